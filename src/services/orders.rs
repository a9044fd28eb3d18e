use std::collections::HashMap;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::require_user;
use crate::cache::ViewKey;
use crate::config::CheckoutConfig;
use crate::entities::{
    order, order_line, DeliveryAddress, Order, OrderLine, OrderLineModel, OrderModel, OrderStatus,
    PaymentMethod, PaymentStatus, Product, ProductionStatus, ShippingMethod,
};
use crate::errors::ServiceError;
use crate::events::{ChangeEvent, ChangeKind};
use crate::realtime;
use crate::services::cart::{delete_lines, load_user_lines, CartView};
use crate::services::coordination::InFlight;
use crate::services::pricing::{self, OrderTotals};
use crate::services::ServiceContext;

/// Everything checkout needs besides the cart itself.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckoutRequest {
    #[validate]
    pub address: DeliveryAddress,
    pub payment_method: PaymentMethod,
    pub shipping_method: ShippingMethod,
    #[serde(default)]
    pub discount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderWithLines {
    pub order: OrderModel,
    pub lines: Vec<OrderLineModel>,
}

impl OrderWithLines {
    fn involves(&self, user_id: Uuid) -> bool {
        self.order.customer_id == user_id || self.lines.iter().any(|l| l.seamstress_id == user_id)
    }
}

/// `PED-YYYYMMDDHHMMSS-XXXXXX`: UTC creation time plus the first six hex
/// digits of the order id.
pub fn order_number(created_at: DateTime<Utc>, order_id: Uuid) -> String {
    let suffix: String = order_id
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect::<String>()
        .to_uppercase();
    format!("PED-{}-{}", created_at.format("%Y%m%d%H%M%S"), suffix)
}

async fn load_lines<C: ConnectionTrait>(
    conn: &C,
    order_ids: Vec<Uuid>,
) -> Result<Vec<OrderLineModel>, DbErr> {
    OrderLine::find()
        .filter(order_line::Column::OrderId.is_in(order_ids))
        .order_by_asc(order_line::Column::CreatedAt)
        .order_by_asc(order_line::Column::Id)
        .all(conn)
        .await
}

/// Whether `user_id` may act on `order`: its customer, or a seamstress
/// fulfilling one of its lines.
async fn user_involved<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    user_id: Uuid,
) -> Result<bool, DbErr> {
    if order.customer_id == user_id {
        return Ok(true);
    }
    let fulfilled = OrderLine::find()
        .filter(order_line::Column::OrderId.eq(order.id))
        .filter(order_line::Column::SeamstressId.eq(user_id))
        .count(conn)
        .await?;
    Ok(fulfilled > 0)
}

/// The snapshot must still describe the cart as stored: same lines, same
/// quantities, same prices.
fn matches_stored_cart(snapshot: &CartView, stored: &[crate::entities::CartLineModel]) -> bool {
    if snapshot.lines.len() != stored.len() {
        return false;
    }
    let stored: HashMap<Uuid, (i32, Decimal)> = stored
        .iter()
        .map(|l| (l.id, (l.quantity, l.unit_price)))
        .collect();
    snapshot
        .lines
        .iter()
        .all(|l| stored.get(&l.id) == Some(&(l.quantity, l.unit_price)))
}

#[derive(Clone)]
pub struct OrderService {
    ctx: ServiceContext,
    checkout: CheckoutConfig,
    checkouts_in_flight: InFlight<Uuid>,
}

impl OrderService {
    pub fn new(ctx: ServiceContext, checkout: CheckoutConfig) -> Self {
        Self {
            ctx,
            checkout,
            checkouts_in_flight: InFlight::new(),
        }
    }

    /// Prices a cart without placing an order.
    pub fn quote(&self, cart: &CartView, discount: Decimal) -> Result<OrderTotals, ServiceError> {
        pricing::compute_totals(cart.total()?, discount, &self.checkout)
    }

    /// Turns a cart snapshot into an order.
    ///
    /// The order row, its lines and the cart clear commit together or not at
    /// all; on any failure the cart is left exactly as it was.
    #[instrument(skip(self, snapshot, request), fields(lines = snapshot.lines.len()))]
    pub async fn create_order(
        &self,
        snapshot: &CartView,
        request: CheckoutRequest,
    ) -> Result<OrderWithLines, ServiceError> {
        let user = require_user(self.ctx.auth.as_ref()).await?;
        let customer_id = user.id;

        if snapshot.user_id != customer_id
            || snapshot.lines.iter().any(|l| l.user_id != customer_id)
        {
            return Err(ServiceError::NotFound(
                "Cart does not belong to the signed-in user".to_string(),
            ));
        }
        if snapshot.is_empty() {
            return Err(ServiceError::ValidationFailed("Cart is empty".to_string()));
        }
        request.validate()?;

        let totals = self.quote(snapshot, request.discount)?;

        let _in_flight = self
            .checkouts_in_flight
            .try_begin(customer_id)
            .ok_or_else(|| ServiceError::Conflict("Checkout already in flight".to_string()))?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let address = request.address;
        let order_row = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number(now, order_id)),
            customer_id: Set(customer_id),
            status: Set(OrderStatus::Pending),
            subtotal: Set(totals.subtotal),
            discount: Set(totals.discount),
            shipping_fee: Set(totals.shipping_fee),
            platform_fee: Set(totals.platform_fee),
            total: Set(totals.total),
            address_street: Set(address.street),
            address_number: Set(address.number),
            address_complement: Set(address.complement),
            address_neighborhood: Set(address.neighborhood),
            address_city: Set(address.city),
            address_state: Set(address.state.to_uppercase()),
            address_zip: Set(address.zip_code),
            shipping_method: Set(request.shipping_method),
            tracking_code: Set(None),
            payment_method: Set(request.payment_method),
            payment_status: Set(PaymentStatus::Pending),
            shipped_at: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let snapshot = snapshot.clone();

        let (created, cleared) = self
            .ctx
            .store
            .transaction("orders.create", move |txn| {
                Box::pin(async move {
                    let stored = load_user_lines(txn, customer_id).await?;
                    if !matches_stored_cart(&snapshot, &stored) {
                        return Err(ServiceError::Conflict(
                            "Cart changed since the snapshot was taken".to_string(),
                        ));
                    }

                    let order = order_row.insert(txn).await?;

                    let mut lines = Vec::with_capacity(snapshot.lines.len());
                    for item in &snapshot.lines {
                        let product = Product::find_by_id(item.product_id)
                            .one(txn)
                            .await?
                            .ok_or_else(|| {
                                ServiceError::NotFound(format!(
                                    "Product {} is no longer available",
                                    item.product_id
                                ))
                            })?;

                        let line_total = pricing::line_total(item.unit_price, item.quantity)?;
                        let line = order_line::ActiveModel {
                            id: Set(Uuid::new_v4()),
                            order_id: Set(order.id),
                            product_id: Set(product.id),
                            seamstress_id: Set(product.seamstress_id),
                            quantity: Set(item.quantity),
                            unit_price: Set(item.unit_price),
                            line_total: Set(line_total),
                            production_status: Set(Some(ProductionStatus::Waiting)),
                            production_started_at: Set(None),
                            production_finished_at: Set(None),
                            created_at: Set(now),
                            updated_at: Set(now),
                        };
                        lines.push(line.insert(txn).await?);
                    }

                    // Only the lines being ordered; anything added meanwhile stays
                    let cleared: Vec<Uuid> = snapshot.lines.iter().map(|l| l.id).collect();
                    let removed = delete_lines(txn, customer_id, cleared.clone()).await?;
                    if removed != cleared.len() as u64 {
                        return Err(ServiceError::Conflict(
                            "Cart changed since the snapshot was taken".to_string(),
                        ));
                    }
                    Ok((OrderWithLines { order, lines }, cleared))
                })
            })
            .await?;

        let mut events = vec![ChangeEvent::order(ChangeKind::Insert, order_id, customer_id)];
        events.extend(
            cleared
                .iter()
                .map(|id| ChangeEvent::cart_line(ChangeKind::Delete, *id, customer_id)),
        );
        self.ctx.events.publish_all(events);
        realtime::order_changed(&self.ctx.cache, customer_id, order_id);
        realtime::cart_changed(&self.ctx.cache, customer_id);
        counter!("costura_orders.created", 1);

        info!(
            order_id = %order_id,
            order_number = %created.order.order_number,
            total = %created.order.total,
            "Order created"
        );
        Ok(created)
    }

    /// Moves an order along its lifecycle. Setting the current status again
    /// is a no-op.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = new_status.as_str()))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<OrderModel, ServiceError> {
        self.transition(order_id, new_status, None).await
    }

    /// Marks an order shipped and records the carrier's tracking code.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn ship_order(
        &self,
        order_id: Uuid,
        tracking_code: String,
    ) -> Result<OrderModel, ServiceError> {
        let tracking_code = tracking_code.trim().to_string();
        if tracking_code.is_empty() {
            return Err(ServiceError::ValidationFailed(
                "Tracking code is required".to_string(),
            ));
        }
        self.transition(order_id, OrderStatus::Shipped, Some(tracking_code))
            .await
    }

    async fn transition(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        tracking_code: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let user = require_user(self.ctx.auth.as_ref()).await?;
        let user_id = user.id;

        let (order, changed) = self
            .ctx
            .store
            .transaction("orders.update_status", move |txn| {
                Box::pin(async move {
                    let not_found =
                        || ServiceError::NotFound(format!("Order {} not found", order_id));
                    let order = Order::find_by_id(order_id).one(txn).await?.ok_or_else(not_found)?;
                    if !user_involved(txn, &order, user_id).await? {
                        return Err(not_found());
                    }

                    if order.status == new_status {
                        return Ok((order, false));
                    }
                    if !order.status.can_transition_to(new_status) {
                        error!(
                            from = order.status.as_str(),
                            to = new_status.as_str(),
                            "Invalid order status transition"
                        );
                        return Err(ServiceError::InvalidTransition {
                            from: order.status,
                            to: new_status,
                        });
                    }

                    let now = Utc::now();
                    let mut model: order::ActiveModel = order.into();
                    model.status = Set(new_status);
                    model.updated_at = Set(now);
                    if tracking_code.is_some() {
                        model.tracking_code = Set(tracking_code);
                    }
                    match new_status {
                        OrderStatus::Shipped => model.shipped_at = Set(Some(now)),
                        OrderStatus::Delivered => model.delivered_at = Set(Some(now)),
                        _ => {}
                    }
                    Ok((model.update(txn).await?, true))
                })
            })
            .await?;

        if changed {
            self.ctx.events.publish(ChangeEvent::order(
                ChangeKind::Update,
                order.id,
                order.customer_id,
            ));
            realtime::order_changed(&self.ctx.cache, order.customer_id, order.id);
            info!(status = order.status.as_str(), "Order status updated");
        }
        Ok(order)
    }

    /// Records production progress on one line, by the seamstress making it.
    #[instrument(skip(self), fields(line_id = %line_id))]
    pub async fn update_line_production(
        &self,
        line_id: Uuid,
        status: ProductionStatus,
    ) -> Result<OrderLineModel, ServiceError> {
        let user = require_user(self.ctx.auth.as_ref()).await?;
        let seamstress_id = user.id;

        let (line, customer_id) = self
            .ctx
            .store
            .transaction("orders.update_line_production", move |txn| {
                Box::pin(async move {
                    let not_found =
                        || ServiceError::NotFound(format!("Order line {} not found", line_id));
                    let line = OrderLine::find_by_id(line_id)
                        .filter(order_line::Column::SeamstressId.eq(seamstress_id))
                        .one(txn)
                        .await?
                        .ok_or_else(not_found)?;
                    let order = Order::find_by_id(line.order_id)
                        .one(txn)
                        .await?
                        .ok_or_else(not_found)?;

                    let now = Utc::now();
                    let started_at = line.production_started_at;
                    let mut model: order_line::ActiveModel = line.into();
                    model.production_status = Set(Some(status));
                    match status {
                        ProductionStatus::Waiting => {}
                        ProductionStatus::InProduction => {
                            if started_at.is_none() {
                                model.production_started_at = Set(Some(now));
                            }
                        }
                        ProductionStatus::Finished => {
                            if started_at.is_none() {
                                model.production_started_at = Set(Some(now));
                            }
                            model.production_finished_at = Set(Some(now));
                        }
                    }
                    model.updated_at = Set(now);
                    Ok((model.update(txn).await?, order.customer_id))
                })
            })
            .await?;

        self.ctx.events.publish(ChangeEvent::order(
            ChangeKind::Update,
            line.order_id,
            customer_id,
        ));
        realtime::order_changed(&self.ctx.cache, customer_id, line.order_id);
        info!(order_id = %line.order_id, status = ?status, "Line production updated");
        Ok(line)
    }

    /// The signed-in customer's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(&self) -> Result<Vec<OrderWithLines>, ServiceError> {
        let user = require_user(self.ctx.auth.as_ref()).await?;
        let customer_id = user.id;
        let store = self.ctx.store.clone();

        self.ctx
            .cache
            .get_or_fetch(ViewKey::Orders(customer_id), || async move {
                store
                    .read("orders.list", move |db| async move {
                        let orders = Order::find()
                            .filter(order::Column::CustomerId.eq(customer_id))
                            .order_by_desc(order::Column::CreatedAt)
                            .order_by_asc(order::Column::Id)
                            .all(&db)
                            .await?;
                        let mut lines_by_order: HashMap<Uuid, Vec<OrderLineModel>> =
                            HashMap::new();
                        for line in load_lines(&db, orders.iter().map(|o| o.id).collect()).await? {
                            lines_by_order.entry(line.order_id).or_default().push(line);
                        }
                        Ok(orders
                            .into_iter()
                            .map(|order| OrderWithLines {
                                lines: lines_by_order.remove(&order.id).unwrap_or_default(),
                                order,
                            })
                            .collect())
                    })
                    .await
            })
            .await
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithLines, ServiceError> {
        let user = require_user(self.ctx.auth.as_ref()).await?;
        let store = self.ctx.store.clone();

        let found = self
            .ctx
            .cache
            .get_or_fetch(ViewKey::Order(order_id), || async move {
                let found = store
                    .read("orders.get", move |db| async move {
                        let Some(order) = Order::find_by_id(order_id).one(&db).await? else {
                            return Ok(None);
                        };
                        let lines = load_lines(&db, vec![order.id]).await?;
                        Ok(Some(OrderWithLines { order, lines }))
                    })
                    .await?;
                found.ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
            })
            .await?;

        // The cached view is shared, so ownership is checked on every read
        if !found.involves(user.id) {
            warn!(user_id = %user.id, "Order requested by a user outside it");
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn order_number_format() {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let id = Uuid::parse_str("a1b2c3d4-0000-4000-8000-000000000000").unwrap();
        assert_eq!(order_number(created_at, id), "PED-20240309140507-A1B2C3");
    }

    #[test]
    fn order_numbers_differ_for_distinct_ids() {
        let now = Utc::now();
        assert_ne!(
            order_number(now, Uuid::new_v4()),
            order_number(now, Uuid::new_v4())
        );
    }
}
