use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::auth::require_user;
use crate::cache::ViewKey;
use crate::entities::{cart_line, CartLine, CartLineModel, Product};
use crate::errors::ServiceError;
use crate::events::{ChangeEvent, ChangeKind};
use crate::realtime;
use crate::services::coordination::{InFlight, LineSequencer, Ticket};
use crate::services::pricing;
use crate::services::ServiceContext;

/// The signed-in customer's cart as last read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartView {
    pub user_id: Uuid,
    pub lines: Vec<CartLineModel>,
}

impl CartView {
    /// Σ(unit_price × quantity), recomputed on every call. Fails only when
    /// the sum does not fit a `Decimal`.
    pub fn total(&self) -> Result<Decimal, ServiceError> {
        pricing::subtotal(self.lines.iter().map(|l| (l.unit_price, l.quantity)))
    }

    pub fn item_count(&self) -> i64 {
        self.lines.iter().map(|l| i64::from(l.quantity)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn line_for_product(&self, product_id: Uuid) -> Option<&CartLineModel> {
        self.lines.iter().find(|l| l.product_id == product_id)
    }
}

/// Cart operations for the signed-in customer.
///
/// Every mutation is persisted first and then reflected by invalidating the
/// cached cart; nothing is applied optimistically.
#[async_trait]
pub trait CartManager: Send + Sync {
    /// Adds `quantity` units of a product, bumping the existing line if any.
    async fn add_to_cart(
        &self,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartLineModel, ServiceError>;

    /// Sets a line's quantity; `quantity <= 0` removes the line. Returns the
    /// line as stored afterwards, `None` once it is gone.
    ///
    /// Calls for the same line take effect in the order they were made.
    fn update_quantity(
        &self,
        line_id: Uuid,
        quantity: i32,
    ) -> BoxFuture<'_, Result<Option<CartLineModel>, ServiceError>>;

    /// Deletes a line. Removing a line that is already gone succeeds.
    async fn remove_from_cart(&self, line_id: Uuid) -> Result<(), ServiceError>;

    /// Deletes every line of `user_id`, returning how many were removed.
    async fn clear_cart(&self, user_id: Uuid) -> Result<u64, ServiceError>;

    async fn cart(&self) -> Result<CartView, ServiceError>;

    /// Cart contents to hand to checkout.
    async fn snapshot(&self) -> Result<CartView, ServiceError>;
}

/// Deletes all of a user's cart lines on `conn`, returning their ids.
async fn delete_user_lines<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<Vec<Uuid>, DbErr> {
    let ids: Vec<Uuid> = CartLine::find()
        .select_only()
        .column(cart_line::Column::Id)
        .filter(cart_line::Column::UserId.eq(user_id))
        .into_tuple()
        .all(conn)
        .await?;
    if !ids.is_empty() {
        CartLine::delete_many()
            .filter(cart_line::Column::UserId.eq(user_id))
            .exec(conn)
            .await?;
    }
    Ok(ids)
}

/// Deletes the given lines of a user on `conn`, returning how many matched.
/// Lines of the user outside `line_ids` are left alone.
pub(crate) async fn delete_lines<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    line_ids: Vec<Uuid>,
) -> Result<u64, DbErr> {
    let result = CartLine::delete_many()
        .filter(cart_line::Column::UserId.eq(user_id))
        .filter(cart_line::Column::Id.is_in(line_ids))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

pub(crate) async fn load_user_lines<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<Vec<CartLineModel>, DbErr> {
    CartLine::find()
        .filter(cart_line::Column::UserId.eq(user_id))
        .order_by_asc(cart_line::Column::CreatedAt)
        .order_by_asc(cart_line::Column::Id)
        .all(conn)
        .await
}

#[derive(Clone)]
pub struct CartService {
    ctx: ServiceContext,
    adds_in_flight: InFlight<(Uuid, Uuid)>,
    sequencer: LineSequencer,
}

impl CartService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            adds_in_flight: InFlight::new(),
            sequencer: LineSequencer::new(),
        }
    }

    fn mutated(&self, events: Vec<ChangeEvent>, user_id: Uuid) {
        self.ctx.events.publish_all(events);
        realtime::cart_changed(&self.ctx.cache, user_id);
        counter!("costura_cart.mutation", 1);
    }

    async fn find_owned_line(
        &self,
        line_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<CartLineModel>, ServiceError> {
        self.ctx
            .store
            .read("cart.find_line", move |db| async move {
                CartLine::find_by_id(line_id)
                    .filter(cart_line::Column::UserId.eq(user_id))
                    .one(&db)
                    .await
            })
            .await
    }

    #[instrument(skip(self, ticket), fields(line_id = %line_id, seq = ticket.seq()))]
    async fn apply_quantity(
        &self,
        ticket: Ticket,
        line_id: Uuid,
        quantity: i32,
    ) -> Result<Option<CartLineModel>, ServiceError> {
        let user = require_user(self.ctx.auth.as_ref()).await?;
        let user_id = user.id;

        let turn = ticket.turn().await;
        if !turn.is_current() {
            debug!("Quantity update superseded by a later one");
            return self.find_owned_line(line_id, user_id).await;
        }

        if quantity <= 0 {
            let removed = self.delete_line(line_id, user_id).await?;
            turn.commit();
            self.mutated(
                removed
                    .then(|| ChangeEvent::cart_line(ChangeKind::Delete, line_id, user_id))
                    .into_iter()
                    .collect(),
                user_id,
            );
            return Ok(None);
        }

        let line = self
            .ctx
            .store
            .transaction("cart.update_quantity", move |txn| {
                Box::pin(async move {
                    let line = CartLine::find_by_id(line_id)
                        .filter(cart_line::Column::UserId.eq(user_id))
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Cart line {} not found", line_id))
                        })?;
                    let mut model: cart_line::ActiveModel = line.into();
                    model.quantity = Set(quantity);
                    model.updated_at = Set(Utc::now());
                    Ok(model.update(txn).await?)
                })
            })
            .await?;
        turn.commit();

        self.mutated(
            vec![ChangeEvent::cart_line(ChangeKind::Update, line.id, user_id)],
            user_id,
        );
        info!(quantity, "Cart line quantity updated");
        Ok(Some(line))
    }

    /// Scoped delete; `false` when nothing matched.
    async fn delete_line(&self, line_id: Uuid, user_id: Uuid) -> Result<bool, ServiceError> {
        let result = self
            .ctx
            .store
            .write("cart.remove_line", move |db| async move {
                CartLine::delete_many()
                    .filter(cart_line::Column::Id.eq(line_id))
                    .filter(cart_line::Column::UserId.eq(user_id))
                    .exec(&db)
                    .await
            })
            .await?;
        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl CartManager for CartService {
    #[instrument(skip(self), fields(product_id = %product_id))]
    async fn add_to_cart(
        &self,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartLineModel, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationFailed(format!(
                "Quantity must be at least 1, got {}",
                quantity
            )));
        }
        let user = require_user(self.ctx.auth.as_ref()).await?;
        let user_id = user.id;

        let _in_flight = self
            .adds_in_flight
            .try_begin((user_id, product_id))
            .ok_or_else(|| {
                ServiceError::Conflict(format!(
                    "Add to cart for product {} already in flight",
                    product_id
                ))
            })?;

        let (line, kind) = self
            .ctx
            .store
            .transaction("cart.add", move |txn| {
                Box::pin(async move {
                    let product = Product::find_by_id(product_id)
                        .one(txn)
                        .await?
                        .filter(|p| p.is_active())
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Product {} not found", product_id))
                        })?;

                    let existing = CartLine::find()
                        .filter(cart_line::Column::UserId.eq(user_id))
                        .filter(cart_line::Column::ProductId.eq(product_id))
                        .one(txn)
                        .await?;

                    let now = Utc::now();
                    match existing {
                        Some(line) => {
                            let new_quantity =
                                line.quantity.checked_add(quantity).ok_or_else(|| {
                                    ServiceError::ValidationFailed(
                                        "Quantity out of range".to_string(),
                                    )
                                })?;
                            let mut model: cart_line::ActiveModel = line.into();
                            model.quantity = Set(new_quantity);
                            model.updated_at = Set(now);
                            Ok((model.update(txn).await?, ChangeKind::Update))
                        }
                        None => {
                            let model = cart_line::ActiveModel {
                                id: Set(Uuid::new_v4()),
                                user_id: Set(user_id),
                                product_id: Set(product_id),
                                quantity: Set(quantity),
                                unit_price: Set(product.effective_price()),
                                created_at: Set(now),
                                updated_at: Set(now),
                            };
                            Ok((model.insert(txn).await?, ChangeKind::Insert))
                        }
                    }
                })
            })
            .await?;

        self.mutated(vec![ChangeEvent::cart_line(kind, line.id, user_id)], user_id);
        info!(line_id = %line.id, quantity = line.quantity, "Product added to cart");
        Ok(line)
    }

    fn update_quantity(
        &self,
        line_id: Uuid,
        quantity: i32,
    ) -> BoxFuture<'_, Result<Option<CartLineModel>, ServiceError>> {
        // Taken before the future is first polled so it reflects call order
        let ticket = self.sequencer.ticket(line_id);
        Box::pin(self.apply_quantity(ticket, line_id, quantity))
    }

    #[instrument(skip(self), fields(line_id = %line_id))]
    async fn remove_from_cart(&self, line_id: Uuid) -> Result<(), ServiceError> {
        self.update_quantity(line_id, 0).await.map(|_| ())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn clear_cart(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let user = require_user(self.ctx.auth.as_ref()).await?;
        if user.id != user_id {
            return Err(ServiceError::Unauthenticated);
        }

        let removed = self
            .ctx
            .store
            .transaction("cart.clear", move |txn| {
                Box::pin(async move { Ok(delete_user_lines(txn, user_id).await?) })
            })
            .await?;

        let count = removed.len() as u64;
        self.mutated(
            removed
                .into_iter()
                .map(|id| ChangeEvent::cart_line(ChangeKind::Delete, id, user_id))
                .collect(),
            user_id,
        );
        info!(removed = count, "Cart cleared");
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn cart(&self) -> Result<CartView, ServiceError> {
        let user = require_user(self.ctx.auth.as_ref()).await?;
        let user_id = user.id;
        let store = self.ctx.store.clone();

        self.ctx
            .cache
            .get_or_fetch(ViewKey::Cart(user_id), || async move {
                let lines = store
                    .read("cart.lines", move |db| async move {
                        load_user_lines(&db, user_id).await
                    })
                    .await?;
                Ok(CartView { user_id, lines })
            })
            .await
    }

    async fn snapshot(&self) -> Result<CartView, ServiceError> {
        self.cart().await
    }
}
