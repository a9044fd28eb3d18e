use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::auth::require_seamstress;
use crate::cache::ViewKey;
use crate::entities::{
    product, product_review, Dimensions, Product, ProductModel, ProductOrdering, ProductReview,
    ProductReviewModel, ProductStatus,
};
use crate::errors::ServiceError;
use crate::events::{ChangeEvent, ChangeKind};
use crate::realtime;
use crate::services::pricing::round_money;
use crate::services::ServiceContext;

/// A product page: the product, its reviews and their mean rating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetail {
    pub product: ProductModel,
    pub reviews: Vec<ProductReviewModel>,
    pub average_rating: Option<Decimal>,
}

fn average_rating(reviews: &[ProductReviewModel]) -> Option<Decimal> {
    if reviews.is_empty() {
        return None;
    }
    let sum: Decimal = reviews.iter().map(|r| Decimal::from(r.rating)).sum();
    Some(round_money(sum / Decimal::from(reviews.len())))
}

/// Public, read-only view of the catalog.
#[derive(Clone)]
pub struct ProductReader {
    ctx: ServiceContext,
}

impl ProductReader {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Active products, read through the cache.
    #[instrument(skip(self))]
    pub async fn list_active(
        &self,
        ordering: ProductOrdering,
    ) -> Result<Vec<ProductModel>, ServiceError> {
        let store = self.ctx.store.clone();
        self.ctx
            .cache
            .get_or_fetch(ViewKey::ActiveProducts(ordering), || async move {
                store
                    .read("products.list_active", move |db| async move {
                        let query = Product::find()
                            .filter(product::Column::Status.eq(ProductStatus::Active));
                        let query = match ordering {
                            ProductOrdering::Newest => query
                                .order_by_desc(product::Column::CreatedAt)
                                .order_by_asc(product::Column::Id),
                            ProductOrdering::Name => query
                                .order_by_asc(product::Column::Name)
                                .order_by_asc(product::Column::Id),
                        };
                        query.all(&db).await
                    })
                    .await
            })
            .await
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn get_product(&self, product_id: Uuid) -> Result<ProductDetail, ServiceError> {
        let store = self.ctx.store.clone();
        self.ctx
            .cache
            .get_or_fetch(ViewKey::Product(product_id), || async move {
                let found = store
                    .read("products.get", move |db| async move {
                        let Some(product) = Product::find_by_id(product_id).one(&db).await? else {
                            return Ok(None);
                        };
                        let reviews = ProductReview::find()
                            .filter(product_review::Column::ProductId.eq(product_id))
                            .order_by_desc(product_review::Column::CreatedAt)
                            .all(&db)
                            .await?;
                        Ok(Some((product, reviews)))
                    })
                    .await?;

                let (product, reviews) = found.ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", product_id))
                })?;
                Ok(ProductDetail {
                    average_rating: average_rating(&reviews),
                    product,
                    reviews,
                })
            })
            .await
    }
}

/// Fields of a new listing.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewProduct {
    #[validate(custom = "validate_not_blank")]
    pub name: String,
    pub short_description: Option<String>,
    #[serde(default)]
    pub description: String,
    #[validate(custom = "validate_price")]
    pub price: Decimal,
    #[validate(custom = "validate_price")]
    pub promotional_price: Option<Decimal>,
    pub category_id: Option<Uuid>,
    #[validate(url)]
    pub image_url: Option<String>,
    #[validate(range(min = 0))]
    pub stock: i32,
    pub weight: Option<Decimal>,
    pub dimensions: Option<Dimensions>,
    pub material: Option<String>,
    #[serde(default = "default_status")]
    pub status: ProductStatus,
}

fn default_status() -> ProductStatus {
    ProductStatus::Active
}

/// Partial update of a listing; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub short_description: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    /// `Some(None)` removes the promotion
    pub promotional_price: Option<Option<Decimal>>,
    pub category_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub stock: Option<i32>,
    pub material: Option<String>,
    pub status: Option<ProductStatus>,
}

fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("Nome é obrigatório".into());
        return Err(err);
    }
    Ok(())
}

/// Largest amount a `Decimal(12, 2)` price column holds.
const MAX_PRICE: Decimal = dec!(9999999999.99);

fn validate_price(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO || *value > MAX_PRICE {
        let mut err = ValidationError::new("range");
        err.message = Some("Preço deve ser maior que zero e até 9999999999.99".into());
        return Err(err);
    }
    if value.normalize().scale() > 2 {
        let mut err = ValidationError::new("scale");
        err.message = Some("Preço deve ter no máximo duas casas decimais".into());
        return Err(err);
    }
    Ok(())
}

/// Rules spanning several fields, checked on create and on the merged result
/// of an update.
fn check_listing(
    name: &str,
    price: Decimal,
    promotional_price: Option<Decimal>,
    stock: i32,
) -> Result<(), ServiceError> {
    validate_not_blank(name)
        .and_then(|_| validate_price(&price))
        .and_then(|_| promotional_price.as_ref().map_or(Ok(()), validate_price))
        .map_err(|e| {
            ServiceError::ValidationFailed(
                e.message
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string()),
            )
        })?;
    if stock < 0 {
        return Err(ServiceError::ValidationFailed(
            "Stock cannot be negative".to_string(),
        ));
    }
    if let Some(promo) = promotional_price {
        if promo >= price {
            return Err(ServiceError::ValidationFailed(format!(
                "Promotional price {} must be below the price {}",
                promo, price
            )));
        }
    }
    Ok(())
}

/// Catalog writes, restricted to the seamstress that owns each listing.
#[derive(Clone)]
pub struct ProductManager {
    ctx: ServiceContext,
}

impl ProductManager {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_product(&self, input: NewProduct) -> Result<ProductModel, ServiceError> {
        let seamstress = require_seamstress(self.ctx.auth.as_ref()).await?;
        input.validate()?;
        check_listing(
            &input.name,
            input.price,
            input.promotional_price,
            input.stock,
        )?;

        let now = Utc::now();
        let dimensions = input.dimensions;
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            seamstress_id: Set(seamstress.id),
            category_id: Set(input.category_id),
            name: Set(input.name.trim().to_string()),
            short_description: Set(input.short_description),
            description: Set(input.description),
            price: Set(input.price),
            promotional_price: Set(input.promotional_price),
            image_url: Set(input.image_url),
            stock: Set(input.stock),
            weight: Set(input.weight),
            width: Set(dimensions.map(|d| d.width)),
            height: Set(dimensions.map(|d| d.height)),
            depth: Set(dimensions.map(|d| d.depth)),
            material: Set(input.material),
            status: Set(input.status),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let product = self
            .ctx
            .store
            .write("products.create", move |db| async move { model.insert(&db).await })
            .await?;

        self.ctx.events.publish(ChangeEvent::product(
            ChangeKind::Insert,
            product.id,
            product.seamstress_id,
        ));
        realtime::product_changed(&self.ctx.cache, product.id);

        info!(product_id = %product.id, seamstress_id = %product.seamstress_id, "Product created");
        Ok(product)
    }

    #[instrument(skip(self, patch), fields(product_id = %product_id))]
    pub async fn update_product(
        &self,
        product_id: Uuid,
        patch: ProductPatch,
    ) -> Result<ProductModel, ServiceError> {
        let seamstress = require_seamstress(self.ctx.auth.as_ref()).await?;
        let seamstress_id = seamstress.id;

        let product = self
            .ctx
            .store
            .transaction("products.update", move |txn| {
                Box::pin(async move {
                    let existing = Product::find_by_id(product_id)
                        .filter(product::Column::SeamstressId.eq(seamstress_id))
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Product {} not found", product_id))
                        })?;

                    let mut updated = existing;
                    if let Some(name) = patch.name {
                        updated.name = name.trim().to_string();
                    }
                    if let Some(short_description) = patch.short_description {
                        updated.short_description = Some(short_description);
                    }
                    if let Some(description) = patch.description {
                        updated.description = description;
                    }
                    if let Some(price) = patch.price {
                        updated.price = price;
                    }
                    if let Some(promotional_price) = patch.promotional_price {
                        updated.promotional_price = promotional_price;
                    }
                    if let Some(category_id) = patch.category_id {
                        updated.category_id = Some(category_id);
                    }
                    if let Some(image_url) = patch.image_url {
                        updated.image_url = Some(image_url);
                    }
                    if let Some(stock) = patch.stock {
                        updated.stock = stock;
                    }
                    if let Some(material) = patch.material {
                        updated.material = Some(material);
                    }
                    if let Some(status) = patch.status {
                        updated.status = status;
                    }
                    check_listing(
                        &updated.name,
                        updated.price,
                        updated.promotional_price,
                        updated.stock,
                    )?;
                    updated.updated_at = Utc::now();

                    let model = product::ActiveModel::from(updated).reset_all();
                    Ok(model.update(txn).await?)
                })
            })
            .await?;

        self.ctx.events.publish(ChangeEvent::product(
            ChangeKind::Update,
            product.id,
            product.seamstress_id,
        ));
        realtime::product_changed(&self.ctx.cache, product.id);

        info!(product_id = %product.id, "Product updated");
        Ok(product)
    }

    /// Deletes a listing and its reviews. Cart lines that still point at it
    /// stay until the buyer removes them; checking them out fails with
    /// `NotFound`.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn delete_product(&self, product_id: Uuid) -> Result<(), ServiceError> {
        let seamstress = require_seamstress(self.ctx.auth.as_ref()).await?;
        let seamstress_id = seamstress.id;

        self.ctx
            .store
            .transaction("products.delete", move |txn| {
                Box::pin(async move {
                    let deleted = Product::delete_many()
                        .filter(product::Column::Id.eq(product_id))
                        .filter(product::Column::SeamstressId.eq(seamstress_id))
                        .exec(txn)
                        .await?;
                    if deleted.rows_affected == 0 {
                        return Err(ServiceError::NotFound(format!(
                            "Product {} not found",
                            product_id
                        )));
                    }
                    ProductReview::delete_many()
                        .filter(product_review::Column::ProductId.eq(product_id))
                        .exec(txn)
                        .await?;
                    Ok(())
                })
            })
            .await?;

        self.ctx.events.publish(ChangeEvent::product(
            ChangeKind::Delete,
            product_id,
            seamstress_id,
        ));
        realtime::product_changed(&self.ctx.cache, product_id);

        info!(product_id = %product_id, "Product deleted");
        Ok(())
    }

    /// Every listing of the signed-in seamstress, active or not, newest first.
    #[instrument(skip(self))]
    pub async fn list_own(&self) -> Result<Vec<ProductModel>, ServiceError> {
        let seamstress = require_seamstress(self.ctx.auth.as_ref()).await?;
        let seamstress_id = seamstress.id;

        self.ctx
            .store
            .read("products.list_own", move |db| async move {
                Product::find()
                    .filter(product::Column::SeamstressId.eq(seamstress_id))
                    .order_by_desc(product::Column::CreatedAt)
                    .all(&db)
                    .await
            })
            .await
    }
}
