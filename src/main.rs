use std::sync::Arc;

use anyhow::Context;
use rust_decimal_macros::dec;
use tracing::{error, info};

use costura_store as store;
use store::auth::{AuthProvider, LocalAuthProvider, SignUpRequest, UserRole};
use store::entities::{
    DeliveryAddress, OrderStatus, PaymentMethod, ProductOrdering, ShippingMethod,
};
use store::services::{CartManager, CheckoutRequest, NewProduct};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = store::config::load_config().context("failed to load configuration")?;
    store::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = store::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the store")?;
    if cfg.auto_migrate {
        store::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }

    let auth: Arc<dyn AuthProvider> = Arc::new(LocalAuthProvider::new());
    let storefront = store::Storefront::new(Arc::new(db_pool), cfg, auth.clone());

    // Demo catalog, listed by one seamstress
    let seamstress = auth
        .sign_up(SignUpRequest {
            email: "ana.costureira@example.com".into(),
            password: "retalhos123".into(),
            full_name: "Ana Retalhos".into(),
            role: UserRole::Seamstress,
        })
        .await?;
    info!(user_id = %seamstress.id, "Seamstress signed up");

    let pieces = [
        ("Bolsa de jeans reciclado", dec!(30.00), None),
        ("Avental patchwork", dec!(25.00), None),
        ("Jaqueta customizada", dec!(120.00), Some(dec!(99.90))),
    ];
    for (name, price, promotional_price) in pieces {
        let product = storefront
            .catalog()
            .create_product(NewProduct {
                name: name.into(),
                short_description: None,
                description: format!("{} feita à mão com jeans de reuso", name),
                price,
                promotional_price,
                category_id: None,
                image_url: None,
                stock: 5,
                weight: None,
                dimensions: None,
                material: Some("jeans".into()),
                status: store::entities::ProductStatus::Active,
            })
            .await?;
        info!(product_id = %product.id, name = %product.name, "Listed product");
    }
    auth.sign_out().await?;

    // A buyer walks through the storefront
    let customer = auth
        .sign_up(SignUpRequest {
            email: "joao.cliente@example.com".into(),
            password: "denim2024".into(),
            full_name: "João Cliente".into(),
            role: UserRole::Customer,
        })
        .await?;
    info!(user_id = %customer.id, "Customer signed up");

    let catalog = storefront.products().list_active(ProductOrdering::Name).await?;
    info!(products = catalog.len(), "Catalog loaded");

    for product in catalog.iter().take(2) {
        let quantity = if product.price == dec!(30.00) { 2 } else { 1 };
        storefront.cart().add_to_cart(product.id, quantity).await?;
    }

    let snapshot = storefront.cart().snapshot().await?;
    let quote = storefront.orders().quote(&snapshot, dec!(0))?;
    info!(
        items = snapshot.item_count(),
        subtotal = %quote.subtotal,
        shipping = %quote.shipping_fee,
        platform_fee = %quote.platform_fee,
        total = %quote.total,
        "Cart ready for checkout"
    );

    let placed = storefront
        .orders()
        .create_order(
            &snapshot,
            CheckoutRequest {
                address: DeliveryAddress {
                    street: "Rua das Costureiras".into(),
                    number: "120".into(),
                    complement: Some("Casa 2".into()),
                    neighborhood: "Centro".into(),
                    city: "Belo Horizonte".into(),
                    state: "MG".into(),
                    zip_code: "30110-012".into(),
                },
                payment_method: PaymentMethod::Pix,
                shipping_method: ShippingMethod::Standard,
                discount: dec!(0),
            },
        )
        .await?;
    info!(
        order_number = %placed.order.order_number,
        status = placed.order.status.label(),
        total = %placed.order.total,
        lines = placed.lines.len(),
        "Order placed"
    );

    let cancelled = storefront
        .orders()
        .update_order_status(placed.order.id, OrderStatus::Cancelled)
        .await?;
    info!(status = cancelled.status.label(), "Demo order cancelled");

    let cart = storefront.cart().cart().await?;
    let total = cart.total()?;
    info!(lines = cart.lines.len(), total = %total, "Cart after checkout");

    storefront.shutdown();
    Ok(())
}
