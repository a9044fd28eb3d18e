#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use costura_store::{
    auth::{AuthProvider, LocalAuthProvider, SessionUser, SignUpRequest, UserRole},
    config::AppConfig,
    db,
    entities::{product, DeliveryAddress, PaymentMethod, ProductModel, ProductStatus, ShippingMethod},
    services::CheckoutRequest,
    Storefront,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use uuid::Uuid;

/// Storefront backed by a fresh in-memory SQLite database.
pub struct TestApp {
    pub storefront: Storefront,
    pub auth: Arc<LocalAuthProvider>,
    pub db: Arc<DatabaseConnection>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Same as [`TestApp::new`], letting the test tweak the configuration first.
    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        // A single connection keeps the in-memory database alive and shared
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        tweak(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db = Arc::new(pool);
        let auth = Arc::new(LocalAuthProvider::new());
        let provider: Arc<dyn AuthProvider> = auth.clone();
        let storefront = Storefront::new(db.clone(), cfg, provider);

        Self {
            storefront,
            auth,
            db,
        }
    }

    pub async fn sign_up(&self, role: UserRole) -> SessionUser {
        let user = self
            .auth
            .sign_up(SignUpRequest {
                email: format!("{}@example.com", Uuid::new_v4().simple()),
                password: "segredo123".to_string(),
                full_name: "Pessoa de Teste".to_string(),
                role,
            })
            .await
            .expect("sign up");
        self.storefront
            .invalidator()
            .wait_until_listening(Some(user.id))
            .await;
        user
    }

    /// Signs a fresh customer up; they become the session user.
    pub async fn sign_up_customer(&self) -> SessionUser {
        self.sign_up(UserRole::Customer).await
    }

    pub async fn sign_up_seamstress(&self) -> SessionUser {
        self.sign_up(UserRole::Seamstress).await
    }

    /// Inserts an active product straight into the store, bypassing the
    /// session so tests can seed a catalog while a customer is signed in.
    pub async fn seed_product(&self, name: &str, price: Decimal) -> ProductModel {
        self.seed_product_with(name, price, None, ProductStatus::Active)
            .await
    }

    pub async fn seed_product_with(
        &self,
        name: &str,
        price: Decimal,
        promotional_price: Option<Decimal>,
        status: ProductStatus,
    ) -> ProductModel {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            seamstress_id: Set(Uuid::new_v4()),
            category_id: Set(None),
            name: Set(name.to_string()),
            short_description: Set(None),
            description: Set(format!("{} de jeans reaproveitado", name)),
            price: Set(price),
            promotional_price: Set(promotional_price),
            image_url: Set(None),
            stock: Set(10),
            weight: Set(None),
            width: Set(None),
            height: Set(None),
            depth: Set(None),
            material: Set(Some("jeans".to_string())),
            status: Set(status),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("failed to seed product")
    }
}

pub fn address() -> DeliveryAddress {
    DeliveryAddress {
        street: "Rua das Flores".to_string(),
        number: "42".to_string(),
        complement: None,
        neighborhood: "Centro".to_string(),
        city: "Belo Horizonte".to_string(),
        state: "mg".to_string(),
        zip_code: "30110-012".to_string(),
    }
}

pub fn checkout_request(discount: Decimal) -> CheckoutRequest {
    CheckoutRequest {
        address: address(),
        payment_method: PaymentMethod::Pix,
        shipping_method: ShippingMethod::Standard,
        discount,
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
