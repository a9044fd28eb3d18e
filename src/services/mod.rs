// Storefront services
pub mod cart;
pub mod orders;
pub mod products;

// Checkout pricing rules
pub mod pricing;

// Duplicate-submission and ordering guards
pub mod coordination;

use std::sync::Arc;

use crate::auth::AuthProvider;
use crate::cache::QueryCache;
use crate::db::StoreClient;
use crate::events::EventSender;

pub use cart::{CartManager, CartService, CartView};
pub use orders::{CheckoutRequest, OrderService, OrderWithLines};
pub use pricing::OrderTotals;
pub use products::{NewProduct, ProductDetail, ProductManager, ProductPatch, ProductReader};

/// Collaborators shared by every service, built once by the application root.
#[derive(Clone)]
pub struct ServiceContext {
    pub store: StoreClient,
    pub events: EventSender,
    pub cache: QueryCache,
    pub auth: Arc<dyn AuthProvider>,
}

impl ServiceContext {
    pub fn new(
        store: StoreClient,
        events: EventSender,
        cache: QueryCache,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            store,
            events,
            cache,
            auth,
        }
    }
}
