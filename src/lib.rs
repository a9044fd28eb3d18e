//! Costura Store
//!
//! Cart and order workflow of a marketplace for upcycled-denim pieces made by
//! independent seamstresses. Carts and orders live in a relational store;
//! committed changes are pushed over a change feed that keeps cached views
//! fresh.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod realtime;
pub mod services;

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tracing::info;

use crate::auth::AuthProvider;
use crate::cache::QueryCache;
use crate::config::AppConfig;
use crate::db::StoreClient;
use crate::events::EventSender;
use crate::realtime::RealtimeInvalidator;
use crate::services::{
    CartService, OrderService, ProductManager, ProductReader, ServiceContext,
};

pub use crate::errors::ServiceError;

/// Application root: builds every collaborator explicitly and owns their
/// lifecycle.
pub struct Storefront {
    config: AppConfig,
    context: ServiceContext,
    products: ProductReader,
    catalog: ProductManager,
    cart: CartService,
    orders: OrderService,
    invalidator: RealtimeInvalidator,
}

impl Storefront {
    /// Wires the storefront over an open connection. Spawns the realtime
    /// listeners, so it must run inside a tokio runtime.
    pub fn new(db: Arc<DatabaseConnection>, config: AppConfig, auth: Arc<dyn AuthProvider>) -> Self {
        let store = StoreClient::from_config(db, &config);
        let events = EventSender::new(config.event_channel_capacity);
        let cache = QueryCache::new(config.cache_ttl());
        let context = ServiceContext::new(store, events.clone(), cache.clone(), auth.clone());

        let invalidator = RealtimeInvalidator::start(events, cache, auth);

        info!(environment = %config.environment, "Storefront ready");
        Self {
            products: ProductReader::new(context.clone()),
            catalog: ProductManager::new(context.clone()),
            cart: CartService::new(context.clone()),
            orders: OrderService::new(context.clone(), config.checkout.clone()),
            invalidator,
            context,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.context.auth
    }

    pub fn products(&self) -> &ProductReader {
        &self.products
    }

    /// Seamstress-only catalog writes
    pub fn catalog(&self) -> &ProductManager {
        &self.catalog
    }

    pub fn cart(&self) -> &CartService {
        &self.cart
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    /// Change feed; writers outside this process publish here too.
    pub fn events(&self) -> &EventSender {
        &self.context.events
    }

    pub fn cache(&self) -> &QueryCache {
        &self.context.cache
    }

    pub fn store(&self) -> &StoreClient {
        &self.context.store
    }

    pub fn invalidator(&self) -> &RealtimeInvalidator {
        &self.invalidator
    }

    /// Stops the realtime listeners. Services stay usable; views are then
    /// only refreshed by the writes made through this process.
    pub fn shutdown(&self) {
        self.invalidator.shutdown();
    }
}
