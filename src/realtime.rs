//! Push-driven invalidation of cached views.
//!
//! Change events only mark views stale; the data itself always comes from the
//! next pull read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::cache::{QueryCache, ViewKey};
use crate::events::{EventSender, Subscription, SubscriptionError, SubscriptionFilter, Table};

pub(crate) fn product_changed(cache: &QueryCache, product_id: Uuid) {
    cache.invalidate_where(|key| matches!(key, ViewKey::ActiveProducts(_)));
    cache.invalidate(&ViewKey::Product(product_id));
}

pub(crate) fn cart_changed(cache: &QueryCache, user_id: Uuid) {
    cache.invalidate(&ViewKey::Cart(user_id));
}

pub(crate) fn order_changed(cache: &QueryCache, customer_id: Uuid, order_id: Uuid) {
    cache.invalidate(&ViewKey::Orders(customer_id));
    cache.invalidate(&ViewKey::Order(order_id));
}

/// Background listeners that keep the query cache honest.
///
/// One `products` listener runs for the whole lifetime; `cart_lines` and
/// `orders` listeners are scoped to the signed-in user and replaced on every
/// session change.
pub struct RealtimeInvalidator {
    products_task: JoinHandle<()>,
    session_task: JoinHandle<()>,
    user_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    listening: watch::Receiver<Option<Uuid>>,
    processed: Arc<AtomicU64>,
}

impl RealtimeInvalidator {
    /// Spawns the listeners. Must be called from within a tokio runtime.
    pub fn start(events: EventSender, cache: QueryCache, auth: Arc<dyn AuthProvider>) -> Self {
        let processed = Arc::new(AtomicU64::new(0));

        // Subscribed before spawning so no event published after `start`
        // returns is missed.
        let products = events.subscribe(Table::Products, SubscriptionFilter::All);
        let products_task = tokio::spawn(listen(products, cache.clone(), processed.clone()));

        let user_tasks = Arc::new(Mutex::new(Vec::new()));
        let (listening_tx, listening) = watch::channel(None);
        let session_task = tokio::spawn(follow_session(
            auth.session_changes(),
            events,
            cache,
            user_tasks.clone(),
            listening_tx,
            processed.clone(),
        ));

        Self {
            products_task,
            session_task,
            user_tasks,
            listening,
            processed,
        }
    }

    /// User whose cart and orders are currently watched.
    pub fn listening_for(&self) -> Option<Uuid> {
        *self.listening.borrow()
    }

    /// Resolves once the user-scoped listeners match `user`.
    pub async fn wait_until_listening(&self, user: Option<Uuid>) {
        let mut listening = self.listening.clone();
        let _ = listening.wait_for(|current| *current == user).await;
    }

    /// Change events handled so far, lag notices included.
    pub fn processed_events(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.abort_tasks();
        info!("Realtime invalidator stopped");
    }

    fn abort_tasks(&self) {
        self.session_task.abort();
        self.products_task.abort();
        abort_all(&self.user_tasks);
    }
}

impl Drop for RealtimeInvalidator {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn abort_all(tasks: &Mutex<Vec<JoinHandle<()>>>) {
    let mut tasks = tasks.lock().unwrap_or_else(PoisonError::into_inner);
    for task in tasks.drain(..) {
        task.abort();
    }
}

async fn follow_session(
    mut session: watch::Receiver<Option<crate::auth::SessionUser>>,
    events: EventSender,
    cache: QueryCache,
    user_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    listening: watch::Sender<Option<Uuid>>,
    processed: Arc<AtomicU64>,
) {
    loop {
        let user_id = session.borrow_and_update().as_ref().map(|user| user.id);
        abort_all(&user_tasks);

        if let Some(user_id) = user_id {
            let filter = SubscriptionFilter::OwnedBy(user_id);
            let cart = events.subscribe(Table::CartLines, filter);
            let orders = events.subscribe(Table::Orders, filter);

            let mut tasks = user_tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.push(tokio::spawn(listen(cart, cache.clone(), processed.clone())));
            tasks.push(tokio::spawn(listen(orders, cache.clone(), processed.clone())));
            debug!(user_id = %user_id, "Watching cart and orders");
        } else {
            debug!("No session; user-scoped listeners stopped");
        }
        listening.send_replace(user_id);

        if session.changed().await.is_err() {
            break;
        }
    }
}

async fn listen(mut subscription: Subscription, cache: QueryCache, processed: Arc<AtomicU64>) {
    let table = subscription.table();
    loop {
        match subscription.recv().await {
            Ok(event) => {
                match (event.table, subscription.filter()) {
                    (Table::Products, _) => product_changed(&cache, event.row_id),
                    (Table::CartLines, SubscriptionFilter::OwnedBy(user_id)) => {
                        cart_changed(&cache, user_id)
                    }
                    (Table::Orders, SubscriptionFilter::OwnedBy(user_id)) => {
                        order_changed(&cache, user_id, event.row_id)
                    }
                    (Table::CartLines, SubscriptionFilter::All) => {
                        cache.invalidate_where(|key| matches!(key, ViewKey::Cart(_)))
                    }
                    (Table::Orders, SubscriptionFilter::All) => cache.invalidate_where(|key| {
                        matches!(key, ViewKey::Orders(_) | ViewKey::Order(_))
                    }),
                }
                counter!("costura_realtime.event", 1, "table" => table.as_str());
            }
            Err(SubscriptionError::Lagged(missed)) => {
                warn!(table = table.as_str(), missed, "Change feed lagged; invalidating every view it feeds");
                invalidate_table(&cache, table, subscription.filter());
                counter!("costura_realtime.lagged", 1, "table" => table.as_str());
            }
            Err(SubscriptionError::Closed) => {
                debug!(table = table.as_str(), "Change feed closed");
                break;
            }
        }
        processed.fetch_add(1, Ordering::SeqCst);
    }
}

fn invalidate_table(cache: &QueryCache, table: Table, filter: SubscriptionFilter) {
    match (table, filter) {
        (Table::Products, _) => cache.invalidate_where(|key| {
            matches!(key, ViewKey::ActiveProducts(_) | ViewKey::Product(_))
        }),
        (Table::CartLines, SubscriptionFilter::OwnedBy(user_id)) => cart_changed(cache, user_id),
        (Table::CartLines, SubscriptionFilter::All) => {
            cache.invalidate_where(|key| matches!(key, ViewKey::Cart(_)))
        }
        (Table::Orders, SubscriptionFilter::OwnedBy(user_id)) => {
            cache.invalidate(&ViewKey::Orders(user_id));
            cache.invalidate_where(|key| matches!(key, ViewKey::Order(_)));
        }
        (Table::Orders, SubscriptionFilter::All) => cache.invalidate_where(|key| {
            matches!(key, ViewKey::Orders(_) | ViewKey::Order(_))
        }),
    }
}
