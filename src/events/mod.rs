use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

/// Tables that publish change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Products,
    CartLines,
    Orders,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::CartLines => "cart_lines",
            Self::Orders => "orders",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A committed row change.
///
/// `owner_id` is the user the row belongs to: the customer for cart lines and
/// orders, the seamstress for products.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub row_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind, row_id: Uuid, owner_id: Option<Uuid>) -> Self {
        Self {
            table,
            kind,
            row_id,
            owner_id,
            occurred_at: Utc::now(),
        }
    }

    pub fn product(kind: ChangeKind, product_id: Uuid, seamstress_id: Uuid) -> Self {
        Self::new(Table::Products, kind, product_id, Some(seamstress_id))
    }

    pub fn cart_line(kind: ChangeKind, line_id: Uuid, user_id: Uuid) -> Self {
        Self::new(Table::CartLines, kind, line_id, Some(user_id))
    }

    pub fn order(kind: ChangeKind, order_id: Uuid, customer_id: Uuid) -> Self {
        Self::new(Table::Orders, kind, order_id, Some(customer_id))
    }
}

/// Row filter of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    /// Equality filter on the owning user id
    OwnedBy(Uuid),
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Self::All => true,
            Self::OwnedBy(owner) => event.owner_id == Some(*owner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The receiver fell behind and `n` events were dropped. Consumers should
    /// treat everything the subscription feeds as stale.
    #[error("subscription lagged by {0} events")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// Publishing side of the change feed.
///
/// Services publish only after their transaction commits, so subscribers
/// never see a change that was rolled back.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes one event and returns how many subscribers received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        trace!(
            table = event.table.as_str(),
            kind = ?event.kind,
            row_id = %event.row_id,
            "Publishing change event"
        );
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("Change event dropped: no subscribers");
                0
            }
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self, table: Table, filter: SubscriptionFilter) -> Subscription {
        Subscription {
            table,
            filter,
            receiver: self.sender.subscribe(),
        }
    }
}

/// A stream of change events for one table, narrowed by a filter.
#[derive(Debug)]
pub struct Subscription {
    table: Table,
    filter: SubscriptionFilter,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn table(&self) -> Table {
        self.table
    }

    pub fn filter(&self) -> SubscriptionFilter {
        self.filter
    }

    /// Waits for the next matching event.
    pub async fn recv(&mut self) -> Result<ChangeEvent, SubscriptionError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.table == self.table && self.filter.matches(&event) => {
                    return Ok(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(SubscriptionError::Lagged(n))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    /// Adapts the subscription into a stream that ends when the feed closes.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeEvent, SubscriptionError>> {
        stream::unfold(self, |mut sub| async move {
            match sub.recv().await {
                Err(SubscriptionError::Closed) => None,
                item => Some((item, sub)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn filters_by_table_and_owner() {
        let events = EventSender::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut sub = events.subscribe(Table::CartLines, SubscriptionFilter::OwnedBy(alice));

        events.publish(ChangeEvent::cart_line(ChangeKind::Insert, Uuid::new_v4(), bob));
        events.publish(ChangeEvent::order(ChangeKind::Insert, Uuid::new_v4(), alice));
        let line_id = Uuid::new_v4();
        events.publish(ChangeEvent::cart_line(ChangeKind::Update, line_id, alice));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.row_id, line_id);
        assert_eq!(event.kind, ChangeKind::Update);
    }

    #[tokio::test]
    async fn lagging_subscribers_are_told_so() {
        let events = EventSender::new(2);
        let mut sub = events.subscribe(Table::Products, SubscriptionFilter::All);
        let seamstress = Uuid::new_v4();
        for _ in 0..5 {
            events.publish(ChangeEvent::product(ChangeKind::Update, Uuid::new_v4(), seamstress));
        }

        assert_eq!(sub.recv().await, Err(SubscriptionError::Lagged(3)));
        assert!(sub.recv().await.is_ok());
    }

    #[tokio::test]
    async fn stream_ends_when_the_feed_is_dropped() {
        let events = EventSender::new(4);
        let sub = events.subscribe(Table::Orders, SubscriptionFilter::All);
        events.publish(ChangeEvent::order(ChangeKind::Insert, Uuid::new_v4(), Uuid::new_v4()));
        drop(events);

        let items: Vec<_> = sub.into_stream().collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let events = EventSender::new(4);
        assert_eq!(
            events.publish(ChangeEvent::order(ChangeKind::Delete, Uuid::new_v4(), Uuid::new_v4())),
            0
        );
    }
}
