/*!
 * Transaction helpers
 *
 * The atomic server-side unit used by checkout and cart mutations.
 */

use sea_orm::{DatabaseConnection, DatabaseTransaction, DbErr, TransactionError, TransactionTrait};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed future used in transactions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Execute `f` within one database transaction.
///
/// Commits when `f` returns `Ok`, rolls back otherwise. The closure's own
/// error is returned unchanged, so callers keep their `ServiceError` variants
/// (a `NotFound` raised mid-transaction surfaces as `NotFound`).
///
/// ```rust,ignore
/// let order = transaction_scope(&db, move |txn| {
///     Box::pin(async move {
///         let order = order_row.insert(txn).await?;
///         for line in lines {
///             line.insert(txn).await?;
///         }
///         Ok::<_, ServiceError>(order)
///     })
/// })
/// .await?;
/// ```
pub async fn transaction_scope<F, T, E>(db: &DatabaseConnection, f: F) -> Result<T, E>
where
    F: for<'c> FnOnce(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, E>> + Send,
    T: Send,
    E: std::error::Error + From<DbErr> + Send,
{
    db.transaction(f).await.map_err(|e| match e {
        TransactionError::Connection(db_err) => E::from(db_err),
        TransactionError::Transaction(err) => err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::cart_line;
    use crate::errors::ServiceError;
    use crate::migrator::Migrator;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sea_orm::{ActiveModelTrait, ConnectOptions, Database, EntityTrait, PaginatorTrait, Set};
    use sea_orm_migration::MigratorTrait;
    use uuid::Uuid;

    async fn memory_db() -> DatabaseConnection {
        let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
        opt.max_connections(1).min_connections(1).sqlx_logging(false);
        let db = Database::connect(opt).await.expect("connect");
        Migrator::up(&db, None).await.expect("migrate");
        db
    }

    fn line() -> cart_line::ActiveModel {
        let now = Utc::now();
        cart_line::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(Uuid::new_v4()),
            product_id: Set(Uuid::new_v4()),
            quantity: Set(1),
            unit_price: Set(dec!(10.00)),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }

    #[tokio::test]
    async fn commits_on_success() {
        let db = memory_db().await;
        let row = line();

        transaction_scope(&db, move |txn| {
            Box::pin(async move {
                row.insert(txn).await?;
                Ok::<_, ServiceError>(())
            })
        })
        .await
        .unwrap();

        assert_eq!(cart_line::Entity::find().count(&db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rolls_back_and_keeps_the_error_variant() {
        let db = memory_db().await;
        let row = line();

        let result: Result<(), ServiceError> = transaction_scope(&db, move |txn| {
            Box::pin(async move {
                row.insert(txn).await?;
                Err(ServiceError::NotFound("product".into()))
            })
        })
        .await;

        assert!(matches!(result, Err(ServiceError::NotFound(_))));
        assert_eq!(cart_line::Entity::find().count(&db).await.unwrap(), 0);
    }
}
