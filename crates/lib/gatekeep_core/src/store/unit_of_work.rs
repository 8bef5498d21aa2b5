//! Unit of work: one atomic transaction spanning the user and session stores.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use super::{SessionRepository, UserRepository};
use crate::error::Result;

/// Opens transactions over the backing store.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Repositories scoped to one open transaction.
///
/// Dropping a transaction without committing discards its changes.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn users(&self) -> &dyn UserRepository;

    fn sessions(&self) -> &dyn SessionRepository;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `work` inside one transaction: commit if it returns `Ok`, roll back
/// if it returns `Err`.
///
/// ```ignore
/// unit_of_work::run(uow, move |tx| {
///     Box::pin(async move {
///         tx.sessions().delete_all_for_principal(user_id).await?;
///         tx.users().soft_delete(user_id).await
///     })
/// })
/// .await?;
/// ```
pub async fn run<T, F>(uow: &dyn UnitOfWork, work: F) -> Result<T>
where
    T: Send,
    F: for<'t> FnOnce(&'t dyn Transaction) -> BoxFuture<'t, Result<T>> + Send,
{
    let tx = uow.begin().await?;
    let outcome = work(tx.as_ref()).await;
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("rollback failed after {e}: {rollback_err}");
            }
            Err(e)
        }
    }
}
