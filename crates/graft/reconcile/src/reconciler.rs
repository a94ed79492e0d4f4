use crate::queue::{ReconcileItem, ReconcileKey, ReconcileQueue};
use async_trait::async_trait;

/// Boxed error carried by reconciler operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-entity-kind reconciliation behavior, driven by a
/// [`Manager`](crate::Manager).
///
/// `resync` is a best-effort bounded scan: enqueue every key that appears to
/// need work; a failed scan self-heals on the
/// next tick. `reconcile` settles a popped batch; every item must be
/// completed or failed exactly once, and a skip over a missing precondition
/// is a completion, not a retry.
#[async_trait]
pub trait Reconciler<K: ReconcileKey>: Send + Sync {
    /// Stable identifier used in logs.
    fn name(&self) -> &str;

    /// One-time recovery hook, run synchronously at manager construction.
    async fn reboot(&self) -> Result<(), BoxError>;

    /// Scan for keys needing work and enqueue them.
    async fn resync(&self, queue: &ReconcileQueue<K>) -> Result<(), BoxError>;

    /// Settle a batch of popped items.
    async fn reconcile(&self, items: Vec<ReconcileItem<K>>) -> Result<(), BoxError>;
}
