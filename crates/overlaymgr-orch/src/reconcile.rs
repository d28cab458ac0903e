//! Base reconciler trait.

use async_trait::async_trait;

use crate::notification::Notification;
use crate::task::TaskResult;

/// A level-triggered reconciler for one kind of declared resource.
///
/// The dispatcher guarantees that `reconcile` is never invoked concurrently
/// for the same notification key; different keys may run in parallel, so
/// implementations must be `Send + Sync` and guard any shared state.
///
/// # Contract
///
/// 1. Fetch the current declared resource for `notification.key`
/// 2. Converge kernel state toward it
/// 3. Write back status changes
/// 4. Return `Err` for anything that should be redelivered
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Returns the name of this reconciler (for logging).
    fn name(&self) -> &str;

    /// Converges state for one declared resource.
    async fn reconcile(&self, notification: &Notification) -> TaskResult<()>;
}
