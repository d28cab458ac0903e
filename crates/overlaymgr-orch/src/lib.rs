//! Reconciliation plumbing for the overlay network managers.
//!
//! - [`Reconcile`]: Trait implemented by every level-triggered reconciler
//! - [`Notification`]: A "declared resource changed/removed" event
//! - [`ShardedDispatcher`]: Per-identity worker lanes with retry
//! - [`TaskStatus`] / [`TaskError`]: Outcome of a single reconciliation
//! - [`Backoff`]: Redelivery delay policy
//!
//! # Architecture
//!
//! 1. An external event source observes declared-resource changes
//! 2. Each change is submitted to the dispatcher keyed by resource identity
//! 3. The identity hashes to one lane; a lane reconciles sequentially
//! 4. Failures are redelivered to the same lane after a backoff
//!
//! # Example
//!
//! ```ignore
//! use overlaymgr_orch::{Notification, Reconcile, ShardedDispatcher, DispatcherConfig};
//!
//! let dispatcher = ShardedDispatcher::start(Arc::new(reconciler), DispatcherConfig::default());
//! dispatcher.submit(Notification::changed("default/peer-a")).await?;
//! ```

mod dispatch;
mod notification;
mod reconcile;
mod retry;
mod task;

pub use dispatch::{DispatchError, DispatcherConfig, ShardedDispatcher};
pub use notification::{Notification, Operation};
pub use reconcile::Reconcile;
pub use retry::Backoff;
pub use task::{TaskError, TaskResult, TaskStatus};
