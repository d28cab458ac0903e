//! Common infrastructure for the overlay network managers.
//!
//! This crate provides the pieces shared by every manager that converges
//! kernel networking state:
//!
//! - [`shell`]: Safe shell command execution with proper quoting
//! - [`error`]: The error taxonomy used across the reconciliation engine
//!
//! # Example
//!
//! ```ignore
//! use overlaymgr_common::{
//!     shell::{self, IP_CMD, shellquote},
//!     error::OverlayResult,
//! };
//!
//! async fn set_mtu(link: &str, mtu: u32) -> OverlayResult<()> {
//!     let cmd = format!("{} link set dev {} mtu {}", IP_CMD, shellquote(link), mtu);
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{OverlayError, OverlayResult};
