//! A plugin-neutral network abstraction (NA) layer for RPC runtimes.
//!
//! `naos` sits between a high-level RPC runtime and one or more transport
//! plugins, presenting a single API for addressing, two-sided messaging,
//! one-sided memory access (put/get), progress, completion and
//! cancellation. It ships with a complete shared-memory transport for
//! in-node communication; see the [`sm`] module.
//!
//! The execution model is plain OS threads: operations are submitted with a
//! caller-owned [`OpId`] and a completion callback, a progress caller
//! drives the transport through [`Context::poll_wait`], and
//! [`Context::trigger`] runs the callbacks outside the progress critical
//! section.
//!
//! # Example
//!
//! ```no_run
//! use naos::{Class, NaError};
//!
//! # fn main() -> naos::Result<()> {
//! let class = Class::initialize("sm://", true)?;
//! let context = class.context_create()?;
//! let op = class.op_create()?;
//!
//! let target = class.addr_self()?;
//! class.msg_send_unexpected(
//!     &context,
//!     |info| assert!(info.ret.is_ok()),
//!     b"hello",
//!     &target,
//!     0,
//!     42,
//!     &op,
//! )?;
//!
//! loop {
//!     match context.poll_wait(100) {
//!         Ok(_) => break,
//!         Err(NaError::Timeout) => continue,
//!         Err(err) => return Err(err),
//!     }
//! }
//! context.trigger(u32::MAX)?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
compile_error!("`naos` currently only supports Linux and macOS");

/// Shared utility primitives.
mod util;

mod addr;
mod class;
mod context;
mod error;
mod info;
mod mem;
mod op;

/// Transport-plugin dispatch surface.
pub mod plugin;

/// The shared-memory transport plugin.
pub mod sm;

pub use addr::*;
pub use class::*;
pub use context::*;
pub use error::*;
pub use info::*;
pub use mem::*;
pub use op::*;
