//! Xianwei Concurrency Runtime
//!
//! A cooperative fiber scheduler with a cross-platform event loop and
//! backpressure-aware channels, designed as the concurrency core of a
//! dynamic-language runtime.
//!
//! # Example
//!
//! ```no_run
//! use xianwei::runtime::fiber::Step;
//! use xianwei::runtime::scheduler::{EventLoop, OpCtx};
//! use xianwei::runtime::value::Value;
//! use xianwei::Result;
//!
//! fn main() -> Result<()> {
//!     let mut ev = EventLoop::new()?;
//!     let fiber = ev.spawn(|_cx: &mut OpCtx<'_>, input: Value| {
//!         println!("resumed with {input}");
//!         Step::Done(Value::Nil)
//!     });
//!     ev.run_fiber(&fiber, Value::str("hello"))?;
//!     Ok(())
//! }
//! ```
//!
//! # Crate Features
//!
//! - `debug`: Enable extra runtime tracing

#![doc(html_root_url = "https://docs.rs/xianwei")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::channel::Channel;
pub use runtime::errors::{RuntimeError, RuntimeResult};
pub use runtime::fiber::{FiberHandle, FiberStatus, Signal, Step};
pub use runtime::scheduler::{EventLoop, EventLoopConfig, LoopTurn, OpCtx, SelectClause};
pub use runtime::value::Value;

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "Xianwei (纤维)";
