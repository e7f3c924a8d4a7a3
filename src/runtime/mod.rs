//! Runtime system
//!
//! This module contains the fiber model, the event loop and scheduler,
//! channels, non-blocking streams and the value surface they exchange.

pub mod channel;
pub mod errors;
pub mod fiber;
pub mod gc;
pub mod scheduler;
pub mod stream;
pub mod value;
