//! Blocking work offload.
//!
//! A fiber that must perform blocking work hands a closure to a plain OS
//! thread and parks. The thread posts the result back through the loop's
//! wake channel; the parked entry keeps the loop alive until then.

use std::thread;

use tracing::{debug, warn};

use crate::runtime::fiber::{FiberHandle, Signal};
use crate::runtime::scheduler::EventLoop;
use crate::runtime::value::Value;

/// Result of offloaded work, restricted to shapes that can cross threads.
#[derive(Debug)]
pub enum WorkResult {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// The work failed; the fiber resumes by raising this message.
    Err(String),
}

impl WorkResult {
    fn into_value(self) -> Value {
        match self {
            WorkResult::Nil => Value::Nil,
            WorkResult::Bool(b) => Value::Bool(b),
            WorkResult::Int(i) => Value::Int(i),
            WorkResult::Float(f) => Value::Float(f),
            WorkResult::Str(s) => Value::from(s),
            WorkResult::Bytes(b) => Value::bytes(b),
            WorkResult::Err(_) => Value::Nil,
        }
    }
}

/// Park `fiber` and run `work` on a fresh thread. The fiber resumes with
/// the result, or raises when the work reports an error. A fiber that was
/// cancelled while the work ran has its result dropped.
pub(crate) fn offload(
    ev: &mut EventLoop,
    fiber: &FiberHandle,
    work: impl FnOnce() -> WorkResult + Send + 'static,
) {
    let (wake, id, generation) = ev.remote_park(fiber);
    let spawned = thread::Builder::new()
        .name("xianwei-worker".into())
        .spawn(move || {
            let result = work();
            wake.post(move |ev| match ev.unpark(id, generation) {
                Some(f) => match result {
                    WorkResult::Err(msg) => {
                        ev.schedule_signal(&f, Value::str(msg), Signal::Error)
                    }
                    other => ev.schedule(&f, other.into_value()),
                },
                None => debug!(fiber = %id, "worker result dropped, fiber moved on"),
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn worker thread");
        if let Some(f) = ev.unpark(id, generation) {
            ev.schedule_signal(&f, Value::str(e.to_string()), Signal::Error);
        }
    }
}
