//! Process-local registries of nameable work.
//!
//! Rust closures can't cross a process boundary the way a pickled Python
//! callable can. Since the worker is always a re-exec of the *same*
//! compiled binary as its host, the fix is to never serialize the callable
//! at all: register it under a name at static-init time (via [`inventory`])
//! and serialize only the name. Both processes link the same registry, so
//! the worker can look the name back up.
//!
//! Two registries live here: [`TaskEntry`] for the jobs a worker can run,
//! and [`RetireEntry`] for the predicates a worker can poll between jobs.

use std::panic::AssertUnwindSafe;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{decode, encode};
use crate::error::BrokenWorker;

/// A unit of work a worker process can execute, named and registered with
/// [`remote_task!`](crate::remote_task).
///
/// `Output` is bounded by `Serialize`, which a `Future` can never satisfy --
/// that bound is what rejects "coroutine" tasks at the registration call
/// site instead of at runtime inside the worker.
pub trait RemoteTask: 'static {
    /// Registered name. Must be unique across the binary.
    const NAME: &'static str;
    /// Argument tuple, round-tripped through the wire codec.
    type Args: Serialize + DeserializeOwned + Send + 'static;
    /// Return value, round-tripped through the wire codec.
    ///
    /// Bounded by `Serialize`, which no `Future` can ever satisfy -- this is
    /// what rejects async functions at the `remote_task!` call site instead
    /// of at runtime inside the worker.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Run the task. May panic; the worker captures it.
    fn call(args: Self::Args) -> Self::Output;
}

/// Wire form of a worker's answer to one job: either the encoded output, or
/// a description of the panic that interrupted it.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Outcome {
    Ok(Vec<u8>),
    Panicked(CapturedPanic),
}

/// A panic caught inside a worker, reduced to something serializable.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CapturedPanic {
    pub message: String,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker task panicked with a non-string payload".to_string()
    }
}

/// One entry in the task registry: a name and a type-erased invoker.
pub struct TaskEntry {
    pub name: &'static str,
    invoke: fn(&[u8]) -> Result<Outcome, BrokenWorker>,
}

inventory::collect!(TaskEntry);

impl TaskEntry {
    /// Build a registry entry for `T`. Used by [`remote_task!`](crate::remote_task); not
    /// normally called directly.
    pub const fn of<T: RemoteTask>() -> Self {
        TaskEntry {
            name: T::NAME,
            invoke: invoke_task::<T>,
        }
    }

    pub(crate) fn invoke(&self, args: &[u8]) -> Result<Outcome, BrokenWorker> {
        (self.invoke)(args)
    }
}

fn invoke_task<T: RemoteTask>(args_bytes: &[u8]) -> Result<Outcome, BrokenWorker> {
    let args: T::Args = decode(args_bytes)?;
    match std::panic::catch_unwind(AssertUnwindSafe(|| T::call(args))) {
        Ok(output) => Ok(Outcome::Ok(encode(&output)?)),
        Err(payload) => Ok(Outcome::Panicked(CapturedPanic {
            message: panic_message(payload.as_ref()),
        })),
    }
}

pub(crate) fn lookup_task(name: &str) -> Option<&'static TaskEntry> {
    inventory::iter::<TaskEntry>.into_iter().find(|e| e.name == name)
}

/// Register a [`RemoteTask`] implementation so worker processes can look it
/// up by [`RemoteTask::NAME`].
#[macro_export]
macro_rules! remote_task {
    ($ty:ty) => {
        ::inventory::submit! {
            $crate::registry::TaskEntry::of::<$ty>()
        }
    };
}

/// One entry in the retire-strategy registry: a name and a nullary
/// predicate. Registered with [`register_retire!`](crate::register_retire).
pub struct RetireEntry {
    pub name: &'static str,
    pub predicate: fn() -> bool,
}

inventory::collect!(RetireEntry);

/// Built-in strategy that never retires, matching the source's use of a
/// plain `False` default.
fn never_retire() -> bool {
    false
}

inventory::submit! {
    RetireEntry { name: "__never", predicate: never_retire }
}

pub(crate) fn lookup_retire(name: &str) -> Option<fn() -> bool> {
    inventory::iter::<RetireEntry>
        .into_iter()
        .find(|e| e.name == name)
        .map(|e| e.predicate)
}

/// Register a named retire predicate for use with
/// [`ContextOptions::retire`](crate::context::ContextOptions::retire).
#[macro_export]
macro_rules! register_retire {
    ($name:expr, $func:path) => {
        ::inventory::submit! {
            $crate::registry::RetireEntry {
                name: $name,
                predicate: $func,
            }
        }
    };
}

/// A named, registered retire predicate, the stand-in for an arbitrary
/// picklable nullary callable.
///
/// Copy/clone-able: it's just a name, resolved against the registry inside
/// whichever worker process actually evaluates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireStrategy {
    pub(crate) name: &'static str,
}

impl RetireStrategy {
    /// The default: a worker under this strategy never volunteers to exit
    /// early, only on idle timeout.
    pub fn never() -> Self {
        RetireStrategy { name: "__never" }
    }

    /// Reference a strategy registered under `name` via
    /// [`register_retire!`](crate::register_retire). Not validated until the
    /// owning [`cache_scope`](crate::context::cache_scope) call.
    pub fn named(name: &'static str) -> Self {
        RetireStrategy { name }
    }

    pub(crate) fn is_registered(&self) -> bool {
        lookup_retire(self.name).is_some()
    }
}
