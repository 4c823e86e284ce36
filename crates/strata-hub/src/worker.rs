//! Off-thread module execution with a deadline
//!
//! Each dispatched module runs on its own named thread and reports through a
//! one-slot channel. The coordinator waits until the module's deadline and no
//! longer; a module that overruns is abandoned, never killed. Its thread keeps
//! the view it was given alive until it finishes, and the in-flight flag stays
//! raised until then so the scheduler does not dispatch it again meanwhile.

use crate::{Module, View};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strata_core::CommandBuffer;

/// Why a module execution did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleFailure {
    /// The module returned an error
    Error(String),
    /// The module panicked
    Panic(String),
    /// The module did not finish within its budget
    Timeout(Duration),
    /// The worker went away without reporting
    Disconnected,
    /// No worker thread could be started
    Spawn(String),
}

impl ModuleFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModuleFailure::Timeout(_))
    }
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleFailure::Error(msg) => write!(f, "error: {}", msg),
            ModuleFailure::Panic(msg) => write!(f, "panicked: {}", msg),
            ModuleFailure::Timeout(limit) => write!(f, "timed out after {:?}", limit),
            ModuleFailure::Disconnected => write!(f, "worker disconnected"),
            ModuleFailure::Spawn(msg) => write!(f, "failed to spawn worker: {}", msg),
        }
    }
}

pub(crate) type Outcome = std::result::Result<CommandBuffer, ModuleFailure>;

/// A running module execution
pub(crate) struct Execution {
    rx: Receiver<Outcome>,
    deadline: Instant,
    budget: Duration,
}

impl Execution {
    /// Wait for the outcome until the deadline
    pub(crate) fn join(self) -> Outcome {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(ModuleFailure::Timeout(self.budget)),
            Err(RecvTimeoutError::Disconnected) => Err(ModuleFailure::Disconnected),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `module` on a fresh thread
///
/// `in_flight` is raised before the thread starts and lowered by the thread
/// when the module returns, whether or not anyone is still waiting.
pub(crate) fn dispatch(
    name: &str,
    module: Arc<dyn Module>,
    mut view: View,
    elapsed: Duration,
    budget: Duration,
    in_flight: Arc<AtomicBool>,
) -> std::result::Result<Execution, ModuleFailure> {
    let (tx, rx) = bounded::<Outcome>(1);
    in_flight.store(true, Ordering::Release);
    let flag = Arc::clone(&in_flight);

    let spawned = thread::Builder::new()
        .name(format!("strata-{name}"))
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| module.execute(&mut view, elapsed)));
            // drop the snapshot before reporting so its provider can recycle it
            let commands = view.into_commands();
            let outcome = match result {
                Ok(Ok(())) => Ok(commands),
                Ok(Err(err)) => Err(ModuleFailure::Error(err.to_string())),
                Err(payload) => Err(ModuleFailure::Panic(panic_message(payload.as_ref()))),
            };
            flag.store(false, Ordering::Release);
            // the coordinator may have given up on us already
            let _ = tx.send(outcome);
        });

    match spawned {
        Ok(_) => Ok(Execution {
            rx,
            deadline: Instant::now() + budget,
            budget,
        }),
        Err(err) => {
            in_flight.store(false, Ordering::Release);
            Err(ModuleFailure::Spawn(err.to_string()))
        }
    }
}
