//! Background units of work for blocking remote calls.
//!
//! Each unit performs one blocking call and posts its single result back on the
//! bus. Units cannot be cancelled; a bounded wait abandons the call instead.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::FlingError;
use crate::remote::RemoteResult;

/// Runs a unit of work off the owning context.
pub trait TaskSpawner: Send + Sync {
    /// On `Err` the task was dropped without running, so its result message will
    /// never arrive and the caller must apply the failure itself.
    fn spawn(&self, label: &str, task: Box<dyn FnOnce() + Send + 'static>) -> RemoteResult<()>;
}

/// Spawns one short-lived named thread per unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl TaskSpawner for ThreadSpawner {
    fn spawn(&self, label: &str, task: Box<dyn FnOnce() + Send + 'static>) -> RemoteResult<()> {
        thread::Builder::new()
            .name(format!("remote-{label}"))
            .spawn(task)
            .map(|_| ())
            .map_err(|err| {
                warn!("ThreadSpawner: failed to spawn unit '{}': {}", label, err);
                FlingError::remote(label, format!("failed to spawn unit: {err}"))
            })
    }
}

/// Runs `call` on a helper thread and waits at most `timeout` for its result.
///
/// On timeout the helper thread is left to finish on its own and its result is
/// discarded.
pub fn call_with_timeout<T, F>(call_name: &str, timeout: Duration, call: F) -> RemoteResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RemoteResult<T> + Send + 'static,
{
    let (result_tx, result_rx) = mpsc::sync_channel(1);
    let spawn_result = thread::Builder::new()
        .name(format!("bounded-{call_name}"))
        .spawn(move || {
            let _ = result_tx.send(call());
        });
    if let Err(err) = spawn_result {
        return Err(FlingError::remote(
            call_name,
            format!("failed to spawn call thread: {err}"),
        ));
    }

    match result_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(FlingError::RemoteCallTimedOut {
            call: call_name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(FlingError::remote(
            call_name,
            "call thread exited without a result",
        )),
    }
}
