//! Macro Operation Executor
//!
//! Runs multi-step device procedures on their own tasks. At most one
//! procedure runs per device; a second start is rejected until the first
//! one has finished by any path.

use super::DeviceError;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of a macro operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult<T> {
    /// Procedure completed without error
    pub success: bool,
    /// Failure description
    pub description: Option<String>,
    /// Value produced by a successful procedure
    pub value: Option<T>,
}

impl<T> OperationResult<T> {
    /// Successful result
    pub fn ok(value: T) -> Self {
        Self {
            success: true,
            description: None,
            value: Some(value),
        }
    }

    /// Failed result described by `error`
    pub fn failed(error: &DeviceError) -> Self {
        Self {
            success: false,
            description: Some(error.to_string()),
            value: None,
        }
    }

    /// Convert into a plain result, the error being the description
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.value) {
            (true, Some(value)) => Ok(value),
            _ => Err(self.description.unwrap_or_else(|| "no result".to_string())),
        }
    }
}

/// Handle of a started macro operation
#[derive(Debug)]
pub struct OperationHandle<T> {
    id: u64,
    task: JoinHandle<OperationResult<T>>,
}

impl<T> OperationHandle<T> {
    /// Operation id, unique per executor
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the operation has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the result; a panicked task yields a failed result
    pub async fn join(self) -> OperationResult<T> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                let error = DeviceError::Aborted(e.to_string());
                tracing::error!("operation {}: {}", self.id, error);
                OperationResult::failed(&error)
            }
        }
    }
}

type Slot = Arc<Mutex<Option<(u64, CancellationToken)>>>;

/// Releases the single-flight slot on every exit path of its operation
struct SlotGuard {
    slot: Slot,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Some((id, _)) if id == self.id) {
            *slot = None;
        }
    }
}

/// Single-flight runner of cancellable, timeout-bound procedures
#[derive(Debug)]
pub struct MacroExecutor {
    slot: Slot,
    next_id: AtomicU64,
    parent: CancellationToken,
}

impl Default for MacroExecutor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl MacroExecutor {
    /// Create an executor whose operations are cancelled together with `parent`
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            parent,
        }
    }

    /// Whether an operation is running
    pub fn is_executing(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Request cancellation of the running operation, if any
    pub fn cancel(&self) {
        if let Some((id, token)) = &*self.slot.lock() {
            tracing::debug!("cancelling operation {}", id);
            token.cancel();
        }
    }

    /// Start `procedure` on its own task
    ///
    /// Fails with [`DeviceError::OperationConflict`] while another operation
    /// runs. With a timeout, the operation's token is cancelled once it
    /// expires and the procedure is left to wind down on its own.
    pub fn start<T, F, Fut>(
        &self,
        name: &'static str,
        timeout: Option<Duration>,
        procedure: F,
    ) -> Result<OperationHandle<T>, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>> + Send + 'static,
    {
        let token = self.parent.child_token();
        let id = {
            let mut slot = self.slot.lock();
            if slot.is_some() {
                tracing::warn!("{}: another operation is executing", name);
                return Err(DeviceError::OperationConflict);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            *slot = Some((id, token.clone()));
            id
        };
        let guard = SlotGuard {
            slot: Arc::clone(&self.slot),
            id,
        };

        let body = procedure(token.clone()).boxed();
        let task = tokio::spawn(async move {
            let _guard = guard;
            tracing::debug!("{} ({}) start", name, id);
            match supervise(name, body, timeout, &token).await {
                Ok(value) => {
                    tracing::debug!("{} ({}) finish", name, id);
                    OperationResult::ok(value)
                }
                Err(e) => {
                    tracing::error!("{} ({}) failed: {}", name, id, e);
                    OperationResult::failed(&e)
                }
            }
        });

        Ok(OperationHandle { id, task })
    }
}

/// Drive `body`, cancelling `token` when the timeout expires first
async fn supervise<T>(
    name: &str,
    mut body: BoxFuture<'static, Result<T, DeviceError>>,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Result<T, DeviceError> {
    if let Some(timeout) = timeout {
        tokio::select! {
            result = &mut body => return result,
            _ = tokio::time::sleep(timeout) => {
                tracing::info!("{}: operation timeout, requesting cancellation", name);
                token.cancel();
            }
        }
    }
    body.await
}
