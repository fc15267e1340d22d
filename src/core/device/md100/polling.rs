//! Background polling loop

use super::Md100;
use crate::core::device::DeviceError;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Running polling loop
pub(super) struct PollingTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Md100 {
    /// Start the polling loop; does nothing while one is running
    ///
    /// The loop stops on [`stop_polling`](Self::stop_polling), when the
    /// master terminates, or when the device is dropped.
    pub fn start_polling(self: &Arc<Self>) {
        let mut polling = self.polling.lock();
        if polling.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }
        let token = self.slave.master().shutdown_token().child_token();
        let handle = tokio::spawn(run(Arc::downgrade(self), token.clone()));
        *polling = Some(PollingTask { token, handle });
    }

    /// Stop the polling loop and wait for it to exit
    pub async fn stop_polling(&self) {
        let task = self.polling.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                tracing::error!("polling task ended abnormally: {}", e);
            }
        }
    }

    /// Whether the polling loop is running
    pub fn is_polling(&self) -> bool {
        self.polling
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// One poll: fetch the event buffer and feed the state machine
    ///
    /// Returns the number of new events.
    pub async fn poll_once(&self) -> Result<usize, DeviceError> {
        let events = self.fetch_events().await?;
        Ok(self.state.process_snapshot(&events))
    }
}

async fn run(device: Weak<Md100>, token: CancellationToken) {
    let mut available: Option<bool> = None;
    tracing::debug!("polling started");

    loop {
        let Some(md100) = device.upgrade() else {
            break;
        };
        let interval = md100.options.poll_interval;

        if md100.slave.master().is_connected() {
            match md100.poll_once().await {
                Ok(_) => {
                    if available != Some(true) {
                        tracing::debug!("device {} works", md100.slave.address());
                        available = Some(true);
                    }
                }
                Err(e) if e.is_no_response() => {
                    if available != Some(false) {
                        tracing::warn!("device {} is not available", md100.slave.address());
                        available = Some(false);
                    }
                }
                Err(e) => tracing::error!("polling device {}: {}", md100.slave.address(), e),
            }
        }
        drop(md100);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::debug!("polling stopped");
}
