use crate::core::{KernelError, Result};
use crate::kernel::Kernel;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Background loop calling [`Kernel::tick_now`] on a fixed period.
///
/// Ticks never overlap: each one holds the kernel lock for its duration.
pub struct TickDriver {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TickDriver {
    /// Signals the loop to stop and waits for the current tick to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| KernelError::ExecutionError(format!("tick driver join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for TickDriver {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Must be called inside a tokio runtime. Periods under 10ms are raised
/// to 10ms.
pub fn spawn_tick_driver(kernel: Arc<Mutex<Kernel>>, period: Duration) -> TickDriver {
    let period = period.max(Duration::from_millis(10));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        event!(Level::INFO, period_ms = period.as_millis() as u64, "tick driver started");
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(period) => {
                    let mut guard = kernel.lock().await;
                    match guard.tick_now() {
                        Ok(report) if report.executed() > 0 => event!(
                            Level::DEBUG,
                            executed = report.executed(),
                            failures = report.failures(),
                            "driver tick"
                        ),
                        Ok(_) => {}
                        Err(err) => event!(Level::ERROR, error = %err, "driver tick failed"),
                    }
                }
            }
        }
        event!(Level::INFO, "tick driver stopped");
    });

    TickDriver {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
