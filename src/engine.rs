//! The engine event loop: one task that owns the manager and dispatches
//! source completions, action completions, and timer fires in FIFO order.

use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alarm::manager::{
    EngineEvent, EventReceiver, EventSender, Manager, ProcessLauncher,
};

/// Create the event channel shared by the manager, the source layer, and
/// the action executors.
pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Run the engine until cancellation. All state mutation happens here, on
/// this task; callbacks never block.
pub async fn run(mut manager: Manager, mut events: EventReceiver, cancel: CancellationToken) {
    info!("[Engine] started");
    loop {
        manager.poll_timers();
        let idle = match manager.next_timer_deadline() {
            Some(deadline) => {
                let now = manager.clock().now();
                let millis = (deadline - now).num_milliseconds().max(0) as u64;
                Duration::from_millis(millis)
            }
            None => Duration::from_secs(3600),
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                manager.stop();
                info!("[Engine] stopped");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => manager.dispatch(event),
                    None => {
                        manager.stop();
                        info!("[Engine] event channel closed");
                        break;
                    }
                }
            }
            _ = sleep(idle) => {
                // timers polled at the top of the loop
            }
        }
    }
}

/// Production exec-action launcher: runs the rendered command line through
/// the system shell and reports its exit status.
#[derive(Debug, Default)]
pub struct ShellProcessLauncher;

impl ProcessLauncher for ShellProcessLauncher {
    fn launch(&mut self, action: u64, command: String, done: EventSender) {
        tokio::spawn(async move {
            #[cfg(unix)]
            let result = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .output()
                .await;
            #[cfg(windows)]
            let result = tokio::process::Command::new("cmd")
                .arg("/C")
                .arg(&command)
                .output()
                .await;
            let error = match result {
                Ok(output) if output.status.success() => None,
                Ok(output) => Some(format!("process exited with {}", output.status)),
                Err(e) => Some(format!("failed to launch process: {e}")),
            };
            let _ = done.send(EngineEvent::ActionComplete { action, error });
        });
    }
}
