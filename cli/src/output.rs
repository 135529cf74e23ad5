//! Plain-text progress output for transfer events.

use chartwrap_core::{Operation, TransferEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Render an event as one progress line. Per-attempt events are silent.
pub fn render_event(event: &TransferEvent) -> Option<String> {
    match event {
        TransferEvent::Started { operation, total } => {
            let noun = match operation {
                Operation::Pull => "artifact(s)",
                Operation::Push => "image(s)",
            };
            Some(format!("{}ing {} {}", capitalize(&operation.to_string()), total, noun))
        }
        TransferEvent::UnitStarted {
            unit,
            completed,
            total,
        } => Some(format!("[{}/{}] {}", completed + 1, total, unit)),
        TransferEvent::Attempt { .. } => None,
        TransferEvent::Retrying {
            attempt,
            max_attempts,
            error,
            ..
        } => Some(format!("  retrying {}/{}: {}", attempt, max_attempts, error)),
        TransferEvent::UnitSucceeded { cached: true, .. } => Some("  already cached".to_string()),
        TransferEvent::UnitSucceeded { .. } => None,
        TransferEvent::UnitFailed { unit, error } => Some(format!("  failed {}: {}", unit, error)),
        TransferEvent::Finished {
            operation,
            completed,
            total,
        } => Some(format!("Finished {}: {}/{} done", operation, completed, total)),
    }
}

/// Print events to stderr until every sender is gone.
pub fn spawn_printer(mut rx: broadcast::Receiver<TransferEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = render_event(&event) {
                        eprintln!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
