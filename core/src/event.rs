//! Transfer progress events.
//!
//! The transfer engine reports every unit's lifecycle through an
//! [`EventEmitter`]; front-ends subscribe and render however they like.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity for an emitter.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Direction of a transfer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Pull,
    Push,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Pull => write!(f, "pull"),
            Operation::Push => write!(f, "push"),
        }
    }
}

/// One unit of transfer work: a single digest on pull, a whole image on push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferUnit {
    /// Logical image name from the lock
    pub name: String,
    /// Registry reference
    pub image: String,
    /// Platform (pull units only)
    pub platform: Option<String>,
    /// Manifest digest (pull units only)
    pub digest: Option<String>,
}

impl fmt::Display for TransferUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.image)?;
        if let Some(ref platform) = self.platform {
            write!(f, " ({})", platform)?;
        }
        Ok(())
    }
}

/// Lifecycle state of a transfer unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
}

/// Progress event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    /// A pull or push call started
    Started { operation: Operation, total: usize },
    /// A unit left `Pending`
    UnitStarted {
        unit: TransferUnit,
        completed: usize,
        total: usize,
    },
    /// A unit is `InFlight` for the given 1-based attempt
    Attempt { unit: TransferUnit, attempt: u32 },
    /// An attempt failed and the unit will be retried
    Retrying {
        unit: TransferUnit,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    /// A unit finished; `cached` when the local cache already held it
    UnitSucceeded {
        unit: TransferUnit,
        completed: usize,
        total: usize,
        cached: bool,
    },
    /// A unit failed terminally
    UnitFailed { unit: TransferUnit, error: String },
    /// The whole call succeeded
    Finished {
        operation: Operation,
        completed: usize,
        total: usize,
    },
}

impl TransferEvent {
    /// State the event moves its unit into, if it concerns a unit.
    pub fn unit_state(&self) -> Option<UnitState> {
        match self {
            TransferEvent::UnitStarted { .. } | TransferEvent::Attempt { .. } => {
                Some(UnitState::InFlight)
            }
            TransferEvent::Retrying { .. } => Some(UnitState::Retrying),
            TransferEvent::UnitSucceeded { .. } => Some(UnitState::Succeeded),
            TransferEvent::UnitFailed { .. } => Some(UnitState::Failed),
            TransferEvent::Started { .. } | TransferEvent::Finished { .. } => None,
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<TransferEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Events are dropped when nobody is subscribed.
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
