//! chartwrap core - foundational types.
//!
//! The Images.lock model and codec, configuration, the error taxonomy and
//! transfer progress events shared by the engine and the CLI.

pub mod config;
pub mod error;
pub mod event;
pub mod imagelock;
pub mod platform;

// Re-export commonly used types
pub use config::{LockConfig, LogLevel, RegistryConfig, TransferConfig, WrapConfig};
pub use error::{Result, WrapError};
pub use event::{EventEmitter, Operation, TransferEvent, TransferUnit, UnitState};
pub use imagelock::{ChartImage, DigestInfo, ImagesLock, LockDiff, LockedDigest};
pub use platform::Platform;

/// chartwrap version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
