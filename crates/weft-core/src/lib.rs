pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod types;

pub use config::WeftConfig;
pub use error::{Result, WeftError};
pub use event::{EventBus, EventKind, EventWatchers, WorkflowEvent};
pub use message::{Envelope, MessageMeta, Payload, TypeTag, WorkflowMessage};
pub use types::*;
