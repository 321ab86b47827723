pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{BatonError, ErrorKind, Result};
pub use event::{EventBus, WorkflowEvent};
pub use types::*;
