pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod flow;
pub mod template;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, ModelError, Result, ValidationError, ValidationErrorKind};
pub use event::{EventBus, FlowEvent};
pub use execution::*;
pub use flow::*;
pub use types::*;
