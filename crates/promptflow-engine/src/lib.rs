pub mod batch;
pub mod bindings;
pub mod condition;
pub mod engine;
pub mod executors;
pub mod history;
pub mod retry;
pub mod store;
pub mod validation;

pub use batch::{BatchCoordinator, BatchTarget};
pub use bindings::Bindings;
pub use engine::FlowEngine;
pub use history::JsonlHistorySink;
pub use retry::RetryingProvider;
pub use store::MemoryStore;
pub use validation::{validate, FlowPlan};
