//! Node executors.
//!
//! Each node type implements [`NodeExecutor`]. Types are registered by name
//! in a [`NodeRegistry`] through a constructor that receives the node's
//! `config`.

mod delay;
mod logger;
mod registry;
mod set;
mod types;

pub use delay::DelayNode;
pub use logger::LoggerNode;
pub use registry::{NodeConstructor, NodeRegistry};
pub use set::SetNode;
pub use types::{ExecutionResult, NodeContext, NodeExecutor, NodeInput, ResultStatus};
