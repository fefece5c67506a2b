//! Workflow graph model, loading and dependency resolution.
//!
//! A workflow is a set of typed nodes joined by edges (and by each node's
//! `dependencies` list). The [`DependencyResolver`] turns that graph into an
//! execution order, parallel layers and readiness checks.

mod parser;
mod resolver;
mod types;

pub use parser::{parse_workflow, parse_workflow_file};
pub use resolver::DependencyResolver;
pub use types::*;
