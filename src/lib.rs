//! dagflow - dependency-aware workflow execution engine
//!
//! A workflow is a directed acyclic graph of typed nodes. dagflow validates
//! the graph, runs every node as soon as all of its dependencies have
//! succeeded, and bounds concurrency with a shared worker pool. Each node
//! attempt goes through a per-node-type circuit breaker and a configurable
//! retry policy, and every state change is recorded through a pluggable
//! [`storage::Storage`] backend.
//!
//! ## Example
//!
//! ```yaml
//! id: nightly-report
//! name: Nightly report
//!
//! nodes:
//!   - id: wait
//!     type: delay
//!     config:
//!       milliseconds: 100
//!
//!   - id: tag
//!     type: set
//!     config:
//!       fields:
//!         - name: report.status
//!           value: ready
//!     depends_on: [wait]
//!
//!   - id: log
//!     type: logger
//!     depends_on: [tag]
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod nodes;
pub mod storage;
pub mod workflow;

pub use engine::Engine;
pub use error::{Error, Result};
pub use workflow::Workflow;
