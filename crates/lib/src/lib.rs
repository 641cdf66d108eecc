//! minicons-lib: an incremental, signature-based build engine
//!
//! Host code declares a graph of nodes and builders through an
//! [`Environment`] and asks it to bring names up to date:
//! - `NodeRegistry`: interned files, directories, values and aliases
//! - `DependencyGraph`: static and discovered edges, one producer per node
//! - `SignatureStore`: persisted per-target records driving staleness
//! - `execute`: parallel scheduling with failure propagation
//!
//! Builders are plain Rust values implementing [`Builder`]. They may report
//! dependencies and outputs they discover while running; those are recorded
//! and reused by later runs.

pub mod builder;
pub mod config;
pub mod consts;
pub mod environment;
pub mod error;
pub mod execute;
pub mod graph;
pub mod node;
pub mod state;
pub mod util;

pub use builder::{BuildContext, BuildOutcome, Builder, BuilderError, Discoveries, FnBuilder};
pub use config::{EnvConfig, SignatureMode};
pub use environment::Environment;
pub use error::ConfigError;
pub use execute::{BlockCause, BuildReport, ExecuteConfig, ExecuteError, PreparedBuild, TargetStatus};
pub use graph::{BuilderId, EdgeKind};
pub use node::{Identity, NodeId, NodeInfo, NodeKind, NodeSpec};
pub use state::{SignatureRecord, SignatureStore, StaleReason};
pub use util::hash::Signature;
