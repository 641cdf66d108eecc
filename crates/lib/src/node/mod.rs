//! Build graph entities: files, directories, values and aliases.

mod registry;
mod signature;
mod types;

pub use registry::NodeRegistry;
pub use signature::{SignatureCache, compute_signature, spec_signature};
pub use types::{Identity, NodeId, NodeInfo, NodeKind, NodeSpec};
