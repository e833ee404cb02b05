use thiserror::Error;

use crate::tree::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("unknown node {0} (never created or already detached)")]
    UnknownNode(NodeId),

    #[error("node {0} is not a leaf")]
    NotALeaf(NodeId),

    #[error("node {0} is not a sector")]
    NotASector(NodeId),

    #[error("item is already queued on node {owner}")]
    AlreadyOwned { owner: NodeId },

    #[error("client {0} already has a child on this sector")]
    DuplicateClient(String),

    #[error("node {0} already has a parent")]
    AlreadyAttached(NodeId),

    #[error("leaf {0} is empty; only leaves holding items can be attached")]
    EmptyLeaf(NodeId),

    #[error("selection tree invariant violated: {0}")]
    Invariant(String),
}
