//! Clusters - Problem Cluster Lifecycle Engine
//!
//! Groups extracted problem statements into durable clusters of recurring
//! workflows. A batch builder seeds clusters from a bounded pool, a streaming
//! assigner routes each new record (merge, found, or orphan), a change
//! detector flags clusters whose metrics drifted since their last snapshot,
//! and a lifecycle manager enforces orphan retention and cluster archival.
//!
//! The vector index, relational store and LLM judge are consumed through the
//! [`index::VectorIndex`], [`store::ClusterStore`] and [`judge::SemanticJudge`]
//! traits so they can be swapped without touching the policy code.

pub mod assigner;
pub mod builder;
pub mod clustering;
pub mod config;
pub mod detector;
pub mod error;
pub mod frequency;
pub mod index;
pub mod journal;
pub mod judge;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod similarity;
pub mod store;
pub mod sync;

pub use config::ClustersConfig;
pub use error::{ClusterError, Result};
pub use models::{
  ChangeTrigger, ChangeType, Cluster, ClusterMetrics, ClusterSnapshot, LifecycleStage, Placement,
  Priority, ProblemRecord, SnapshotReason,
};
