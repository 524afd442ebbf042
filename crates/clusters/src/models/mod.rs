//! Domain records shared by every stage of the pipeline

pub mod cluster;
pub mod problem;
pub mod trigger;

pub use cluster::{Cluster, ClusterMetrics, ClusterSnapshot, SnapshotReason};
pub use problem::{LifecycleStage, Placement, ProblemRecord};
pub use trigger::{ChangeTrigger, ChangeType, Priority};
