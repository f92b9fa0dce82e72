//! Scan-cycle orchestration: scope registry, per-page merge
//! reconciliation, contact enrichment with its circuit breaker,
//! soft-delete diffing, and the single-flight cycle runner.

pub mod config;
pub mod context;
pub mod reconcile;
pub mod runner;

pub use config::{CycleConfig, Rotation, ScopeRegistry, SourceConfig};
pub use context::{CycleContext, PHONE_FAILURE_LIMIT};
pub use reconcile::{reconcile_soft_deletes, ContactEnrichment, MergeReconciler, SoftDeleteSummary};
pub use runner::{
    ClassifiedAdFactory, CollectorFactory, CycleRunner, CycleSummary, RoomFactory,
};

pub const CRATE_NAME: &str = "adwatch-cycle";
