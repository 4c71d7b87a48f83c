//! Whale Provenance Library
//!
//! Backward funding tracer and common-funder cluster detection for
//! on-chain wallets.

pub mod cache;
pub mod classifier;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod report;
pub mod source;
pub mod tracer;
pub mod types;

// Re-export commonly used types
pub use classifier::{AddressClassifier, AddressRegistry};
pub use cluster::{ClusterDetector, ClusterRequest};
pub use config::Config;
pub use error::{Error, Result};
pub use report::{ClusterReport, ReportAssembler, TraceReport};
pub use source::ChainDataSource;
pub use tracer::{ProvenanceTracer, TraceRequest};
pub use types::{Chain, Classification, TraceResult};
