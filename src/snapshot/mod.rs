//! Schema snapshot caching and drift detection.

pub mod diff;
pub mod store;

pub use diff::DriftReport;
pub use store::SchemaCatalog;
