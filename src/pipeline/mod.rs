//! Question Pipeline Module
//!
//! Turns a natural-language question into an answer over the live database:
//!
//! 1. **Generate**: the model writes candidate SQL from the schema catalog
//! 2. **Validate**: the candidate is parsed, scope-checked and row-capped
//! 3. **Execute**: the validated statement runs in a read-only transaction
//! 4. **Answer**: the model summarizes the rows, or the raw table is returned

pub mod answer;
pub mod executor;
pub mod orchestrator;
pub mod types;
pub mod validator;
pub mod values;

// Re-export main types for convenient access
pub use orchestrator::{Orchestrator, PipelineConfig};
pub use types::PipelineResponse;
