//! vela-transform - Canonicalization passes
//!
//! Takes the structured IR produced by lowering to the flat, materialized
//! form code generation consumes.
//!
//! # Pipeline
//!
//! ```text
//!   structured IR
//!         ↓
//!   separate_targets   device-annotated functions → target sub-modules
//!         ↓
//!   lifetime           initialize / copy / destroy hook calls
//!         ↓
//!   flatten            if / while / for → one marker-delimited block
//!         ↓
//!   extract_kernels    parallel for → kernel function + launch
//!         ↓
//!   partition          markers → basic blocks
//!         ↓
//!   materialize        locals / projections / derefs → alloca, gep, load, store
//! ```

pub mod walk;
pub mod flatten;
pub mod lifetime;
pub mod materialize;
pub mod kernel;
pub mod targets;
pub mod pipeline;
pub mod session;
pub mod samples;

pub use flatten::{flatten_function, flatten_module, partition_function, partition_module};
pub use kernel::extract_kernels;
pub use lifetime::insert_lifetime_calls;
pub use materialize::materialize_module;
pub use pipeline::{ConfigError, Pipeline, PipelineConfig, PipelineReport, Stage};
pub use session::{Session, SessionError};
pub use targets::separate_targets;
