//! # Data Loading Module
//!
//! Converts row-oriented datasets into [`MiniBatch`] objects for the
//! execution-graph engine.
//!
//! ## Key Components
//!
//! - [`DataSource`]: trait adapting a backing dataset to the engine
//! - [`SequentialDataSource`]: variable-length sequences, bucketed by depth
//! - [`VectorDataSource`]: plain feature/target tables (single timestep)
//! - [`MiniBatch`]: timestep-major batch with sequence-position tags
//!
//! ## Example
//!
//! ```ignore
//! use gradflow::data::{DataSource, SequentialDataSource};
//!
//! let source = SequentialDataSource::new(sequences);
//! for bucket in source.get_buckets() {
//!     let batch = source.get(&bucket)?;
//!     // drive the graph over batch.steps()
//! }
//! ```

pub mod minibatch;
pub mod source;

pub use minibatch::{MiniBatch, MiniBatchStep, MiniBatchType};
pub use source::{DataError, DataResult, DataSource, SequentialDataSource, VectorDataSource};
