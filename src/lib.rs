//! # gradflow: Execution-Graph Machine Learning Engine in Rust
//!
//! **gradflow** is a machine-learning toolkit built around an
//! **execution graph**: a directed computation graph of polymorphic
//! nodes driven by an operation queue, performing forward inference and
//! reverse-mode differentiation (including backpropagation-through-time
//! for sequential data) over batched tensor data.
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gradflow::graph::{Engine, ExecutionContext, Graph, LearningConfig, LearningContext, NodeOp};
//! use gradflow::linalg::ActivationKind;
//!
//! // 1. Build the computation graph
//! let mut graph = Graph::new();
//! let input = graph.add_node(Some("input"), NodeOp::FlowThrough);
//! let dense = graph.add_node(Some("dense"), NodeOp::dense(4, 8));
//! let relu = graph.add_node(Some("relu"), NodeOp::Activation(ActivationKind::Relu));
//! graph.connect(input, dense).unwrap();
//! graph.connect(dense, relu).unwrap();
//!
//! // 2. Create run state and train over a data source
//! let engine = Engine::new(graph);
//! let execution = Arc::new(ExecutionContext::new());
//! let mut learning = LearningContext::new(LearningConfig::new(0.1, 32));
//!
//! // engine.train(&source, &execution, &mut learning) per epoch
//! ```

// Declare public modules that constitute the core library API.
pub mod data;
pub mod graph;
pub mod linalg;
