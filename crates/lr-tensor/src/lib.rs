//! `lr-tensor` - tensor substrate for llama-runtime.
//!
//! This crate provides:
//! - Data type definitions for float and block-quantized storage
//! - Quantization encode/decode codecs keyed by dtype
//! - A `Backend` trait over arena-owned tensor storage and split execution
//! - A reference `CpuBackend` implementation
//! - A computation graph of operation kinds, partitioned into per-backend
//!   splits

pub mod backend;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod quant;
pub mod shape;

// Re-export primary types at the crate root for convenience.
pub use backend::{Backend, BufferId, MappedRegion, TensorHandle, TENSOR_ALIGNMENT};
pub use cpu::CpuBackend;
pub use dtype::{DType, FILE_DTYPES, QK_K};
pub use error::{Result, TensorError};
pub use graph::{ExecState, Graph, GraphBuilder, NodeId, Op, Split, SplitGraph, Value, View};
pub use shape::Shape;
