//! Forward-pass computation graphs, partitioned into per-backend splits.
//!
//! A graph is a flat, topologically ordered list of nodes; each node is an
//! operation kind plus operand node ids. Tensors that live in backend
//! buffers (weights, KV cache slabs, staging tensors) enter the graph as
//! `Read`/`Weight` leaves and leave it through `Write` nodes. A new split is
//! opened whenever the builder crosses a backend boundary; values consumed
//! across the boundary are recorded as explicit split inputs.

use std::sync::Arc;

use crate::backend::{Backend, TensorHandle};
use crate::error::{Result, TensorError};
use crate::shape::Shape;

pub type NodeId = usize;

/// A strided window into a persistent tensor, in elements.
#[derive(Debug, Clone)]
pub struct View {
    pub offset: usize,
    pub shape: Shape,
    pub strides: Vec<usize>,
}

impl View {
    /// A contiguous view covering `shape` starting at element `offset`.
    pub fn contiguous(offset: usize, shape: Shape) -> Self {
        let strides = shape.strides();
        View {
            offset,
            shape,
            strides,
        }
    }
}

/// Operation kinds. Shapes below are row-major; the innermost dimension is
/// the fastest-varying one.
#[derive(Debug, Clone)]
pub enum Op {
    /// Gather a strided view of a persistent tensor into a contiguous value.
    Read { tensor: TensorHandle, view: View },
    /// A (possibly quantized) weight operand, consumed in place by
    /// `MatMul` and `GetRows` without materialization.
    Weight { tensor: TensorHandle },
    /// Scalar constant, materialized once per graph.
    Const { value: f32 },
    /// Row lookup: `out[i] = weight[ids[i]]` with on-the-fly dequantization.
    GetRows { weight: NodeId, ids: NodeId },
    /// `C[.., n, m] = sum_k A[.., m, k] * B[.., n, k]`. `A` may be a 2-D
    /// `Weight`; batched forms require both operands 3-D with equal batch.
    MatMul { a: NodeId, b: NodeId },
    /// Element-wise sum of equal shapes.
    Add { a: NodeId, b: NodeId },
    /// Element-wise product; `b` may be a 1-D row broadcast over `a`.
    Mul { a: NodeId, b: NodeId },
    /// Multiply every element by the scalar node `s`.
    Scale { a: NodeId, s: NodeId },
    /// RMS normalization over the innermost axis.
    RmsNorm { a: NodeId, eps: f32 },
    /// Rotary position embedding over `[n_tokens, n_head, head_dim]`.
    Rope {
        a: NodeId,
        n_past: usize,
        n_rot: usize,
        freq_base: f32,
        freq_scale: f32,
    },
    /// SiLU activation.
    Silu { a: NodeId },
    /// Softmax over the innermost axis.
    SoftMax { a: NodeId },
    /// Causal mask on `[.., n, kv]`: entries with `kv > n_past + n` get -inf.
    DiagMaskInf { a: NodeId, n_past: usize },
    /// Reinterpret the value with a new shape of equal element count.
    Reshape { a: NodeId, shape: Shape },
    /// Materialize an axis permutation.
    Permute { a: NodeId, axes: Vec<usize> },
    /// Slice `len` outermost rows starting at `start`.
    Rows {
        a: NodeId,
        start: usize,
        len: usize,
    },
    /// Scatter a value into a strided view of a persistent tensor, with
    /// dtype conversion. Produces no value.
    Write {
        src: NodeId,
        tensor: TensorHandle,
        view: View,
    },
}

impl Op {
    pub(crate) fn srcs(&self) -> Vec<NodeId> {
        match self {
            Op::Read { .. } | Op::Weight { .. } | Op::Const { .. } => vec![],
            Op::GetRows { weight, ids } => vec![*weight, *ids],
            Op::MatMul { a, b } | Op::Add { a, b } | Op::Mul { a, b } => vec![*a, *b],
            Op::Scale { a, s } => vec![*a, *s],
            Op::RmsNorm { a, .. }
            | Op::Rope { a, .. }
            | Op::Silu { a }
            | Op::SoftMax { a }
            | Op::DiagMaskInf { a, .. }
            | Op::Reshape { a, .. }
            | Op::Permute { a, .. }
            | Op::Rows { a, .. } => vec![*a],
            Op::Write { src, .. } => vec![*src],
        }
    }
}

/// A graph node: operation, output shape and a debug name.
#[derive(Debug)]
pub struct Node {
    pub op: Op,
    pub shape: Shape,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
}

/// A maximal contiguous subgraph executing on a single backend.
#[derive(Debug)]
pub struct Split {
    pub name: String,
    pub backend: usize,
    pub nodes: Vec<NodeId>,
    /// Values produced by earlier splits and consumed here.
    pub inputs: Vec<NodeId>,
}

/// A computed node value.
#[derive(Debug, Clone)]
pub enum Value {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl Value {
    pub fn as_f32(&self) -> Result<&[f32]> {
        match self {
            Value::F32(v) => Ok(v),
            Value::I32(_) => Err(TensorError::Other("expected f32 value".to_string())),
        }
    }

    pub fn as_i32(&self) -> Result<&[i32]> {
        match self {
            Value::I32(v) => Ok(v),
            Value::F32(_) => Err(TensorError::Other("expected i32 value".to_string())),
        }
    }
}

/// Node values accumulated over the split fold.
#[derive(Debug)]
pub struct ExecState {
    pub values: Vec<Option<Value>>,
    /// Last consumer of each node, if any; executors may drop a value once
    /// its last consumer has run.
    pub last_use: Vec<Option<NodeId>>,
}

impl ExecState {
    pub fn new(n_nodes: usize) -> Self {
        ExecState {
            values: (0..n_nodes).map(|_| None).collect(),
            last_use: Vec::new(),
        }
    }

    pub fn value(&self, id: NodeId) -> Result<&Value> {
        self.values[id]
            .as_ref()
            .ok_or_else(|| TensorError::Other(format!("node {} has no value", id)))
    }
}

/// A fully built graph with its split schedule.
#[derive(Debug)]
pub struct SplitGraph {
    pub graph: Graph,
    pub splits: Vec<Split>,
}

impl SplitGraph {
    /// Execute all splits in order against the given backend registry.
    pub fn execute(&self, backends: &[Arc<dyn Backend>]) -> Result<ExecState> {
        let mut state = ExecState::new(self.graph.nodes.len());
        state.last_use = vec![None; self.graph.nodes.len()];
        for (i, node) in self.graph.nodes.iter().enumerate() {
            for src in node.op.srcs() {
                state.last_use[src] = Some(i);
            }
        }
        for split in &self.splits {
            backends[split.backend].execute(&self.graph, split, &mut state)?;
        }
        Ok(state)
    }
}

/// Incrementally builds a [`SplitGraph`].
///
/// Every node is appended to the split opened by the most recent
/// [`GraphBuilder::split`] call; operands living in earlier splits are
/// recorded as that split's inputs.
pub struct GraphBuilder {
    graph: Graph,
    splits: Vec<Split>,
    node_split: Vec<usize>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder {
            graph: Graph::default(),
            splits: Vec::new(),
            node_split: Vec::new(),
        }
    }

    /// Open a new split on `backend`. Consecutive splits on the same backend
    /// are merged.
    pub fn split(&mut self, backend: usize, name: impl Into<String>) {
        if let Some(last) = self.splits.last() {
            if last.backend == backend {
                return;
            }
        }
        self.splits.push(Split {
            name: name.into(),
            backend,
            nodes: Vec::new(),
            inputs: Vec::new(),
        });
    }

    fn push(&mut self, op: Op, shape: Shape, name: impl Into<String>) -> NodeId {
        let split_idx = self
            .splits
            .len()
            .checked_sub(1)
            .expect("graph node added before the first split");
        let id = self.graph.nodes.len();
        for src in op.srcs() {
            let src_split = self.node_split[src];
            if src_split != split_idx && !self.splits[split_idx].inputs.contains(&src) {
                self.splits[split_idx].inputs.push(src);
            }
        }
        self.graph.nodes.push(Node {
            op,
            shape,
            name: name.into(),
        });
        self.splits[split_idx].nodes.push(id);
        self.node_split.push(split_idx);
        id
    }

    fn shape_of(&self, id: NodeId) -> &Shape {
        &self.graph.nodes[id].shape
    }

    /// Gather a strided view of a persistent tensor.
    pub fn read(&mut self, tensor: TensorHandle, view: View, name: impl Into<String>) -> NodeId {
        let shape = view.shape.clone();
        self.push(Op::Read { tensor, view }, shape, name)
    }

    /// Read a persistent tensor in full, contiguously.
    pub fn read_all(&mut self, tensor: TensorHandle, name: impl Into<String>) -> NodeId {
        let view = View::contiguous(0, tensor.shape.clone());
        self.read(tensor, view, name)
    }

    /// Reference a weight operand for `matmul`/`get_rows`.
    pub fn weight(&mut self, tensor: TensorHandle, name: impl Into<String>) -> NodeId {
        let shape = tensor.shape.clone();
        self.push(Op::Weight { tensor }, shape, name)
    }

    /// Scalar constant node.
    pub fn constant(&mut self, value: f32, name: impl Into<String>) -> NodeId {
        self.push(Op::Const { value }, Shape::new(vec![1]), name)
    }

    pub fn get_rows(&mut self, weight: NodeId, ids: NodeId, name: impl Into<String>) -> NodeId {
        let n = self.shape_of(ids).numel();
        let n_embd = self.shape_of(weight).dim(1);
        self.push(
            Op::GetRows { weight, ids },
            Shape::new(vec![n, n_embd]),
            name,
        )
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId, name: impl Into<String>) -> NodeId {
        let ashape = self.shape_of(a).clone();
        let bshape = self.shape_of(b).clone();
        assert_eq!(
            ashape.inner(),
            bshape.inner(),
            "matmul: inner dimensions differ: {} vs {}",
            ashape,
            bshape
        );
        let out = if ashape.ndim() == 2 {
            let mut dims = bshape.dims().to_vec();
            let last = dims.len() - 1;
            dims[last] = ashape.dim(0);
            Shape::new(dims)
        } else {
            assert_eq!(ashape.ndim(), 3);
            assert_eq!(bshape.ndim(), 3);
            assert_eq!(ashape.dim(0), bshape.dim(0), "matmul: batch mismatch");
            Shape::new(vec![ashape.dim(0), bshape.dim(1), ashape.dim(1)])
        };
        self.push(Op::MatMul { a, b }, out, name)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId, name: impl Into<String>) -> NodeId {
        let shape = self.shape_of(a).clone();
        self.push(Op::Add { a, b }, shape, name)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId, name: impl Into<String>) -> NodeId {
        let shape = self.shape_of(a).clone();
        self.push(Op::Mul { a, b }, shape, name)
    }

    pub fn scale(&mut self, a: NodeId, s: NodeId, name: impl Into<String>) -> NodeId {
        let shape = self.shape_of(a).clone();
        self.push(Op::Scale { a, s }, shape, name)
    }

    pub fn rms_norm(&mut self, a: NodeId, eps: f32, name: impl Into<String>) -> NodeId {
        let shape = self.shape_of(a).clone();
        self.push(Op::RmsNorm { a, eps }, shape, name)
    }

    pub fn rope(
        &mut self,
        a: NodeId,
        n_past: usize,
        n_rot: usize,
        freq_base: f32,
        freq_scale: f32,
        name: impl Into<String>,
    ) -> NodeId {
        let shape = self.shape_of(a).clone();
        assert_eq!(shape.ndim(), 3, "rope expects [n_tokens, n_head, head_dim]");
        self.push(
            Op::Rope {
                a,
                n_past,
                n_rot,
                freq_base,
                freq_scale,
            },
            shape,
            name,
        )
    }

    pub fn silu(&mut self, a: NodeId, name: impl Into<String>) -> NodeId {
        let shape = self.shape_of(a).clone();
        self.push(Op::Silu { a }, shape, name)
    }

    pub fn soft_max(&mut self, a: NodeId, name: impl Into<String>) -> NodeId {
        let shape = self.shape_of(a).clone();
        self.push(Op::SoftMax { a }, shape, name)
    }

    pub fn diag_mask_inf(&mut self, a: NodeId, n_past: usize, name: impl Into<String>) -> NodeId {
        let shape = self.shape_of(a).clone();
        self.push(Op::DiagMaskInf { a, n_past }, shape, name)
    }

    pub fn reshape(&mut self, a: NodeId, shape: Shape, name: impl Into<String>) -> NodeId {
        assert_eq!(self.shape_of(a).numel(), shape.numel());
        self.push(Op::Reshape { a, shape: shape.clone() }, shape, name)
    }

    pub fn permute(&mut self, a: NodeId, axes: Vec<usize>, name: impl Into<String>) -> NodeId {
        let src = self.shape_of(a);
        let dims: Vec<usize> = axes.iter().map(|&ax| src.dim(ax)).collect();
        self.push(Op::Permute { a, axes }, Shape::new(dims), name)
    }

    pub fn rows(
        &mut self,
        a: NodeId,
        start: usize,
        len: usize,
        name: impl Into<String>,
    ) -> NodeId {
        let src = self.shape_of(a);
        let mut dims = src.dims().to_vec();
        dims[0] = len;
        self.push(Op::Rows { a, start, len }, Shape::new(dims), name)
    }

    pub fn write(
        &mut self,
        src: NodeId,
        tensor: TensorHandle,
        view: View,
        name: impl Into<String>,
    ) -> NodeId {
        assert_eq!(
            self.shape_of(src).numel(),
            view.shape.numel(),
            "write: element count mismatch"
        );
        self.push(Op::Write { src, tensor, view }, Shape::new(vec![]), name)
    }

    pub fn finish(self) -> SplitGraph {
        SplitGraph {
            graph: self.graph,
            splits: self.splits,
        }
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_merging_and_inputs() {
        let mut b = GraphBuilder::new();
        b.split(0, "first");
        let c0 = b.constant(2.0, "two");
        let c1 = b.constant(3.0, "three");
        let sum = b.add(c0, c1, "sum");
        b.split(0, "still-first");
        let _ = b.mul(sum, c0, "prod");
        b.split(1, "second");
        let scaled = b.scale(sum, c1, "scaled");
        let g = b.finish();

        assert_eq!(g.splits.len(), 2);
        assert_eq!(g.splits[0].backend, 0);
        assert_eq!(g.splits[1].backend, 1);
        // the second split consumes `sum` and `c1` from the first
        assert!(g.splits[1].inputs.contains(&sum));
        assert!(g.splits[1].inputs.contains(&c1));
        assert_eq!(g.graph.nodes[scaled].name, "scaled");
    }

    #[test]
    fn test_matmul_shapes() {
        let mut b = GraphBuilder::new();
        b.split(0, "s");
        let w = b.weight(
            TensorHandle {
                buffer: 0,
                offset: 0,
                dtype: crate::DType::F32,
                shape: Shape::new(vec![8, 4]),
            },
            "w",
        );
        // [8,4] x [3,4] -> [3,8]
        let act = b.weight(
            TensorHandle {
                buffer: 0,
                offset: 0,
                dtype: crate::DType::F32,
                shape: Shape::new(vec![3, 4]),
            },
            "act",
        );
        let y = b.matmul(w, act, "y");
        assert_eq!(b.shape_of(y).dims(), &[3, 8]);
    }
}
