//! Pure-Rust CPU backend.
//!
//! Buffers are linear arenas (owned allocations or shared mmap regions);
//! kernels are straightforward loops optimized for correctness rather than
//! peak throughput. Matrix products dequantize weight rows on the fly and
//! fan out over the configured thread count.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use half::f16;

use crate::backend::{
    Backend, BufferId, MappedRegion, TensorHandle, TENSOR_ALIGNMENT, TENSOR_OVERHEAD,
};
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::graph::{ExecState, Graph, NodeId, Op, Split, Value, View};
use crate::quant::dequantize_row;
use crate::shape::Shape;

enum Storage {
    Owned(Vec<u8>),
    Mapped(Arc<dyn MappedRegion>),
}

struct BufferSlot {
    storage: Storage,
    cursor: usize,
    capacity: usize,
}

impl BufferSlot {
    fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(v) => v,
            Storage::Mapped(m) => m.as_bytes(),
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.storage {
            Storage::Owned(v) => Ok(v),
            Storage::Mapped(_) => Err(TensorError::InvalidAccess(
                "mapped buffers are read-only".to_string(),
            )),
        }
    }
}

/// CPU compute backend.
pub struct CpuBackend {
    name: String,
    ram_shared: bool,
    n_threads: AtomicUsize,
    buffers: RwLock<Vec<Option<BufferSlot>>>,
}

impl fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBackend")
            .field("name", &self.name)
            .field("ram_shared", &self.ram_shared)
            .finish()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend {
            name: "cpu".to_string(),
            ram_shared: true,
            n_threads: AtomicUsize::new(1),
            buffers: RwLock::new(Vec::new()),
        }
    }

    /// A CPU-resident backend that behaves like a discrete device for
    /// placement purposes: no RAM sharing, so tensor data goes through the
    /// bounce-buffer upload path. Used to exercise split scheduling without
    /// device code.
    pub fn non_shared(name: &str) -> Self {
        CpuBackend {
            name: name.to_string(),
            ram_shared: false,
            n_threads: AtomicUsize::new(1),
            buffers: RwLock::new(Vec::new()),
        }
    }

    fn buffers_read(&self) -> Result<RwLockReadGuard<'_, Vec<Option<BufferSlot>>>> {
        self.buffers
            .read()
            .map_err(|_| TensorError::Other("buffer table lock poisoned".to_string()))
    }

    fn buffers_write(&self) -> Result<RwLockWriteGuard<'_, Vec<Option<BufferSlot>>>> {
        self.buffers
            .write()
            .map_err(|_| TensorError::Other("buffer table lock poisoned".to_string()))
    }
}

fn slot<'a>(bufs: &'a [Option<BufferSlot>], id: BufferId) -> Result<&'a BufferSlot> {
    bufs.get(id)
        .and_then(|s| s.as_ref())
        .ok_or_else(|| TensorError::InvalidAccess(format!("no buffer {}", id)))
}

fn slot_mut<'a>(bufs: &'a mut [Option<BufferSlot>], id: BufferId) -> Result<&'a mut BufferSlot> {
    bufs.get_mut(id)
        .and_then(|s| s.as_mut())
        .ok_or_else(|| TensorError::InvalidAccess(format!("no buffer {}", id)))
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ram_shared(&self) -> bool {
        self.ram_shared
    }

    fn alloc_buffer(&self, size: usize, max_tensors: usize) -> Result<BufferId> {
        let capacity = size + max_tensors * TENSOR_OVERHEAD;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|e| TensorError::AllocFailure(format!("{} bytes: {}", capacity, e)))?;
        data.resize(capacity, 0);
        let mut bufs = self.buffers_write()?;
        bufs.push(Some(BufferSlot {
            storage: Storage::Owned(data),
            cursor: 0,
            capacity,
        }));
        Ok(bufs.len() - 1)
    }

    fn free_buffer(&self, buffer: BufferId) {
        if let Ok(mut bufs) = self.buffers_write() {
            if let Some(s) = bufs.get_mut(buffer) {
                *s = None;
            }
        }
    }

    fn map_buffer(&self, region: Arc<dyn MappedRegion>) -> Result<BufferId> {
        if !self.ram_shared {
            return Err(TensorError::Other(format!(
                "backend '{}' cannot share mapped memory",
                self.name
            )));
        }
        let capacity = region.as_bytes().len();
        let mut bufs = self.buffers_write()?;
        bufs.push(Some(BufferSlot {
            storage: Storage::Mapped(region),
            cursor: capacity,
            capacity,
        }));
        Ok(bufs.len() - 1)
    }

    fn create_tensor(
        &self,
        buffer: BufferId,
        dtype: DType,
        shape: Shape,
    ) -> Result<TensorHandle> {
        if shape.dim(shape.ndim() - 1) % dtype.block_size() != 0 {
            return Err(TensorError::Other(format!(
                "tensor shape {} not divisible by {} block size",
                shape, dtype
            )));
        }
        let nbytes = dtype.row_bytes(shape.numel());
        let mut bufs = self.buffers_write()?;
        let s = slot_mut(&mut bufs, buffer)?;
        let offset = (s.cursor + TENSOR_ALIGNMENT - 1) & !(TENSOR_ALIGNMENT - 1);
        if offset + nbytes > s.capacity {
            return Err(TensorError::AllocFailure(format!(
                "buffer {} exhausted: need {} bytes at {}, capacity {}",
                buffer, nbytes, offset, s.capacity
            )));
        }
        s.cursor = offset + nbytes;
        Ok(TensorHandle {
            buffer,
            offset,
            dtype,
            shape,
        })
    }

    fn upload(&self, tensor: &TensorHandle, data: &[u8], offset: usize) -> Result<()> {
        let mut bufs = self.buffers_write()?;
        let s = slot_mut(&mut bufs, tensor.buffer)?;
        let start = tensor.offset + offset;
        let dst = s.bytes_mut()?;
        if start + data.len() > dst.len() {
            return Err(TensorError::InvalidAccess(format!(
                "upload past end of buffer {}",
                tensor.buffer
            )));
        }
        dst[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download(&self, tensor: &TensorHandle, out: &mut [u8], offset: usize) -> Result<()> {
        let bufs = self.buffers_read()?;
        let s = slot(&bufs, tensor.buffer)?;
        let start = tensor.offset + offset;
        let src = s.bytes();
        if start + out.len() > src.len() {
            return Err(TensorError::InvalidAccess(format!(
                "download past end of buffer {}",
                tensor.buffer
            )));
        }
        out.copy_from_slice(&src[start..start + out.len()]);
        Ok(())
    }

    fn set_n_threads(&self, n: usize) {
        self.n_threads.store(n.max(1), Ordering::Relaxed);
    }

    fn execute(&self, graph: &Graph, split: &Split, state: &mut ExecState) -> Result<()> {
        for &id in &split.nodes {
            let node = &graph.nodes[id];
            let value = match &node.op {
                // weights are consumed in place by matmul/get_rows
                Op::Weight { .. } => continue,
                Op::Write { src, tensor, view } => {
                    self.write_view(state.value(*src)?.as_f32()?, tensor, view)?;
                    release_dead_operands(graph, id, state);
                    continue;
                }
                Op::Const { value } => Value::F32(vec![*value]),
                Op::Read { tensor, view } => self.read_view(tensor, view)?,
                Op::GetRows { weight, ids } => self.get_rows(graph, *weight, *ids, state)?,
                Op::MatMul { a, b } => self.matmul(graph, *a, *b, state)?,
                Op::Add { a, b } => {
                    let av = state.value(*a)?.as_f32()?;
                    let bv = state.value(*b)?.as_f32()?;
                    if av.len() != bv.len() {
                        return Err(TensorError::ShapeMismatch {
                            expected: vec![av.len()],
                            got: vec![bv.len()],
                        });
                    }
                    Value::F32(av.iter().zip(bv).map(|(x, y)| x + y).collect())
                }
                Op::Mul { a, b } => {
                    let av = state.value(*a)?.as_f32()?;
                    let bv = state.value(*b)?.as_f32()?;
                    mul_broadcast(av, bv)?
                }
                Op::Scale { a, s } => {
                    let av = state.value(*a)?.as_f32()?;
                    let sv = state.value(*s)?.as_f32()?;
                    Value::F32(av.iter().map(|x| x * sv[0]).collect())
                }
                Op::RmsNorm { a, eps } => {
                    let av = state.value(*a)?.as_f32()?;
                    rms_norm(av, graph.nodes[*a].shape.inner(), *eps)
                }
                Op::Rope {
                    a,
                    n_past,
                    n_rot,
                    freq_base,
                    freq_scale,
                } => {
                    let av = state.value(*a)?.as_f32()?;
                    rope(
                        av,
                        &graph.nodes[*a].shape,
                        *n_past,
                        *n_rot,
                        *freq_base,
                        *freq_scale,
                    )
                }
                Op::Silu { a } => {
                    let av = state.value(*a)?.as_f32()?;
                    Value::F32(av.iter().map(|&v| v / (1.0 + (-v).exp())).collect())
                }
                Op::SoftMax { a } => {
                    let av = state.value(*a)?.as_f32()?;
                    soft_max(av, graph.nodes[*a].shape.inner())
                }
                Op::DiagMaskInf { a, n_past } => {
                    let av = state.value(*a)?.as_f32()?;
                    diag_mask_inf(av, &graph.nodes[*a].shape, *n_past)
                }
                Op::Reshape { a, .. } => state.value(*a)?.clone(),
                Op::Permute { a, axes } => {
                    let av = state.value(*a)?.as_f32()?;
                    permute3(av, &graph.nodes[*a].shape, axes)?
                }
                Op::Rows { a, start, len } => {
                    let av = state.value(*a)?.as_f32()?;
                    let shape = &graph.nodes[*a].shape;
                    let row = shape.numel() / shape.dim(0);
                    Value::F32(av[start * row..(start + len) * row].to_vec())
                }
            };
            state.values[id] = Some(value);
            release_dead_operands(graph, id, state);
        }
        Ok(())
    }
}

/// Drop operand values whose last consumer was node `id`.
fn release_dead_operands(graph: &Graph, id: NodeId, state: &mut ExecState) {
    for src in graph.nodes[id].op.srcs() {
        if state.last_use.get(src).copied().flatten() == Some(id) {
            state.values[src] = None;
        }
    }
}

impl CpuBackend {
    fn read_view(&self, tensor: &TensorHandle, view: &View) -> Result<Value> {
        let bufs = self.buffers_read()?;
        let data = slot(&bufs, tensor.buffer)?.bytes();
        let (d, s) = padded3(&view.shape, &view.strides);
        let elt = match tensor.dtype {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            other => {
                return Err(TensorError::UnsupportedDType(format!(
                    "cannot read a strided view of {}",
                    other
                )));
            }
        };
        let check = |e: usize| -> Result<usize> {
            let byte = tensor.offset + e * elt;
            if byte + elt > data.len() {
                return Err(TensorError::InvalidAccess(
                    "view reaches past end of buffer".to_string(),
                ));
            }
            Ok(byte)
        };
        match tensor.dtype {
            DType::I32 => {
                let mut out = Vec::with_capacity(view.shape.numel());
                for i0 in 0..d[0] {
                    for i1 in 0..d[1] {
                        for i2 in 0..d[2] {
                            let e = view.offset + i0 * s[0] + i1 * s[1] + i2 * s[2];
                            let b = check(e)?;
                            out.push(i32::from_le_bytes(data[b..b + 4].try_into().unwrap()));
                        }
                    }
                }
                Ok(Value::I32(out))
            }
            _ => {
                let mut out = Vec::with_capacity(view.shape.numel());
                for i0 in 0..d[0] {
                    for i1 in 0..d[1] {
                        for i2 in 0..d[2] {
                            let e = view.offset + i0 * s[0] + i1 * s[1] + i2 * s[2];
                            let b = check(e)?;
                            let v = if elt == 4 {
                                f32::from_le_bytes(data[b..b + 4].try_into().unwrap())
                            } else {
                                f16::from_le_bytes(data[b..b + 2].try_into().unwrap()).to_f32()
                            };
                            out.push(v);
                        }
                    }
                }
                Ok(Value::F32(out))
            }
        }
    }

    fn write_view(&self, src: &[f32], tensor: &TensorHandle, view: &View) -> Result<()> {
        let mut bufs = self.buffers_write()?;
        let data = slot_mut(&mut bufs, tensor.buffer)?.bytes_mut()?;
        let (d, s) = padded3(&view.shape, &view.strides);
        let elt = match tensor.dtype {
            DType::F32 => 4,
            DType::F16 => 2,
            other => {
                return Err(TensorError::UnsupportedDType(format!(
                    "cannot write a strided view of {}",
                    other
                )));
            }
        };
        let mut i = 0;
        for i0 in 0..d[0] {
            for i1 in 0..d[1] {
                for i2 in 0..d[2] {
                    let e = view.offset + i0 * s[0] + i1 * s[1] + i2 * s[2];
                    let b = tensor.offset + e * elt;
                    if b + elt > data.len() {
                        return Err(TensorError::InvalidAccess(
                            "view reaches past end of buffer".to_string(),
                        ));
                    }
                    if elt == 4 {
                        data[b..b + 4].copy_from_slice(&src[i].to_le_bytes());
                    } else {
                        data[b..b + 2].copy_from_slice(&f16::from_f32(src[i]).to_le_bytes());
                    }
                    i += 1;
                }
            }
        }
        Ok(())
    }

    fn get_rows(
        &self,
        graph: &Graph,
        weight: NodeId,
        ids: NodeId,
        state: &ExecState,
    ) -> Result<Value> {
        let tensor = weight_operand(graph, weight)?;
        let ids = state.value(ids)?.as_i32()?;
        let n_rows = tensor.shape.dim(0);
        let n_embd = tensor.shape.dim(1);
        let row_bytes = tensor.dtype.row_bytes(n_embd);
        let bufs = self.buffers_read()?;
        let data = slot(&bufs, tensor.buffer)?.bytes();
        let mut out = vec![0.0f32; ids.len() * n_embd];
        for (i, &id) in ids.iter().enumerate() {
            let id = id as usize;
            if id >= n_rows {
                return Err(TensorError::InvalidAccess(format!(
                    "row {} out of range for {} rows",
                    id, n_rows
                )));
            }
            let start = tensor.offset + id * row_bytes;
            dequantize_row(
                tensor.dtype,
                &data[start..start + row_bytes],
                &mut out[i * n_embd..(i + 1) * n_embd],
            )?;
        }
        Ok(Value::F32(out))
    }

    fn matmul(&self, graph: &Graph, a: NodeId, b: NodeId, state: &ExecState) -> Result<Value> {
        let n_threads = self.n_threads.load(Ordering::Relaxed).max(1);
        let bv = state.value(b)?.as_f32()?;
        if let Op::Weight { tensor } = &graph.nodes[a].op {
            let m = tensor.shape.dim(0);
            let k = tensor.shape.dim(1);
            if bv.len() % k != 0 {
                return Err(TensorError::MatmulMismatch {
                    m,
                    k,
                    k2: bv.len(),
                    n: 0,
                });
            }
            let n = bv.len() / k;
            let bufs = self.buffers_read()?;
            let data = slot(&bufs, tensor.buffer)?.bytes();
            let wbytes = &data[tensor.offset..tensor.offset + tensor.dtype.row_bytes(m * k)];
            let mut out = vec![0.0f32; n * m];
            matmul_weight(tensor.dtype, wbytes, m, k, bv, n, &mut out, n_threads)?;
            return Ok(Value::F32(out));
        }
        let av = state.value(a)?.as_f32()?;
        let ashape = &graph.nodes[a].shape;
        let bshape = &graph.nodes[b].shape;
        let (batch, m, k) = match ashape.ndim() {
            2 => (1, ashape.dim(0), ashape.dim(1)),
            3 => (ashape.dim(0), ashape.dim(1), ashape.dim(2)),
            _ => {
                return Err(TensorError::Other(
                    "matmul operand must be 2-D or 3-D".to_string(),
                ));
            }
        };
        if bshape.ndim() < 2 {
            return Err(TensorError::Other(
                "matmul operand must be 2-D or 3-D".to_string(),
            ));
        }
        let n = bshape.dim(bshape.ndim() - 2);
        if bshape.inner() != k || bv.len() != batch * n * k {
            return Err(TensorError::MatmulMismatch {
                m,
                k,
                k2: bshape.inner(),
                n,
            });
        }
        let mut out = vec![0.0f32; batch * n * m];
        matmul_batched(av, bv, batch, m, k, n, &mut out, n_threads);
        Ok(Value::F32(out))
    }
}

fn weight_operand<'g>(graph: &'g Graph, id: NodeId) -> Result<&'g TensorHandle> {
    match &graph.nodes[id].op {
        Op::Weight { tensor } => Ok(tensor),
        _ => Err(TensorError::Other(
            "operand must be a weight tensor".to_string(),
        )),
    }
}

fn padded3(shape: &Shape, strides: &[usize]) -> ([usize; 3], [usize; 3]) {
    let mut d = [1usize; 3];
    let mut s = [0usize; 3];
    let nd = shape.ndim();
    for i in 0..nd {
        d[3 - nd + i] = shape.dim(i);
        s[3 - nd + i] = strides[i];
    }
    (d, s)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mul_broadcast(a: &[f32], b: &[f32]) -> Result<Value> {
    if a.len() == b.len() {
        return Ok(Value::F32(a.iter().zip(b).map(|(x, y)| x * y).collect()));
    }
    if b.is_empty() || a.len() % b.len() != 0 {
        return Err(TensorError::ShapeMismatch {
            expected: vec![a.len()],
            got: vec![b.len()],
        });
    }
    let mut out = Vec::with_capacity(a.len());
    for row in a.chunks_exact(b.len()) {
        out.extend(row.iter().zip(b).map(|(x, y)| x * y));
    }
    Ok(Value::F32(out))
}

fn rms_norm(x: &[f32], inner: usize, eps: f32) -> Value {
    let mut out = Vec::with_capacity(x.len());
    for row in x.chunks_exact(inner) {
        let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / inner as f32;
        let inv = 1.0 / (mean_sq + eps).sqrt();
        out.extend(row.iter().map(|v| v * inv));
    }
    Value::F32(out)
}

fn soft_max(x: &[f32], inner: usize) -> Value {
    let mut out = Vec::with_capacity(x.len());
    for row in x.chunks_exact(inner) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        let start = out.len();
        for &v in row {
            let e = (v - max).exp();
            out.push(e);
            sum += e;
        }
        for v in &mut out[start..] {
            *v /= sum;
        }
    }
    Value::F32(out)
}

fn diag_mask_inf(x: &[f32], shape: &Shape, n_past: usize) -> Value {
    let nc = shape.inner();
    let nr = shape.dim(shape.ndim() - 2);
    let mut out = x.to_vec();
    for (r, row) in out.chunks_exact_mut(nc).enumerate() {
        let i = r % nr;
        for (j, v) in row.iter_mut().enumerate() {
            if j > n_past + i {
                *v = f32::NEG_INFINITY;
            }
        }
    }
    Value::F32(out)
}

fn rope(
    x: &[f32],
    shape: &Shape,
    n_past: usize,
    n_rot: usize,
    freq_base: f32,
    freq_scale: f32,
) -> Value {
    let n_tokens = shape.dim(0);
    let n_head = shape.dim(1);
    let head_dim = shape.dim(2);
    let mut out = x.to_vec();
    for t in 0..n_tokens {
        let theta_base = freq_scale * (n_past + t) as f32;
        for h in 0..n_head {
            let base = (t * n_head + h) * head_dim;
            for i in 0..n_rot / 2 {
                let theta = theta_base * freq_base.powf(-(2.0 * i as f32) / n_rot as f32);
                let (sin, cos) = theta.sin_cos();
                let x0 = x[base + 2 * i];
                let x1 = x[base + 2 * i + 1];
                out[base + 2 * i] = x0 * cos - x1 * sin;
                out[base + 2 * i + 1] = x0 * sin + x1 * cos;
            }
        }
    }
    Value::F32(out)
}

fn permute3(x: &[f32], shape: &Shape, axes: &[usize]) -> Result<Value> {
    if shape.ndim() != 3 || axes.len() != 3 {
        return Err(TensorError::Other("permute expects a 3-D value".to_string()));
    }
    let sd = [shape.dim(0), shape.dim(1), shape.dim(2)];
    let od = [sd[axes[0]], sd[axes[1]], sd[axes[2]]];
    let mut out = Vec::with_capacity(x.len());
    for o0 in 0..od[0] {
        for o1 in 0..od[1] {
            for o2 in 0..od[2] {
                let mut si = [0usize; 3];
                si[axes[0]] = o0;
                si[axes[1]] = o1;
                si[axes[2]] = o2;
                out.push(x[(si[0] * sd[1] + si[1]) * sd[2] + si[2]]);
            }
        }
    }
    Ok(Value::F32(out))
}

/// `out[n, m] = sum_k row_m(W)[k] * b[n, k]`, dequantizing one weight row at
/// a time. Work is split over `n_threads` ranges of weight rows; each worker
/// produces a row-major partial block that is scattered into the column-major
/// result after the join.
#[allow(clippy::too_many_arguments)]
fn matmul_weight(
    dtype: DType,
    wbytes: &[u8],
    m: usize,
    k: usize,
    b: &[f32],
    n: usize,
    out: &mut [f32],
    n_threads: usize,
) -> Result<()> {
    let row_bytes = dtype.row_bytes(k);
    let compute = |m0: usize, m1: usize| -> Result<Vec<f32>> {
        let mut partial = vec![0.0f32; (m1 - m0) * n];
        let mut row = vec![0.0f32; k];
        for mm in m0..m1 {
            dequantize_row(dtype, &wbytes[mm * row_bytes..(mm + 1) * row_bytes], &mut row)?;
            for nn in 0..n {
                partial[(mm - m0) * n + nn] = dot(&row, &b[nn * k..(nn + 1) * k]);
            }
        }
        Ok(partial)
    };

    let n_threads = n_threads.min(m).max(1);
    if n_threads == 1 {
        let partial = compute(0, m)?;
        scatter(&partial, 0, m, n, out);
        return Ok(());
    }

    let chunk = m.div_ceil(n_threads);
    let results = std::thread::scope(|scope| {
        let compute = &compute;
        let mut handles = Vec::new();
        for t in 0..n_threads {
            let m0 = t * chunk;
            let m1 = ((t + 1) * chunk).min(m);
            if m0 >= m1 {
                break;
            }
            handles.push((m0, m1, scope.spawn(move || compute(m0, m1))));
        }
        let mut results = Vec::new();
        for (m0, m1, h) in handles {
            match h.join() {
                Ok(r) => results.push((m0, m1, r)),
                Err(_) => results.push((
                    m0,
                    m1,
                    Err(TensorError::Other("matmul worker panicked".to_string())),
                )),
            }
        }
        results
    });
    for (m0, m1, r) in results {
        let partial = r?;
        scatter(&partial, m0, m1, n, out);
    }
    Ok(())
}

fn scatter(partial: &[f32], m0: usize, m1: usize, n: usize, out: &mut [f32]) {
    let m = out.len() / n;
    for mm in m0..m1 {
        for nn in 0..n {
            out[nn * m + mm] = partial[(mm - m0) * n + nn];
        }
    }
}

/// Batched `out[b, n, m] = sum_k a[b, m, k] * b[b, n, k]`, parallel over the
/// batch dimension.
#[allow(clippy::too_many_arguments)]
fn matmul_batched(
    a: &[f32],
    b: &[f32],
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
    out: &mut [f32],
    n_threads: usize,
) {
    let block = |bi: usize, out_block: &mut [f32]| {
        let ab = &a[bi * m * k..(bi + 1) * m * k];
        let bb = &b[bi * n * k..(bi + 1) * n * k];
        for nn in 0..n {
            for mm in 0..m {
                out_block[nn * m + mm] = dot(&ab[mm * k..(mm + 1) * k], &bb[nn * k..(nn + 1) * k]);
            }
        }
    };
    let n_threads = n_threads.min(batch).max(1);
    if n_threads == 1 {
        for (bi, out_block) in out.chunks_exact_mut(n * m).enumerate() {
            block(bi, out_block);
        }
        return;
    }
    let per = batch.div_ceil(n_threads);
    std::thread::scope(|scope| {
        for (t, chunk) in out.chunks_mut(per * n * m).enumerate() {
            let block = &block;
            scope.spawn(move || {
                for (i, out_block) in chunk.chunks_exact_mut(n * m).enumerate() {
                    block(t * per + i, out_block);
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::quant::{quantize_chunk, HIST_BINS};

    fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn make_tensor(be: &CpuBackend, buf: BufferId, shape: &[usize], data: &[f32]) -> TensorHandle {
        let t = be
            .create_tensor(buf, DType::F32, Shape::from_slice(shape))
            .unwrap();
        be.upload(&t, &f32_bytes(data), 0).unwrap();
        t
    }

    #[test]
    fn test_matmul_weight_basic() {
        // [2x2] weight times two activation rows
        let w = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut out = vec![0.0f32; 4];
        matmul_weight(DType::F32, &w, 2, 2, &b, 2, &mut out, 1).unwrap();
        // out[n, m] = dot(w_m, b_n)
        assert_eq!(out, vec![17.0, 39.0, 23.0, 53.0]);
    }

    #[test]
    fn test_matmul_weight_threaded_matches_single() {
        let m = 7;
        let k = 32;
        let n = 3;
        let wdata: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.37).sin()).collect();
        let w = f32_bytes(&wdata);
        let b: Vec<f32> = (0..n * k).map(|i| (i as f32 * 0.11).cos()).collect();
        let mut out1 = vec![0.0f32; n * m];
        let mut out4 = vec![0.0f32; n * m];
        matmul_weight(DType::F32, &w, m, k, &b, n, &mut out1, 1).unwrap();
        matmul_weight(DType::F32, &w, m, k, &b, n, &mut out4, 4).unwrap();
        assert_eq!(out1, out4);
    }

    #[test]
    fn test_matmul_quantized_weight() {
        let k = 32;
        let wdata: Vec<f32> = (0..k).map(|i| (i as f32 - 16.0) / 16.0).collect();
        let mut enc = vec![0u8; DType::Q8_0.row_bytes(k)];
        let mut hist = [0i64; HIST_BINS];
        quantize_chunk(DType::Q8_0, &wdata, &mut enc, &mut hist).unwrap();
        let b = vec![1.0f32; k];
        let mut out = vec![0.0f32; 1];
        matmul_weight(DType::Q8_0, &enc, 1, k, &b, 1, &mut out, 1).unwrap();
        let exact: f32 = wdata.iter().sum();
        assert!((out[0] - exact).abs() < 0.05);
    }

    #[test]
    fn test_matmul_batched() {
        // two independent 1x2 @ 1x2 products
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [10.0, 20.0, 30.0, 40.0];
        let mut out = vec![0.0f32; 2];
        matmul_batched(&a, &b, 2, 1, 2, 1, &mut out, 2);
        assert_eq!(out, vec![50.0, 250.0]);
    }

    #[test]
    fn test_rms_norm_rows() {
        let v = rms_norm(&[1.0, 2.0, 3.0, 4.0], 4, 1e-6);
        let out = v.as_f32().unwrap();
        let rms = (7.5f32 + 1e-6).sqrt();
        assert!((out[0] - 1.0 / rms).abs() < 1e-5);
        assert!((out[3] - 4.0 / rms).abs() < 1e-5);
    }

    #[test]
    fn test_soft_max_rows() {
        let v = soft_max(&[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], 3);
        let out = v.as_f32().unwrap();
        let s1: f32 = out[..3].iter().sum();
        let s2: f32 = out[3..].iter().sum();
        assert!((s1 - 1.0).abs() < 1e-6);
        assert!((s2 - 1.0).abs() < 1e-6);
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_diag_mask() {
        // 1 head, 2 query rows, 3 kv columns, n_past = 1
        let x = vec![0.0f32; 6];
        let v = diag_mask_inf(&x, &Shape::new(vec![1, 2, 3]), 1);
        let out = v.as_f32().unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], f32::NEG_INFINITY); // col 2 > past 1 + row 0
        assert!(out[3..6].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_rope_identity_at_origin() {
        let x = vec![1.0, 0.5, -0.25, 2.0];
        let v = rope(&x, &Shape::new(vec![1, 1, 4]), 0, 4, 10000.0, 1.0);
        let out = v.as_f32().unwrap();
        for (a, b) in x.iter().zip(out) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rope_rotates_with_position() {
        let x = vec![1.0, 0.0];
        let v = rope(&x, &Shape::new(vec![1, 1, 2]), 3, 2, 10000.0, 1.0);
        let out = v.as_f32().unwrap();
        assert!((out[0] - (3.0f32).cos()).abs() < 1e-5);
        assert!((out[1] - (3.0f32).sin()).abs() < 1e-5);
    }

    #[test]
    fn test_permute3() {
        // [2, 1, 2] -> [1, 2, 2] with axes [1, 0, 2]
        let x = [1.0, 2.0, 3.0, 4.0];
        let v = permute3(&x, &Shape::new(vec![2, 1, 2]), &[1, 0, 2]).unwrap();
        assert_eq!(v.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);

        // [2, 2, 1] -> [2, 1, 2] swapping the outer two axes
        let v = permute3(&x, &Shape::new(vec![2, 2, 1]), &[1, 0, 2]).unwrap();
        assert_eq!(v.as_f32().unwrap(), &[1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_strided_write_then_read_transposes() {
        let be = CpuBackend::new();
        let buf = be.alloc_buffer(1024, 4).unwrap();
        let t = be
            .create_tensor(buf, DType::F32, Shape::new(vec![16]))
            .unwrap();
        // write a [2, 3] value as a transposed [3, 2] window with row stride 2
        let src = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let view = View {
            offset: 0,
            shape: Shape::new(vec![2, 3]),
            strides: vec![1, 2],
        };
        be.write_view(&src, &t, &view).unwrap();
        let back = be
            .read_view(&t, &View::contiguous(0, Shape::new(vec![6])))
            .unwrap();
        assert_eq!(back.as_f32().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_buffer_exhaustion() {
        let be = CpuBackend::new();
        let buf = be.alloc_buffer(64, 1).unwrap();
        assert!(be
            .create_tensor(buf, DType::F32, Shape::new(vec![64]))
            .is_err());
    }

    #[test]
    fn test_graph_end_to_end_two_splits() {
        let cpu_concrete = CpuBackend::new();
        let buf = cpu_concrete.alloc_buffer(256, 2).unwrap();
        let w = make_tensor(&cpu_concrete, buf, &[2, 2], &[1.0, 0.0, 0.0, 2.0]);
        let cpu: Arc<dyn Backend> = Arc::new(cpu_concrete);
        let aux: Arc<dyn Backend> = Arc::new(CpuBackend::non_shared("aux"));

        let mut gb = GraphBuilder::new();
        gb.split(0, "main");
        let wn = gb.weight(w, "w");
        let x = gb.read(
            TensorHandle {
                buffer: buf,
                offset: 0,
                dtype: DType::F32,
                shape: Shape::new(vec![4]),
            },
            View::contiguous(0, Shape::new(vec![1, 2])),
            "x",
        );
        let y = gb.matmul(wn, x, "y");
        gb.split(1, "aux");
        let two = gb.constant(2.0, "two");
        let z = gb.scale(y, two, "z");
        let g = gb.finish();

        assert_eq!(g.splits.len(), 2);
        assert_eq!(g.splits[1].inputs, vec![y]);
        let state = g.execute(&[cpu, aux]).unwrap();
        // x = first row of w storage = [1, 0]; y = [1*1+0*0, 0] = [1, 0]; z = [2, 0]
        assert_eq!(state.value(z).unwrap().as_f32().unwrap(), &[2.0, 0.0]);
    }
}
