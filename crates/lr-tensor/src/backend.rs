use std::fmt::Debug;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::graph::{ExecState, Graph, Split};
use crate::shape::Shape;

/// Alignment of tensor data within backend buffers.
pub const TENSOR_ALIGNMENT: usize = 32;

/// Per-tensor headroom reserved when sizing buffers; covers alignment
/// padding up to [`TENSOR_ALIGNMENT`].
pub const TENSOR_OVERHEAD: usize = 32;

/// A read-only byte region backed by a memory-mapped file.
///
/// The concrete mapping primitive lives with the file loader; compute
/// backends only need byte access and the two advisory hooks.
pub trait MappedRegion: Send + Sync {
    fn as_bytes(&self) -> &[u8];

    /// Hint that a byte range will not be read again.
    fn discard(&self, _offset: usize, _len: usize) {}

    /// Try to pin the region's pages in RAM.
    fn lock(&self) {}
}

/// Identifies a buffer within one backend.
pub type BufferId = usize;

/// A tensor stored inside a backend buffer.
///
/// Handles carry no pointer: they are (buffer, byte offset, dtype, shape),
/// resolved by the owning backend at execution time.
#[derive(Debug, Clone)]
pub struct TensorHandle {
    pub buffer: BufferId,
    pub offset: usize,
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorHandle {
    /// Storage size of this tensor in bytes.
    pub fn nbytes(&self) -> usize {
        self.dtype.row_bytes(self.shape.numel())
    }
}

/// A compute device holding tensor storage and executing graph splits.
///
/// Exactly one backend owns each tensor. The CPU backend is always present;
/// additional backends are optional and selected per tensor at load time.
pub trait Backend: Send + Sync + Debug {
    /// Backend name for logs and split debugging (e.g. "cpu").
    fn name(&self) -> &str;

    /// True when an mmap region can back tensor data directly, without an
    /// upload copy.
    fn is_ram_shared(&self) -> bool;

    /// Allocate a buffer of `size` data bytes plus metadata headroom for up
    /// to `max_tensors` tensors.
    fn alloc_buffer(&self, size: usize, max_tensors: usize) -> Result<BufferId>;

    /// Release a buffer. Outstanding handles into it become invalid.
    fn free_buffer(&self, buffer: BufferId);

    /// Expose a mapped region as a read-only buffer.
    ///
    /// Only RAM-shared backends support this; the default rejects it.
    fn map_buffer(&self, _region: Arc<dyn MappedRegion>) -> Result<BufferId> {
        Err(TensorError::Other(format!(
            "backend '{}' cannot share mapped memory",
            self.name()
        )))
    }

    /// Reserve space for a tensor inside `buffer`, aligned to
    /// [`TENSOR_ALIGNMENT`].
    fn create_tensor(&self, buffer: BufferId, dtype: DType, shape: Shape)
        -> Result<TensorHandle>;

    /// Copy `data` into the tensor's storage at `offset` bytes.
    fn upload(&self, tensor: &TensorHandle, data: &[u8], offset: usize) -> Result<()>;

    /// Copy the tensor's storage at `offset` bytes into `out`.
    fn download(&self, tensor: &TensorHandle, out: &mut [u8], offset: usize) -> Result<()>;

    /// Thread-count hint; only meaningful for the CPU backend.
    fn set_n_threads(&self, _n: usize) {}

    /// Whether a BLAS-capable path backs large matrix products.
    fn has_blas(&self) -> bool {
        false
    }

    /// Block until all queued work is observable. Default: synchronous
    /// backends have nothing to wait for.
    fn synchronize(&self) {}

    /// Execute the nodes of one split, reading and writing `state`.
    fn execute(&self, graph: &Graph, split: &Split, state: &mut ExecState) -> Result<()>;
}
