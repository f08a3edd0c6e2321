use std::sync::Arc;

use log::info;
use lr_tensor::{Backend, BufferId, DType, Shape, TensorHandle};

use crate::error::Result;
use crate::hparams::Hparams;

const MIB: usize = 1024 * 1024;

/// Per-layer storage of post-RoPE keys and transposed values.
///
/// `k` and `v` are flat slabs of `n_layer * n_ctx * n_embd` elements each.
/// Keys are written position-major per layer; values are written transposed
/// so attention reads over positions are contiguous. `n` counts the filled
/// positions and never exceeds `n_ctx`.
pub struct KvCache {
    pub k: TensorHandle,
    pub v: TensorHandle,
    /// Number of tokens currently in the cache.
    pub n: usize,
    pub dtype: DType,
    pub backend: usize,
    pub buffer: BufferId,
    /// Total allocation, recorded in session state blobs.
    pub buf_size: usize,
}

impl KvCache {
    /// Allocate the cache slabs ("cache_k"/"cache_v" in graph node names) on
    /// the chosen backend.
    pub fn init(
        backend: &Arc<dyn Backend>,
        backend_idx: usize,
        hparams: &Hparams,
        dtype: DType,
        n_ctx: usize,
    ) -> Result<KvCache> {
        let n_embd = hparams.n_embd as usize;
        let n_layer = hparams.n_layer as usize;
        let n_elements = n_embd * n_layer * n_ctx;

        let buf_size = 2 * n_elements * dtype.block_bytes() + 2 * MIB;
        let buffer = backend.alloc_buffer(buf_size, 2)?;
        let k = backend.create_tensor(buffer, dtype, Shape::new(vec![n_elements]))?;
        let v = backend.create_tensor(buffer, dtype, Shape::new(vec![n_elements]))?;

        info!(
            "kv self size = {:7.2} MB",
            (k.nbytes() + v.nbytes()) as f64 / 1024.0 / 1024.0
        );

        Ok(KvCache {
            k,
            v,
            n: 0,
            dtype,
            backend: backend_idx,
            buffer,
            buf_size,
        })
    }
}
