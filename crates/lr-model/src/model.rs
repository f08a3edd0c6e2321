use std::sync::Arc;
use std::time::Instant;

use lr_sampler::TokenId;
use lr_tensor::{Backend, BufferId, TensorHandle};

use crate::hparams::{Hparams, ModelSize};
use crate::mmap::MmapFile;
use crate::vocab::Vocab;

/// Weight tensors of one transformer layer.
#[derive(Debug, Clone)]
pub struct Layer {
    pub attention_norm: TensorHandle,
    pub wq: TensorHandle,
    pub wk: TensorHandle,
    pub wv: TensorHandle,
    pub wo: TensorHandle,
    pub ffn_norm: TensorHandle,
    pub w1: TensorHandle,
    pub w2: TensorHandle,
    pub w3: TensorHandle,
}

/// Backend buffers owned by a model or context; freed on drop, which also
/// covers unwinding out of a partially completed load.
pub(crate) struct OwnedBuffers {
    backends: Vec<Arc<dyn Backend>>,
    buffers: Vec<(usize, BufferId)>,
}

impl OwnedBuffers {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        OwnedBuffers {
            backends,
            buffers: Vec::new(),
        }
    }

    pub fn track(&mut self, backend: usize, buffer: BufferId) {
        self.buffers.push((backend, buffer));
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }
}

impl Drop for OwnedBuffers {
    fn drop(&mut self) {
        for &(backend, buffer) in &self.buffers {
            self.backends[backend].free_buffer(buffer);
        }
    }
}

/// A loaded model: immutable after load, shareable read-only between
/// contexts.
pub struct Model {
    pub hparams: Hparams,
    pub vocab: Vocab,
    pub size_class: ModelSize,

    pub tok_embeddings: TensorHandle,
    pub norm: TensorHandle,
    pub output: TensorHandle,
    pub layers: Vec<Layer>,

    pub(crate) buffers: OwnedBuffers,
    pub(crate) backend_cpu: usize,
    pub(crate) backend_gpu: Option<usize>,
    pub(crate) backend_inp: usize,
    pub(crate) backend_out: usize,
    pub(crate) backend_layers: Vec<usize>,
    pub(crate) n_gpu_layers: usize,

    /// Keeps the mapping alive for tensors backed directly by the file.
    pub(crate) mapping: Option<Arc<MmapFile>>,

    pub(crate) t_start: Instant,
    pub(crate) t_load_us: u64,
}

impl Model {
    pub fn n_vocab(&self) -> usize {
        self.hparams.n_vocab as usize
    }

    pub fn n_ctx(&self) -> usize {
        self.hparams.n_ctx as usize
    }

    pub fn n_embd(&self) -> usize {
        self.hparams.n_embd as usize
    }

    pub fn n_layer(&self) -> usize {
        self.hparams.n_layer as usize
    }

    /// Raw bytes of a vocabulary token.
    pub fn token_text(&self, id: TokenId) -> Option<&[u8]> {
        self.vocab.token_text(id)
    }

    pub fn token_score(&self, id: TokenId) -> Option<f32> {
        self.vocab.token_score(id)
    }

    pub(crate) fn backends(&self) -> &[Arc<dyn Backend>] {
        self.buffers.backends()
    }

    pub(crate) fn backend(&self, idx: usize) -> &Arc<dyn Backend> {
        &self.buffers.backends()[idx]
    }

    /// Microseconds spent loading; refined after the first eval to include
    /// deferred page faults.
    pub fn load_time_us(&self) -> u64 {
        self.t_load_us
    }
}
