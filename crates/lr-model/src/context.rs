use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::info;
use lr_sampler::{Prng, TokenDataArray, TokenId, DEFAULT_SEED};
use lr_tensor::{Backend, DType, Shape, TensorHandle};

use crate::error::{ModelError, Result};
use crate::kv_cache::KvCache;
use crate::model::{Model, OwnedBuffers};
use crate::tokenizer;

/// Parameters for loading a model and creating a context, mirroring the
/// single parameter block the public API takes for both.
pub struct ContextParams {
    pub seed: u32,
    pub n_ctx: usize,
    pub n_batch: usize,
    pub n_gpu_layers: usize,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub low_vram: bool,
    pub f16_kv: bool,
    /// Keep logits for all tokens of a step, not just the last.
    pub logits_all: bool,
    /// Expose the final-norm embedding of the last token.
    pub embedding: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Optional device backend; layers are offloaded to it per
    /// `n_gpu_layers`.
    pub gpu_backend: Option<Arc<dyn Backend>>,
    /// Monotonic 0.0..=1.0 over bytes loaded.
    pub progress_callback: Option<Box<dyn Fn(f32) + Send + Sync>>,
}

impl Default for ContextParams {
    fn default() -> Self {
        ContextParams {
            seed: DEFAULT_SEED,
            n_ctx: 512,
            n_batch: 512,
            n_gpu_layers: 0,
            rope_freq_base: 10000.0,
            rope_freq_scale: 1.0,
            low_vram: false,
            f16_kv: true,
            logits_all: false,
            embedding: false,
            use_mmap: true,
            use_mlock: false,
            gpu_backend: None,
            progress_callback: None,
        }
    }
}

/// Persistent staging tensors of a context's graphs.
pub(crate) struct GraphIo {
    pub tokens_in: TensorHandle,
    pub embd_in: TensorHandle,
    pub logits_out: TensorHandle,
    pub embd_out: Option<TensorHandle>,
}

/// One inference stream over a shared model: RNG, KV cache, staging
/// buffers, logits and timing counters. Not thread-safe.
pub struct Context {
    pub(crate) model: Arc<Model>,
    pub(crate) rng: Prng,
    pub(crate) kv_self: KvCache,
    pub(crate) backend_kv: usize,
    pub(crate) io: GraphIo,
    pub(crate) bufs: OwnedBuffers,

    pub(crate) n_batch: usize,
    pub(crate) logits_all: bool,
    pub(crate) embedding_on: bool,
    pub(crate) logits: Vec<f32>,
    pub(crate) embedding: Vec<f32>,

    pub(crate) t_start: Instant,
    pub(crate) t_load_us: u64,
    pub(crate) has_evaluated_once: bool,
    pub(crate) t_sample_us: u64,
    pub(crate) n_sample: u32,
    pub(crate) t_eval_us: u64,
    pub(crate) n_eval: u32,
    pub(crate) t_p_eval_us: u64,
    pub(crate) n_p_eval: u32,
}

impl Context {
    pub fn new(model: Arc<Model>, params: &ContextParams) -> Result<Context> {
        if params.n_ctx < 1 {
            return Err(ModelError::InvalidParameter(format!(
                "invalid n_ctx = {}",
                params.n_ctx
            )));
        }
        let n_ctx = model.n_ctx();
        let n_embd = model.n_embd();
        let n_vocab = model.n_vocab();

        let rng = Prng::new(params.seed);

        // the KV cache goes to the device only when most layers live there
        let backend_kv = match model.backend_gpu {
            Some(gpu) if model.n_gpu_layers >= model.n_layer() / 2 && !params.low_vram => gpu,
            _ => model.backend_cpu,
        };
        let kv_dtype = if params.f16_kv { DType::F16 } else { DType::F32 };

        let mut bufs = OwnedBuffers::new(model.backends().to_vec());
        let kv_self = KvCache::init(
            model.backend(backend_kv),
            backend_kv,
            &model.hparams,
            kv_dtype,
            n_ctx,
        )?;
        bufs.track(backend_kv, kv_self.buffer);

        // sized analytically; the class table is n_ctx=2048 presets
        let scratch = eval_scratch_size(&model.hparams, params.n_batch.max(1));
        info!(
            "compute buffer = {:7.2} MB (class preset {:7.2} MB)",
            scratch as f64 / 1024.0 / 1024.0,
            model.size_class.mem_req_eval() as f64 / 1024.0 / 1024.0
        );

        // graph input staging: token ids and embeddings rows
        let backend_inp = model.backend(model.backend_inp);
        let input_size = n_ctx * std::mem::size_of::<f32>() * (1 + n_embd);
        let input_buf = backend_inp.alloc_buffer(input_size, 2)?;
        bufs.track(model.backend_inp, input_buf);
        let tokens_in =
            backend_inp.create_tensor(input_buf, DType::I32, Shape::new(vec![n_ctx]))?;
        let embd_in =
            backend_inp.create_tensor(input_buf, DType::F32, Shape::new(vec![n_ctx, n_embd]))?;

        // graph output staging: logits and optional embedding
        let backend_out = model.backend(model.backend_out);
        let logits_capacity = if params.logits_all {
            n_ctx * n_vocab
        } else {
            n_vocab
        };
        let mut output_size = logits_capacity * std::mem::size_of::<f32>();
        if params.embedding {
            output_size += n_embd * std::mem::size_of::<f32>();
        }
        let output_buf = backend_out.alloc_buffer(output_size, 2)?;
        bufs.track(model.backend_out, output_buf);
        let logits_out =
            backend_out.create_tensor(output_buf, DType::F32, Shape::new(vec![logits_capacity]))?;
        let embd_out = if params.embedding {
            Some(backend_out.create_tensor(output_buf, DType::F32, Shape::new(vec![n_embd]))?)
        } else {
            None
        };

        let mut logits = Vec::new();
        logits.reserve_exact(logits_capacity);
        let embedding = if params.embedding {
            vec![0.0; n_embd]
        } else {
            Vec::new()
        };

        log_backend_plan(&model, backend_kv);

        let t_load_us = model.t_load_us;
        Ok(Context {
            model,
            rng,
            kv_self,
            backend_kv,
            io: GraphIo {
                tokens_in,
                embd_in,
                logits_out,
                embd_out,
            },
            bufs,
            n_batch: params.n_batch.max(1),
            logits_all: params.logits_all,
            embedding_on: params.embedding,
            logits,
            embedding,
            t_start: Instant::now(),
            t_load_us,
            has_evaluated_once: false,
            t_sample_us: 0,
            n_sample: 0,
            t_eval_us: 0,
            n_eval: 0,
            t_p_eval_us: 0,
            n_p_eval: 0,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn n_vocab(&self) -> usize {
        self.model.n_vocab()
    }

    pub fn n_ctx(&self) -> usize {
        self.model.n_ctx()
    }

    pub fn n_embd(&self) -> usize {
        self.model.n_embd()
    }

    /// Logits of the last evaluation: one row, or `n_tokens` rows with
    /// `logits_all`.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Final-norm embedding of the last evaluated token, when enabled.
    pub fn embeddings(&self) -> Option<&[f32]> {
        if self.embedding_on {
            Some(&self.embedding)
        } else {
            None
        }
    }

    /// Number of tokens currently in the KV cache.
    pub fn kv_cache_token_count(&self) -> usize {
        self.kv_self.n
    }

    pub fn set_rng_seed(&mut self, seed: u32) {
        self.rng.reseed(seed);
    }

    /// Encode text into token ids, optionally with a leading BOS.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        tokenizer::tokenize(&self.model.vocab, text, add_bos)
    }

    pub fn token_text(&self, id: TokenId) -> Option<&[u8]> {
        self.model.token_text(id)
    }

    // -- sampling pipeline -------------------------------------------------
    //
    // Thin wrappers over lr-sampler that attribute elapsed time to this
    // context's sample counters.

    fn timed<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let t0 = Instant::now();
        let out = f(self);
        self.t_sample_us += t0.elapsed().as_micros() as u64;
        out
    }

    pub fn sample_softmax(&mut self, candidates: &mut TokenDataArray) {
        self.timed(|_| lr_sampler::softmax(candidates));
    }

    pub fn sample_top_k(&mut self, candidates: &mut TokenDataArray, k: usize, min_keep: usize) {
        self.timed(|_| lr_sampler::top_k(candidates, k, min_keep));
    }

    pub fn sample_top_p(&mut self, candidates: &mut TokenDataArray, p: f32, min_keep: usize) {
        self.timed(|_| lr_sampler::top_p(candidates, p, min_keep));
    }

    pub fn sample_tail_free(&mut self, candidates: &mut TokenDataArray, z: f32, min_keep: usize) {
        self.timed(|_| lr_sampler::tail_free(candidates, z, min_keep));
    }

    pub fn sample_typical(&mut self, candidates: &mut TokenDataArray, p: f32, min_keep: usize) {
        self.timed(|_| lr_sampler::typical(candidates, p, min_keep));
    }

    pub fn sample_temperature(&mut self, candidates: &mut TokenDataArray, temp: f32) {
        self.timed(|_| lr_sampler::temperature(candidates, temp));
    }

    pub fn sample_repetition_penalty(
        &mut self,
        candidates: &mut TokenDataArray,
        last_tokens: &[TokenId],
        penalty: f32,
    ) {
        self.timed(|_| lr_sampler::repetition_penalty(candidates, last_tokens, penalty));
    }

    pub fn sample_frequency_and_presence_penalties(
        &mut self,
        candidates: &mut TokenDataArray,
        last_tokens: &[TokenId],
        alpha_frequency: f32,
        alpha_presence: f32,
    ) {
        self.timed(|_| {
            lr_sampler::frequency_and_presence_penalties(
                candidates,
                last_tokens,
                alpha_frequency,
                alpha_presence,
            )
        });
    }

    /// `guidance_logits` is the logits row of the guidance context.
    pub fn sample_classifier_free_guidance(
        &mut self,
        candidates: &mut TokenDataArray,
        guidance_logits: &[f32],
        scale: f32,
        smooth_factor: f32,
    ) {
        self.timed(|_| {
            lr_sampler::classifier_free_guidance(candidates, guidance_logits, scale, smooth_factor)
        });
    }

    pub fn sample_token_greedy(&mut self, candidates: &mut TokenDataArray) -> Option<TokenId> {
        let out = self.timed(|_| lr_sampler::sample_token_greedy(candidates));
        self.n_sample += 1;
        out
    }

    pub fn sample_token(&mut self, candidates: &mut TokenDataArray) -> Option<TokenId> {
        let out = self.timed(|ctx| lr_sampler::sample_token(candidates, &mut ctx.rng));
        self.n_sample += 1;
        out
    }

    pub fn sample_token_mirostat(
        &mut self,
        candidates: &mut TokenDataArray,
        tau: f32,
        eta: f32,
        m: usize,
        mu: &mut f32,
    ) -> Option<TokenId> {
        let n_vocab = self.n_vocab();
        let out = self.timed(|ctx| {
            lr_sampler::sample_token_mirostat(candidates, &mut ctx.rng, tau, eta, m, mu, n_vocab)
        });
        self.n_sample += 1;
        out
    }

    pub fn sample_token_mirostat_v2(
        &mut self,
        candidates: &mut TokenDataArray,
        tau: f32,
        eta: f32,
        mu: &mut f32,
    ) -> Option<TokenId> {
        let out = self.timed(|ctx| {
            lr_sampler::sample_token_mirostat_v2(candidates, &mut ctx.rng, tau, eta, mu)
        });
        self.n_sample += 1;
        out
    }

    // -- timings -----------------------------------------------------------

    pub fn timings(&self) -> Timings {
        Timings {
            t_total_ms: self.t_start.elapsed().as_micros() as f64 / 1000.0,
            t_load_ms: self.t_load_us as f64 / 1000.0,
            t_sample_ms: self.t_sample_us as f64 / 1000.0,
            t_p_eval_ms: self.t_p_eval_us as f64 / 1000.0,
            t_eval_ms: self.t_eval_us as f64 / 1000.0,
            n_sample: self.n_sample.max(1),
            n_p_eval: self.n_p_eval.max(1),
            n_eval: self.n_eval.max(1),
        }
    }

    pub fn reset_timings(&mut self) {
        self.t_start = Instant::now();
        self.t_sample_us = 0;
        self.n_sample = 0;
        self.t_eval_us = 0;
        self.n_eval = 0;
        self.t_p_eval_us = 0;
        self.n_p_eval = 0;
    }
}

/// Timing summary of a context.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub t_total_ms: f64,
    pub t_load_ms: f64,
    pub t_sample_ms: f64,
    pub t_p_eval_ms: f64,
    pub t_eval_ms: f64,
    pub n_sample: u32,
    pub n_p_eval: u32,
    pub n_eval: u32,
}

impl fmt::Display for Timings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "load time   = {:8.2} ms", self.t_load_ms)?;
        writeln!(
            f,
            "sample time = {:8.2} ms / {:5} runs   ({:8.2} ms per run)",
            self.t_sample_ms,
            self.n_sample,
            self.t_sample_ms / self.n_sample as f64
        )?;
        writeln!(
            f,
            "prompt eval = {:8.2} ms / {:5} tokens ({:8.2} ms per token)",
            self.t_p_eval_ms,
            self.n_p_eval,
            self.t_p_eval_ms / self.n_p_eval as f64
        )?;
        writeln!(
            f,
            "eval time   = {:8.2} ms / {:5} runs   ({:8.2} ms per run)",
            self.t_eval_ms,
            self.n_eval,
            self.t_eval_ms / self.n_eval as f64
        )?;
        write!(f, "total time  = {:8.2} ms", self.t_total_ms)
    }
}

/// Largest single intermediate of one eval step, in bytes: the KQ score
/// matrix, an FFN activation row block, or the logits block.
fn eval_scratch_size(hparams: &crate::hparams::Hparams, n_batch: usize) -> usize {
    let n_ctx = hparams.n_ctx as usize;
    let n_head = hparams.n_head as usize;
    let n_ff = hparams.n_ff() as usize;
    let n_vocab = hparams.n_vocab as usize;
    let kq = n_head * n_batch * n_ctx;
    let ffn = n_batch * n_ff;
    let logits = n_batch * n_vocab;
    kq.max(ffn).max(logits) * std::mem::size_of::<f32>()
}

fn log_backend_plan(model: &Model, backend_kv: usize) {
    let name = |idx: usize| model.backend(idx).name().to_string();
    info!("layer backends: input: {}", name(model.backend_inp));
    let mut start = 0;
    for i in 1..=model.backend_layers.len() {
        if i == model.backend_layers.len() || model.backend_layers[i] != model.backend_layers[start]
        {
            if start == i - 1 {
                info!("layer {}: {}", start, name(model.backend_layers[start]));
            } else {
                info!("layers {}-{}: {}", start, i - 1, name(model.backend_layers[start]));
            }
            start = i;
        }
    }
    info!(
        "output: {}, kv: {}",
        name(model.backend_out),
        name(backend_kv)
    );
}
