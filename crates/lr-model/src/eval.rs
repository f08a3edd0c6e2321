//! The evaluator: stages inputs, runs the split graph, advances the KV
//! cache and reads logits (and embeddings) back out.

use std::time::Instant;

use lr_sampler::TokenId;

use crate::context::Context;
use crate::error::{ModelError, Result};
use crate::graph::{build_graph, GraphConfig};

impl Context {
    /// Process `tokens` starting at cache position `n_past`.
    ///
    /// On success the KV cache holds `n_past + tokens.len()` positions and
    /// `logits()` exposes the new distribution. On failure the cache
    /// counter is unchanged but backend state may be partial; the context
    /// should be discarded.
    pub fn eval(&mut self, tokens: &[TokenId], n_past: usize, n_threads: usize) -> Result<()> {
        self.eval_internal(Some(tokens), None, n_past, n_threads)
    }

    /// Process precomputed embeddings (`n_tokens * n_embd` values) instead
    /// of token ids.
    pub fn eval_embd(&mut self, embd: &[f32], n_past: usize, n_threads: usize) -> Result<()> {
        self.eval_internal(None, Some(embd), n_past, n_threads)
    }

    fn eval_internal(
        &mut self,
        tokens: Option<&[TokenId]>,
        embd: Option<&[f32]>,
        n_past: usize,
        n_threads: usize,
    ) -> Result<()> {
        let t_start = Instant::now();
        let n_embd = self.n_embd();
        let n_vocab = self.n_vocab();

        let n = match (tokens, embd) {
            (Some(t), None) => t.len(),
            (None, Some(e)) => {
                if e.len() % n_embd != 0 {
                    return Err(ModelError::InvalidParameter(format!(
                        "embedding input of {} values is not a multiple of n_embd {}",
                        e.len(),
                        n_embd
                    )));
                }
                e.len() / n_embd
            }
            _ => {
                return Err(ModelError::InvalidParameter(
                    "exactly one of tokens or embeddings must be given".to_string(),
                ));
            }
        };
        if n == 0 {
            return Err(ModelError::InvalidParameter(
                "nothing to evaluate".to_string(),
            ));
        }
        if n > self.n_batch {
            return Err(ModelError::InvalidParameter(format!(
                "{} tokens exceed n_batch {}",
                n, self.n_batch
            )));
        }
        if n_past + n > self.n_ctx() {
            return Err(ModelError::InvalidParameter(format!(
                "{} tokens at position {} exceed n_ctx {}",
                n,
                n_past,
                self.n_ctx()
            )));
        }

        let backends = self.model.backends();

        // stage the inputs
        if let Some(tokens) = tokens {
            let bytes: Vec<u8> = tokens.iter().flat_map(|t| t.to_le_bytes()).collect();
            backends[self.model.backend_inp].upload(&self.io.tokens_in, &bytes, 0)?;
        }
        if let Some(embd) = embd {
            let bytes: Vec<u8> = embd.iter().flat_map(|v| v.to_le_bytes()).collect();
            backends[self.model.backend_inp].upload(&self.io.embd_in, &bytes, 0)?;
        }

        // big batches on a BLAS-backed CPU run single-threaded: worker spin
        // competes with the library's own parallelism
        let cpu = &backends[self.model.backend_cpu];
        let n_threads = if n >= 32 && cpu.has_blas() { 1 } else { n_threads };
        cpu.set_n_threads(n_threads.max(1));

        let graph = build_graph(
            &self.model,
            &self.io,
            self.backend_kv,
            &self.kv_self.k,
            &self.kv_self.v,
            &GraphConfig {
                n_tokens: n,
                n_past,
                embeddings_input: embd.is_some(),
                logits_all: self.logits_all,
            },
        );
        graph.execute(backends)?;

        self.kv_self.n = n_past + n;

        // read the logits (and embeddings) back out
        let logits_len = if self.logits_all { n * n_vocab } else { n_vocab };
        let mut bytes = vec![0u8; logits_len * 4];
        backends[self.model.backend_out].download(&self.io.logits_out, &mut bytes, 0)?;
        self.logits.clear();
        self.logits.extend(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );

        if let Some(embd_out) = &self.io.embd_out {
            let mut bytes = vec![0u8; n_embd * 4];
            backends[self.model.backend_out].download(embd_out, &mut bytes, 0)?;
            self.embedding.clear();
            self.embedding.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }

        // device backends may complete asynchronously
        if let Some(gpu) = self.model.backend_gpu {
            backends[gpu].synchronize();
        }

        let elapsed = t_start.elapsed().as_micros() as u64;
        if n == 1 {
            self.t_eval_us += elapsed;
            self.n_eval += 1;
        } else {
            self.t_p_eval_us += elapsed;
            self.n_p_eval += n as u32;
        }

        // refine the load time on the first eval so deferred mmap page
        // faults are counted
        if !self.has_evaluated_once {
            self.t_load_us = self.model.t_start.elapsed().as_micros() as u64;
            self.has_evaluated_once = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hparams::Ftype;
    use crate::loader::load_model;
    use crate::test_support::{tiny_context, tiny_params, write_tiny_model};
    use crate::vocab::token_bos;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_single_token_advances_cache() {
        let (_dir, mut ctx) = tiny_context(Ftype::AllF32, |_| {});
        ctx.eval(&[token_bos()], 0, 1).unwrap();
        assert_eq!(ctx.kv_cache_token_count(), 1);
        assert_eq!(ctx.logits().len(), ctx.n_vocab());
        assert!(ctx.logits().iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_incremental_matches_full_eval() {
        let (_dir, mut a) = tiny_context(Ftype::AllF32, |_| {});
        let (_dir2, mut b) = tiny_context(Ftype::AllF32, |_| {});
        let prompt = [1, 270, 271, 272, 273];

        a.eval(&prompt[..4], 0, 1).unwrap();
        assert_eq!(a.kv_cache_token_count(), 4);
        a.eval(&prompt[4..], 4, 1).unwrap();
        assert_eq!(a.kv_cache_token_count(), 5);

        b.eval(&prompt, 0, 1).unwrap();
        assert_eq!(b.kv_cache_token_count(), 5);

        for (x, y) in a.logits().iter().zip(b.logits()) {
            assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_logits_all() {
        let (_dir, mut ctx) = tiny_context(Ftype::AllF32, |p| p.logits_all = true);
        ctx.eval(&[1, 270, 271], 0, 1).unwrap();
        assert_eq!(ctx.logits().len(), 3 * ctx.n_vocab());
    }

    #[test]
    fn test_embedding_output() {
        let (_dir, mut ctx) = tiny_context(Ftype::AllF32, |p| p.embedding = true);
        ctx.eval(&[1, 270], 0, 1).unwrap();
        let emb = ctx.embeddings().unwrap();
        assert_eq!(emb.len(), ctx.n_embd());
        assert!(emb.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_eval_embd_input() {
        let (_dir, mut ctx) = tiny_context(Ftype::AllF32, |_| {});
        let embd = vec![0.1f32; 2 * ctx.n_embd()];
        ctx.eval_embd(&embd, 0, 1).unwrap();
        assert_eq!(ctx.kv_cache_token_count(), 2);
    }

    #[test]
    fn test_invalid_inputs() {
        let (_dir, mut ctx) = tiny_context(Ftype::AllF32, |_| {});
        assert!(matches!(
            ctx.eval_internal(None, None, 0, 1),
            Err(ModelError::InvalidParameter(_))
        ));
        assert!(matches!(
            ctx.eval(&[], 0, 1),
            Err(ModelError::InvalidParameter(_))
        ));
        // overflowing the context window fails and leaves the cache alone
        let too_many: Vec<_> = (0..ctx.n_ctx() + 1).map(|_| 1).collect();
        assert!(ctx.eval(&too_many, 0, 1).is_err());
        assert_eq!(ctx.kv_cache_token_count(), 0);
    }

    #[test]
    fn test_timing_attribution() {
        let (_dir, mut ctx) = tiny_context(Ftype::AllF32, |_| {});
        ctx.eval(&[1, 270, 271], 0, 1).unwrap();
        ctx.eval(&[272], 3, 1).unwrap();
        let t = ctx.timings();
        assert_eq!(t.n_p_eval, 3);
        assert_eq!(t.n_eval, 1);
    }

    #[test]
    fn test_eval_quantized_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny_q8.bin");
        write_tiny_model(&path, Ftype::MostlyQ8_0);
        let model = Arc::new(load_model(&path, &tiny_params()).unwrap());
        let mut ctx = Context::new(model, &tiny_params()).unwrap();
        ctx.eval(&[1, 270], 0, 2).unwrap();
        assert_eq!(ctx.kv_cache_token_count(), 2);
        assert!(ctx.logits().iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_device_backend_matches_cpu() {
        let (_dir, mut cpu_ctx) = tiny_context(Ftype::AllF32, |_| {});
        // all layers, the output head and the KV cache on a simulated device:
        // the graph splits at the input boundary and every weight goes
        // through the bounce-buffer upload path
        let (_dir2, mut dev_ctx) = tiny_context(Ftype::AllF32, |p| {
            p.n_gpu_layers = 2;
            p.gpu_backend = Some(Arc::new(lr_tensor::CpuBackend::non_shared("gpu-sim")));
        });
        cpu_ctx.eval(&[1, 270, 271], 0, 1).unwrap();
        dev_ctx.eval(&[1, 270, 271], 0, 1).unwrap();
        assert_eq!(cpu_ctx.logits(), dev_ctx.logits());
    }

    #[test]
    fn test_multithreaded_eval_matches() {
        let (_dir, mut a) = tiny_context(Ftype::AllF32, |_| {});
        let (_dir2, mut b) = tiny_context(Ftype::AllF32, |_| {});
        a.eval(&[1, 270, 271], 0, 1).unwrap();
        b.eval(&[1, 270, 271], 0, 4).unwrap();
        for (x, y) in a.logits().iter().zip(b.logits()) {
            assert_eq!(x, y);
        }
    }
}
