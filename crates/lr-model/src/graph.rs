//! Builds the per-step forward graph.
//!
//! One graph is built per evaluation of `n_tokens` tokens at `n_past`. The
//! graph is partitioned by backend: all linear algebra of a layer stays on
//! that layer's backend, and each layer's attention crosses into the KV
//! backend for the K/V/Q work and back out for the KQV read, so cache
//! traffic is the only cross-device transfer. Within a split, nodes execute
//! in append order, which is what sequences the cache writes before the
//! strided cache reads.

use lr_tensor::{GraphBuilder, Shape, SplitGraph, TensorHandle, View};

use crate::context::GraphIo;
use crate::model::Model;

const RMS_NORM_EPS: f32 = 1e-6;

pub(crate) struct GraphConfig {
    pub n_tokens: usize,
    pub n_past: usize,
    pub embeddings_input: bool,
    pub logits_all: bool,
}

pub(crate) fn build_graph(
    model: &Model,
    io: &GraphIo,
    backend_kv: usize,
    kv_k: &TensorHandle,
    kv_v: &TensorHandle,
    cfg: &GraphConfig,
) -> SplitGraph {
    let hp = &model.hparams;
    let n = cfg.n_tokens;
    let n_embd = hp.n_embd as usize;
    let n_head = hp.n_head as usize;
    let n_ctx = hp.n_ctx as usize;
    let n_vocab = hp.n_vocab as usize;
    let head_dim = n_embd / n_head;
    let n_rot = head_dim;
    let n_past = cfg.n_past;
    let kv_len = n_past + n;
    let freq_base = hp.rope_freq_base;
    let freq_scale = hp.rope_freq_scale;

    let mut b = GraphBuilder::new();

    // graph input: token ids or precomputed embeddings
    b.split(model.backend_inp, "input");
    let mut inp_l = if cfg.embeddings_input {
        b.read(
            io.embd_in.clone(),
            View::contiguous(0, Shape::new(vec![n, n_embd])),
            "embeddings_in",
        )
    } else {
        let tokens = b.read(
            io.tokens_in.clone(),
            View::contiguous(0, Shape::new(vec![n])),
            "tokens_in",
        );
        let emb = b.weight(model.tok_embeddings.clone(), "tok_embeddings");
        b.get_rows(emb, tokens, "inp_embd")
    };

    // the scale scalar is shared by every layer to avoid repeated transfers
    let mut kq_scale = None;

    for (il, layer) in model.layers.iter().enumerate() {
        let backend_l = model.backend_layers[il];
        b.split(backend_l, format!("l{}", il));
        let inp_sa = inp_l;

        // pre-attention norm
        let mut cur = b.rms_norm(inp_l, RMS_NORM_EPS, "rms_norm_0");
        let attn_norm = b.read_all(layer.attention_norm.clone(), "attention_norm");
        cur = b.mul(cur, attn_norm, "attention_norm_0");

        // Q, K, V projections; RoPE on Q and K
        let wq = b.weight(layer.wq.clone(), "wq");
        let tmpq = b.matmul(wq, cur, "tmpq");
        let wk = b.weight(layer.wk.clone(), "wk");
        let tmpk = b.matmul(wk, cur, "tmpk");
        let wv = b.weight(layer.wv.clone(), "wv");
        let tmpv = b.matmul(wv, cur, "tmpv");

        let q3 = b.reshape(tmpq, Shape::new(vec![n, n_head, head_dim]), "tmpq_3d");
        let q_cur = b.rope(q3, n_past, n_rot, freq_base, freq_scale, "Qcur");
        let k3 = b.reshape(tmpk, Shape::new(vec![n, n_head, head_dim]), "tmpk_3d");
        let k_cur = b.rope(k3, n_past, n_rot, freq_base, freq_scale, "Kcur");

        // transposed V so that cache reads over positions are contiguous
        let v3 = b.reshape(tmpv, Shape::new(vec![1, n, n_embd]), "tmpv_3d");
        let vt = b.permute(v3, vec![0, 2, 1], "Vcur_t");
        let v_cur = b.reshape(vt, Shape::new(vec![n_embd, n]), "Vcur");

        // store the RoPE-ed keys and transposed values into the cache
        b.split(backend_kv, format!("l{}_attn", il));
        let scale = *kq_scale.get_or_insert_with(|| {
            b.constant(
                1.0 / (head_dim as f32).sqrt(),
                "1/sqrt(n_embd/n_head)",
            )
        });
        b.write(
            k_cur,
            kv_k.clone(),
            View::contiguous((il * n_ctx + n_past) * n_embd, Shape::new(vec![n * n_embd])),
            "cache_k_cpy",
        );
        b.write(
            v_cur,
            kv_v.clone(),
            View {
                offset: il * n_ctx * n_embd + n_past,
                shape: Shape::new(vec![n_embd, n]),
                strides: vec![n_ctx, 1],
            },
            "cache_v_cpy",
        );

        // attention over the filled cache prefix
        let q = b.permute(q_cur, vec![1, 0, 2], "Q");
        let k = b.read(
            kv_k.clone(),
            View {
                offset: il * n_ctx * n_embd,
                shape: Shape::new(vec![n_head, kv_len, head_dim]),
                strides: vec![head_dim, n_embd, 1],
            },
            "K",
        );
        let kq = b.matmul(k, q, "KQ");
        let kq_scaled = b.scale(kq, scale, "KQ_scaled");
        let kq_masked = b.diag_mask_inf(kq_scaled, n_past, "KQ_masked");
        let kq_soft_max = b.soft_max(kq_masked, "KQ_soft_max");
        let v = b.read(
            kv_v.clone(),
            View {
                offset: il * n_ctx * n_embd,
                shape: Shape::new(vec![n_head, head_dim, kv_len]),
                strides: vec![head_dim * n_ctx, n_ctx, 1],
            },
            "V",
        );
        let kqv = b.matmul(v, kq_soft_max, "KQV");

        // back on the layer backend: merge heads, project, residual
        b.split(backend_l, format!("l{}", il));
        let kqv_merged = b.permute(kqv, vec![1, 0, 2], "KQV_merged");
        cur = b.reshape(
            kqv_merged,
            Shape::new(vec![n, n_embd]),
            "KQV_merged_contiguous",
        );
        let wo = b.weight(layer.wo.clone(), "wo");
        cur = b.matmul(wo, cur, "result_wo");
        let inp_ff = b.add(cur, inp_sa, "inpFF");

        // feed-forward network
        cur = b.rms_norm(inp_ff, RMS_NORM_EPS, "rms_norm_1");
        let ffn_norm = b.read_all(layer.ffn_norm.clone(), "ffn_norm_weight");
        cur = b.mul(cur, ffn_norm, "ffn_norm");
        let w3 = b.weight(layer.w3.clone(), "w3");
        let tmp = b.matmul(w3, cur, "result_w3");
        let w1 = b.weight(layer.w1.clone(), "w1");
        cur = b.matmul(w1, cur, "result_w1");
        cur = b.silu(cur, "silu");
        cur = b.mul(cur, tmp, "silu_x_result_w3");
        let w2 = b.weight(layer.w2.clone(), "w2");
        cur = b.matmul(w2, cur, "result_w2");

        inp_l = b.add(cur, inp_ff, "inpFF_+_result_w2");
    }

    // final norm and LM head on the output backend
    b.split(model.backend_out, "output");
    let mut cur = b.rms_norm(inp_l, RMS_NORM_EPS, "rms_norm_2");
    let norm_w = b.read_all(model.norm.clone(), "norm_weight");
    cur = b.mul(cur, norm_w, "result_norm");

    if let Some(embd_out) = &io.embd_out {
        let last = b.rows(cur, n - 1, 1, "embd_last");
        b.write(
            last,
            embd_out.clone(),
            View::contiguous(0, Shape::new(vec![n_embd])),
            "embeddings_out",
        );
    }

    let output_w = b.weight(model.output.clone(), "output");
    let logits = b.matmul(output_w, cur, "result_output");
    if cfg.logits_all {
        b.write(
            logits,
            io.logits_out.clone(),
            View::contiguous(0, Shape::new(vec![n * n_vocab])),
            "logits_cpy",
        );
    } else {
        let last = b.rows(logits, n - 1, 1, "logits_last");
        b.write(
            last,
            io.logits_out.clone(),
            View::contiguous(0, Shape::new(vec![n_vocab])),
            "logits_cpy",
        );
    }

    b.finish()
}
