//! Helpers for building tiny deterministic model files on disk.

use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use lr_tensor::quant::{quantize_chunk, HIST_BINS};
use lr_tensor::DType;
use tempfile::TempDir;

use crate::context::{Context, ContextParams};
use crate::format::{FileSaver, TensorMeta};
use crate::hparams::{Ftype, Hparams};
use crate::loader::{expected_tensors, load_model};
use crate::vocab::{TokenScore, Vocab};

pub(crate) fn tiny_hparams() -> Hparams {
    Hparams {
        n_vocab: 300,
        n_embd: 32,
        n_mult: 32,
        n_head: 4,
        n_layer: 2,
        n_rot: 8,
        ftype: Ftype::AllF32,
        ..Hparams::default()
    }
}

/// Reserved ids, the byte-fallback range, a few merge chains and filler.
pub(crate) fn tiny_vocab() -> Vocab {
    let mut entries: Vec<TokenScore> = [b"<unk>".to_vec(), b"<s>".to_vec(), b"</s>".to_vec()]
        .into_iter()
        .map(|text| TokenScore { text, score: 0.0 })
        .collect();
    for b in 0u16..256 {
        entries.push(TokenScore {
            text: vec![b as u8],
            score: 0.0,
        });
    }
    for word in ["He", "Hel", "Hell", "Hello", "wo", "wor", "worl", "world"] {
        entries.push(TokenScore {
            text: word.as_bytes().to_vec(),
            score: word.len() as f32,
        });
    }
    let mut i = 0;
    while entries.len() < 300 {
        entries.push(TokenScore {
            text: format!("tok{}", i).into_bytes(),
            score: 0.1,
        });
        i += 1;
    }
    Vocab::new(entries)
}

fn next_f32(state: &mut u64) -> f32 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    ((*state >> 40) as f32 / (1u64 << 24) as f32 - 0.5) * 0.5
}

fn weight_dtype(ftype: Ftype) -> DType {
    match ftype {
        Ftype::AllF32 => DType::F32,
        Ftype::MostlyF16 => DType::F16,
        Ftype::MostlyQ8_0 => DType::Q8_0,
        other => panic!("tiny models do not support {:?}", other),
    }
}

/// Write a complete 2-layer model with deterministic pseudo-random weights.
pub(crate) fn write_tiny_model(path: &Path, ftype: Ftype) {
    write_tiny_model_with(path, ftype, &[]);
}

/// Same, with extra tensors appended after the expected set.
pub(crate) fn write_tiny_model_with(path: &Path, ftype: Ftype, extra: &[(&str, Vec<usize>)]) {
    let mut hparams = tiny_hparams();
    hparams.ftype = ftype;
    let vocab = tiny_vocab();
    let mut saver = FileSaver::create(path, &hparams, ftype, &vocab).unwrap();

    let dtype_2d = weight_dtype(ftype);
    let mut state = 0x00c0_ffee_d00d_f00du64;
    let mut tensors: Vec<(String, Vec<usize>)> = expected_tensors(&hparams);
    tensors.extend(
        extra
            .iter()
            .map(|(name, ne)| (name.to_string(), ne.clone())),
    );
    for (name, ne) in tensors {
        let numel: usize = ne.iter().product();
        let values: Vec<f32> = (0..numel).map(|_| next_f32(&mut state)).collect();
        let dtype = if ne.len() == 2 { dtype_2d } else { DType::F32 };
        let bytes = match dtype {
            DType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            other => {
                let mut out = vec![0u8; other.row_bytes(numel)];
                let mut hist = [0i64; HIST_BINS];
                quantize_chunk(other, &values, &mut out, &mut hist).unwrap();
                out
            }
        };
        let meta = TensorMeta {
            name,
            dtype,
            ne,
            file_off: 0,
            size: 0,
        };
        saver.write_tensor(&meta, dtype, &bytes).unwrap();
    }
    saver.finish().unwrap();
}

pub(crate) fn write_with_extra_tensor(path: &Path) {
    write_tiny_model_with(path, Ftype::AllF32, &[("layers.0.bonus.weight", vec![32])]);
}

/// Hand-rolled legacy header (GGML / GGMF / GGJT pre-v3) with no tensors,
/// for exercising the version gates.
pub(crate) fn write_legacy_model(path: &Path, magic: u32, version: Option<u32>, ftype: Ftype) {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(magic).unwrap();
    if let Some(v) = version {
        out.write_u32::<LittleEndian>(v).unwrap();
    }
    let hp = tiny_hparams();
    out.write_u32::<LittleEndian>(2).unwrap(); // n_vocab
    out.write_u32::<LittleEndian>(hp.n_embd).unwrap();
    out.write_u32::<LittleEndian>(hp.n_mult).unwrap();
    out.write_u32::<LittleEndian>(hp.n_head).unwrap();
    out.write_u32::<LittleEndian>(hp.n_layer).unwrap();
    out.write_u32::<LittleEndian>(hp.n_rot).unwrap();
    out.write_u32::<LittleEndian>(ftype.to_u32()).unwrap();
    for text in [b"a", b"b"] {
        out.write_u32::<LittleEndian>(1).unwrap();
        out.extend_from_slice(text);
        if version.is_some() {
            out.write_f32::<LittleEndian>(0.0).unwrap();
        }
    }
    std::fs::write(path, out).unwrap();
}

pub(crate) fn tiny_params() -> ContextParams {
    ContextParams {
        seed: 42,
        n_ctx: 16,
        n_batch: 8,
        ..ContextParams::default()
    }
}

/// Write, load and wrap a tiny model; `tweak` adjusts the shared parameter
/// block before both the load and the context creation.
pub(crate) fn tiny_context(
    ftype: Ftype,
    tweak: impl FnOnce(&mut ContextParams),
) -> (TempDir, Context) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.bin");
    write_tiny_model(&path, ftype);
    let mut params = tiny_params();
    tweak(&mut params);
    let model = Arc::new(load_model(&path, &params).unwrap());
    let ctx = Context::new(model, &params).unwrap();
    (dir, ctx)
}
