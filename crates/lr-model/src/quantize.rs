//! Model requantization: stream tensors out of one file, re-encode the
//! weight matrices into a target dtype with a chunked worker pool, and write
//! a current-version file.

use std::path::Path;
use std::sync::Mutex;

use log::{info, warn};
use lr_tensor::quant::{dequantize_row, quantize_chunk, HIST_BINS};
use lr_tensor::{DType, QK_K};

use crate::error::{ModelError, Result};
use crate::format::{FileReader, FileSaver, FileVersion, TensorCatalog};
use crate::hparams::Ftype;

/// Elements claimed per worker iteration.
const CHUNK_SIZE: usize = 32 * 512;

pub struct QuantizeParams {
    pub ftype: Ftype,
    /// 0 selects the available hardware parallelism.
    pub n_threads: usize,
    /// Permit re-encoding tensors that are already quantized.
    pub allow_requantize: bool,
    /// Quantize `output.weight` too (to Q6_K under K-quant targets).
    pub quantize_output_tensor: bool,
}

impl Default for QuantizeParams {
    fn default() -> Self {
        QuantizeParams {
            ftype: Ftype::MostlyQ5_1,
            n_threads: 0,
            allow_requantize: false,
            quantize_output_tensor: true,
        }
    }
}

/// Aggregate result of a quantization run.
#[derive(Debug, Clone)]
pub struct QuantizeStats {
    pub total_size_org: usize,
    pub total_size_new: usize,
    pub hist: [i64; HIST_BINS],
}

impl QuantizeStats {
    /// Histogram normalized over all quantized elements.
    pub fn hist_normalized(&self) -> [f32; HIST_BINS] {
        let sum: i64 = self.hist.iter().sum();
        let mut out = [0.0f32; HIST_BINS];
        if sum > 0 {
            for (o, &h) in out.iter_mut().zip(&self.hist) {
                *o = h as f32 / sum as f32;
            }
        }
        out
    }
}

fn base_quant_type(ftype: Ftype) -> Result<DType> {
    Ok(match ftype {
        Ftype::AllF32 => DType::F32,
        Ftype::MostlyF16 => DType::F16,
        Ftype::MostlyQ4_0 => DType::Q4_0,
        Ftype::MostlyQ4_1 => DType::Q4_1,
        Ftype::MostlyQ5_0 => DType::Q5_0,
        Ftype::MostlyQ5_1 => DType::Q5_1,
        Ftype::MostlyQ8_0 => DType::Q8_0,
        Ftype::MostlyQ2K => DType::Q2K,
        Ftype::MostlyQ3KS | Ftype::MostlyQ3KM | Ftype::MostlyQ3KL => DType::Q3K,
        Ftype::MostlyQ4KS | Ftype::MostlyQ4KM => DType::Q4K,
        Ftype::MostlyQ5KS | Ftype::MostlyQ5KM => DType::Q5K,
        Ftype::MostlyQ6K => DType::Q6K,
        Ftype::MostlyQ4_1SomeF16 => {
            return Err(ModelError::InvalidParameter(format!(
                "invalid output file type {:?}",
                ftype
            )));
        }
    })
}

/// Extra precision for the layers that hurt most when starved: the first
/// eighth, the last eighth, and every third layer of the middle stratum.
fn use_more_bits(i_layer: usize, n_layers: usize) -> bool {
    i_layer < n_layers / 8 || i_layer >= 7 * n_layers / 8 || (i_layer - n_layers / 8) % 3 == 2
}

struct QuantShared {
    counter: usize,
    hist: [i64; HIST_BINS],
    size: usize,
    chunks: Vec<(usize, Vec<u8>)>,
    failed: Option<ModelError>,
}

/// Encode `data` into `dtype`. Workers claim [`CHUNK_SIZE`]-element chunks
/// through a mutex-guarded counter and merge their local histogram and
/// emitted-byte count under the same mutex on completion; the encode itself
/// runs unlocked.
fn quantize_tensor(
    dtype: DType,
    data: &[f32],
    n_threads: usize,
) -> Result<(Vec<u8>, [i64; HIST_BINS])> {
    let nelements = data.len();
    if nelements % dtype.block_size() != 0 {
        return Err(ModelError::QuantizeUnsupported(format!(
            "{} elements do not fill {} blocks",
            nelements, dtype
        )));
    }
    let nchunks = nelements.div_ceil(CHUNK_SIZE);
    let nthread_use = if n_threads > 1 {
        n_threads.min(nchunks).max(1)
    } else {
        1
    };

    if nthread_use < 2 {
        let mut out = vec![0u8; dtype.row_bytes(nelements)];
        let mut hist = [0i64; HIST_BINS];
        quantize_chunk(dtype, data, &mut out, &mut hist)?;
        return Ok((out, hist));
    }

    let shared = Mutex::new(QuantShared {
        counter: 0,
        hist: [0i64; HIST_BINS],
        size: 0,
        chunks: Vec::with_capacity(nchunks),
        failed: None,
    });

    let worker = |shared: &Mutex<QuantShared>| {
        let mut local_hist = [0i64; HIST_BINS];
        let mut local_size = 0usize;
        let mut local_chunks: Vec<(usize, Vec<u8>)> = Vec::new();
        loop {
            let first = {
                let mut sh = match shared.lock() {
                    Ok(sh) => sh,
                    Err(_) => return,
                };
                if sh.counter >= nelements || sh.failed.is_some() {
                    for (h, l) in sh.hist.iter_mut().zip(&local_hist) {
                        *h += l;
                    }
                    sh.size += local_size;
                    sh.chunks.append(&mut local_chunks);
                    return;
                }
                let first = sh.counter;
                sh.counter += CHUNK_SIZE;
                first
            };
            let last = (first + CHUNK_SIZE).min(nelements);
            let mut buf = vec![0u8; dtype.row_bytes(last - first)];
            match quantize_chunk(dtype, &data[first..last], &mut buf, &mut local_hist) {
                Ok(n) => {
                    local_size += n;
                    local_chunks.push((first, buf));
                }
                Err(e) => {
                    if let Ok(mut sh) = shared.lock() {
                        sh.failed = Some(e.into());
                    }
                    return;
                }
            }
        }
    };

    std::thread::scope(|scope| {
        for _ in 0..nthread_use - 1 {
            scope.spawn(|| worker(&shared));
        }
        worker(&shared);
    });

    let mut sh = shared
        .into_inner()
        .map_err(|_| ModelError::AllocFailure("quantize worker state poisoned".to_string()))?;
    if let Some(e) = sh.failed.take() {
        return Err(e);
    }

    let mut out = vec![0u8; dtype.row_bytes(nelements)];
    for (first, buf) in &sh.chunks {
        let off = first / dtype.block_size() * dtype.block_bytes();
        out[off..off + buf.len()].copy_from_slice(buf);
    }
    debug_assert_eq!(sh.size, out.len());
    Ok((out, sh.hist))
}

/// Requantize a model file into `fname_out` at the target file type.
pub fn quantize_model(
    fname_inp: &Path,
    fname_out: &Path,
    params: &QuantizeParams,
) -> Result<QuantizeStats> {
    let quantized_type = base_quant_type(params.ftype)?;
    let n_threads = if params.n_threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        params.n_threads
    };

    let mut reader = FileReader::open(fname_inp)?;
    let version = reader.read_magic()?;
    let hparams = reader.read_hparams()?;
    let vocab = reader.read_vocab(version, hparams.n_vocab)?;
    let mut catalog = TensorCatalog::new();
    reader.read_tensor_metadata(version, &mut catalog)?;

    if version == FileVersion::Ggml {
        warn!("input is an old file without scores; writing dummy scores");
    }
    info!(
        "quantizing {} to {} ({})",
        fname_inp.display(),
        fname_out.display(),
        params.ftype.name()
    );

    let mut saver = FileSaver::create(fname_out, &hparams, params.ftype, &vocab)?;

    let n_attention_wv = catalog
        .tensors
        .iter()
        .filter(|t| t.name.contains("attention.wv.weight"))
        .count();
    let n_feed_forward_w2 = catalog
        .tensors
        .iter()
        .filter(|t| t.name.contains("feed_forward.w2.weight"))
        .count();
    let mut i_attention_wv = 0usize;
    let mut i_feed_forward_w2 = 0usize;

    let mut stats = QuantizeStats {
        total_size_org: 0,
        total_size_new: 0,
        hist: [0i64; HIST_BINS],
    };

    let n_tensors = catalog.len();
    for (idx, meta) in catalog.tensors.iter().enumerate() {
        let data = reader.read_tensor_data(meta)?;
        info!(
            "[{:4}/{:4}] {:36} {:?}, type = {}",
            idx + 1,
            n_tensors,
            meta.name,
            meta.ne,
            meta.dtype
        );

        // only 2-D projection matrices are quantized
        let mut quantize = meta.name.ends_with("weight") && meta.ne.len() == 2;
        quantize &= params.quantize_output_tensor || meta.name != "output.weight";
        quantize &= quantized_type != meta.dtype;

        if !quantize {
            saver.write_tensor(meta, meta.dtype, &data)?;
            stats.total_size_org += meta.size;
            stats.total_size_new += meta.size;
            continue;
        }

        let mut new_type = quantized_type;
        if quantized_type.block_size() == QK_K {
            let nx = meta.ne[0];
            let ny = meta.ne[1];
            let incompatible = nx % QK_K != 0 || ny % QK_K != 0;

            if meta.name == "output.weight" {
                if !incompatible {
                    new_type = DType::Q6K;
                }
            } else if meta.name.contains("attention.wv.weight") {
                new_type = match params.ftype {
                    Ftype::MostlyQ3KM | Ftype::MostlyQ2K => DType::Q4K,
                    Ftype::MostlyQ3KL => DType::Q5K,
                    Ftype::MostlyQ4KM | Ftype::MostlyQ5KM
                        if use_more_bits(i_attention_wv, n_attention_wv) =>
                    {
                        DType::Q6K
                    }
                    _ => new_type,
                };
                i_attention_wv += 1;
            } else if meta.name.contains("feed_forward.w2.weight") {
                new_type = match params.ftype {
                    Ftype::MostlyQ3KM | Ftype::MostlyQ2K => DType::Q4K,
                    Ftype::MostlyQ3KL => DType::Q5K,
                    Ftype::MostlyQ4KM | Ftype::MostlyQ5KM
                        if use_more_bits(i_feed_forward_w2, n_feed_forward_w2) =>
                    {
                        DType::Q6K
                    }
                    _ => new_type,
                };
                i_feed_forward_w2 += 1;
            } else if meta.name.contains("attention.wo.weight") {
                new_type = match params.ftype {
                    Ftype::MostlyQ3KM | Ftype::MostlyQ2K => DType::Q4K,
                    Ftype::MostlyQ3KL => DType::Q5K,
                    _ => new_type,
                };
            }

            if incompatible {
                warn!(
                    "tensor '{}' ({} x {}) is not divisible by {}",
                    meta.name, nx, ny, QK_K
                );
                new_type = match meta.name.as_str() {
                    "output.weight" => DType::F16,
                    "tok_embeddings.weight" => DType::Q4_0,
                    _ => {
                        return Err(ModelError::QuantizeUnsupported(format!(
                            "tensor '{}' has no fallback for its unsupported size",
                            meta.name
                        )));
                    }
                };
            }
        }

        // produce the f32 working copy
        let nelements = meta.numel();
        let f32_data: Vec<f32> = if meta.dtype == DType::F32 {
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        } else if meta.dtype.is_quantized() && !params.allow_requantize {
            return Err(ModelError::RequantizeDisabled(meta.dtype.to_string()));
        } else {
            let mut out = vec![0.0f32; nelements];
            dequantize_row(meta.dtype, &data, &mut out)?;
            out
        };

        let (new_data, hist_cur) = quantize_tensor(new_type, &f32_data, n_threads)?;
        info!(
            "{} -> {}: {:8.2} MB -> {:8.2} MB",
            meta.dtype,
            new_type,
            meta.size as f64 / 1024.0 / 1024.0,
            new_data.len() as f64 / 1024.0 / 1024.0
        );

        saver.write_tensor(meta, new_type, &new_data)?;
        stats.total_size_org += meta.size;
        stats.total_size_new += new_data.len();
        for (all, cur) in stats.hist.iter_mut().zip(&hist_cur) {
            *all += cur;
        }
    }
    saver.finish()?;

    info!(
        "model size = {:8.2} MB, quant size = {:8.2} MB",
        stats.total_size_org as f64 / 1024.0 / 1024.0,
        stats.total_size_new as f64 / 1024.0 / 1024.0
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::loader::load_model;
    use crate::test_support::{tiny_params, write_tiny_model};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_use_more_bits_strata() {
        // first eighth, last eighth and the (i - n/8) % 3 == 2 stratum
        assert!(use_more_bits(0, 32));
        assert!(use_more_bits(3, 32));
        assert!(!use_more_bits(4, 32));
        assert!(use_more_bits(6, 32)); // (6 - 4) % 3 == 2
        assert!(use_more_bits(28, 32));
        assert!(use_more_bits(31, 32));
    }

    #[test]
    fn test_quantize_then_load_and_eval() {
        let dir = tempdir().unwrap();
        let f32_path = dir.path().join("tiny_f32.bin");
        let q_path = dir.path().join("tiny_q4.bin");
        write_tiny_model(&f32_path, Ftype::AllF32);

        let stats = quantize_model(
            &f32_path,
            &q_path,
            &QuantizeParams {
                ftype: Ftype::MostlyQ4_0,
                n_threads: 2,
                ..QuantizeParams::default()
            },
        )
        .unwrap();
        assert!(stats.total_size_new < stats.total_size_org);
        assert!(stats.hist.iter().sum::<i64>() > 0);
        let norm: f32 = stats.hist_normalized().iter().sum();
        assert!((norm - 1.0).abs() < 1e-4);

        let model = Arc::new(load_model(&q_path, &tiny_params()).unwrap());
        assert_eq!(model.hparams.ftype, Ftype::MostlyQ4_0);
        assert_eq!(model.layers[0].wq.dtype, DType::Q4_0);
        // 1-D norms stay in f32
        assert_eq!(model.layers[0].attention_norm.dtype, DType::F32);

        let mut ctx = Context::new(model, &tiny_params()).unwrap();
        ctx.eval(&[1, 270], 0, 1).unwrap();
        assert!(ctx.logits().iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_requantize_needs_opt_in() {
        let dir = tempdir().unwrap();
        let f32_path = dir.path().join("tiny_f32.bin");
        let q_path = dir.path().join("tiny_q8.bin");
        let rq_path = dir.path().join("tiny_q4.bin");
        write_tiny_model(&f32_path, Ftype::AllF32);
        quantize_model(
            &f32_path,
            &q_path,
            &QuantizeParams {
                ftype: Ftype::MostlyQ8_0,
                n_threads: 1,
                ..QuantizeParams::default()
            },
        )
        .unwrap();

        let denied = quantize_model(
            &q_path,
            &rq_path,
            &QuantizeParams {
                ftype: Ftype::MostlyQ4_0,
                n_threads: 1,
                ..QuantizeParams::default()
            },
        );
        assert!(matches!(denied, Err(ModelError::RequantizeDisabled(_))));

        quantize_model(
            &q_path,
            &rq_path,
            &QuantizeParams {
                ftype: Ftype::MostlyQ4_0,
                n_threads: 1,
                allow_requantize: true,
                ..QuantizeParams::default()
            },
        )
        .unwrap();
        let model = load_model(&rq_path, &tiny_params()).unwrap();
        assert_eq!(model.layers[0].wq.dtype, DType::Q4_0);
    }

    #[test]
    fn test_output_tensor_can_be_spared() {
        let dir = tempdir().unwrap();
        let f32_path = dir.path().join("tiny_f32.bin");
        let q_path = dir.path().join("tiny_q.bin");
        write_tiny_model(&f32_path, Ftype::AllF32);
        quantize_model(
            &f32_path,
            &q_path,
            &QuantizeParams {
                ftype: Ftype::MostlyQ4_0,
                n_threads: 1,
                quantize_output_tensor: false,
                ..QuantizeParams::default()
            },
        )
        .unwrap();
        let model = load_model(&q_path, &tiny_params()).unwrap();
        assert_eq!(model.output.dtype, DType::F32);
        assert_eq!(model.layers[0].wq.dtype, DType::Q4_0);
    }

    #[test]
    fn test_threaded_matches_single_threaded() {
        let data: Vec<f32> = (0..CHUNK_SIZE * 3 + 512)
            .map(|i| ((i * 37) % 255) as f32 / 128.0 - 1.0)
            .collect();
        let (a, hist_a) = quantize_tensor(DType::Q8_0, &data, 1).unwrap();
        let (b, hist_b) = quantize_tensor(DType::Q8_0, &data, 4).unwrap();
        assert_eq!(a, b);
        assert_eq!(hist_a, hist_b);
    }

    #[test]
    fn test_kquant_fallback_error() {
        // a 48-element row cannot fill 256-element super-blocks and is not
        // one of the tensors with a fallback type
        let data = vec![0.0f32; 48];
        assert!(matches!(
            quantize_tensor(DType::Q4K, &data, 1),
            Err(ModelError::QuantizeUnsupported(_))
        ));
    }
}
