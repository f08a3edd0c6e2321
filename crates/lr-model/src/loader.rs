//! Model loading: drives the file reader and tensor catalog, places every
//! tensor on a backend, allocates the backend buffers and streams the data
//! in file order, either by pointing RAM-shared tensors into the mapping or
//! by uploading through a bounce buffer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::info;
use lr_tensor::{Backend, BufferId, CpuBackend, MappedRegion, Shape, TensorHandle};

use crate::context::ContextParams;
use crate::error::{ModelError, Result};
use crate::format::{FileReader, FileVersion, TensorCatalog};
use crate::hparams::{Ftype, Hparams, ModelSize};
use crate::mmap::MmapFile;
use crate::model::{Layer, Model, OwnedBuffers};
use crate::vocab::Vocab;

/// Parse the header, hyperparameters and vocabulary only; no backend work.
pub fn load_vocab(path: &Path) -> Result<(Hparams, Vocab)> {
    let mut reader = FileReader::open(path)?;
    let version = reader.read_magic()?;
    let hparams = reader.read_hparams()?;
    let vocab = reader.read_vocab(version, hparams.n_vocab)?;
    Ok((hparams, vocab))
}

fn tensor_placement(
    name: &str,
    n_layer: usize,
    backend_inp: usize,
    backend_out: usize,
    backend_layers: &[usize],
) -> Result<usize> {
    if name == "tok_embeddings.weight" {
        return Ok(backend_inp);
    }
    if name == "norm.weight" || name == "output.weight" {
        return Ok(backend_out);
    }
    let layer = name
        .strip_prefix("layers.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|num| num.parse::<usize>().ok())
        .ok_or_else(|| {
            ModelError::BadFormat(format!(
                "failed to parse layer number from tensor name '{}'",
                name
            ))
        })?;
    if layer >= n_layer {
        return Err(ModelError::BadFormat(format!(
            "invalid layer number {} in tensor name '{}'",
            layer, name
        )));
    }
    Ok(backend_layers[layer])
}

/// Every tensor a complete model must contain, with its on-disk `ne`.
pub(crate) fn expected_tensors(hparams: &Hparams) -> Vec<(String, Vec<usize>)> {
    let e = hparams.n_embd as usize;
    let v = hparams.n_vocab as usize;
    let ff = hparams.n_ff() as usize;
    let mut out = vec![
        ("tok_embeddings.weight".to_string(), vec![e, v]),
        ("norm.weight".to_string(), vec![e]),
        ("output.weight".to_string(), vec![e, v]),
    ];
    for i in 0..hparams.n_layer as usize {
        let p = format!("layers.{}", i);
        out.push((format!("{}.attention_norm.weight", p), vec![e]));
        out.push((format!("{}.attention.wq.weight", p), vec![e, e]));
        out.push((format!("{}.attention.wk.weight", p), vec![e, e]));
        out.push((format!("{}.attention.wv.weight", p), vec![e, e]));
        out.push((format!("{}.attention.wo.weight", p), vec![e, e]));
        out.push((format!("{}.ffn_norm.weight", p), vec![e]));
        out.push((format!("{}.feed_forward.w1.weight", p), vec![e, ff]));
        out.push((format!("{}.feed_forward.w2.weight", p), vec![ff, e]));
        out.push((format!("{}.feed_forward.w3.weight", p), vec![e, ff]));
    }
    out
}

fn arena_of(arenas: &HashMap<usize, BufferId>, backend: usize) -> Result<BufferId> {
    arenas.get(&backend).copied().ok_or_else(|| {
        ModelError::AllocFailure(format!("no arena allocated for backend {}", backend))
    })
}

/// Load a model file, binding every tensor to a backend buffer.
pub fn load_model(path: &Path, params: &ContextParams) -> Result<Model> {
    let t_start = Instant::now();
    info!("loading model from {}", path.display());

    if params.n_ctx < 1 {
        return Err(ModelError::InvalidParameter(format!(
            "invalid n_ctx = {}",
            params.n_ctx
        )));
    }

    let mut reader = FileReader::open(path)?;
    let version = reader.read_magic()?;
    let mut hparams = reader.read_hparams()?;
    let vocab = reader.read_vocab(version, hparams.n_vocab)?;
    let mut catalog = TensorCatalog::new();
    reader.read_tensor_metadata(version, &mut catalog)?;

    hparams.n_ctx = params.n_ctx as u32;
    hparams.rope_freq_base = params.rope_freq_base;
    hparams.rope_freq_scale = params.rope_freq_scale;
    let size_class = ModelSize::from_n_layer(hparams.n_layer);

    info!("format     = {}", version.name());
    info!("n_vocab    = {}", hparams.n_vocab);
    info!("n_ctx      = {}", hparams.n_ctx);
    info!("n_embd     = {}", hparams.n_embd);
    info!("n_mult     = {}", hparams.n_mult);
    info!("n_head     = {}", hparams.n_head);
    info!("n_layer    = {}", hparams.n_layer);
    info!("n_rot      = {}", hparams.n_rot);
    info!("freq_base  = {:.1}", hparams.rope_freq_base);
    info!("freq_scale = {}", hparams.rope_freq_scale);
    info!("ftype      = {} ({})", hparams.ftype.to_u32(), hparams.ftype.name());
    info!("n_ff       = {}", hparams.n_ff());
    info!("model size = {}", size_class.name());

    if version < FileVersion::GgjtV2
        && !matches!(
            hparams.ftype,
            Ftype::AllF32 | Ftype::MostlyF16 | Ftype::MostlyQ8_0
        )
    {
        return Err(ModelError::UnsupportedFormat(
            "quantized files before 'ggjt' v2 use a retired block layout".to_string(),
        ));
    }
    if version < FileVersion::GgjtV3
        && matches!(
            hparams.ftype,
            Ftype::MostlyQ4_0 | Ftype::MostlyQ4_1 | Ftype::MostlyQ8_0
        )
    {
        return Err(ModelError::UnsupportedFormat(
            "Q4/Q8 files before 'ggjt' v3 use a retired block layout".to_string(),
        ));
    }

    // backend registry: CPU always, an injected device backend optionally
    let mut backends: Vec<Arc<dyn Backend>> = vec![Arc::new(CpuBackend::new())];
    let backend_cpu = 0usize;
    let n_gpu_layers = params.n_gpu_layers;
    let backend_gpu = match &params.gpu_backend {
        Some(gpu) if n_gpu_layers > 0 => {
            backends.push(gpu.clone());
            Some(1usize)
        }
        _ => None,
    };

    let n_layer = hparams.n_layer as usize;
    let i_gpu_start = n_layer.saturating_sub(n_gpu_layers);
    let backend_inp = match backend_gpu {
        Some(gpu) if n_gpu_layers > n_layer => gpu,
        _ => backend_cpu,
    };
    let backend_out = backend_gpu.unwrap_or(backend_cpu);
    let backend_layers: Vec<usize> = (0..n_layer)
        .map(|i| match backend_gpu {
            Some(gpu) if i >= i_gpu_start => gpu,
            _ => backend_cpu,
        })
        .collect();

    // per-backend data size, minus what the mapping will back directly
    let mut tensor_backend = Vec::with_capacity(catalog.len());
    let mut ctx_sizes: HashMap<usize, usize> = HashMap::new();
    for meta in &catalog.tensors {
        let b = tensor_placement(&meta.name, n_layer, backend_inp, backend_out, &backend_layers)?;
        *ctx_sizes.entry(b).or_insert(0) += meta.size;
        tensor_backend.push(b);
    }
    let use_mmap = params.use_mmap;
    let mut mmap_size = 0usize;
    if use_mmap {
        for (&b, size) in ctx_sizes.iter_mut() {
            if backends[b].is_ram_shared() {
                mmap_size += *size;
                *size = 0;
            }
        }
    }
    for (&b, &size) in &ctx_sizes {
        info!(
            "{:>8} = {:7.2} MB",
            backends[b].name(),
            size as f64 / 1024.0 / 1024.0
        );
    }
    if mmap_size > 0 {
        info!("{:>8} = {:7.2} MB", "mmap", mmap_size as f64 / 1024.0 / 1024.0);
    }

    let mut owned = OwnedBuffers::new(backends.clone());
    let mut arenas: HashMap<usize, BufferId> = HashMap::new();
    for (&b, &size) in &ctx_sizes {
        if size > 0 {
            let id = backends[b].alloc_buffer(size, catalog.len())?;
            owned.track(b, id);
            arenas.insert(b, id);
        }
    }

    // one mapped buffer per RAM-shared backend holding mapped tensors
    let mut mapping: Option<Arc<MmapFile>> = None;
    let mut mapped_bufs: HashMap<usize, BufferId> = HashMap::new();
    if use_mmap {
        let region = Arc::new(MmapFile::new(reader.file())?);
        if params.use_mlock {
            region.lock();
        }
        for &b in &tensor_backend {
            if backends[b].is_ram_shared() && !mapped_bufs.contains_key(&b) {
                let id = backends[b].map_buffer(region.clone())?;
                owned.track(b, id);
                mapped_bufs.insert(b, id);
            }
        }
        mapping = Some(region);
    }

    // bind every expected descriptor to exactly one backend tensor
    let mut bindings: Vec<Option<TensorHandle>> = vec![None; catalog.len()];
    for (name, ne) in expected_tensors(&hparams) {
        let idx = catalog
            .index_of(&name)
            .ok_or_else(|| ModelError::MissingTensor(name.clone()))?;
        let meta = &catalog.tensors[idx];
        if meta.ne != ne {
            return Err(ModelError::ShapeMismatch {
                name,
                expected: ne,
                got: meta.ne.clone(),
            });
        }
        let b = tensor_backend[idx];
        let shape = Shape::new(meta.ne.iter().rev().copied().collect());
        let handle = if use_mmap && backends[b].is_ram_shared() {
            TensorHandle {
                buffer: arena_of(&mapped_bufs, b)?,
                offset: meta.file_off as usize,
                dtype: meta.dtype,
                shape,
            }
        } else {
            backends[b].create_tensor(arena_of(&arenas, b)?, meta.dtype, shape)?
        };
        bindings[idx] = Some(handle);
    }
    if let Some((idx, _)) = bindings.iter().enumerate().find(|(_, b)| b.is_none()) {
        return Err(ModelError::ExtraTensor(catalog.tensors[idx].name.clone()));
    }

    {
        let kv_scale: usize = if params.f16_kv { 1 } else { 2 };
        let ctx_sum: usize = mmap_size + ctx_sizes.values().sum::<usize>();
        info!(
            "mem required = {:7.2} MB (+ {:7.2} MB per state)",
            (ctx_sum + size_class.mem_req_eval()) as f64 / 1024.0 / 1024.0,
            (kv_scale * size_class.mem_req_kv_self()) as f64 / 1024.0 / 1024.0
        );
    }

    // stream tensor data in file order
    let data_size: usize = catalog.tensors.iter().map(|t| t.size).sum();
    let bounce_size = catalog
        .tensors
        .iter()
        .enumerate()
        .filter(|(i, _)| !(use_mmap && backends[tensor_backend[*i]].is_ram_shared()))
        .map(|(_, t)| t.size)
        .max()
        .unwrap_or(0);
    let mut bounce = vec![0u8; if use_mmap { 0 } else { bounce_size }];
    let mut done_size = 0usize;
    for (idx, meta) in catalog.tensors.iter().enumerate() {
        if let Some(cb) = &params.progress_callback {
            cb(done_size as f32 / data_size.max(1) as f32);
        }
        let b = tensor_backend[idx];
        let handle = bindings[idx]
            .as_ref()
            .ok_or_else(|| ModelError::MissingTensor(meta.name.clone()))?;
        if use_mmap {
            if backends[b].is_ram_shared() {
                // already backed by the mapping
            } else {
                let region = mapping
                    .as_ref()
                    .ok_or_else(|| ModelError::AllocFailure("mapping vanished".to_string()))?;
                let off = meta.file_off as usize;
                let bytes = &region.as_bytes()[off..off + meta.size];
                backends[b].upload(handle, bytes, 0)?;
                region.discard(off, meta.size);
            }
        } else {
            let dst = &mut bounce[..meta.size];
            reader.read_tensor_into(meta, dst)?;
            backends[b].upload(handle, dst, 0)?;
        }
        done_size += meta.size;
    }
    if let Some(cb) = &params.progress_callback {
        cb(1.0);
    }

    let take = |name: &str| -> Result<TensorHandle> {
        let idx = catalog
            .index_of(name)
            .ok_or_else(|| ModelError::MissingTensor(name.to_string()))?;
        bindings[idx]
            .clone()
            .ok_or_else(|| ModelError::MissingTensor(name.to_string()))
    };
    let mut layers = Vec::with_capacity(n_layer);
    for i in 0..n_layer {
        let p = format!("layers.{}", i);
        layers.push(Layer {
            attention_norm: take(&format!("{}.attention_norm.weight", p))?,
            wq: take(&format!("{}.attention.wq.weight", p))?,
            wk: take(&format!("{}.attention.wk.weight", p))?,
            wv: take(&format!("{}.attention.wv.weight", p))?,
            wo: take(&format!("{}.attention.wo.weight", p))?,
            ffn_norm: take(&format!("{}.ffn_norm.weight", p))?,
            w1: take(&format!("{}.feed_forward.w1.weight", p))?,
            w2: take(&format!("{}.feed_forward.w2.weight", p))?,
            w3: take(&format!("{}.feed_forward.w3.weight", p))?,
        });
    }

    let t_load_us = t_start.elapsed().as_micros() as u64;
    info!("load time = {:.2} ms", t_load_us as f64 / 1000.0);

    Ok(Model {
        tok_embeddings: take("tok_embeddings.weight")?,
        norm: take("norm.weight")?,
        output: take("output.weight")?,
        layers,
        hparams,
        vocab,
        size_class,
        buffers: owned,
        backend_cpu,
        backend_gpu,
        backend_inp,
        backend_out,
        backend_layers,
        n_gpu_layers,
        mapping,
        t_start,
        t_load_us,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{tiny_params, write_tiny_model, write_with_extra_tensor};
    use lr_tensor::DType;
    use tempfile::tempdir;

    #[test]
    fn test_load_tiny_model_mmap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        write_tiny_model(&path, Ftype::AllF32);

        let model = load_model(&path, &tiny_params()).unwrap();
        assert_eq!(model.layers.len(), 2);
        assert_eq!(model.tok_embeddings.dtype, DType::F32);
        // on-disk ne {n_embd, n_vocab} becomes a row-major [n_vocab, n_embd]
        assert_eq!(
            model.tok_embeddings.shape.dims(),
            &[model.n_vocab(), model.n_embd()]
        );
        assert!(model.mapping.is_some());
    }

    #[test]
    fn test_load_tiny_model_no_mmap_matches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        write_tiny_model(&path, Ftype::AllF32);

        let mut params = tiny_params();
        params.use_mmap = false;
        let model = load_model(&path, &params).unwrap();
        assert!(model.mapping.is_none());

        // both paths must expose identical bytes for a weight
        let mmap_model = load_model(&path, &tiny_params()).unwrap();
        let mut a = vec![0u8; model.norm.nbytes()];
        let mut b = vec![0u8; model.norm.nbytes()];
        model
            .backend(model.backend_out)
            .download(&model.norm, &mut a, 0)
            .unwrap();
        mmap_model
            .backend(mmap_model.backend_out)
            .download(&mmap_model.norm, &mut b, 0)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_progress_callback_monotonic() {
        use std::sync::Mutex;
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        write_tiny_model(&path, Ftype::AllF32);

        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut params = tiny_params();
        params.progress_callback = Some(Box::new(move |p| seen2.lock().unwrap().push(p)));
        load_model(&path, &params).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen.first().unwrap(), 0.0);
        assert_eq!(*seen.last().unwrap(), 1.0);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_extra_tensor_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extra.bin");
        write_with_extra_tensor(&path);
        match load_model(&path, &tiny_params()) {
            Err(ModelError::ExtraTensor(name)) => assert_eq!(name, "layers.0.bonus.weight"),
            other => panic!("expected ExtraTensor, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_n_ctx() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        write_tiny_model(&path, Ftype::AllF32);
        let mut params = tiny_params();
        params.n_ctx = 0;
        assert!(matches!(
            load_model(&path, &params),
            Err(ModelError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_gpu_layer_placement() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        write_tiny_model(&path, Ftype::AllF32);

        let mut params = tiny_params();
        params.n_gpu_layers = 1;
        params.gpu_backend = Some(Arc::new(lr_tensor::CpuBackend::non_shared("gpu-sim")));
        let model = load_model(&path, &params).unwrap();
        // the last layer goes to the device, the first stays on the CPU
        assert_eq!(model.backend_layers, vec![0, 1]);
        assert_eq!(model.backend_out, 1);
        assert_eq!(model.backend_inp, 0);
    }

    #[test]
    fn test_version_gates() {
        use crate::format::{FILE_MAGIC_GGJT, FILE_MAGIC_GGMF, FILE_MAGIC_GGML};
        use crate::test_support::write_legacy_model;
        let dir = tempdir().unwrap();

        // pre-'ggjt' v2 quantized files are rejected
        let p = dir.path().join("ggmf_q4.bin");
        write_legacy_model(&p, FILE_MAGIC_GGMF, Some(1), Ftype::MostlyQ4_0);
        assert!(matches!(
            load_model(&p, &tiny_params()),
            Err(ModelError::UnsupportedFormat(_))
        ));

        // pre-'ggjt' v3 Q4/Q8 layouts are rejected
        let p = dir.path().join("ggjt2_q8.bin");
        write_legacy_model(&p, FILE_MAGIC_GGJT, Some(2), Ftype::MostlyQ8_0);
        assert!(matches!(
            load_model(&p, &tiny_params()),
            Err(ModelError::UnsupportedFormat(_))
        ));

        // an f32 legacy file passes the gates and fails later on the
        // missing tensors
        let p = dir.path().join("ggml_f32.bin");
        write_legacy_model(&p, FILE_MAGIC_GGML, None, Ftype::AllF32);
        assert!(matches!(
            load_model(&p, &tiny_params()),
            Err(ModelError::MissingTensor(_))
        ));
    }

    #[test]
    fn test_vocab_only_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        write_tiny_model(&path, Ftype::AllF32);
        let (hp, vocab) = load_vocab(&path).unwrap();
        assert_eq!(vocab.n_vocab(), hp.n_vocab as usize);
    }
}
