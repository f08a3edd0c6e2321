//! Context state serialization and session files.
//!
//! The state blob layout: RNG as a length-prefixed text line padded to
//! 64 KiB, logits (u64 count + f32 payload), embeddings (u64 count + f32
//! payload), then the KV cache (u64 buffer size + i32 token count + the K
//! and V contents dumped layer-major, position-major, embed-major).
//!
//! Session version 2: version 1 serialized a Mersenne-Twister text stream;
//! this runtime's ChaCha state line is not compatible with it.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use lr_sampler::{Prng, TokenId};

use crate::context::Context;
use crate::error::{ModelError, Result};
use crate::hparams::{Ftype, Hparams};

pub const SESSION_MAGIC: u32 = 0x6767_736e; // 'ggsn'
pub const SESSION_VERSION: u32 = 2;

/// Fixed size of the serialized RNG block.
pub const MAX_RNG_STATE: usize = 64 * 1024;

fn write_hparams(out: &mut impl Write, hp: &Hparams) -> Result<()> {
    out.write_u32::<LittleEndian>(hp.n_vocab)?;
    out.write_u32::<LittleEndian>(hp.n_ctx)?;
    out.write_u32::<LittleEndian>(hp.n_embd)?;
    out.write_u32::<LittleEndian>(hp.n_mult)?;
    out.write_u32::<LittleEndian>(hp.n_head)?;
    out.write_u32::<LittleEndian>(hp.n_layer)?;
    out.write_u32::<LittleEndian>(hp.n_rot)?;
    out.write_f32::<LittleEndian>(hp.rope_freq_base)?;
    out.write_f32::<LittleEndian>(hp.rope_freq_scale)?;
    out.write_u32::<LittleEndian>(hp.ftype.to_u32())?;
    Ok(())
}

fn read_hparams(inp: &mut impl Read) -> Result<Hparams> {
    Ok(Hparams {
        n_vocab: inp.read_u32::<LittleEndian>()?,
        n_ctx: inp.read_u32::<LittleEndian>()?,
        n_embd: inp.read_u32::<LittleEndian>()?,
        n_mult: inp.read_u32::<LittleEndian>()?,
        n_head: inp.read_u32::<LittleEndian>()?,
        n_layer: inp.read_u32::<LittleEndian>()?,
        n_rot: inp.read_u32::<LittleEndian>()?,
        rope_freq_base: inp.read_f32::<LittleEndian>()?,
        rope_freq_scale: inp.read_f32::<LittleEndian>()?,
        ftype: Ftype::from_u32(inp.read_u32::<LittleEndian>()?)?,
    })
}

impl Context {
    /// Exact upper bound on [`Context::copy_state_data`] output for this
    /// context's configuration.
    pub fn state_size(&self) -> usize {
        let n_vocab = self.n_vocab();
        let n_ctx = self.n_ctx();
        let logits_cap = if self.logits_all {
            n_ctx * n_vocab
        } else {
            n_vocab
        };
        let embd_cap = if self.embedding_on { self.n_embd() } else { 0 };
        8 + MAX_RNG_STATE          // rng text, length-prefixed and padded
            + 8 + logits_cap * 4   // logits
            + 8 + embd_cap * 4     // embeddings
            + 8 + 4                // kv buffer size + token count
            + self.kv_self.buf_size
    }

    /// Serialize RNG, logits, embeddings and KV cache.
    pub fn copy_state_data(&self) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::with_capacity(self.state_size());

        // rng
        let rng_state = self.rng.state_string();
        if rng_state.len() > MAX_RNG_STATE {
            return Err(ModelError::InvalidParameter(
                "RNG state exceeds the session block size".to_string(),
            ));
        }
        out.write_u64::<LittleEndian>(rng_state.len() as u64)?;
        out.write_all(rng_state.as_bytes())?;
        out.write_all(&vec![0u8; MAX_RNG_STATE - rng_state.len()])?;

        // logits
        out.write_u64::<LittleEndian>(self.logits.len() as u64)?;
        for &v in &self.logits {
            out.write_f32::<LittleEndian>(v)?;
        }

        // embeddings
        out.write_u64::<LittleEndian>(self.embedding.len() as u64)?;
        for &v in &self.embedding {
            out.write_f32::<LittleEndian>(v)?;
        }

        // kv cache
        let hp = &self.model.hparams;
        let n_embd = hp.n_embd as usize;
        let n_layer = hp.n_layer as usize;
        let n_ctx = hp.n_ctx as usize;
        let elt = self.kv_self.dtype.block_bytes();
        let ntok = self.kv_self.n;

        out.write_u64::<LittleEndian>(self.kv_self.buf_size as u64)?;
        out.write_i32::<LittleEndian>(ntok as i32)?;

        if ntok > 0 {
            let backend = self.model.backend(self.kv_self.backend);
            let mut k_slab = vec![0u8; self.kv_self.k.nbytes()];
            backend.download(&self.kv_self.k, &mut k_slab, 0)?;
            for l in 0..n_layer {
                let start = l * n_ctx * n_embd * elt;
                out.extend_from_slice(&k_slab[start..start + ntok * n_embd * elt]);
            }
            let mut v_slab = vec![0u8; self.kv_self.v.nbytes()];
            backend.download(&self.kv_self.v, &mut v_slab, 0)?;
            for l in 0..n_layer {
                for e in 0..n_embd {
                    let start = (l * n_ctx * n_embd + e * n_ctx) * elt;
                    out.extend_from_slice(&v_slab[start..start + ntok * elt]);
                }
            }
        }

        debug_assert!(out.len() <= self.state_size());
        Ok(out)
    }

    /// Restore state written by [`Context::copy_state_data`]. Returns the
    /// number of bytes consumed.
    pub fn set_state_data(&mut self, src: &[u8]) -> Result<usize> {
        let mut inp = Cursor::new(src);

        // rng
        let rng_size = inp.read_u64::<LittleEndian>()? as usize;
        if rng_size > MAX_RNG_STATE {
            return Err(ModelError::BadFormat(
                "oversized RNG state in session data".to_string(),
            ));
        }
        let mut rng_buf = vec![0u8; MAX_RNG_STATE];
        inp.read_exact(&mut rng_buf)?;
        let rng_text = std::str::from_utf8(&rng_buf[..rng_size])
            .map_err(|_| ModelError::BadFormat("RNG state is not UTF-8".to_string()))?;
        self.rng = Prng::from_state_string(rng_text)
            .ok_or_else(|| ModelError::BadFormat("unrecognized RNG state".to_string()))?;

        // logits
        let n_vocab = self.n_vocab();
        let logits_cap = if self.logits_all {
            self.n_ctx() * n_vocab
        } else {
            n_vocab
        };
        let logits_size = inp.read_u64::<LittleEndian>()? as usize;
        if logits_size > logits_cap {
            return Err(ModelError::BadFormat(format!(
                "session logits ({}) exceed this context's capacity ({})",
                logits_size, logits_cap
            )));
        }
        self.logits.clear();
        for _ in 0..logits_size {
            self.logits.push(inp.read_f32::<LittleEndian>()?);
        }

        // embeddings
        let embd_size = inp.read_u64::<LittleEndian>()? as usize;
        if embd_size > 0 && embd_size != self.n_embd() {
            return Err(ModelError::BadFormat(format!(
                "session embedding width {} does not match n_embd {}",
                embd_size,
                self.n_embd()
            )));
        }
        self.embedding.clear();
        for _ in 0..embd_size {
            self.embedding.push(inp.read_f32::<LittleEndian>()?);
        }

        // kv cache
        let hp = self.model.hparams;
        let n_embd = hp.n_embd as usize;
        let n_layer = hp.n_layer as usize;
        let n_ctx = hp.n_ctx as usize;
        let elt = self.kv_self.dtype.block_bytes();

        let kv_size = inp.read_u64::<LittleEndian>()? as usize;
        if kv_size != self.kv_self.buf_size {
            return Err(ModelError::BadFormat(format!(
                "session KV buffer size {} does not match this context's {}",
                kv_size, self.kv_self.buf_size
            )));
        }
        let ntok = inp.read_i32::<LittleEndian>()?;
        if ntok < 0 || ntok as usize > n_ctx {
            return Err(ModelError::BadFormat(format!(
                "session KV token count {} exceeds n_ctx {}",
                ntok, n_ctx
            )));
        }
        let ntok = ntok as usize;

        if ntok > 0 {
            let backend = self.model.backend(self.kv_self.backend);
            let mut row = vec![0u8; ntok * n_embd * elt];
            for l in 0..n_layer {
                inp.read_exact(&mut row)?;
                backend.upload(&self.kv_self.k, &row, l * n_ctx * n_embd * elt)?;
            }
            let mut col = vec![0u8; ntok * elt];
            for l in 0..n_layer {
                for e in 0..n_embd {
                    inp.read_exact(&mut col)?;
                    backend.upload(
                        &self.kv_self.v,
                        &col,
                        (l * n_ctx * n_embd + e * n_ctx) * elt,
                    )?;
                }
            }
        }
        self.kv_self.n = ntok;

        let nread = inp.position() as usize;
        debug_assert!(nread <= self.state_size());
        Ok(nread)
    }

    /// Persist the prompt tokens and full context state.
    pub fn save_session_file(&self, path: &Path, tokens: &[TokenId]) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_u32::<LittleEndian>(SESSION_MAGIC)?;
        out.write_u32::<LittleEndian>(SESSION_VERSION)?;
        write_hparams(&mut out, &self.model.hparams)?;

        out.write_u32::<LittleEndian>(tokens.len() as u32)?;
        for &t in tokens {
            out.write_i32::<LittleEndian>(t)?;
        }

        let state = self.copy_state_data()?;
        out.write_all(&state)?;
        out.flush()?;
        Ok(())
    }

    /// Restore a session saved against a structurally identical model.
    /// Returns the prompt tokens.
    pub fn load_session_file(&mut self, path: &Path) -> Result<Vec<TokenId>> {
        let mut inp = BufReader::new(File::open(path)?);

        let magic = inp.read_u32::<LittleEndian>()?;
        if magic != SESSION_MAGIC {
            return Err(ModelError::BadFormat(format!(
                "not a session file (magic {:08x})",
                magic
            )));
        }
        let version = inp.read_u32::<LittleEndian>()?;
        if version != SESSION_VERSION {
            return Err(ModelError::UnsupportedFormat(format!(
                "session version {} (expected {})",
                version, SESSION_VERSION
            )));
        }
        let session_hparams = read_hparams(&mut inp)?;
        if session_hparams != self.model.hparams {
            warn!("session hparams do not match the loaded model");
            return Err(ModelError::BadFormat(
                "model hparams do not match the session file".to_string(),
            ));
        }

        let n_tokens = inp.read_u32::<LittleEndian>()? as usize;
        if n_tokens > self.n_ctx() {
            return Err(ModelError::BadFormat(format!(
                "session token count {} exceeds n_ctx {}",
                n_tokens,
                self.n_ctx()
            )));
        }
        let mut tokens = Vec::with_capacity(n_tokens);
        for _ in 0..n_tokens {
            tokens.push(inp.read_i32::<LittleEndian>()?);
        }

        let mut state = Vec::new();
        inp.read_to_end(&mut state)?;
        if state.len() > self.state_size() {
            return Err(ModelError::BadFormat(format!(
                "session state of {} bytes exceeds the maximum {}",
                state.len(),
                self.state_size()
            )));
        }
        self.set_state_data(&state)?;

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hparams::Ftype;
    use crate::test_support::tiny_context;
    use lr_sampler::TokenDataArray;

    #[test]
    fn test_state_roundtrip_restores_logits_and_kv() {
        let (_dir, mut ctx) = tiny_context(Ftype::AllF32, |_| {});
        ctx.eval(&[1, 270, 271], 0, 1).unwrap();
        let logits_before = ctx.logits().to_vec();
        let state = ctx.copy_state_data().unwrap();
        assert!(state.len() <= ctx.state_size());

        // clobber the context, then restore
        ctx.eval(&[272], 3, 1).unwrap();
        let nread = ctx.set_state_data(&state).unwrap();
        assert_eq!(nread, state.len());
        assert_eq!(ctx.kv_cache_token_count(), 3);
        assert_eq!(ctx.logits(), logits_before.as_slice());

        // the restored cache must continue exactly like the original
        ctx.eval(&[272], 3, 1).unwrap();
        let (_dir2, mut fresh) = tiny_context(Ftype::AllF32, |_| {});
        fresh.eval(&[1, 270, 271, 272], 0, 1).unwrap();
        for (a, b) in ctx.logits().iter().zip(fresh.logits()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_session_save_load_save_is_byte_identical() {
        let (dir, mut ctx) = tiny_context(Ftype::AllF32, |_| {});
        let prompt = vec![1, 270, 271];
        ctx.eval(&prompt, 0, 1).unwrap();

        // draw once so the RNG has mid-stream state
        let mut cands = TokenDataArray::from_logits(ctx.logits());
        let _ = ctx.sample_token(&mut cands);

        let p1 = dir.path().join("a.session");
        let p2 = dir.path().join("b.session");
        ctx.save_session_file(&p1, &prompt).unwrap();

        let (_dir2, mut other) = tiny_context(Ftype::AllF32, |_| {});
        let restored = other.load_session_file(&p1).unwrap();
        assert_eq!(restored, prompt);
        other.save_session_file(&p2, &restored).unwrap();

        let a = std::fs::read(&p1).unwrap();
        let b = std::fs::read(&p2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_session_rejects_mismatched_hparams() {
        let (dir, mut ctx) = tiny_context(Ftype::AllF32, |_| {});
        ctx.eval(&[1], 0, 1).unwrap();
        let path = dir.path().join("s.session");
        ctx.save_session_file(&path, &[1]).unwrap();

        // a context with a different n_ctx has different hparams
        let (_dir2, mut other) = tiny_context(Ftype::AllF32, |p| p.n_ctx = 8);
        assert!(matches!(
            other.load_session_file(&path),
            Err(ModelError::BadFormat(_))
        ));
    }

    #[test]
    fn test_session_rejects_bad_magic() {
        let (dir, mut ctx) = tiny_context(Ftype::AllF32, |_| {});
        let path = dir.path().join("junk.session");
        std::fs::write(&path, b"GGSN but not really").unwrap();
        assert!(ctx.load_session_file(&path).is_err());
    }
}
