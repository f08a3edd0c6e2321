use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use lr_tensor::DType;

use super::catalog::{TensorCatalog, TensorMeta};
use super::{FileVersion, FILE_MAGIC_GGJT, FILE_MAGIC_GGML, FILE_MAGIC_GGMF};
use crate::error::{ModelError, Result};
use crate::hparams::{Ftype, Hparams};
use crate::vocab::{TokenScore, Vocab};

/// Sequential reader over a model file.
pub struct FileReader {
    reader: BufReader<File>,
    pub size: u64,
}

impl FileReader {
    pub fn open(path: &Path) -> Result<FileReader> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileReader {
            reader: BufReader::new(file),
            size,
        })
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.reader.stream_position()?)
    }

    /// Detect the container from the magic and (except for legacy 'ggml')
    /// version words.
    pub fn read_magic(&mut self) -> Result<FileVersion> {
        let magic = self.reader.read_u32::<LittleEndian>()?;
        if magic == FILE_MAGIC_GGML {
            return Ok(FileVersion::Ggml);
        }
        let version = self.reader.read_u32::<LittleEndian>()?;
        match (magic, version) {
            (FILE_MAGIC_GGMF, 1) => Ok(FileVersion::GgmfV1),
            (FILE_MAGIC_GGJT, 1) => Ok(FileVersion::GgjtV1),
            (FILE_MAGIC_GGJT, 2) => Ok(FileVersion::GgjtV2),
            (FILE_MAGIC_GGJT, 3) => Ok(FileVersion::GgjtV3),
            _ => Err(ModelError::BadFormat(format!(
                "unknown (magic, version) combination: {:08x}, {:08x}",
                magic, version
            ))),
        }
    }

    /// Read the 7 x u32 hyperparameter record.
    pub fn read_hparams(&mut self) -> Result<Hparams> {
        let n_vocab = self.reader.read_u32::<LittleEndian>()?;
        let n_embd = self.reader.read_u32::<LittleEndian>()?;
        let n_mult = self.reader.read_u32::<LittleEndian>()?;
        let n_head = self.reader.read_u32::<LittleEndian>()?;
        let n_layer = self.reader.read_u32::<LittleEndian>()?;
        let n_rot = self.reader.read_u32::<LittleEndian>()?;
        let ftype = Ftype::from_u32(self.reader.read_u32::<LittleEndian>()?)?;
        Ok(Hparams {
            n_vocab,
            n_embd,
            n_mult,
            n_head,
            n_layer,
            n_rot,
            ftype,
            ..Hparams::default()
        })
    }

    /// Read `n_vocab` (length, bytes, score) records. Legacy 'ggml' files
    /// carry no scores; those default to 0.
    pub fn read_vocab(&mut self, version: FileVersion, n_vocab: u32) -> Result<Vocab> {
        let mut entries = Vec::with_capacity(n_vocab as usize);
        for _ in 0..n_vocab {
            let len = self.reader.read_u32::<LittleEndian>()? as usize;
            let mut text = vec![0u8; len];
            self.reader.read_exact(&mut text)?;
            let score = if version.has_vocab_scores() {
                self.reader.read_f32::<LittleEndian>()?
            } else {
                0.0
            };
            entries.push(TokenScore { text, score });
        }
        Ok(Vocab::new(entries))
    }

    /// Walk tensor metadata records until end of file, recording aligned
    /// payload offsets and seeking past the data.
    pub fn read_tensor_metadata(
        &mut self,
        version: FileVersion,
        catalog: &mut TensorCatalog,
    ) -> Result<()> {
        while self.tell()? < self.size {
            let n_dims = self.reader.read_u32::<LittleEndian>()?;
            let name_len = self.reader.read_u32::<LittleEndian>()?;
            let dtype_id = self.reader.read_u32::<LittleEndian>()?;

            let mut ne = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                ne.push(self.reader.read_u32::<LittleEndian>()? as usize);
            }
            let mut name_bytes = vec![0u8; name_len as usize];
            self.reader.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| ModelError::BadFormat("tensor name is not UTF-8".to_string()))?;

            if !(1..=2).contains(&n_dims) {
                return Err(ModelError::BadFormat(format!(
                    "tensor '{}' should not be {}-dimensional",
                    name, n_dims
                )));
            }
            let dtype = match DType::from_file_type(dtype_id) {
                Some(d) if d != DType::I32 => d,
                _ => {
                    return Err(ModelError::BadFormat(format!(
                        "tensor '{}' has unrecognized type {}",
                        name, dtype_id
                    )));
                }
            };

            if version.aligned_tensor_data() {
                let pos = self.tell()?;
                let pad = pos.wrapping_neg() & 31;
                self.reader.seek(SeekFrom::Current(pad as i64))?;
            }

            let file_off = self.tell()?;
            let size = TensorMeta::calc_size(&name, &ne, dtype)?;
            self.reader.seek(SeekFrom::Current(size as i64))?;

            catalog.push(TensorMeta {
                name,
                dtype,
                ne,
                file_off,
                size,
            })?;
        }
        Ok(())
    }

    /// Read one tensor's raw payload (non-mmap path).
    pub fn read_tensor_data(&mut self, meta: &TensorMeta) -> Result<Vec<u8>> {
        let mut data = vec![0u8; meta.size];
        self.read_tensor_into(meta, &mut data)?;
        Ok(data)
    }

    /// Read one tensor's raw payload into a caller-provided bounce buffer.
    pub fn read_tensor_into(&mut self, meta: &TensorMeta, out: &mut [u8]) -> Result<()> {
        self.reader.seek(SeekFrom::Start(meta.file_off))?;
        self.reader.read_exact(out)?;
        Ok(())
    }

    /// The underlying file, for memory mapping.
    pub fn file(&self) -> &File {
        self.reader.get_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{tiny_hparams, write_tiny_model};
    use tempfile::tempdir;

    #[test]
    fn test_read_back_written_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        write_tiny_model(&path, Ftype::AllF32);

        let mut r = FileReader::open(&path).unwrap();
        let version = r.read_magic().unwrap();
        assert_eq!(version, FileVersion::GgjtV3);

        let hp = r.read_hparams().unwrap();
        let want = tiny_hparams();
        assert_eq!(hp.n_vocab, want.n_vocab);
        assert_eq!(hp.n_embd, want.n_embd);
        assert_eq!(hp.n_layer, want.n_layer);
        assert_eq!(hp.ftype, Ftype::AllF32);

        let vocab = r.read_vocab(version, hp.n_vocab).unwrap();
        assert_eq!(vocab.n_vocab(), hp.n_vocab as usize);

        let mut catalog = TensorCatalog::new();
        r.read_tensor_metadata(version, &mut catalog).unwrap();
        // 3 global tensors + 9 per layer
        assert_eq!(catalog.len(), 3 + 9 * hp.n_layer as usize);
        for t in &catalog.tensors {
            assert_eq!(t.file_off % 32, 0, "tensor '{}' payload unaligned", t.name);
            assert_eq!(
                t.size,
                TensorMeta::calc_size(&t.name, &t.ne, t.dtype).unwrap()
            );
        }
        let emb = catalog.get("tok_embeddings.weight").unwrap();
        assert_eq!(emb.ne, vec![hp.n_embd as usize, hp.n_vocab as usize]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"not a model file").unwrap();
        let mut r = FileReader::open(&path).unwrap();
        assert!(matches!(r.read_magic(), Err(ModelError::BadFormat(_))));
    }
}
