use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use lr_tensor::DType;

use super::catalog::TensorMeta;
use super::{FILE_MAGIC, FILE_VERSION};
use crate::error::{ModelError, Result};
use crate::hparams::{Ftype, Hparams};
use crate::vocab::Vocab;

/// Writes a model file at the current container version ('ggjt' v3),
/// mirroring [`super::reader::FileReader`]'s record layout.
pub struct FileSaver {
    writer: BufWriter<File>,
}

impl FileSaver {
    /// Create the output file and write the header, hyperparameters (with
    /// `new_ftype` substituted) and vocabulary.
    pub fn create(path: &Path, hparams: &Hparams, new_ftype: Ftype, vocab: &Vocab) -> Result<Self> {
        let file = File::create(path)?;
        let mut saver = FileSaver {
            writer: BufWriter::new(file),
        };
        saver.writer.write_u32::<LittleEndian>(FILE_MAGIC)?;
        saver.writer.write_u32::<LittleEndian>(FILE_VERSION)?;

        saver.writer.write_u32::<LittleEndian>(hparams.n_vocab)?;
        saver.writer.write_u32::<LittleEndian>(hparams.n_embd)?;
        saver.writer.write_u32::<LittleEndian>(hparams.n_mult)?;
        saver.writer.write_u32::<LittleEndian>(hparams.n_head)?;
        saver.writer.write_u32::<LittleEndian>(hparams.n_layer)?;
        saver.writer.write_u32::<LittleEndian>(hparams.n_rot)?;
        saver.writer.write_u32::<LittleEndian>(new_ftype.to_u32())?;

        for tok in &vocab.id_to_token {
            saver.writer.write_u32::<LittleEndian>(tok.text.len() as u32)?;
            saver.writer.write_all(&tok.text)?;
            saver.writer.write_f32::<LittleEndian>(tok.score)?;
        }
        Ok(saver)
    }

    /// Append one tensor record: metadata, 32-byte alignment padding, then
    /// the payload.
    pub fn write_tensor(&mut self, meta: &TensorMeta, dtype: DType, data: &[u8]) -> Result<()> {
        let expected = TensorMeta::calc_size(&meta.name, &meta.ne, dtype)?;
        if data.len() != expected {
            return Err(ModelError::BadFormat(format!(
                "tensor '{}': payload is {} bytes, expected {}",
                meta.name,
                data.len(),
                expected
            )));
        }
        self.writer.write_u32::<LittleEndian>(meta.ne.len() as u32)?;
        self.writer
            .write_u32::<LittleEndian>(meta.name.len() as u32)?;
        self.writer.write_u32::<LittleEndian>(dtype.to_file_type())?;
        for &d in &meta.ne {
            self.writer.write_u32::<LittleEndian>(d as u32)?;
        }
        self.writer.write_all(meta.name.as_bytes())?;

        let pos = self.writer.stream_position()?;
        let pad = pos.wrapping_neg() & 31;
        self.writer.write_all(&vec![0u8; pad as usize])?;

        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
