//! The on-disk model container: a stream of little-endian records with a
//! magic/version header, hyperparameters, scored vocabulary and 32-byte
//! aligned tensor payloads.

pub mod catalog;
pub mod reader;
pub mod writer;

pub use catalog::{TensorCatalog, TensorMeta};
pub use reader::FileReader;
pub use writer::FileSaver;

/// Legacy container without scores or alignment.
pub const FILE_MAGIC_GGML: u32 = 0x6767_6d6c; // 'ggml'
/// Versioned container that added vocabulary scores.
pub const FILE_MAGIC_GGMF: u32 = 0x6767_6d66; // 'ggmf'
/// Versioned container with 32-byte aligned tensor data.
pub const FILE_MAGIC_GGJT: u32 = 0x6767_6a74; // 'ggjt'

/// Magic and version written by [`writer::FileSaver`].
pub const FILE_MAGIC: u32 = FILE_MAGIC_GGJT;
pub const FILE_VERSION: u32 = 3;

/// Decoded (magic, version) combinations, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileVersion {
    /// 'ggml': no scores, no alignment.
    Ggml,
    /// 'ggmf' v1: adds vocabulary scores.
    GgmfV1,
    /// 'ggjt' v1: adds 32-byte tensor alignment (and mmap support).
    GgjtV1,
    /// 'ggjt' v2: changed the Q4/Q8 block layouts.
    GgjtV2,
    /// 'ggjt' v3: changed the Q4/Q8 block layouts again; current.
    GgjtV3,
}

impl FileVersion {
    pub fn name(&self) -> &'static str {
        match self {
            FileVersion::Ggml => "'ggml' (old version with no scores and no mmap support)",
            FileVersion::GgmfV1 => "'ggmf' v1 (old version with no mmap support)",
            FileVersion::GgjtV1 => "'ggjt' v1 (deprecated quantization layout)",
            FileVersion::GgjtV2 => "'ggjt' v2 (deprecated quantization layout)",
            FileVersion::GgjtV3 => "'ggjt' v3 (latest)",
        }
    }

    /// Whether tensor payloads are aligned to 32 bytes.
    pub fn aligned_tensor_data(&self) -> bool {
        *self >= FileVersion::GgjtV1
    }

    /// Whether vocabulary records carry a score field.
    pub fn has_vocab_scores(&self) -> bool {
        *self >= FileVersion::GgmfV1
    }
}
