use std::fmt;

/// Number of elements in a K-quant super-block.
pub const QK_K: usize = 256;

/// Supported data types for tensor storage.
///
/// The quantized variants are block formats: a block of `block_size()`
/// elements is stored in `block_bytes()` bytes, scales included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point (IEEE 754 half-precision, via the `half` crate).
    F16,
    /// 4-bit quantization, absmax scale (18 bytes per 32 elements).
    Q4_0,
    /// 4-bit quantization, min/scale pair (20 bytes per 32 elements).
    Q4_1,
    /// 5-bit quantization, absmax scale (22 bytes per 32 elements).
    Q5_0,
    /// 5-bit quantization, min/scale pair (24 bytes per 32 elements).
    Q5_1,
    /// 8-bit quantization, absmax scale (34 bytes per 32 elements).
    Q8_0,
    /// 2-bit K-quant (84 bytes per 256 elements).
    Q2K,
    /// 3-bit K-quant (110 bytes per 256 elements).
    Q3K,
    /// 4-bit K-quant (144 bytes per 256 elements).
    Q4K,
    /// 5-bit K-quant (176 bytes per 256 elements).
    Q5K,
    /// 6-bit K-quant (210 bytes per 256 elements).
    Q6K,
    /// 32-bit signed integer (token ids; never stored in model files).
    I32,
}

impl DType {
    /// Number of elements covered by one storage block.
    pub fn block_size(&self) -> usize {
        match self {
            DType::F32 | DType::F16 | DType::I32 => 1,
            DType::Q4_0 | DType::Q4_1 | DType::Q5_0 | DType::Q5_1 | DType::Q8_0 => 32,
            DType::Q2K | DType::Q3K | DType::Q4K | DType::Q5K | DType::Q6K => QK_K,
        }
    }

    /// Size in bytes of one storage block.
    pub fn block_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::Q4_0 => 18, // f16 scale + 16 bytes of nibbles
            DType::Q4_1 => 20, // f16 scale + f16 min + 16 bytes of nibbles
            DType::Q5_0 => 22, // f16 scale + u32 high bits + 16 bytes of nibbles
            DType::Q5_1 => 24, // f16 scale + f16 min + u32 high bits + 16 bytes
            DType::Q8_0 => 34, // f16 scale + 32 signed bytes
            DType::Q2K => 84,  // 16 scale/min bytes + 64 quant bytes + 2 f16
            DType::Q3K => 110, // 32 hmask + 64 quant + 12 scale bytes + f16
            DType::Q4K => 144, // 2 f16 + 12 scale bytes + 128 quant bytes
            DType::Q5K => 176, // 2 f16 + 12 scale bytes + 32 high bits + 128
            DType::Q6K => 210, // 128 ql + 64 qh + 16 scales + f16
        }
    }

    /// Converts a file-format type id to a `DType`.
    ///
    /// The ids follow the ggml type enumeration used on disk.
    pub fn from_file_type(id: u32) -> Option<DType> {
        match id {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            2 => Some(DType::Q4_0),
            3 => Some(DType::Q4_1),
            6 => Some(DType::Q5_0),
            7 => Some(DType::Q5_1),
            8 => Some(DType::Q8_0),
            10 => Some(DType::Q2K),
            11 => Some(DType::Q3K),
            12 => Some(DType::Q4K),
            13 => Some(DType::Q5K),
            14 => Some(DType::Q6K),
            18 => Some(DType::I32),
            _ => None,
        }
    }

    /// Returns the file-format type id for this `DType`.
    pub fn to_file_type(&self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::Q4_0 => 2,
            DType::Q4_1 => 3,
            DType::Q5_0 => 6,
            DType::Q5_1 => 7,
            DType::Q8_0 => 8,
            DType::Q2K => 10,
            DType::Q3K => 11,
            DType::Q4K => 12,
            DType::Q5K => 13,
            DType::Q6K => 14,
            DType::I32 => 18,
        }
    }

    /// Returns true if this dtype is a block-quantized format.
    pub fn is_quantized(&self) -> bool {
        self.block_size() > 1
    }

    /// Storage size in bytes of a row of `n` elements.
    ///
    /// `n` must be a multiple of `block_size()`.
    pub fn row_bytes(&self, n: usize) -> usize {
        debug_assert_eq!(n % self.block_size(), 0);
        n / self.block_size() * self.block_bytes()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::Q4_0 => "q4_0",
            DType::Q4_1 => "q4_1",
            DType::Q5_0 => "q5_0",
            DType::Q5_1 => "q5_1",
            DType::Q8_0 => "q8_0",
            DType::Q2K => "q2_k",
            DType::Q3K => "q3_k",
            DType::Q4K => "q4_k",
            DType::Q5K => "q5_k",
            DType::Q6K => "q6_k",
            DType::I32 => "i32",
        };
        write!(f, "{}", name)
    }
}

/// All dtypes that may appear in a model file.
pub const FILE_DTYPES: [DType; 12] = [
    DType::F32,
    DType::F16,
    DType::Q4_0,
    DType::Q4_1,
    DType::Q5_0,
    DType::Q5_1,
    DType::Q8_0,
    DType::Q2K,
    DType::Q3K,
    DType::Q4K,
    DType::Q5K,
    DType::Q6K,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_sizes() {
        assert_eq!(DType::F32.block_size(), 1);
        assert_eq!(DType::Q4_0.block_size(), 32);
        assert_eq!(DType::Q6K.block_size(), 256);
    }

    #[test]
    fn test_row_bytes() {
        assert_eq!(DType::F32.row_bytes(10), 40);
        assert_eq!(DType::F16.row_bytes(10), 20);
        assert_eq!(DType::Q4_0.row_bytes(64), 36);
        assert_eq!(DType::Q8_0.row_bytes(32), 34);
        assert_eq!(DType::Q4K.row_bytes(512), 288);
    }

    #[test]
    fn test_file_type_roundtrip() {
        for dtype in FILE_DTYPES {
            let id = dtype.to_file_type();
            assert_eq!(DType::from_file_type(id), Some(dtype));
        }
    }

    #[test]
    fn test_file_type_unknown() {
        assert!(DType::from_file_type(999).is_none());
        // ids 4 and 5 were retired from the on-disk enumeration
        assert!(DType::from_file_type(4).is_none());
        assert!(DType::from_file_type(5).is_none());
    }
}
