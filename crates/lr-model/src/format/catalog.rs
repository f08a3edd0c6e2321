use std::collections::HashMap;

use lr_tensor::DType;

use crate::error::{ModelError, Result};

/// Descriptor of one tensor in a model file.
///
/// `ne` follows the on-disk convention: `ne[0]` is the row length (the
/// fastest-varying dimension), `ne[1]` the row count.
#[derive(Debug, Clone)]
pub struct TensorMeta {
    pub name: String,
    pub dtype: DType,
    pub ne: Vec<usize>,
    pub file_off: u64,
    pub size: usize,
}

impl TensorMeta {
    pub fn numel(&self) -> usize {
        self.ne.iter().product()
    }

    /// Bytes of storage for `ne` elements of `dtype`; the block size must
    /// divide the row length.
    pub fn calc_size(name: &str, ne: &[usize], dtype: DType) -> Result<usize> {
        let bs = dtype.block_size();
        if ne[0] % bs != 0 {
            return Err(ModelError::BadFormat(format!(
                "tensor '{}': row length {} not divisible by {} block size {}",
                name, ne[0], dtype, bs
            )));
        }
        Ok(dtype.row_bytes(ne.iter().product()))
    }
}

/// File-ordered tensor descriptors with a name index.
///
/// File order is preserved because the loader streams tensor data in that
/// order for locality.
#[derive(Debug, Default)]
pub struct TensorCatalog {
    pub tensors: Vec<TensorMeta>,
    name_to_idx: HashMap<String, usize>,
}

impl TensorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, meta: TensorMeta) -> Result<()> {
        if self.name_to_idx.contains_key(&meta.name) {
            return Err(ModelError::BadFormat(format!(
                "duplicate tensor '{}'",
                meta.name
            )));
        }
        self.name_to_idx.insert(meta.name.clone(), self.tensors.len());
        self.tensors.push(meta);
        Ok(())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_idx.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&TensorMeta> {
        self.index_of(name).map(|i| &self.tensors[i])
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_size() {
        assert_eq!(
            TensorMeta::calc_size("t", &[32, 2], DType::F32).unwrap(),
            256
        );
        assert_eq!(
            TensorMeta::calc_size("t", &[64, 1], DType::Q4_0).unwrap(),
            36
        );
        // 33 elements cannot fill Q4_0 blocks of 32
        assert!(TensorMeta::calc_size("t", &[33, 1], DType::Q4_0).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut c = TensorCatalog::new();
        let meta = TensorMeta {
            name: "w".to_string(),
            dtype: DType::F32,
            ne: vec![4],
            file_off: 0,
            size: 16,
        };
        c.push(meta.clone()).unwrap();
        assert!(c.push(meta).is_err());
        assert_eq!(c.len(), 1);
        assert!(c.get("w").is_some());
    }
}
