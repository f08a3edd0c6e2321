use crate::error::{ModelError, Result};

/// File-level tag describing the dominant weight encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ftype {
    AllF32,
    MostlyF16,
    MostlyQ4_0,
    MostlyQ4_1,
    MostlyQ4_1SomeF16,
    MostlyQ8_0,
    MostlyQ5_0,
    MostlyQ5_1,
    MostlyQ2K,
    MostlyQ3KS,
    MostlyQ3KM,
    MostlyQ3KL,
    MostlyQ4KS,
    MostlyQ4KM,
    MostlyQ5KS,
    MostlyQ5KM,
    MostlyQ6K,
}

impl Ftype {
    pub fn from_u32(v: u32) -> Result<Ftype> {
        Ok(match v {
            0 => Ftype::AllF32,
            1 => Ftype::MostlyF16,
            2 => Ftype::MostlyQ4_0,
            3 => Ftype::MostlyQ4_1,
            4 => Ftype::MostlyQ4_1SomeF16,
            7 => Ftype::MostlyQ8_0,
            8 => Ftype::MostlyQ5_0,
            9 => Ftype::MostlyQ5_1,
            10 => Ftype::MostlyQ2K,
            11 => Ftype::MostlyQ3KS,
            12 => Ftype::MostlyQ3KM,
            13 => Ftype::MostlyQ3KL,
            14 => Ftype::MostlyQ4KS,
            15 => Ftype::MostlyQ4KM,
            16 => Ftype::MostlyQ5KS,
            17 => Ftype::MostlyQ5KM,
            18 => Ftype::MostlyQ6K,
            other => {
                return Err(ModelError::BadFormat(format!(
                    "unknown file type tag {}",
                    other
                )));
            }
        })
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Ftype::AllF32 => 0,
            Ftype::MostlyF16 => 1,
            Ftype::MostlyQ4_0 => 2,
            Ftype::MostlyQ4_1 => 3,
            Ftype::MostlyQ4_1SomeF16 => 4,
            Ftype::MostlyQ8_0 => 7,
            Ftype::MostlyQ5_0 => 8,
            Ftype::MostlyQ5_1 => 9,
            Ftype::MostlyQ2K => 10,
            Ftype::MostlyQ3KS => 11,
            Ftype::MostlyQ3KM => 12,
            Ftype::MostlyQ3KL => 13,
            Ftype::MostlyQ4KS => 14,
            Ftype::MostlyQ4KM => 15,
            Ftype::MostlyQ5KS => 16,
            Ftype::MostlyQ5KM => 17,
            Ftype::MostlyQ6K => 18,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Ftype::AllF32 => "all F32",
            Ftype::MostlyF16 => "mostly F16",
            Ftype::MostlyQ4_0 => "mostly Q4_0",
            Ftype::MostlyQ4_1 => "mostly Q4_1",
            Ftype::MostlyQ4_1SomeF16 => "mostly Q4_1, some F16",
            Ftype::MostlyQ8_0 => "mostly Q8_0",
            Ftype::MostlyQ5_0 => "mostly Q5_0",
            Ftype::MostlyQ5_1 => "mostly Q5_1",
            Ftype::MostlyQ2K => "mostly Q2_K",
            Ftype::MostlyQ3KS => "mostly Q3_K - Small",
            Ftype::MostlyQ3KM => "mostly Q3_K - Medium",
            Ftype::MostlyQ3KL => "mostly Q3_K - Large",
            Ftype::MostlyQ4KS => "mostly Q4_K - Small",
            Ftype::MostlyQ4KM => "mostly Q4_K - Medium",
            Ftype::MostlyQ5KS => "mostly Q5_K - Small",
            Ftype::MostlyQ5KM => "mostly Q5_K - Medium",
            Ftype::MostlyQ6K => "mostly Q6_K",
        }
    }
}

/// Model hyperparameters; immutable after load.
///
/// `n_ctx`, `rope_freq_base` and `rope_freq_scale` are caller inputs patched
/// in at load time; the rest comes from the model file. Equality is byte
/// equality, which is what session files require.
#[derive(Debug, Clone, Copy)]
pub struct Hparams {
    pub n_vocab: u32,
    pub n_ctx: u32,
    pub n_embd: u32,
    pub n_mult: u32,
    pub n_head: u32,
    pub n_layer: u32,
    pub n_rot: u32,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub ftype: Ftype,
}

impl Default for Hparams {
    fn default() -> Self {
        Hparams {
            n_vocab: 32000,
            n_ctx: 512,
            n_embd: 4096,
            n_mult: 256,
            n_head: 32,
            n_layer: 32,
            n_rot: 64,
            rope_freq_base: 10000.0,
            rope_freq_scale: 1.0,
            ftype: Ftype::MostlyF16,
        }
    }
}

impl PartialEq for Hparams {
    fn eq(&self, other: &Self) -> bool {
        self.n_vocab == other.n_vocab
            && self.n_ctx == other.n_ctx
            && self.n_embd == other.n_embd
            && self.n_mult == other.n_mult
            && self.n_head == other.n_head
            && self.n_layer == other.n_layer
            && self.n_rot == other.n_rot
            && self.rope_freq_base.to_bits() == other.rope_freq_base.to_bits()
            && self.rope_freq_scale.to_bits() == other.rope_freq_scale.to_bits()
            && self.ftype == other.ftype
    }
}

impl Eq for Hparams {}

impl Hparams {
    /// Feed-forward width derived from `n_embd` and `n_mult`.
    pub fn n_ff(&self) -> u32 {
        ((2 * (4 * self.n_embd) / 3 + self.n_mult - 1) / self.n_mult) * self.n_mult
    }

    /// Head dimension; also the rotary dimension of the forward graph.
    pub fn head_dim(&self) -> u32 {
        self.n_embd / self.n_head
    }
}

const MIB: usize = 1024 * 1024;

/// Model size class derived from the layer count. Informational: it selects
/// the preset rows of the memory-requirement report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    M3B,
    M7B,
    M13B,
    M30B,
    M65B,
}

impl ModelSize {
    pub fn from_n_layer(n_layer: u32) -> ModelSize {
        match n_layer {
            26 => ModelSize::M3B,
            32 => ModelSize::M7B,
            40 => ModelSize::M13B,
            60 => ModelSize::M30B,
            80 => ModelSize::M65B,
            n if n < 32 => ModelSize::M7B,
            _ => ModelSize::M7B,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelSize::M3B => "3B",
            ModelSize::M7B => "7B",
            ModelSize::M13B => "13B",
            ModelSize::M30B => "30B",
            ModelSize::M65B => "65B",
        }
    }

    /// KV-cache memory of one inference state, tuned for n_ctx = 2048.
    pub fn mem_req_kv_self(self) -> usize {
        match self {
            ModelSize::M3B => 682 * MIB,
            ModelSize::M7B => 1026 * MIB,
            ModelSize::M13B => 1608 * MIB,
            ModelSize::M30B => 3124 * MIB,
            ModelSize::M65B => 5120 * MIB,
        }
    }

    /// Scratch memory of one eval, tuned for n_ctx = 2048.
    pub fn mem_req_eval(self) -> usize {
        match self {
            ModelSize::M3B => 512 * MIB,
            ModelSize::M7B => 2048 * MIB,
            ModelSize::M13B => 1024 * MIB,
            ModelSize::M30B => 1280 * MIB,
            ModelSize::M65B => 1536 * MIB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_from_layers() {
        assert_eq!(ModelSize::from_n_layer(26), ModelSize::M3B);
        assert_eq!(ModelSize::from_n_layer(32), ModelSize::M7B);
        assert_eq!(ModelSize::from_n_layer(40), ModelSize::M13B);
        assert_eq!(ModelSize::from_n_layer(60), ModelSize::M30B);
        assert_eq!(ModelSize::from_n_layer(80), ModelSize::M65B);
        // anything below 32 layers falls back to the 7B presets
        assert_eq!(ModelSize::from_n_layer(2), ModelSize::M7B);
    }

    #[test]
    fn test_n_ff() {
        let h = Hparams::default();
        assert_eq!(h.n_ff(), 11008);
        let tiny = Hparams {
            n_embd: 32,
            n_mult: 32,
            ..Hparams::default()
        };
        assert_eq!(tiny.n_ff(), 96);
    }

    #[test]
    fn test_hparams_equality_is_bitwise() {
        let a = Hparams::default();
        let mut b = a;
        assert_eq!(a, b);
        b.rope_freq_scale = 1.0 + f32::EPSILON;
        assert_ne!(a, b);
    }

    #[test]
    fn test_ftype_roundtrip() {
        for v in [0, 1, 2, 3, 4, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18] {
            assert_eq!(Ftype::from_u32(v).unwrap().to_u32(), v);
        }
        assert!(Ftype::from_u32(5).is_err());
        assert!(Ftype::from_u32(99).is_err());
    }
}
