//! Block quantization codecs, keyed by [`DType`].
//!
//! Every quantized dtype stores a fixed number of elements per block
//! (32 for the Q4/Q5/Q8 formats, 256 for the K-quants) together with one or
//! two half-precision scales. `quantize_chunk` and `dequantize_row` are the
//! registry entry points; both dispatch on dtype and reject non-quantizable
//! types.

use half::f16;

use crate::dtype::{DType, QK_K};
use crate::error::{Result, TensorError};

/// Number of bins in the quantization histogram.
pub const HIST_BINS: usize = 16;

const QK: usize = 32;

/// Quantize `src` into `dst`, accumulating a histogram of the emitted
/// quantized values folded into 16 bins.
///
/// `src.len()` must be a multiple of the dtype's block size and `dst` must
/// have room for the encoded blocks. Returns the number of bytes written.
pub fn quantize_chunk(
    dtype: DType,
    src: &[f32],
    dst: &mut [u8],
    hist: &mut [i64; HIST_BINS],
) -> Result<usize> {
    let bs = dtype.block_size();
    if src.len() % bs != 0 {
        return Err(TensorError::Other(format!(
            "quantize: {} elements do not fill {} blocks of {}",
            src.len(),
            dtype,
            bs
        )));
    }
    let n_blocks = src.len() / bs;
    let out_bytes = n_blocks * dtype.block_bytes();
    if dst.len() < out_bytes {
        return Err(TensorError::Other(format!(
            "quantize: output buffer too small ({} < {})",
            dst.len(),
            out_bytes
        )));
    }
    for b in 0..n_blocks {
        let x = &src[b * bs..(b + 1) * bs];
        let y = &mut dst[b * dtype.block_bytes()..(b + 1) * dtype.block_bytes()];
        match dtype {
            DType::F32 => {
                for (i, &v) in x.iter().enumerate() {
                    y[4 * i..4 * i + 4].copy_from_slice(&v.to_le_bytes());
                }
            }
            DType::F16 => {
                for (i, &v) in x.iter().enumerate() {
                    y[2 * i..2 * i + 2].copy_from_slice(&f16::from_f32(v).to_le_bytes());
                }
            }
            DType::Q4_0 => encode_q4_0(x, y, hist),
            DType::Q4_1 => encode_q4_1(x, y, hist),
            DType::Q5_0 => encode_q5_0(x, y, hist),
            DType::Q5_1 => encode_q5_1(x, y, hist),
            DType::Q8_0 => encode_q8_0(x, y, hist),
            DType::Q2K => encode_q2_k(x, y, hist),
            DType::Q3K => encode_q3_k(x, y, hist),
            DType::Q4K => encode_q4_k(x, y, hist),
            DType::Q5K => encode_q5_k(x, y, hist),
            DType::Q6K => encode_q6_k(x, y, hist),
            DType::I32 => {
                return Err(TensorError::UnsupportedDType(
                    "cannot quantize to i32".to_string(),
                ));
            }
        }
    }
    Ok(out_bytes)
}

/// Decode `dst.len()` elements from `src` into f32.
///
/// `dst.len()` must be a multiple of the dtype's block size.
pub fn dequantize_row(dtype: DType, src: &[u8], dst: &mut [f32]) -> Result<()> {
    let bs = dtype.block_size();
    if dst.len() % bs != 0 {
        return Err(TensorError::Other(format!(
            "dequantize: {} elements do not fill {} blocks of {}",
            dst.len(),
            dtype,
            bs
        )));
    }
    let n_blocks = dst.len() / bs;
    let in_bytes = n_blocks * dtype.block_bytes();
    if src.len() < in_bytes {
        return Err(TensorError::Other(format!(
            "dequantize: input buffer too small ({} < {})",
            src.len(),
            in_bytes
        )));
    }
    for b in 0..n_blocks {
        let x = &src[b * dtype.block_bytes()..(b + 1) * dtype.block_bytes()];
        let y = &mut dst[b * bs..(b + 1) * bs];
        match dtype {
            DType::F32 => {
                for (i, v) in y.iter_mut().enumerate() {
                    *v = f32::from_le_bytes(x[4 * i..4 * i + 4].try_into().unwrap());
                }
            }
            DType::F16 => {
                for (i, v) in y.iter_mut().enumerate() {
                    *v = f16::from_le_bytes(x[2 * i..2 * i + 2].try_into().unwrap()).to_f32();
                }
            }
            DType::Q4_0 => decode_q4_0(x, y),
            DType::Q4_1 => decode_q4_1(x, y),
            DType::Q5_0 => decode_q5_0(x, y),
            DType::Q5_1 => decode_q5_1(x, y),
            DType::Q8_0 => decode_q8_0(x, y),
            DType::Q2K => decode_q2_k(x, y),
            DType::Q3K => decode_q3_k(x, y),
            DType::Q4K => decode_q4_k(x, y),
            DType::Q5K => decode_q5_k(x, y),
            DType::Q6K => decode_q6_k(x, y),
            DType::I32 => {
                return Err(TensorError::UnsupportedDType(
                    "cannot dequantize i32".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn put_f16(dst: &mut [u8], v: f32) {
    dst[..2].copy_from_slice(&f16::from_f32(v).to_le_bytes());
}

fn get_f16(src: &[u8]) -> f32 {
    f16::from_le_bytes(src[..2].try_into().unwrap()).to_f32()
}

// Q4_0: f16 scale, then 16 bytes packing elements j (low nibble) and
// j + 16 (high nibble). Values are stored biased by 8.

fn encode_q4_0(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in x {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }
    let d = max / -8.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };
    put_f16(y, d);
    for j in 0..QK / 2 {
        let q0 = ((x[j] * id + 8.5) as i32).clamp(0, 15) as u8;
        let q1 = ((x[j + QK / 2] * id + 8.5) as i32).clamp(0, 15) as u8;
        y[2 + j] = q0 | (q1 << 4);
        hist[q0 as usize] += 1;
        hist[q1 as usize] += 1;
    }
}

fn decode_q4_0(x: &[u8], y: &mut [f32]) {
    let d = get_f16(x);
    for j in 0..QK / 2 {
        let b = x[2 + j];
        y[j] = ((b & 0x0F) as i32 - 8) as f32 * d;
        y[j + QK / 2] = ((b >> 4) as i32 - 8) as f32 * d;
    }
}

// Q4_1: f16 scale + f16 min, unsigned 4-bit offsets from the minimum.

fn encode_q4_1(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let min = x.iter().copied().fold(f32::INFINITY, f32::min);
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let d = (max - min) / 15.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };
    put_f16(y, d);
    put_f16(&mut y[2..], min);
    for j in 0..QK / 2 {
        let q0 = (((x[j] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
        let q1 = (((x[j + QK / 2] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
        y[4 + j] = q0 | (q1 << 4);
        hist[q0 as usize] += 1;
        hist[q1 as usize] += 1;
    }
}

fn decode_q4_1(x: &[u8], y: &mut [f32]) {
    let d = get_f16(x);
    let min = get_f16(&x[2..]);
    for j in 0..QK / 2 {
        let b = x[4 + j];
        y[j] = (b & 0x0F) as f32 * d + min;
        y[j + QK / 2] = (b >> 4) as f32 * d + min;
    }
}

// Q5_0: f16 scale, u32 of fifth bits, 16 nibble bytes. Bias 16.

fn encode_q5_0(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in x {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }
    let d = max / -16.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };
    put_f16(y, d);
    let mut qh = 0u32;
    for j in 0..QK / 2 {
        let q0 = ((x[j] * id + 16.5) as i32).clamp(0, 31) as u8;
        let q1 = ((x[j + QK / 2] * id + 16.5) as i32).clamp(0, 31) as u8;
        y[6 + j] = (q0 & 0x0F) | ((q1 & 0x0F) << 4);
        qh |= ((q0 as u32) >> 4) << j;
        qh |= ((q1 as u32) >> 4) << (j + QK / 2);
        hist[(q0 >> 1) as usize] += 1;
        hist[(q1 >> 1) as usize] += 1;
    }
    y[2..6].copy_from_slice(&qh.to_le_bytes());
}

fn decode_q5_0(x: &[u8], y: &mut [f32]) {
    let d = get_f16(x);
    let qh = u32::from_le_bytes(x[2..6].try_into().unwrap());
    for j in 0..QK / 2 {
        let b = x[6 + j];
        let q0 = (b & 0x0F) as u32 | (((qh >> j) & 1) << 4);
        let q1 = (b >> 4) as u32 | (((qh >> (j + QK / 2)) & 1) << 4);
        y[j] = (q0 as i32 - 16) as f32 * d;
        y[j + QK / 2] = (q1 as i32 - 16) as f32 * d;
    }
}

// Q5_1: f16 scale + f16 min + u32 of fifth bits.

fn encode_q5_1(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let min = x.iter().copied().fold(f32::INFINITY, f32::min);
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let d = (max - min) / 31.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };
    put_f16(y, d);
    put_f16(&mut y[2..], min);
    let mut qh = 0u32;
    for j in 0..QK / 2 {
        let q0 = (((x[j] - min) * id + 0.5) as i32).clamp(0, 31) as u8;
        let q1 = (((x[j + QK / 2] - min) * id + 0.5) as i32).clamp(0, 31) as u8;
        y[8 + j] = (q0 & 0x0F) | ((q1 & 0x0F) << 4);
        qh |= ((q0 as u32) >> 4) << j;
        qh |= ((q1 as u32) >> 4) << (j + QK / 2);
        hist[(q0 >> 1) as usize] += 1;
        hist[(q1 >> 1) as usize] += 1;
    }
    y[4..8].copy_from_slice(&qh.to_le_bytes());
}

fn decode_q5_1(x: &[u8], y: &mut [f32]) {
    let d = get_f16(x);
    let min = get_f16(&x[2..]);
    let qh = u32::from_le_bytes(x[4..8].try_into().unwrap());
    for j in 0..QK / 2 {
        let b = x[8 + j];
        let q0 = (b & 0x0F) as u32 | (((qh >> j) & 1) << 4);
        let q1 = (b >> 4) as u32 | (((qh >> (j + QK / 2)) & 1) << 4);
        y[j] = q0 as f32 * d + min;
        y[j + QK / 2] = q1 as f32 * d + min;
    }
}

// Q8_0: f16 scale + 32 signed bytes.

fn encode_q8_0(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let amax = x.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let d = amax / 127.0;
    let id = if d != 0.0 { 1.0 / d } else { 0.0 };
    put_f16(y, d);
    for j in 0..QK {
        let q = (x[j] * id).round() as i32;
        y[2 + j] = q as i8 as u8;
        hist[((q + 128) >> 4) as usize] += 1;
    }
}

fn decode_q8_0(x: &[u8], y: &mut [f32]) {
    let d = get_f16(x);
    for j in 0..QK {
        y[j] = (x[2 + j] as i8) as f32 * d;
    }
}

// K-quant helpers: per-sub-block scale/min search.
//
// `scale_min` maps a sub-block to the (scale, min) pair such that
// x ~= scale * q - min with q unsigned and min >= 0.

fn scale_min(x: &[f32], levels: f32) -> (f32, f32) {
    let mut mn = x.iter().copied().fold(f32::INFINITY, f32::min);
    let mx = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if mn > 0.0 {
        mn = 0.0;
    }
    ((mx - mn) / levels, -mn)
}

// Q2_K: 16 sub-blocks of 16 elements; per sub-block a 4-bit scale and 4-bit
// min, super-scaled by two f16 values; 2-bit quants stacked four deep in
// 32-byte groups.

fn encode_q2_k(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let mut scales = [0.0f32; 16];
    let mut mins = [0.0f32; 16];
    for j in 0..16 {
        let (s, m) = scale_min(&x[16 * j..16 * (j + 1)], 3.0);
        scales[j] = s;
        mins[j] = m;
    }
    let max_s = scales.iter().copied().fold(0.0f32, f32::max);
    let max_m = mins.iter().copied().fold(0.0f32, f32::max);
    let d = max_s / 15.0;
    let dmin = max_m / 15.0;
    let inv_d = if d != 0.0 { 1.0 / d } else { 0.0 };
    let inv_m = if dmin != 0.0 { 1.0 / dmin } else { 0.0 };
    let mut ls = [0u8; 16];
    let mut lm = [0u8; 16];
    for j in 0..16 {
        ls[j] = ((scales[j] * inv_d).round() as i32).clamp(0, 15) as u8;
        lm[j] = ((mins[j] * inv_m).round() as i32).clamp(0, 15) as u8;
        y[j] = ls[j] | (lm[j] << 4);
    }
    for b in y[16..80].iter_mut() {
        *b = 0;
    }
    put_f16(&mut y[80..], d);
    put_f16(&mut y[82..], dmin);
    // Pack: qs[n/4*32 + l] holds element bits for the four 32-element strips
    // of each 128-half, two bits per strip.
    let mut is = 0;
    for n in (0..QK_K).step_by(128) {
        for shift in [0u8, 2, 4, 6] {
            for half in 0..2 {
                let dl = d * ls[is] as f32;
                let ml = dmin * lm[is] as f32;
                let idl = if dl != 0.0 { 1.0 / dl } else { 0.0 };
                for l in 0..16 {
                    let xi = x[n + (shift as usize / 2) * 32 + half * 16 + l];
                    let q = (((xi + ml) * idl).round() as i32).clamp(0, 3) as u8;
                    y[16 + n / 4 + half * 16 + l] |= q << shift;
                    hist[(q << 2) as usize] += 1;
                }
                is += 1;
            }
        }
    }
}

fn decode_q2_k(x: &[u8], y: &mut [f32]) {
    let d = get_f16(&x[80..]);
    let dmin = get_f16(&x[82..]);
    let mut is = 0;
    let mut out = 0;
    for n in (0..QK_K).step_by(128) {
        let q = &x[16 + n / 4..16 + n / 4 + 32];
        for shift in [0u8, 2, 4, 6] {
            for half in 0..2 {
                let sc = x[is];
                is += 1;
                let dl = d * (sc & 0x0F) as f32;
                let ml = dmin * (sc >> 4) as f32;
                for l in 0..16 {
                    y[out] = dl * ((q[half * 16 + l] >> shift) & 3) as f32 - ml;
                    out += 1;
                }
            }
        }
    }
}

// Q3_K: 16 sub-blocks of 16 elements with signed 6-bit scales packed into
// 12 bytes; 3-bit quants split between a 2-bit plane and a high-bit mask.

fn pack_q3_scales(u: &[u8; 16], out: &mut [u8]) {
    let mut a = [0u8; 4];
    let mut b = [0u8; 4];
    let mut t = [0u8; 4];
    for i in 0..4 {
        a[i] = (u[i] & 0x0F) | ((u[8 + i] & 0x0F) << 4);
        b[i] = (u[4 + i] & 0x0F) | ((u[12 + i] & 0x0F) << 4);
        t[i] = ((u[i] >> 4) & 3)
            | (((u[4 + i] >> 4) & 3) << 2)
            | (((u[8 + i] >> 4) & 3) << 4)
            | (((u[12 + i] >> 4) & 3) << 6);
    }
    out[..4].copy_from_slice(&a);
    out[4..8].copy_from_slice(&b);
    out[8..12].copy_from_slice(&t);
}

fn unpack_q3_scales(src: &[u8]) -> [i8; 16] {
    let mut u = [0i8; 16];
    for i in 0..4 {
        let a = src[i];
        let b = src[4 + i];
        let t = src[8 + i];
        u[i] = (((a & 0x0F) | (((t >> 0) & 3) << 4)) as i8) - 32;
        u[4 + i] = (((b & 0x0F) | (((t >> 2) & 3) << 4)) as i8) - 32;
        u[8 + i] = (((a >> 4) | (((t >> 4) & 3) << 4)) as i8) - 32;
        u[12 + i] = (((b >> 4) | (((t >> 6) & 3) << 4)) as i8) - 32;
    }
    u
}

fn encode_q3_k(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let mut scales = [0.0f32; 16];
    for j in 0..16 {
        let amax = x[16 * j..16 * (j + 1)]
            .iter()
            .fold(0.0f32, |m, v| m.max(v.abs()));
        scales[j] = amax / 4.0;
    }
    let max_s = scales.iter().copied().fold(0.0f32, f32::max);
    let d = max_s / 31.0;
    let inv_d = if d != 0.0 { 1.0 / d } else { 0.0 };
    let mut ls = [0u8; 16];
    let mut dl = [0.0f32; 16];
    for j in 0..16 {
        let q = ((scales[j] * inv_d).round() as i32).clamp(-32, 31);
        ls[j] = (q + 32) as u8;
        dl[j] = d * q as f32;
    }
    for b in y[..96].iter_mut() {
        *b = 0;
    }
    pack_q3_scales(&ls, &mut y[96..108]);
    put_f16(&mut y[108..], d);
    let mut is = 0;
    let mut hm = 1u8;
    for n in (0..QK_K).step_by(128) {
        for shift in [0u8, 2, 4, 6] {
            for half in 0..2 {
                let idl = if dl[is] != 0.0 { 1.0 / dl[is] } else { 0.0 };
                for l in 0..16 {
                    let xi = x[n + (shift as usize / 2) * 32 + half * 16 + l];
                    let q = ((xi * idl).round() as i32).clamp(-4, 3) + 4;
                    let pos = half * 16 + l;
                    y[32 + n / 4 + pos] |= ((q & 3) as u8) << shift;
                    if q & 4 != 0 {
                        y[pos] |= hm;
                    }
                    hist[((q as usize) << 1) & 0x0F] += 1;
                }
                is += 1;
            }
        }
        hm <<= 1;
    }
}

fn decode_q3_k(x: &[u8], y: &mut [f32]) {
    let d = get_f16(&x[108..]);
    let scales = unpack_q3_scales(&x[96..108]);
    let mut is = 0;
    let mut hm = 1u8;
    let mut out = 0;
    for n in (0..QK_K).step_by(128) {
        let q = &x[32 + n / 4..32 + n / 4 + 32];
        for shift in [0u8, 2, 4, 6] {
            for half in 0..2 {
                let dl = d * scales[is] as f32;
                is += 1;
                for l in 0..16 {
                    let pos = half * 16 + l;
                    let lo = ((q[pos] >> shift) & 3) as i32;
                    let hi = if x[pos] & hm != 0 { 0 } else { 4 };
                    y[out] = dl * (lo - hi) as f32;
                    out += 1;
                }
            }
        }
        hm <<= 1;
    }
}

// Q4_K / Q5_K: 8 sub-blocks of 32 elements; 6-bit scales and mins packed
// into 12 bytes, super-scaled by two f16 values.

fn pack_k4_scales(ls: &[u8; 8], lm: &[u8; 8], out: &mut [u8]) {
    for b in out[..12].iter_mut() {
        *b = 0;
    }
    for j in 0..8 {
        if j < 4 {
            out[j] = ls[j] & 63;
            out[j + 4] = lm[j] & 63;
        } else {
            out[j + 4] = (ls[j] & 0x0F) | ((lm[j] & 0x0F) << 4);
            out[j - 4] |= (ls[j] >> 4) << 6;
            out[j] |= (lm[j] >> 4) << 6;
        }
    }
}

fn unpack_k4_scale(src: &[u8], j: usize) -> (u8, u8) {
    if j < 4 {
        (src[j] & 63, src[j + 4] & 63)
    } else {
        (
            (src[j + 4] & 0x0F) | ((src[j - 4] >> 6) << 4),
            (src[j + 4] >> 4) | ((src[j] >> 6) << 4),
        )
    }
}

fn k4_scales(x: &[f32], levels: f32) -> ([u8; 8], [u8; 8], f32, f32) {
    let mut scales = [0.0f32; 8];
    let mut mins = [0.0f32; 8];
    for j in 0..8 {
        let (s, m) = scale_min(&x[32 * j..32 * (j + 1)], levels);
        scales[j] = s;
        mins[j] = m;
    }
    let d = scales.iter().copied().fold(0.0f32, f32::max) / 63.0;
    let dmin = mins.iter().copied().fold(0.0f32, f32::max) / 63.0;
    let inv_d = if d != 0.0 { 1.0 / d } else { 0.0 };
    let inv_m = if dmin != 0.0 { 1.0 / dmin } else { 0.0 };
    let mut ls = [0u8; 8];
    let mut lm = [0u8; 8];
    for j in 0..8 {
        ls[j] = ((scales[j] * inv_d).round() as i32).clamp(0, 63) as u8;
        lm[j] = ((mins[j] * inv_m).round() as i32).clamp(0, 63) as u8;
    }
    (ls, lm, d, dmin)
}

fn encode_q4_k(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let (ls, lm, d, dmin) = k4_scales(x, 15.0);
    put_f16(y, d);
    put_f16(&mut y[2..], dmin);
    pack_k4_scales(&ls, &lm, &mut y[4..16]);
    for b in y[16..144].iter_mut() {
        *b = 0;
    }
    let mut is = 0;
    for j in (0..QK_K).step_by(64) {
        for half in 0..2 {
            let dl = d * ls[is] as f32;
            let ml = dmin * lm[is] as f32;
            let idl = if dl != 0.0 { 1.0 / dl } else { 0.0 };
            for l in 0..32 {
                let q = (((x[j + half * 32 + l] + ml) * idl).round() as i32).clamp(0, 15) as u8;
                y[16 + j / 2 + l] |= q << (4 * half);
                hist[q as usize] += 1;
            }
            is += 1;
        }
    }
}

fn decode_q4_k(x: &[u8], y: &mut [f32]) {
    let d = get_f16(x);
    let dmin = get_f16(&x[2..]);
    let mut is = 0;
    let mut out = 0;
    for j in (0..QK_K).step_by(64) {
        let q = &x[16 + j / 2..16 + j / 2 + 32];
        for half in 0..2 {
            let (sc, m) = unpack_k4_scale(&x[4..16], is);
            is += 1;
            let dl = d * sc as f32;
            let ml = dmin * m as f32;
            for l in 0..32 {
                y[out] = dl * ((q[l] >> (4 * half)) & 0x0F) as f32 - ml;
                out += 1;
            }
        }
    }
}

fn encode_q5_k(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let (ls, lm, d, dmin) = k4_scales(x, 31.0);
    put_f16(y, d);
    put_f16(&mut y[2..], dmin);
    pack_k4_scales(&ls, &lm, &mut y[4..16]);
    for b in y[16..176].iter_mut() {
        *b = 0;
    }
    let mut is = 0;
    let mut hbit = 0u8;
    for j in (0..QK_K).step_by(64) {
        for half in 0..2 {
            let dl = d * ls[is] as f32;
            let ml = dmin * lm[is] as f32;
            let idl = if dl != 0.0 { 1.0 / dl } else { 0.0 };
            for l in 0..32 {
                let q = (((x[j + half * 32 + l] + ml) * idl).round() as i32).clamp(0, 31) as u8;
                y[48 + j / 2 + l] |= (q & 0x0F) << (4 * half);
                if q & 0x10 != 0 {
                    y[16 + l] |= 1 << hbit;
                }
                hist[(q >> 1) as usize] += 1;
            }
            is += 1;
            hbit += 1;
        }
    }
}

fn decode_q5_k(x: &[u8], y: &mut [f32]) {
    let d = get_f16(x);
    let dmin = get_f16(&x[2..]);
    let qh = &x[16..48];
    let mut is = 0;
    let mut hbit = 0u8;
    let mut out = 0;
    for j in (0..QK_K).step_by(64) {
        let ql = &x[48 + j / 2..48 + j / 2 + 32];
        for half in 0..2 {
            let (sc, m) = unpack_k4_scale(&x[4..16], is);
            is += 1;
            let dl = d * sc as f32;
            let ml = dmin * m as f32;
            for l in 0..32 {
                let mut q = ((ql[l] >> (4 * half)) & 0x0F) as u32;
                if qh[l] & (1 << hbit) != 0 {
                    q += 16;
                }
                y[out] = dl * q as f32 - ml;
                out += 1;
            }
            hbit += 1;
        }
    }
}

// Q6_K: 16 sub-blocks of 16 elements with signed 8-bit scales and a single
// f16 super-scale; 6-bit quants split into a 4-bit plane and a 2-bit plane.

fn encode_q6_k(x: &[f32], y: &mut [u8], hist: &mut [i64; HIST_BINS]) {
    let mut scales = [0.0f32; 16];
    for j in 0..16 {
        let amax = x[16 * j..16 * (j + 1)]
            .iter()
            .fold(0.0f32, |m, v| m.max(v.abs()));
        scales[j] = amax / 31.0;
    }
    let max_s = scales.iter().copied().fold(0.0f32, f32::max);
    let d = max_s / 127.0;
    let inv_d = if d != 0.0 { 1.0 / d } else { 0.0 };
    let mut dl = [0.0f32; 16];
    for j in 0..16 {
        let q = ((scales[j] * inv_d).round() as i32).clamp(-128, 127);
        y[192 + j] = q as i8 as u8;
        dl[j] = d * q as f32;
    }
    for b in y[..192].iter_mut() {
        *b = 0;
    }
    put_f16(&mut y[208..], d);
    for (half, n) in [(0usize, 0usize), (1, 128)] {
        let ql = 64 * half;
        let qh = 32 * half;
        let sc = 8 * half;
        for l in 0..32 {
            let is = l / 16 + sc;
            let mut qs = [0i32; 4];
            for (k, off) in [0usize, 32, 64, 96].iter().enumerate() {
                let s = dl[is + 2 * k];
                let inv = if s != 0.0 { 1.0 / s } else { 0.0 };
                let q = ((x[n + l + off] * inv).round() as i32).clamp(-32, 31) + 32;
                qs[k] = q;
                hist[(q >> 2) as usize] += 1;
            }
            y[ql + l] = ((qs[0] & 0x0F) | ((qs[2] & 0x0F) << 4)) as u8;
            y[ql + l + 32] = ((qs[1] & 0x0F) | ((qs[3] & 0x0F) << 4)) as u8;
            y[128 + qh + l] = (((qs[0] >> 4) & 3)
                | (((qs[1] >> 4) & 3) << 2)
                | (((qs[2] >> 4) & 3) << 4)
                | (((qs[3] >> 4) & 3) << 6)) as u8;
        }
    }
}

fn decode_q6_k(x: &[u8], y: &mut [f32]) {
    let d = get_f16(&x[208..]);
    for (half, n) in [(0usize, 0usize), (1, 128)] {
        let ql = &x[64 * half..64 * half + 64];
        let qh = &x[128 + 32 * half..128 + 32 * half + 32];
        let sc = &x[192 + 8 * half..192 + 8 * half + 8];
        for l in 0..32 {
            let is = l / 16;
            let q1 = ((ql[l] & 0x0F) as i32 | (((qh[l] as i32) & 3) << 4)) - 32;
            let q2 = ((ql[l + 32] & 0x0F) as i32 | ((((qh[l] >> 2) as i32) & 3) << 4)) - 32;
            let q3 = ((ql[l] >> 4) as i32 | ((((qh[l] >> 4) as i32) & 3) << 4)) - 32;
            let q4 = ((ql[l + 32] >> 4) as i32 | ((((qh[l] >> 6) as i32) & 3) << 4)) - 32;
            y[n + l] = d * (sc[is] as i8) as f32 * q1 as f32;
            y[n + l + 32] = d * (sc[is + 2] as i8) as f32 * q2 as f32;
            y[n + l + 64] = d * (sc[is + 4] as i8) as f32 * q3 as f32;
            y[n + l + 96] = d * (sc[is + 6] as i8) as f32 * q4 as f32;
        }
    }
}
