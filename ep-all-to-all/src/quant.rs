//! FP8 (e4m3fn) per-block casting used by low-latency dispatch.

use crate::tensor::Matrix;

/// Largest finite e4m3fn value.
pub const FP8_E4M3_MAX: f32 = 448.0;
/// Number of hidden channels sharing one scale.
pub const FP8_BLOCK_SIZE: usize = 128;
/// UE8M0 scales packed into one `i32`, lowest byte first.
pub const UE8M0_SCALES_PER_WORD: usize = 4;
/// Smallest amax used to derive a scale.
const MIN_AMAX: f32 = 1e-4;

/// Round-to-nearest cast with saturation to +-448.
pub fn f32_to_e4m3(value: f32) -> u8 {
    if value.is_nan() {
        return 0x7f;
    }
    let sign = if value.is_sign_negative() { 0x80 } else { 0x00 };
    let abs = value.abs();
    if abs >= FP8_E4M3_MAX {
        return sign | 0x7e;
    }
    if abs < 2f32.powi(-6) {
        // Subnormal: steps of 2^-9. A result of 8 is the smallest normal.
        let mantissa = (abs / 2f32.powi(-9)).round() as u8;
        return sign | mantissa;
    }
    let mut exponent = abs.log2().floor() as i32;
    let mut mantissa = ((abs / 2f32.powi(exponent) - 1.0) * 8.0).round() as u32;
    if mantissa == 8 {
        mantissa = 0;
        exponent += 1;
    }
    let biased = exponent + 7;
    if biased > 15 || (biased == 15 && mantissa == 7) {
        return sign | 0x7e;
    }
    sign | ((biased as u8) << 3) | mantissa as u8
}

pub fn e4m3_to_f32(bits: u8) -> f32 {
    let sign = if bits & 0x80 != 0 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 3) & 0x0f) as i32;
    let mantissa = (bits & 0x07) as f32;
    if exponent == 0x0f && bits & 0x07 == 0x07 {
        return f32::NAN;
    }
    let magnitude = if exponent == 0 {
        mantissa / 8.0 * 2f32.powi(-6)
    } else {
        (1.0 + mantissa / 8.0) * 2f32.powi(exponent - 7)
    };
    sign * magnitude
}

/// Cast one row, writing one scale per [`FP8_BLOCK_SIZE`] channels.
///
/// With `round_scale` the scales are rounded up to a power of two.
pub fn quantize_row(row: &[f32], round_scale: bool, out: &mut [u8], scales: &mut [f32]) {
    let blocks = row.chunks(FP8_BLOCK_SIZE).zip(out.chunks_mut(FP8_BLOCK_SIZE));
    for ((block, out_block), scale) in blocks.zip(scales.iter_mut()) {
        let amax = block.iter().fold(0.0f32, |acc, v| acc.max(v.abs())).max(MIN_AMAX);
        let mut block_scale = amax / FP8_E4M3_MAX;
        if round_scale {
            block_scale = 2f32.powf(block_scale.log2().ceil());
        }
        for (value, q) in block.iter().zip(out_block.iter_mut()) {
            *q = f32_to_e4m3(value / block_scale);
        }
        *scale = block_scale;
    }
}

/// Biased exponent of a power-of-two scale.
pub fn scale_to_ue8m0(scale: f32) -> u8 {
    ((scale.to_bits() >> 23) & 0xff) as u8
}

pub fn ue8m0_to_scale(exponent: u8) -> f32 {
    f32::from_bits((exponent as u32) << 23)
}

/// Pack power-of-two scales [`UE8M0_SCALES_PER_WORD`] per word.
pub fn pack_ue8m0(scales: &[f32], out: &mut [i32]) {
    for (word, chunk) in out.iter_mut().zip(scales.chunks(UE8M0_SCALES_PER_WORD)) {
        let mut bytes = [0u8; UE8M0_SCALES_PER_WORD];
        for (byte, scale) in bytes.iter_mut().zip(chunk) {
            *byte = scale_to_ue8m0(*scale);
        }
        *word = i32::from_le_bytes(bytes);
    }
}

pub fn unpack_ue8m0(words: &[i32], num_scales: usize) -> Vec<f32> {
    words
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .take(num_scales)
        .map(ue8m0_to_scale)
        .collect()
}

fn dequantize_rows(
    data: &Matrix<u8>,
    scales_of: impl Fn(usize) -> Vec<f32>,
) -> Matrix<f32> {
    let mut out = Matrix::zeros(data.rows(), data.cols());
    for row in 0..data.rows() {
        let scale_row = scales_of(row);
        for (col, (q, value)) in data.row(row).iter().zip(out.row_mut(row)).enumerate() {
            *value = e4m3_to_f32(*q) * scale_row[col / FP8_BLOCK_SIZE];
        }
    }
    out
}

/// Inverse of [`quantize_row`] applied to every row.
pub fn dequantize(data: &Matrix<u8>, scales: &Matrix<f32>) -> Matrix<f32> {
    dequantize_rows(data, |row| scales.row(row).to_vec())
}

/// [`dequantize`] with scales packed by [`pack_ue8m0`].
pub fn dequantize_ue8m0(data: &Matrix<u8>, packed: &Matrix<i32>) -> Matrix<f32> {
    let num_scales = data.cols().div_ceil(FP8_BLOCK_SIZE);
    dequantize_rows(data, |row| unpack_ue8m0(packed.row(row), num_scales))
}
