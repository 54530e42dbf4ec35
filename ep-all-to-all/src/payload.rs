use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, ensure_usage},
    quant::{dequantize, dequantize_ue8m0},
    tensor::Matrix,
};

/// Hidden states of a batch of tokens, one row per token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TokenPayload {
    F32(Matrix<f32>),
    /// e4m3 values with a companion scale matrix (one scale per block of
    /// channels).
    Fp8 { data: Matrix<u8>, scales: Matrix<f32> },
    /// e4m3 values with power-of-two scales stored as UE8M0 exponents, four
    /// per `i32`.
    Fp8Ue8m0 { data: Matrix<u8>, scales: Matrix<i32> },
}

impl TokenPayload {
    pub fn fp8(data: Matrix<u8>, scales: Matrix<f32>) -> Result<Self> {
        ensure_usage!(
            data.rows() == scales.rows(),
            "FP8 data has {} rows but its scales have {}",
            data.rows(),
            scales.rows()
        );
        Ok(Self::Fp8 { data, scales })
    }

    pub fn num_tokens(&self) -> usize {
        match self {
            TokenPayload::F32(x) => x.rows(),
            TokenPayload::Fp8 { data, .. } | TokenPayload::Fp8Ue8m0 { data, .. } => {
                data.rows()
            }
        }
    }

    pub fn hidden(&self) -> usize {
        match self {
            TokenPayload::F32(x) => x.cols(),
            TokenPayload::Fp8 { data, .. } | TokenPayload::Fp8Ue8m0 { data, .. } => {
                data.cols()
            }
        }
    }

    /// Scale columns per row; packed words for UE8M0 scales.
    pub fn num_scales(&self) -> usize {
        match self {
            TokenPayload::F32(_) => 0,
            TokenPayload::Fp8 { scales, .. } => scales.cols(),
            TokenPayload::Fp8Ue8m0 { scales, .. } => scales.cols(),
        }
    }

    pub fn is_fp8(&self) -> bool {
        !matches!(self, TokenPayload::F32(_))
    }

    pub fn as_f32(&self) -> Option<&Matrix<f32>> {
        match self {
            TokenPayload::F32(x) => Some(x),
            _ => None,
        }
    }

    pub fn scales(&self) -> Option<&Matrix<f32>> {
        match self {
            TokenPayload::Fp8 { scales, .. } => Some(scales),
            _ => None,
        }
    }

    /// The values as f32, dequantizing FP8 rows.
    pub fn to_f32(&self) -> Matrix<f32> {
        match self {
            TokenPayload::F32(x) => x.clone(),
            TokenPayload::Fp8 { data, scales } => dequantize(data, scales),
            TokenPayload::Fp8Ue8m0 { data, scales } => dequantize_ue8m0(data, scales),
        }
    }

    /// Bytes of one encoded row: values followed by scales.
    pub(crate) fn row_bytes(&self) -> usize {
        match self {
            TokenPayload::F32(x) => x.cols() * size_of::<f32>(),
            TokenPayload::Fp8 { data, scales } => {
                data.cols() + scales.cols() * size_of::<f32>()
            }
            TokenPayload::Fp8Ue8m0 { data, scales } => {
                data.cols() + scales.cols() * size_of::<i32>()
            }
        }
    }

    /// A zeroed payload of the same layout with `rows` rows.
    pub(crate) fn zeros_like(&self, rows: usize) -> Self {
        match self {
            TokenPayload::F32(x) => TokenPayload::F32(Matrix::zeros(rows, x.cols())),
            TokenPayload::Fp8 { data, scales } => TokenPayload::Fp8 {
                data: Matrix::zeros(rows, data.cols()),
                scales: Matrix::zeros(rows, scales.cols()),
            },
            TokenPayload::Fp8Ue8m0 { data, scales } => TokenPayload::Fp8Ue8m0 {
                data: Matrix::zeros(rows, data.cols()),
                scales: Matrix::zeros(rows, scales.cols()),
            },
        }
    }

    pub(crate) fn encode_row(&self, row: usize, out: &mut Vec<u8>) {
        match self {
            TokenPayload::F32(x) => {
                out.extend_from_slice(bytemuck::cast_slice(x.row(row)))
            }
            TokenPayload::Fp8 { data, scales } => {
                out.extend_from_slice(data.row(row));
                out.extend_from_slice(bytemuck::cast_slice(scales.row(row)));
            }
            TokenPayload::Fp8Ue8m0 { data, scales } => {
                out.extend_from_slice(data.row(row));
                out.extend_from_slice(bytemuck::cast_slice(scales.row(row)));
            }
        }
    }

    /// Fill `row` from bytes produced by [`TokenPayload::encode_row`].
    pub(crate) fn decode_row(&mut self, row: usize, bytes: &[u8]) {
        match self {
            TokenPayload::F32(x) => {
                let dst: &mut [u8] = bytemuck::cast_slice_mut(x.row_mut(row));
                dst.copy_from_slice(&bytes[..dst.len()]);
            }
            TokenPayload::Fp8 { data, scales } => {
                let num_values = data.cols();
                data.row_mut(row).copy_from_slice(&bytes[..num_values]);
                let dst: &mut [u8] = bytemuck::cast_slice_mut(scales.row_mut(row));
                dst.copy_from_slice(&bytes[num_values..num_values + dst.len()]);
            }
            TokenPayload::Fp8Ue8m0 { data, scales } => {
                let num_values = data.cols();
                data.row_mut(row).copy_from_slice(&bytes[..num_values]);
                let dst: &mut [u8] = bytemuck::cast_slice_mut(scales.row_mut(row));
                dst.copy_from_slice(&bytes[num_values..num_values + dst.len()]);
            }
        }
    }
}

/// Expert selections of a batch: `-1` marks "no selection".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopkSelection {
    pub idx: Matrix<i64>,
    pub weights: Option<Matrix<f32>>,
}

impl TopkSelection {
    pub fn new(idx: Matrix<i64>, weights: Option<Matrix<f32>>) -> Result<Self> {
        if let Some(weights) = &weights {
            ensure_usage!(
                weights.shape() == idx.shape(),
                "top-k weights of shape {:?} do not match indices of shape {:?}",
                weights.shape(),
                idx.shape()
            );
        }
        Ok(Self { idx, weights })
    }

    pub fn num_tokens(&self) -> usize {
        self.idx.rows()
    }

    pub fn num_topk(&self) -> usize {
        self.idx.cols()
    }
}
