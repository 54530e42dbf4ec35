//! Fixed-stride token records written into peer regions.
//!
//! A dispatch record is a 16-byte header, the encoded payload row, the top-k
//! indices (`i64`) and, when present, the top-k weights (`f32`). A combine
//! row is the reduced hidden vector followed by the top-k weights.

use bytemuck::{Pod, Zeroable};

use crate::{
    config::align_up, payload::TokenPayload, placement::ExpertPlacement, tensor::Matrix,
};

pub(crate) const RECORD_ALIGNMENT: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct RecordHeader {
    pub src_rank: i32,
    pub src_token_idx: i32,
    /// Meaning depends on the hop: NVLink mask of destinations on the
    /// receiving node, or the slot of the token on the forwarder.
    pub aux0: i32,
    pub aux1: i32,
}

const HEADER_BYTES: usize = size_of::<RecordHeader>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RecordLayout {
    row_bytes: usize,
    num_topk: usize,
    with_weights: bool,
}

impl RecordLayout {
    pub fn new(row_bytes: usize, num_topk: usize, with_weights: bool) -> Self {
        Self { row_bytes, num_topk, with_weights }
    }

    pub fn for_payload(
        payload: &TokenPayload,
        num_topk: usize,
        with_weights: bool,
    ) -> Self {
        Self::new(payload.row_bytes(), num_topk, with_weights)
    }

    fn topk_offset(&self) -> usize {
        HEADER_BYTES + self.row_bytes
    }

    fn weights_offset(&self) -> usize {
        self.topk_offset() + self.num_topk * size_of::<i64>()
    }

    pub fn stride(&self) -> usize {
        let weights =
            if self.with_weights { self.num_topk * size_of::<f32>() } else { 0 };
        align_up(self.weights_offset() + weights, RECORD_ALIGNMENT)
    }

    /// Append one record of exactly [`RecordLayout::stride`] bytes.
    pub fn encode(
        &self,
        header: RecordHeader,
        payload: &TokenPayload,
        row: usize,
        topk_idx: Option<&[i64]>,
        topk_weights: Option<&[f32]>,
        out: &mut Vec<u8>,
    ) {
        let start = out.len();
        out.extend_from_slice(bytemuck::bytes_of(&header));
        payload.encode_row(row, out);
        if let Some(idx) = topk_idx {
            out.extend_from_slice(bytemuck::cast_slice(idx));
        }
        if self.with_weights
            && let Some(weights) = topk_weights
        {
            out.extend_from_slice(bytemuck::cast_slice(weights));
        }
        out.resize(start + self.stride(), 0);
    }

    pub fn header(&self, record: &[u8]) -> RecordHeader {
        bytemuck::pod_read_unaligned(&record[..HEADER_BYTES])
    }

    pub fn set_header(&self, record: &mut [u8], header: RecordHeader) {
        record[..HEADER_BYTES].copy_from_slice(bytemuck::bytes_of(&header));
    }

    pub fn payload<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[HEADER_BYTES..self.topk_offset()]
    }

    pub fn topk_idx(&self, record: &[u8]) -> Vec<i64> {
        bytemuck::pod_collect_to_vec(&record[self.topk_offset()..self.weights_offset()])
    }

    pub fn topk_weights(&self, record: &[u8]) -> Option<Vec<f32>> {
        if !self.with_weights {
            return None;
        }
        let begin = self.weights_offset();
        Some(bytemuck::pod_collect_to_vec(
            &record[begin..begin + self.num_topk * size_of::<f32>()],
        ))
    }
}

/// Row of the combine direction: `hidden` values then `num_topk` weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CombineRowLayout {
    pub hidden: usize,
    pub num_topk: usize,
}

impl CombineRowLayout {
    pub fn stride(&self) -> usize {
        align_up((self.hidden + self.num_topk) * size_of::<f32>(), RECORD_ALIGNMENT)
    }

    pub fn encode(&self, values: &[f32], weights: Option<&[f32]>, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(bytemuck::cast_slice(values));
        if let Some(weights) = weights {
            out.extend_from_slice(bytemuck::cast_slice(weights));
        }
        out.resize(start + self.stride(), 0);
    }

    /// Add the row in `bytes` to `values` and `weights`.
    pub fn accumulate(&self, bytes: &[u8], values: &mut [f32], weights: &mut [f32]) {
        let len = (self.hidden + self.num_topk) * size_of::<f32>();
        let decoded: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[..len]);
        let (row, row_weights) = decoded.split_at(self.hidden);
        values.iter_mut().zip(row).for_each(|(acc, v)| *acc += v);
        weights.iter_mut().zip(row_weights).for_each(|(acc, w)| *acc += w);
    }
}

/// How received top-k selections are mapped to the local experts.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TopkMapping<'a> {
    pub placement: &'a ExpertPlacement,
    pub rank: usize,
    pub with_weights: bool,
}

pub(crate) struct DecodedTokens {
    pub recv_x: TokenPayload,
    pub recv_topk_idx: Option<Matrix<i64>>,
    pub recv_topk_weights: Option<Matrix<f32>>,
    pub headers: Vec<RecordHeader>,
}

/// Decode consecutive records into `num_rows` output rows; rows past the
/// last record stay zero, with `-1` selections.
pub(crate) fn decode_tokens(
    bytes: &[u8],
    layout: &RecordLayout,
    template: &TokenPayload,
    num_rows: usize,
    topk: Option<TopkMapping<'_>>,
) -> DecodedTokens {
    let stride = layout.stride();
    let num_records = bytes.len() / stride;
    let mut recv_x = template.zeros_like(num_rows);
    let mut recv_topk_idx =
        topk.map(|_| Matrix::filled(num_rows, layout.num_topk, -1i64));
    let mut recv_topk_weights = topk
        .filter(|mapping| mapping.with_weights)
        .map(|_| Matrix::zeros(num_rows, layout.num_topk));
    let mut headers = Vec::with_capacity(num_records);

    for (row, record) in bytes.chunks_exact(stride).enumerate() {
        headers.push(layout.header(record));
        recv_x.decode_row(row, layout.payload(record));
        let Some(mapping) = topk else {
            continue;
        };
        let selections = layout.topk_idx(record);
        let weights = layout.topk_weights(record);
        for (k, &selection) in selections.iter().enumerate() {
            let Some(local) = mapping.placement.local_on(mapping.rank, selection) else {
                continue;
            };
            if let Some(idx) = recv_topk_idx.as_mut() {
                idx.set(row, k, local as i64);
            }
            if let Some(out) = recv_topk_weights.as_mut()
                && let Some(weights) = weights.as_ref()
            {
                out.set(row, k, weights[k]);
            }
        }
    }
    DecodedTokens { recv_x, recv_topk_idx, recv_topk_weights, headers }
}
