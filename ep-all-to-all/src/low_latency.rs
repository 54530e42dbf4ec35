//! RDMA-only dispatch and combine with statically sized slots.
//!
//! The RDMA region holds two identical halves used alternately by
//! consecutive low-latency operations. Each half:
//!
//! ```text
//! dispatch flags  [local expert][src rank]            i32
//! dispatch data   [local expert][src rank][token]     header + row
//! combine flags   [expert]                            i32
//! combine data    [expert][token]                     f32 * hidden
//! combine send    [local expert][src rank][token]     f32 * hidden
//! ```
//!
//! The combine send section stages expert outputs written in place by the
//! caller for zero-copy combines.
//!
//! A dispatch flag holds `-(count) - 1` once the source finished writing,
//! a combine flag holds `1`. Zero means "not arrived yet"; the receiver
//! resets the flags it consumed.

use bytes::Bytes;
use fabric_lib::api::RegionKind;
use tracing::debug;

use crate::{
    config::align_up,
    context::CommContext,
    error::{Result, ensure_usage, usage_error},
    handle::LowLatencyHandle,
    ops::ExpertLoadCounter,
    payload::TokenPayload,
    placement::ExpertPlacement,
    quant::{FP8_BLOCK_SIZE, UE8M0_SCALES_PER_WORD, pack_ue8m0, quantize_row},
    tensor::Matrix,
};

const SECTION_ALIGNMENT: usize = 128;
const MSG_HEADER_BYTES: usize = 16;
const FLAG_BYTES: usize = size_of::<i32>();

/// Offsets of the low-latency sections for one shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LowLatencyLayout {
    pub num_max_tokens: usize,
    pub hidden: usize,
    pub num_ranks: usize,
    pub num_experts: usize,
    msg_stride: usize,
    dispatch_data: usize,
    combine_flags: usize,
    combine_data: usize,
    combine_send: usize,
    half_bytes: usize,
}

impl LowLatencyLayout {
    pub fn new(
        num_max_tokens: usize,
        hidden: usize,
        num_ranks: usize,
        num_experts: usize,
    ) -> Self {
        let num_local_experts = num_experts / num_ranks.max(1);
        let f32_bytes = hidden * size_of::<f32>();
        let fp8_bytes = hidden + hidden.div_ceil(FP8_BLOCK_SIZE) * size_of::<f32>();
        let msg_stride = align_up(MSG_HEADER_BYTES + f32_bytes.max(fp8_bytes), 16);

        let flags_bytes = num_local_experts * num_ranks * FLAG_BYTES;
        let dispatch_data = align_up(flags_bytes, SECTION_ALIGNMENT);
        let data_bytes = num_local_experts * num_ranks * num_max_tokens * msg_stride;
        let combine_flags = align_up(dispatch_data + data_bytes, SECTION_ALIGNMENT);
        let combine_data =
            align_up(combine_flags + num_experts * FLAG_BYTES, SECTION_ALIGNMENT);
        let combine_send = align_up(
            combine_data + num_experts * num_max_tokens * f32_bytes,
            SECTION_ALIGNMENT,
        );
        let send_rows = num_local_experts * num_ranks * num_max_tokens;
        let half_bytes =
            align_up(combine_send + send_rows * f32_bytes, SECTION_ALIGNMENT);
        Self {
            num_max_tokens,
            hidden,
            num_ranks,
            num_experts,
            msg_stride,
            dispatch_data,
            combine_flags,
            combine_data,
            combine_send,
            half_bytes,
        }
    }

    /// Bytes of both halves.
    pub fn size_hint(&self) -> usize {
        2 * self.half_bytes
    }

    fn base(&self, half: usize) -> usize {
        half * self.half_bytes
    }

    fn dispatch_flag(&self, half: usize, local_expert: usize, src: usize) -> usize {
        self.base(half) + (local_expert * self.num_ranks + src) * FLAG_BYTES
    }

    fn dispatch_msg(
        &self,
        half: usize,
        local_expert: usize,
        src: usize,
        idx: usize,
    ) -> usize {
        let slot = (local_expert * self.num_ranks + src) * self.num_max_tokens + idx;
        self.base(half) + self.dispatch_data + slot * self.msg_stride
    }

    fn combine_flag(&self, half: usize, expert: usize) -> usize {
        self.base(half) + self.combine_flags + expert * FLAG_BYTES
    }

    fn combine_row(&self, half: usize, expert: usize, token: usize) -> usize {
        let row = expert * self.num_max_tokens + token;
        self.base(half) + self.combine_data + row * self.hidden * size_of::<f32>()
    }

    fn rows_per_expert(&self) -> usize {
        self.num_ranks * self.num_max_tokens
    }

    fn combine_send_row(&self, half: usize, local_expert: usize, row: usize) -> usize {
        let row = local_expert * self.rows_per_expert() + row;
        self.base(half) + self.combine_send + row * self.hidden * size_of::<f32>()
    }

    /// Offset and length of the combine send section of `half`.
    pub fn combine_send_range(&self, half: usize) -> (usize, usize) {
        let start = self.base(half) + self.combine_send;
        (start, self.base(half) + self.half_bytes - start)
    }
}

/// Wire format of dispatched rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DispatchFormat {
    F32,
    Fp8 { round_scale: bool },
    /// e4m3 with power-of-two scales packed as UE8M0 exponents.
    Fp8Ue8m0,
}

impl DispatchFormat {
    pub fn new(use_fp8: bool, round_scale: bool, use_ue8m0: bool) -> Result<Self> {
        if !use_ue8m0 {
            return Ok(if use_fp8 { Self::Fp8 { round_scale } } else { Self::F32 });
        }
        ensure_usage!(
            use_fp8 && round_scale,
            "use_ue8m0 needs use_fp8 and round_scale"
        );
        Ok(Self::Fp8Ue8m0)
    }

    fn zeros(&self, rows: usize, hidden: usize) -> TokenPayload {
        let num_scales = hidden.div_ceil(FP8_BLOCK_SIZE);
        match self {
            Self::F32 => TokenPayload::F32(Matrix::zeros(rows, hidden)),
            Self::Fp8 { .. } => TokenPayload::Fp8 {
                data: Matrix::zeros(rows, hidden),
                scales: Matrix::zeros(rows, num_scales),
            },
            Self::Fp8Ue8m0 => TokenPayload::Fp8Ue8m0 {
                data: Matrix::zeros(rows, hidden),
                scales: Matrix::zeros(rows, num_scales.div_ceil(UE8M0_SCALES_PER_WORD)),
            },
        }
    }
}

/// Mutable view of the rows a zero-copy combine sends, laid out like the
/// dispatch's `recv_x`: `[local expert][num_ranks * max tokens][hidden]`.
pub struct LowLatencyCombineBuffer<'a> {
    bytes: &'a mut [u8],
    num_local_experts: usize,
    rows_per_expert: usize,
    hidden: usize,
}

impl<'a> LowLatencyCombineBuffer<'a> {
    pub(crate) fn new(
        bytes: &'a mut [u8],
        layout: &LowLatencyLayout,
        num_local_experts: usize,
    ) -> Self {
        let rows_per_expert = layout.rows_per_expert();
        Self { bytes, num_local_experts, rows_per_expert, hidden: layout.hidden }
    }

    pub fn num_local_experts(&self) -> usize {
        self.num_local_experts
    }

    pub fn rows_per_expert(&self) -> usize {
        self.rows_per_expert
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn set_row(
        &mut self,
        local_expert: usize,
        row: usize,
        values: &[f32],
    ) -> Result<()> {
        ensure_usage!(
            local_expert < self.num_local_experts && row < self.rows_per_expert,
            "row {} of local expert {} is outside the combine buffer ({} x {})",
            row,
            local_expert,
            self.num_local_experts,
            self.rows_per_expert
        );
        ensure_usage!(
            values.len() == self.hidden,
            "combine buffer rows hold {} values, got {}",
            self.hidden,
            values.len()
        );
        let row_bytes = self.hidden * size_of::<f32>();
        let offset = (local_expert * self.rows_per_expert + row) * row_bytes;
        self.bytes[offset..offset + row_bytes]
            .copy_from_slice(bytemuck::cast_slice(values));
        Ok(())
    }

    /// Copy every row of one expert's outputs.
    pub fn copy_expert(&mut self, local_expert: usize, x: &Matrix<f32>) -> Result<()> {
        ensure_usage!(
            x.shape() == (self.rows_per_expert, self.hidden),
            "expert output of shape {:?} does not match the combine buffer ({}, {})",
            x.shape(),
            self.rows_per_expert,
            self.hidden
        );
        for (row, values) in x.iter_rows().enumerate() {
            self.set_row(local_expert, row, values)?;
        }
        Ok(())
    }
}

/// Rows sent back by a combine.
#[derive(Clone, Copy)]
pub(crate) enum CombineSource<'a> {
    Rows(&'a [Matrix<f32>]),
    /// Rows staged in the local combine send section.
    Staged,
}

fn flag_bytes(value: i32) -> Bytes {
    Bytes::copy_from_slice(&value.to_ne_bytes())
}

/// Encode every token once: header, then the f32 row or the e4m3 row
/// followed by its scales.
fn encode_messages(
    layout: &LowLatencyLayout,
    x: &Matrix<f32>,
    format: DispatchFormat,
) -> Vec<Vec<u8>> {
    let hidden = layout.hidden;
    let num_scales = hidden.div_ceil(FP8_BLOCK_SIZE);
    (0..x.rows())
        .map(|token| {
            let mut msg = vec![0u8; layout.msg_stride];
            let header = [token as i32, 0, 0, 0];
            msg[..MSG_HEADER_BYTES].copy_from_slice(bytemuck::cast_slice(&header));
            let body = &mut msg[MSG_HEADER_BYTES..];
            let round_scale = match format {
                DispatchFormat::F32 => {
                    body[..hidden * size_of::<f32>()]
                        .copy_from_slice(bytemuck::cast_slice(x.row(token)));
                    return msg;
                }
                DispatchFormat::Fp8 { round_scale } => round_scale,
                DispatchFormat::Fp8Ue8m0 => true,
            };
            let (values, scale_bytes) = body.split_at_mut(hidden);
            let mut scales = vec![0f32; num_scales];
            quantize_row(x.row(token), round_scale, values, &mut scales);
            if format == DispatchFormat::Fp8Ue8m0 {
                let mut packed = vec![0i32; num_scales.div_ceil(UE8M0_SCALES_PER_WORD)];
                pack_ue8m0(&scales, &mut packed);
                scale_bytes[..packed.len() * size_of::<i32>()]
                    .copy_from_slice(bytemuck::cast_slice(&packed));
            } else {
                scale_bytes[..num_scales * size_of::<f32>()]
                    .copy_from_slice(bytemuck::cast_slice(&scales));
            }
            msg
        })
        .collect()
}

/// Write every token into the slots of the experts it selected, then
/// publish one count flag per expert, including experts that got nothing.
#[allow(clippy::too_many_arguments)]
pub(crate) fn send_dispatch(
    ctx: &CommContext,
    layout: &LowLatencyLayout,
    half: usize,
    x: &Matrix<f32>,
    topk_idx: &Matrix<i64>,
    placement: &ExpertPlacement,
    format: DispatchFormat,
) -> Result<()> {
    let me = ctx.rank();
    let num_experts = placement.num_experts();
    let mut per_expert: Vec<Vec<usize>> = vec![Vec::new(); num_experts];
    for (token, selections) in topk_idx.iter_rows().enumerate() {
        for &selection in selections {
            let expert = usize::try_from(selection).ok().filter(|&e| e < num_experts);
            let Some(expert) = expert else {
                continue;
            };
            // A token selecting an expert twice is sent once.
            if per_expert[expert].last() != Some(&token) {
                per_expert[expert].push(token);
            }
        }
    }

    let messages = encode_messages(layout, x, format);
    for (expert, tokens) in per_expert.iter().enumerate() {
        if tokens.is_empty() {
            continue;
        }
        let owner = placement.owner_rank(expert);
        let local_expert = placement.local_index(expert);
        let mut bytes = Vec::with_capacity(tokens.len() * layout.msg_stride);
        for &token in tokens {
            bytes.extend_from_slice(&messages[token]);
        }
        let offset = layout.dispatch_msg(half, local_expert, me, 0);
        ctx.write(owner, RegionKind::Rdma, offset, Bytes::from(bytes), None)?;
    }
    for (expert, tokens) in per_expert.iter().enumerate() {
        let owner = placement.owner_rank(expert);
        let offset = layout.dispatch_flag(half, placement.local_index(expert), me);
        let flag = -(tokens.len() as i32) - 1;
        ctx.write(owner, RegionKind::Rdma, offset, flag_bytes(flag), None)?;
    }
    debug!("Rank {}: low-latency dispatch sent on half {}", me, half);
    Ok(())
}

/// Spin until the flag at `offset` is non-zero, then reset it.
fn take_flag(ctx: &CommContext, offset: usize) -> Result<i32> {
    let region = ctx.local_region(RegionKind::Rdma)?;
    loop {
        let value = region.read_i32(offset)?;
        if value != 0 {
            region.write(offset, &[0u8; FLAG_BYTES])?;
            return Ok(value);
        }
        std::thread::yield_now();
    }
}

pub(crate) struct LowLatencyReceived {
    pub recv_x: Vec<TokenPayload>,
    pub recv_count: Vec<usize>,
    pub handle: LowLatencyHandle,
}

/// Collect the tokens sent to every local expert, packed by ascending
/// source rank.
pub(crate) fn recv_dispatch(
    ctx: &CommContext,
    layout: &LowLatencyLayout,
    half: usize,
    placement: &ExpertPlacement,
    format: DispatchFormat,
    stats: Option<&ExpertLoadCounter>,
) -> Result<LowLatencyReceived> {
    let num_ranks = layout.num_ranks;
    let num_local_experts = placement.num_local_experts();
    let hidden = layout.hidden;
    let num_rows = layout.rows_per_expert();
    let region = ctx.local_region(RegionKind::Rdma)?;

    let mut recv_x = Vec::with_capacity(num_local_experts);
    let mut recv_count = Vec::with_capacity(num_local_experts);
    let mut src_info = Matrix::filled(num_local_experts, num_rows, -1i32);
    let mut layout_range = Matrix::zeros(num_local_experts, num_ranks);
    for local_expert in 0..num_local_experts {
        let mut payload = format.zeros(num_rows, hidden);
        let mut begin = 0;
        for src in 0..num_ranks {
            let flag = take_flag(ctx, layout.dispatch_flag(half, local_expert, src))?;
            let count = -(flag as i64) - 1;
            if count < 0 || count as usize > layout.num_max_tokens {
                return Err(usage_error!(
                    "low-latency flag {} from rank {} is not a token count; \
                     the buffer is dirty and needs clean_low_latency_buffer",
                    flag,
                    src
                ));
            }
            let count = count as usize;
            let offset = layout.dispatch_msg(half, local_expert, src, 0);
            region.with_slice(offset, count * layout.msg_stride, |bytes| {
                for (i, msg) in bytes.chunks_exact(layout.msg_stride).enumerate() {
                    let header: &[i32] = bytemuck::cast_slice(&msg[..MSG_HEADER_BYTES]);
                    src_info.set(local_expert, begin + i, header[0]);
                    payload.decode_row(begin + i, &msg[MSG_HEADER_BYTES..]);
                }
            })?;
            let range = LowLatencyHandle::pack_range(begin, count);
            layout_range.set(local_expert, src, range);
            begin += count;
        }
        if let Some(stats) = stats {
            stats.add(local_expert, begin);
        }
        recv_x.push(payload);
        recv_count.push(begin);
    }

    let handle = LowLatencyHandle {
        num_ranks,
        packed_recv_src_info: src_info,
        packed_recv_layout_range: layout_range,
        num_max_dispatch_tokens_per_rank: layout.num_max_tokens,
        hidden,
        num_experts: layout.num_experts,
        placement: *placement,
    };
    Ok(LowLatencyReceived { recv_x, recv_count, handle })
}

/// Send every expert output row back to the slot `(expert, token)` of its
/// source rank, then flag each expert of this rank on every source.
pub(crate) fn send_combine(
    ctx: &CommContext,
    layout: &LowLatencyLayout,
    half: usize,
    source: CombineSource<'_>,
    handle: &LowLatencyHandle,
) -> Result<()> {
    let me = ctx.rank();
    let placement = &handle.placement;
    let num_local_experts = placement.num_local_experts();
    let region = ctx.local_region(RegionKind::Rdma)?;
    let row_bytes = layout.hidden * size_of::<f32>();
    let mut writes: Vec<Vec<(usize, Bytes)>> = vec![Vec::new(); layout.num_ranks];
    for local_expert in 0..num_local_experts {
        let expert = placement.global_expert(me, local_expert);
        for src in 0..layout.num_ranks {
            let range = handle.packed_recv_layout_range.get(local_expert, src);
            let (begin, count) = LowLatencyHandle::unpack_range(range);
            for row in begin..begin + count {
                let token = handle.packed_recv_src_info.get(local_expert, row) as usize;
                let bytes = match source {
                    CombineSource::Rows(x) => {
                        let values = x[local_expert].row(row);
                        Bytes::copy_from_slice(bytemuck::cast_slice(values))
                    }
                    CombineSource::Staged => {
                        let offset = layout.combine_send_row(half, local_expert, row);
                        Bytes::from(region.read(offset, row_bytes)?)
                    }
                };
                writes[src].push((layout.combine_row(half, expert, token), bytes));
            }
        }
    }
    for (src, src_writes) in writes.into_iter().enumerate() {
        ctx.scatter(src, RegionKind::Rdma, src_writes)?;
        for local_expert in 0..num_local_experts {
            let expert = placement.global_expert(me, local_expert);
            let offset = layout.combine_flag(half, expert);
            ctx.write(src, RegionKind::Rdma, offset, flag_bytes(1), None)?;
        }
    }
    debug!("Rank {}: low-latency combine sent on half {}", me, half);
    Ok(())
}

/// Wait for every expert's rows and reduce them with the selection weights.
pub(crate) fn recv_combine(
    ctx: &CommContext,
    layout: &LowLatencyLayout,
    half: usize,
    topk_idx: &Matrix<i64>,
    topk_weights: &Matrix<f32>,
    out: Option<Matrix<f32>>,
) -> Result<Matrix<f32>> {
    for expert in 0..layout.num_experts {
        let flag = take_flag(ctx, layout.combine_flag(half, expert))?;
        ensure_usage!(
            flag == 1,
            "low-latency combine flag of expert {} holds {}; the buffer is dirty",
            expert,
            flag
        );
    }
    let region = ctx.local_region(RegionKind::Rdma)?;
    let row_bytes = layout.hidden * size_of::<f32>();
    let mut combined = match out {
        Some(mut out) => {
            out.clear();
            out
        }
        None => Matrix::zeros(topk_idx.rows(), layout.hidden),
    };
    for token in 0..topk_idx.rows() {
        let weights = topk_weights.row(token);
        for (&selection, &weight) in topk_idx.row(token).iter().zip(weights) {
            let Ok(expert) = usize::try_from(selection) else {
                continue;
            };
            let offset = layout.combine_row(half, expert, token);
            region.with_slice(offset, row_bytes, |bytes| {
                let values: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
                for (out, value) in combined.row_mut(token).iter_mut().zip(values) {
                    *out += weight * value;
                }
            })?;
        }
    }
    Ok(combined)
}

/// Zero both halves between two barriers.
pub(crate) fn clean(ctx: &CommContext, layout: &LowLatencyLayout) -> Result<()> {
    let size = layout.size_hint();
    ctx.check_capacity(
        RegionKind::Rdma,
        (0..ctx.topology.num_ranks).map(|rank| (rank, size)),
        "low-latency buffer",
    )?;
    ctx.barrier()?;
    ctx.local_region(RegionKind::Rdma)?.fill(0, size, 0)?;
    ctx.clear_rdma_dirty();
    ctx.barrier()?;
    debug!("Rank {}: cleaned {} low-latency bytes", ctx.rank(), size);
    Ok(())
}
