//! Single-node dispatch and combine over the NVLink region.
//!
//! Region layout during a dispatch: one metadata row per source rank at
//! offset 0, then the received records ordered by source rank and source
//! token index. The combine reuses the region from offset 0 for the rows
//! coming back, one slot per token copy sent by the dispatch.

use std::sync::Arc;

use bytes::Bytes;
use fabric_lib::api::RegionKind;
use tracing::debug;

use crate::{
    config::{Config, align_up},
    context::{CommContext, ImmKind},
    error::{EpError, Result},
    handle::{CommHandle, IntranodeHandle},
    layout::RoutingPlan,
    ops::{CombineOutput, DispatchOutput},
    payload::{TokenPayload, TopkSelection},
    records::{
        CombineRowLayout, RecordHeader, RecordLayout, TopkMapping, decode_tokens,
    },
    tensor::Matrix,
};

pub(crate) const META_ALIGNMENT: usize = 128;

/// Counts published by every rank before the token writes.
struct GroupCounts {
    /// `[src][dst]`
    per_rank: Matrix<usize>,
    /// `[src][expert]`
    per_expert: Matrix<usize>,
    /// `[src][dst * num_channels + channel]`
    per_channel: Matrix<usize>,
}

impl GroupCounts {
    fn row_len(num_ranks: usize, num_experts: usize, num_channels: usize) -> usize {
        1 + num_ranks + num_experts + num_ranks * num_channels
    }

    fn parse(
        meta: &[u32],
        num_ranks: usize,
        num_experts: usize,
        num_channels: usize,
    ) -> Self {
        let row_len = Self::row_len(num_ranks, num_experts, num_channels);
        let mut per_rank = Matrix::zeros(num_ranks, num_ranks);
        let mut per_expert = Matrix::zeros(num_ranks, num_experts);
        let mut per_channel = Matrix::zeros(num_ranks, num_ranks * num_channels);
        for (src, row) in meta.chunks_exact(row_len).enumerate() {
            let (rank_counts, rest) = row[1..].split_at(num_ranks);
            let (expert_counts, channel_counts) = rest.split_at(num_experts);
            copy_counts(per_rank.row_mut(src), rank_counts);
            copy_counts(per_expert.row_mut(src), expert_counts);
            copy_counts(per_channel.row_mut(src), channel_counts);
        }
        Self { per_rank, per_expert, per_channel }
    }
}

fn copy_counts(dst: &mut [usize], src: &[u32]) {
    dst.iter_mut().zip(src).for_each(|(d, s)| *d = *s as usize);
}

/// `[src][dst]` inclusive prefix over sources.
fn rank_prefix_matrix(per_rank: &Matrix<usize>) -> Matrix<usize> {
    let mut prefix = per_rank.clone();
    for src in 1..per_rank.rows() {
        for dst in 0..per_rank.cols() {
            prefix.set(src, dst, prefix.get(src - 1, dst) + per_rank.get(src, dst));
        }
    }
    prefix
}

/// Local send order: `send_head[token][dst]` and per-channel counts.
pub(crate) fn plan_sends(
    config: &Config,
    is_token_in_rank: &Matrix<bool>,
) -> (Matrix<i64>, Matrix<usize>) {
    let (num_tokens, num_ranks) = is_token_in_rank.shape();
    let mut send_head = Matrix::filled(num_tokens, num_ranks, -1i64);
    let mut per_channel = Matrix::zeros(num_ranks, config.num_channels());
    let mut sent = vec![0usize; num_ranks];
    for token in 0..num_tokens {
        let channel = config.channel_of(token, num_tokens);
        for dst in (0..num_ranks).filter(|&dst| is_token_in_rank.get(token, dst)) {
            send_head.set(token, dst, sent[dst] as i64);
            per_channel.set(dst, channel, per_channel.get(dst, channel) + 1);
            sent[dst] += 1;
        }
    }
    (send_head, per_channel)
}

pub(crate) fn inclusive_prefix(counts: &Matrix<usize>) -> Matrix<usize> {
    let mut prefix = counts.clone();
    for row in 0..prefix.rows() {
        let mut acc = 0;
        for value in prefix.row_mut(row) {
            acc += *value;
            *value = acc;
        }
    }
    prefix
}

/// Write the records of every token sent to each rank, one channel at a
/// time, then signal every rank.
#[allow(clippy::too_many_arguments)]
fn send_records(
    ctx: &CommContext,
    config: &Config,
    layout: &RecordLayout,
    x: &TokenPayload,
    topk: Option<&TopkSelection>,
    is_token_in_rank: &Matrix<bool>,
    data_offset: usize,
    recv_offset_at: impl Fn(usize) -> usize,
) -> Result<()> {
    let me = ctx.rank();
    let stride = layout.stride();
    let (num_tokens, num_ranks) = is_token_in_rank.shape();
    for dst in 0..num_ranks {
        let base = data_offset + recv_offset_at(dst) * stride;
        let mut idx = 0;
        for channel in 0..config.num_channels() {
            let first = idx;
            let mut bytes = Vec::new();
            for token in config.channel_range(channel, num_tokens) {
                if !is_token_in_rank.get(token, dst) {
                    continue;
                }
                let header = RecordHeader {
                    src_rank: me as i32,
                    src_token_idx: token as i32,
                    ..Default::default()
                };
                layout.encode(
                    header,
                    x,
                    token,
                    topk.map(|topk| topk.idx.row(token)),
                    topk.and_then(|topk| topk.weights.as_ref()).map(|w| w.row(token)),
                    &mut bytes,
                );
                idx += 1;
            }
            ctx.write_chunked(
                dst,
                RegionKind::Nvl,
                base + first * stride,
                Bytes::from(bytes),
                stride,
                config.num_max_nvl_chunked_send_tokens,
            )?;
        }
    }
    ctx.signal_all(0..num_ranks, RegionKind::Nvl, ImmKind::DispatchNvl)?;
    ctx.wait(ImmKind::DispatchNvl, num_ranks);
    Ok(())
}

pub(crate) fn dispatch(
    ctx: &CommContext,
    config: &Config,
    x: &TokenPayload,
    plan: &RoutingPlan,
    topk: Option<&TopkSelection>,
    expert_alignment: usize,
    num_worst_tokens: usize,
) -> Result<DispatchOutput> {
    let me = ctx.rank();
    let num_ranks = ctx.topology.num_ranks;
    let num_tokens = x.num_tokens();
    let placement = &plan.placement;
    let num_experts = placement.num_experts();
    let num_channels = config.num_channels();
    let region = ctx.local_region(RegionKind::Nvl)?;

    let (send_head, channel_counts) = plan_sends(config, &plan.is_token_in_rank);

    // Count exchange.
    let row_len = GroupCounts::row_len(num_ranks, num_experts, num_channels);
    let row_bytes = row_len * size_of::<u32>();
    let meta_bytes = num_ranks * row_bytes;
    ctx.check_capacity(
        RegionKind::Nvl,
        (0..num_ranks).map(|rank| (rank, meta_bytes)),
        "dispatch metadata",
    )?;
    let mut row: Vec<u32> = Vec::with_capacity(row_len);
    row.push(num_tokens as u32);
    row.extend(plan.num_tokens_per_rank.iter().map(|&c| c as u32));
    row.extend(plan.num_tokens_per_expert.iter().map(|&c| c as u32));
    row.extend(channel_counts.as_slice().iter().map(|&c| c as u32));
    let row = Bytes::copy_from_slice(bytemuck::cast_slice(&row));
    for dst in 0..num_ranks {
        let offset = me * row_bytes;
        ctx.write(dst, RegionKind::Nvl, offset, row.clone(), Some(ImmKind::NotifyNvl))?;
    }
    ctx.wait(ImmKind::NotifyNvl, num_ranks);
    let meta =
        region.with_slice(0, meta_bytes, |b| bytemuck::pod_collect_to_vec::<u8, u32>(b))?;
    let counts = GroupCounts::parse(&meta, num_ranks, num_experts, num_channels);
    let rank_prefix = rank_prefix_matrix(&counts.per_rank);
    let num_recv_of = |rank: usize| rank_prefix.get(num_ranks - 1, rank);

    // Every rank checks every destination, so all of them fail together.
    let with_weights = topk.is_some_and(|topk| topk.weights.is_some());
    let num_topk = topk.map_or(0, TopkSelection::num_topk);
    let layout = RecordLayout::for_payload(x, num_topk, with_weights);
    let stride = layout.stride();
    let data_offset = align_up(meta_bytes, META_ALIGNMENT);
    ctx.check_capacity(
        RegionKind::Nvl,
        (0..num_ranks).map(|rank| (rank, data_offset + num_recv_of(rank) * stride)),
        "intranode dispatch",
    )?;
    let overflow = (0..num_ranks).find(|&rank| num_recv_of(rank) > num_worst_tokens);
    if num_worst_tokens > 0
        && let Some(rank) = overflow
    {
        ctx.barrier()?;
        return Err(EpError::Capacity(format!(
            "rank {} receives {} tokens, more than num_worst_tokens={}",
            rank,
            num_recv_of(rank),
            num_worst_tokens
        )));
    }

    let recv_offset = |src: usize, dst: usize| {
        if src == 0 { 0 } else { rank_prefix.get(src - 1, dst) }
    };
    send_records(
        ctx,
        config,
        &layout,
        x,
        topk,
        &plan.is_token_in_rank,
        data_offset,
        |dst| recv_offset(me, dst),
    )?;

    let num_recv_tokens = num_recv_of(me);
    let num_rows = if num_worst_tokens > 0 { num_worst_tokens } else { num_recv_tokens };
    let mapping = topk.map(|_| TopkMapping { placement, rank: me, with_weights });
    let decoded = region.with_slice(data_offset, num_recv_tokens * stride, |bytes| {
        decode_tokens(bytes, &layout, x, num_rows, mapping)
    })?;
    ctx.barrier()?;

    let mut recv_channel_prefix_matrix = Matrix::zeros(num_ranks, num_channels);
    for src in 0..num_ranks {
        let mut offset = recv_offset(src, me);
        for channel in 0..num_channels {
            recv_channel_prefix_matrix.set(src, channel, offset);
            offset += counts.per_channel.get(src, me * num_channels + channel);
        }
    }
    let num_recv_tokens_per_expert = if num_worst_tokens > 0 {
        Vec::new()
    } else {
        (0..placement.num_local_experts())
            .map(|local| {
                let expert = placement.global_expert(me, local);
                let count: usize =
                    (0..num_ranks).map(|src| counts.per_expert.get(src, expert)).sum();
                align_up(count, expert_alignment.max(1))
            })
            .collect()
    };
    debug!(
        "Rank {} received {} tokens from {} ranks (intranode)",
        me, num_recv_tokens, num_ranks
    );

    let handle = IntranodeHandle {
        num_ranks,
        num_tokens,
        num_recv_tokens,
        rank_prefix_matrix: rank_prefix,
        channel_prefix_matrix: inclusive_prefix(&channel_counts),
        recv_channel_prefix_matrix,
        recv_src_idx: decoded.headers.iter().map(|h| h.src_token_idx as usize).collect(),
        is_token_in_rank: plan.is_token_in_rank.clone(),
        send_head,
    };
    Ok(DispatchOutput {
        recv_x: decoded.recv_x,
        recv_topk_idx: decoded.recv_topk_idx,
        recv_topk_weights: decoded.recv_topk_weights,
        num_recv_tokens_per_expert,
        handle: CommHandle::Intranode(Arc::new(handle)),
    })
}

/// Replay the routing of `handle` without the count exchange.
pub(crate) fn cached_dispatch(
    ctx: &CommContext,
    config: &Config,
    x: &TokenPayload,
    handle: &Arc<IntranodeHandle>,
) -> Result<DispatchOutput> {
    let me = ctx.rank();
    let num_ranks = handle.num_ranks;
    let region = ctx.local_region(RegionKind::Nvl)?;
    let layout = RecordLayout::for_payload(x, 0, false);
    let stride = layout.stride();
    let num_recv_of = |rank: usize| handle.rank_prefix_matrix.get(num_ranks - 1, rank);
    ctx.check_capacity(
        RegionKind::Nvl,
        (0..num_ranks).map(|rank| (rank, num_recv_of(rank) * stride)),
        "cached intranode dispatch",
    )?;

    send_records(ctx, config, &layout, x, None, &handle.is_token_in_rank, 0, |dst| {
        handle.recv_offset(me, dst)
    })?;
    let decoded = region.with_slice(0, handle.num_recv_tokens * stride, |bytes| {
        decode_tokens(bytes, &layout, x, handle.num_recv_tokens, None)
    })?;
    ctx.barrier()?;

    Ok(DispatchOutput {
        recv_x: decoded.recv_x,
        recv_topk_idx: None,
        recv_topk_weights: None,
        num_recv_tokens_per_expert: Vec::new(),
        handle: CommHandle::Intranode(handle.clone()),
    })
}

/// Weight of one received copy: the sum of its local selection weights.
pub(crate) fn copy_scale(weights: Option<&Matrix<f32>>, row: usize) -> f32 {
    weights.map_or(1.0, |w| w.row(row).iter().sum())
}

pub(crate) fn scaled_row(
    x: &Matrix<f32>,
    weights: Option<&Matrix<f32>>,
    row: usize,
) -> Vec<f32> {
    let scale = copy_scale(weights, row);
    x.row(row).iter().map(|v| v * scale).collect()
}

pub(crate) fn combine(
    ctx: &CommContext,
    config: &Config,
    x: &Matrix<f32>,
    topk_weights: Option<&Matrix<f32>>,
    handle: &IntranodeHandle,
) -> Result<CombineOutput> {
    let me = ctx.rank();
    let num_ranks = handle.num_ranks;
    let region = ctx.local_region(RegionKind::Nvl)?;
    let num_topk = topk_weights.map_or(0, Matrix::cols);
    let layout = CombineRowLayout { hidden: x.cols(), num_topk };
    let stride = layout.stride();
    ctx.check_capacity(
        RegionKind::Nvl,
        (0..num_ranks).map(|rank| (rank, handle.num_sent(rank) * stride)),
        "intranode combine",
    )?;

    // Each block of received rows goes back to its source, at the slots the
    // source used when sending to us.
    for src in 0..num_ranks {
        let begin = handle.recv_offset(src, me);
        let mut bytes = Vec::new();
        for row in begin..begin + handle.count(src, me) {
            let values = scaled_row(x, topk_weights, row);
            layout.encode(&values, topk_weights.map(|w| w.row(row)), &mut bytes);
        }
        ctx.write_chunked(
            src,
            RegionKind::Nvl,
            handle.send_offset(src, me) * stride,
            Bytes::from(bytes),
            stride,
            config.num_max_nvl_chunked_send_tokens,
        )?;
    }
    ctx.signal_all(0..num_ranks, RegionKind::Nvl, ImmKind::CombineNvl)?;
    ctx.wait(ImmKind::CombineNvl, num_ranks);

    let mut combined_x = Matrix::zeros(handle.num_tokens, x.cols());
    let mut combined_weights = Matrix::zeros(handle.num_tokens, num_topk);
    region.with_slice(0, handle.num_sent(me) * stride, |bytes| {
        for token in 0..handle.num_tokens {
            for dst in 0..num_ranks {
                let Ok(head) = usize::try_from(handle.send_head.get(token, dst)) else {
                    continue;
                };
                let slot = handle.send_offset(me, dst) + head;
                layout.accumulate(
                    &bytes[slot * stride..(slot + 1) * stride],
                    combined_x.row_mut(token),
                    combined_weights.row_mut(token),
                );
            }
        }
    })?;
    ctx.barrier()?;

    Ok(CombineOutput {
        combined_x,
        combined_topk_weights: topk_weights.map(|_| combined_weights),
    })
}
