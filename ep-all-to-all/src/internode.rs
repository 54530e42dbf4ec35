//! Multi-node dispatch and combine.
//!
//! A token travels over RDMA to the rank holding the same NVLink slot on
//! every destination node, which forwards it over NVLink to the destination
//! ranks of its node. The combine walks the same path backwards, reducing
//! on the forwarder and again on the source.
//!
//! RDMA region: one metadata row per same-slot source node, then the
//! forwarded records in (source node, token) order. NVLink region: one
//! metadata row per rank of the group, then the received records in
//! (source rank, token) order.

use std::sync::Arc;

use bytes::Bytes;
use fabric_lib::api::RegionKind;
use tracing::debug;

use crate::{
    config::{Config, align_up},
    context::{CommContext, ImmKind},
    error::{Result, usage_error},
    handle::{CommHandle, InternodeHandle, SourceMeta},
    intranode::{META_ALIGNMENT, inclusive_prefix, plan_sends, scaled_row},
    layout::RoutingPlan,
    ops::{CombineOutput, DispatchOutput},
    payload::{TokenPayload, TopkSelection},
    records::{
        CombineRowLayout, DecodedTokens, RecordHeader, RecordLayout, TopkMapping,
        decode_tokens,
    },
    tensor::Matrix,
    topology::RankTopology,
};

/// Token counts of the whole group.
struct GroupCounts {
    num_tokens: Vec<usize>,
    /// `[src][dst]`
    per_rank: Matrix<usize>,
    /// `[src][node]`
    per_rdma_rank: Matrix<usize>,
    /// `[src][expert]`
    per_expert: Matrix<usize>,
}

/// Where records land on each hop, derived from the group counts.
struct HopOffsets<'a> {
    topo: &'a RankTopology,
    per_rank: &'a Matrix<usize>,
    per_rdma_rank: &'a Matrix<usize>,
}

impl HopOffsets<'_> {
    /// Records forwarded by `rank` (as the same-slot rank of its node).
    fn num_rdma_recv(&self, rank: usize) -> usize {
        let (node, slot) = (self.topo.rdma_rank_of(rank), self.topo.nvl_rank_of(rank));
        (0..self.topo.num_rdma_ranks)
            .map(|c| self.per_rdma_rank.get(self.topo.global_rank(c, slot), node))
            .sum()
    }

    /// First forwarding slot of `src` on its same-slot rank of `node`.
    fn rdma_recv_offset(&self, src: usize, node: usize) -> usize {
        let (src_node, slot) = (self.topo.rdma_rank_of(src), self.topo.nvl_rank_of(src));
        (0..src_node)
            .map(|c| self.per_rdma_rank.get(self.topo.global_rank(c, slot), node))
            .sum()
    }

    fn num_recv(&self, rank: usize) -> usize {
        (0..self.per_rank.rows()).map(|src| self.per_rank.get(src, rank)).sum()
    }

    /// First receive row of `src` on `dst`.
    fn recv_offset(&self, src: usize, dst: usize) -> usize {
        (0..src).map(|s| self.per_rank.get(s, dst)).sum()
    }

    /// Tokens the forwarder `forwarder` hands to `dst` on its node.
    fn num_forwarded(&self, forwarder: usize, dst: usize) -> usize {
        let slot = self.topo.nvl_rank_of(forwarder);
        (0..self.topo.num_rdma_ranks)
            .map(|c| self.per_rank.get(self.topo.global_rank(c, slot), dst))
            .sum()
    }

    /// Exclusive prefix over the local ranks of the forwarding counts of
    /// `forwarder`; the combine slots of its node are laid out this way.
    fn forward_prefix(&self, forwarder: usize) -> Vec<usize> {
        let node = self.topo.rdma_rank_of(forwarder);
        let mut acc = 0;
        (0..self.topo.num_nvl_peers)
            .map(|slot| {
                let begin = acc;
                acc += self.num_forwarded(forwarder, self.topo.global_rank(node, slot));
                begin
            })
            .collect()
    }

    fn num_combine_slots(&self, forwarder: usize) -> usize {
        let node = self.topo.rdma_rank_of(forwarder);
        (0..self.topo.num_nvl_peers)
            .map(|slot| self.num_forwarded(forwarder, self.topo.global_rank(node, slot)))
            .sum()
    }
}

/// State produced by moving the records over both hops.
struct Hops {
    decoded: DecodedTokens,
    rdma_headers: Vec<RecordHeader>,
    send_rdma_head: Matrix<i64>,
    send_nvl_head: Matrix<i64>,
    rdma_channel_counts: Matrix<usize>,
}

fn nvl_mask(
    topo: &RankTopology,
    is_token_in_rank: &Matrix<bool>,
    token: usize,
    node: usize,
) -> u32 {
    (0..topo.num_nvl_peers)
        .filter(|&slot| is_token_in_rank.get(token, topo.global_rank(node, slot)))
        .fold(0u32, |mask, slot| mask | (1 << slot))
}

#[allow(clippy::too_many_arguments)]
fn transfer_records(
    ctx: &CommContext,
    config: &Config,
    layout: &RecordLayout,
    x: &TokenPayload,
    topk: Option<TopkMapping<'_>>,
    topk_src: Option<&TopkSelection>,
    is_token_in_rank: &Matrix<bool>,
    offsets: &HopOffsets<'_>,
    rdma_data_offset: usize,
    nvl_data_offset: usize,
) -> Result<Hops> {
    let topo = &ctx.topology;
    let me = topo.rank;
    let stride = layout.stride();
    let num_tokens = x.num_tokens();
    let num_nodes = topo.num_rdma_ranks;

    // Hop 1: every token once to each destination node.
    let mut send_rdma_head = Matrix::filled(num_tokens, num_nodes, -1i64);
    let mut rdma_channel_counts = Matrix::zeros(num_nodes, config.num_channels());
    for node in 0..num_nodes {
        let dst = topo.global_rank(node, topo.nvl_rank);
        let base = rdma_data_offset + offsets.rdma_recv_offset(me, node) * stride;
        let mut idx = 0usize;
        for channel in 0..config.num_channels() {
            let first = idx;
            let mut bytes = Vec::new();
            for token in config.channel_range(channel, num_tokens) {
                let mask = nvl_mask(topo, is_token_in_rank, token, node);
                if mask == 0 {
                    continue;
                }
                let header = RecordHeader {
                    src_rank: me as i32,
                    src_token_idx: token as i32,
                    aux0: mask as i32,
                    aux1: idx as i32,
                };
                layout.encode(
                    header,
                    x,
                    token,
                    topk_src.map(|topk| topk.idx.row(token)),
                    topk_src.and_then(|topk| topk.weights.as_ref()).map(|w| w.row(token)),
                    &mut bytes,
                );
                send_rdma_head.set(token, node, idx as i64);
                idx += 1;
            }
            rdma_channel_counts.set(node, channel, idx - first);
            ctx.write_chunked(
                dst,
                RegionKind::Rdma,
                base + first * stride,
                Bytes::from(bytes),
                stride,
                config.num_max_rdma_chunked_send_tokens,
            )?;
        }
    }
    let same_slot: Vec<usize> = topo.same_slot_peers().collect();
    ctx.signal_all(same_slot.iter().copied(), RegionKind::Rdma, ImmKind::DispatchRdma)?;
    ctx.wait(ImmKind::DispatchRdma, num_nodes);

    // Hop 2: fan the forwarded records out to the local destinations.
    let num_rdma_recv = offsets.num_rdma_recv(me);
    let forwarded = ctx
        .local_region(RegionKind::Rdma)?
        .read(rdma_data_offset, num_rdma_recv * stride)?;
    let num_local = topo.num_nvl_peers;
    let forward_prefix = offsets.forward_prefix(me);
    let mut send_nvl_head = Matrix::filled(num_rdma_recv, num_local, -1i64);
    let mut forward_count = vec![0usize; num_local];
    let mut from_src_count = vec![0usize; num_local];
    let mut current_src = None;
    let mut writes: Vec<Vec<(usize, Bytes)>> = vec![Vec::new(); num_local];
    let mut rdma_headers = Vec::with_capacity(num_rdma_recv);
    for (j, record) in forwarded.chunks_exact(stride).enumerate() {
        let header = layout.header(record);
        rdma_headers.push(header);
        let src = header.src_rank as usize;
        if current_src != Some(src) {
            current_src = Some(src);
            from_src_count.fill(0);
        }
        for slot in (0..num_local).filter(|slot| header.aux0 & (1 << slot) != 0) {
            let dst = topo.global_rank(topo.rdma_rank, slot);
            let position = offsets.recv_offset(src, dst) + from_src_count[slot];
            from_src_count[slot] += 1;
            let head = forward_count[slot];
            forward_count[slot] += 1;
            send_nvl_head.set(j, slot, head as i64);

            let mut out = record.to_vec();
            layout.set_header(
                &mut out,
                RecordHeader {
                    src_rank: header.src_rank,
                    src_token_idx: header.src_token_idx,
                    aux0: (forward_prefix[slot] + head) as i32,
                    aux1: 0,
                },
            );
            writes[slot].push((nvl_data_offset + position * stride, Bytes::from(out)));
        }
    }
    for (slot, slot_writes) in writes.into_iter().enumerate() {
        let dst = topo.global_rank(topo.rdma_rank, slot);
        ctx.scatter(dst, RegionKind::Nvl, slot_writes)?;
    }
    ctx.signal_all(topo.node_peers(), RegionKind::Nvl, ImmKind::DispatchNvl)?;
    ctx.wait(ImmKind::DispatchNvl, num_local);

    let num_recv = offsets.num_recv(me);
    let decoded = ctx.local_region(RegionKind::Nvl)?.with_slice(
        nvl_data_offset,
        num_recv * stride,
        |bytes| decode_tokens(bytes, layout, x, num_recv, topk),
    )?;
    Ok(Hops { decoded, rdma_headers, send_rdma_head, send_nvl_head, rdma_channel_counts })
}

fn channel_prefix(
    config: &Config,
    headers: &[RecordHeader],
    num_rows: usize,
    row_of: impl Fn(usize) -> usize,
    num_tokens: &[usize],
) -> Matrix<usize> {
    let mut counts = Matrix::zeros(num_rows, config.num_channels());
    for header in headers {
        let src = header.src_rank as usize;
        let row = row_of(src);
        let channel = config.channel_of(header.src_token_idx as usize, num_tokens[src]);
        counts.set(row, channel, counts.get(row, channel) + 1);
    }
    inclusive_prefix(&counts)
}

fn inclusive_sum(counts: impl Iterator<Item = usize>) -> Vec<usize> {
    counts
        .scan(0, |acc, count| {
            *acc += count;
            Some(*acc)
        })
        .collect()
}

pub(crate) fn dispatch(
    ctx: &CommContext,
    config: &Config,
    x: &TokenPayload,
    plan: &RoutingPlan,
    topk: Option<&TopkSelection>,
    expert_alignment: usize,
) -> Result<DispatchOutput> {
    let topo = &ctx.topology;
    let me = topo.rank;
    let (num_ranks, num_nodes, num_local) =
        (topo.num_ranks, topo.num_rdma_ranks, topo.num_nvl_peers);
    let placement = &plan.placement;
    let num_experts = placement.num_experts();
    let num_tokens = x.num_tokens();
    let Some(per_rdma_rank) = plan.num_tokens_per_rdma_rank.as_ref() else {
        return Err(usage_error!(
            "internode dispatch needs a layout with per-node token counts"
        ));
    };

    // Count exchange: to the same-slot ranks over RDMA, then to the node
    // over NVLink, after which every rank knows the counts of the group.
    let row_len = 1 + num_ranks + num_nodes + num_experts;
    let row_bytes = row_len * size_of::<u32>();
    let rdma_meta_bytes = num_nodes * row_bytes;
    let nvl_meta_bytes = num_ranks * row_bytes;
    ctx.check_capacity(
        RegionKind::Rdma,
        (0..num_ranks).map(|rank| (rank, rdma_meta_bytes)),
        "dispatch metadata",
    )?;
    ctx.check_capacity(
        RegionKind::Nvl,
        (0..num_ranks).map(|rank| (rank, nvl_meta_bytes)),
        "dispatch metadata",
    )?;
    let mut row: Vec<u32> = Vec::with_capacity(row_len);
    row.push(num_tokens as u32);
    row.extend(plan.num_tokens_per_rank.iter().map(|&c| c as u32));
    row.extend(per_rdma_rank.iter().map(|&c| c as u32));
    row.extend(plan.num_tokens_per_expert.iter().map(|&c| c as u32));
    let row = Bytes::copy_from_slice(bytemuck::cast_slice(&row));
    for dst in topo.same_slot_peers() {
        let offset = topo.rdma_rank * row_bytes;
        ctx.write(dst, RegionKind::Rdma, offset, row.clone(), Some(ImmKind::NotifyRdma))?;
    }
    ctx.wait(ImmKind::NotifyRdma, num_nodes);
    let node_rows = ctx.local_region(RegionKind::Rdma)?.read(0, rdma_meta_bytes)?;
    let node_rows = Bytes::from(node_rows);
    for dst in topo.node_peers() {
        let offset = topo.nvl_rank * rdma_meta_bytes;
        let imm = Some(ImmKind::NotifyNvl);
        ctx.write(dst, RegionKind::Nvl, offset, node_rows.clone(), imm)?;
    }
    ctx.wait(ImmKind::NotifyNvl, num_local);
    let meta = ctx
        .local_region(RegionKind::Nvl)?
        .with_slice(0, nvl_meta_bytes, |b| bytemuck::pod_collect_to_vec::<u8, u32>(b))?;

    let mut counts = GroupCounts {
        num_tokens: vec![0; num_ranks],
        per_rank: Matrix::zeros(num_ranks, num_ranks),
        per_rdma_rank: Matrix::zeros(num_ranks, num_nodes),
        per_expert: Matrix::zeros(num_ranks, num_experts),
    };
    for (index, row) in meta.chunks_exact(row_len).enumerate() {
        // Row `slot * num_nodes + node` holds rank (node, slot).
        let src = topo.global_rank(index % num_nodes, index / num_nodes);
        let (rank_counts, rest) = row[1..].split_at(num_ranks);
        let (node_counts, expert_counts) = rest.split_at(num_nodes);
        counts.num_tokens[src] = row[0] as usize;
        let fill = |dst: &mut [usize], src: &[u32]| {
            dst.iter_mut().zip(src).for_each(|(d, s)| *d = *s as usize)
        };
        fill(counts.per_rank.row_mut(src), rank_counts);
        fill(counts.per_rdma_rank.row_mut(src), node_counts);
        fill(counts.per_expert.row_mut(src), expert_counts);
    }

    let with_weights = topk.is_some_and(|topk| topk.weights.is_some());
    let num_topk = topk.map_or(0, TopkSelection::num_topk);
    let layout = RecordLayout::for_payload(x, num_topk, with_weights);
    let stride = layout.stride();
    let offsets = HopOffsets {
        topo,
        per_rank: &counts.per_rank,
        per_rdma_rank: &counts.per_rdma_rank,
    };
    let rdma_data_offset = align_up(rdma_meta_bytes, META_ALIGNMENT);
    let nvl_data_offset = align_up(nvl_meta_bytes, META_ALIGNMENT);
    ctx.check_capacity(
        RegionKind::Rdma,
        (0..num_ranks)
            .map(|rank| (rank, rdma_data_offset + offsets.num_rdma_recv(rank) * stride)),
        "internode dispatch",
    )?;
    ctx.check_capacity(
        RegionKind::Nvl,
        (0..num_ranks)
            .map(|rank| (rank, nvl_data_offset + offsets.num_recv(rank) * stride)),
        "internode dispatch",
    )?;

    ctx.mark_rdma_dirty();
    let mapping = topk.map(|_| TopkMapping { placement, rank: me, with_weights });
    let hops = transfer_records(
        ctx,
        config,
        &layout,
        x,
        mapping,
        topk,
        &plan.is_token_in_rank,
        &offsets,
        rdma_data_offset,
        nvl_data_offset,
    )?;
    ctx.barrier()?;

    let (_, gbl_channel_counts) = plan_sends(config, &plan.is_token_in_rank);
    let num_recv_tokens = offsets.num_recv(me);
    let num_recv_tokens_per_expert = (0..placement.num_local_experts())
        .map(|local| {
            let expert = placement.global_expert(me, local);
            let count: usize =
                (0..num_ranks).map(|src| counts.per_expert.get(src, expert)).sum();
            align_up(count, expert_alignment.max(1))
        })
        .collect();
    debug!(
        "Rank {} forwarded {} and received {} tokens (internode)",
        me,
        hops.rdma_headers.len(),
        num_recv_tokens
    );

    let handle = InternodeHandle {
        num_ranks,
        num_rdma_ranks: num_nodes,
        num_tokens,
        num_recv_tokens,
        is_token_in_rank: plan.is_token_in_rank.clone(),
        rdma_channel_prefix_matrix: inclusive_prefix(&hops.rdma_channel_counts),
        gbl_channel_prefix_matrix: inclusive_prefix(&gbl_channel_counts),
        recv_rdma_channel_prefix_matrix: channel_prefix(
            config,
            &hops.rdma_headers,
            num_nodes,
            |src| topo.rdma_rank_of(src),
            &counts.num_tokens,
        ),
        recv_rdma_rank_prefix_sum: inclusive_sum((0..num_nodes).map(|node| {
            let src = topo.global_rank(node, topo.nvl_rank);
            counts.per_rdma_rank.get(src, topo.rdma_rank)
        })),
        recv_gbl_channel_prefix_matrix: channel_prefix(
            config,
            &hops.decoded.headers,
            num_ranks,
            |src| src,
            &counts.num_tokens,
        ),
        recv_gbl_rank_prefix_sum: inclusive_sum(
            (0..num_ranks).map(|src| counts.per_rank.get(src, me)),
        ),
        recv_src_meta: source_meta(&hops.decoded.headers, |h| h.aux0),
        rdma_recv_src_meta: source_meta(&hops.rdma_headers, |h| h.aux1),
        send_rdma_head: hops.send_rdma_head,
        send_nvl_head: hops.send_nvl_head,
        num_tokens_per_rank_matrix: counts.per_rank,
        num_tokens_per_rdma_rank_matrix: counts.per_rdma_rank,
    };
    Ok(DispatchOutput {
        recv_x: hops.decoded.recv_x,
        recv_topk_idx: hops.decoded.recv_topk_idx,
        recv_topk_weights: hops.decoded.recv_topk_weights,
        num_recv_tokens_per_expert,
        handle: CommHandle::Internode(Arc::new(handle)),
    })
}

fn source_meta(
    headers: &[RecordHeader],
    slot: impl Fn(&RecordHeader) -> i32,
) -> Vec<SourceMeta> {
    headers
        .iter()
        .map(|h| SourceMeta {
            src_rank: h.src_rank as usize,
            src_token_idx: h.src_token_idx as usize,
            slot: slot(h) as usize,
        })
        .collect()
}

/// Replay the routing of `handle` without the count exchange.
pub(crate) fn cached_dispatch(
    ctx: &CommContext,
    config: &Config,
    x: &TokenPayload,
    handle: &Arc<InternodeHandle>,
) -> Result<DispatchOutput> {
    let topo = &ctx.topology;
    let layout = RecordLayout::for_payload(x, 0, false);
    let stride = layout.stride();
    let offsets = HopOffsets {
        topo,
        per_rank: &handle.num_tokens_per_rank_matrix,
        per_rdma_rank: &handle.num_tokens_per_rdma_rank_matrix,
    };
    ctx.check_capacity(
        RegionKind::Rdma,
        (0..topo.num_ranks).map(|rank| (rank, offsets.num_rdma_recv(rank) * stride)),
        "cached internode dispatch",
    )?;
    ctx.check_capacity(
        RegionKind::Nvl,
        (0..topo.num_ranks).map(|rank| (rank, offsets.num_recv(rank) * stride)),
        "cached internode dispatch",
    )?;

    ctx.mark_rdma_dirty();
    let hops = transfer_records(
        ctx,
        config,
        &layout,
        x,
        None,
        None,
        &handle.is_token_in_rank,
        &offsets,
        0,
        0,
    )?;
    ctx.barrier()?;

    Ok(DispatchOutput {
        recv_x: hops.decoded.recv_x,
        recv_topk_idx: None,
        recv_topk_weights: None,
        num_recv_tokens_per_expert: Vec::new(),
        handle: CommHandle::Internode(handle.clone()),
    })
}

pub(crate) fn combine(
    ctx: &CommContext,
    config: &Config,
    x: &Matrix<f32>,
    topk_weights: Option<&Matrix<f32>>,
    handle: &InternodeHandle,
) -> Result<CombineOutput> {
    let topo = &ctx.topology;
    let me = topo.rank;
    let num_topk = topk_weights.map_or(0, Matrix::cols);
    let layout = CombineRowLayout { hidden: x.cols(), num_topk };
    let stride = layout.stride();
    let offsets = HopOffsets {
        topo,
        per_rank: &handle.num_tokens_per_rank_matrix,
        per_rdma_rank: &handle.num_tokens_per_rdma_rank_matrix,
    };
    ctx.check_capacity(
        RegionKind::Nvl,
        (0..topo.num_ranks).map(|rank| (rank, offsets.num_combine_slots(rank) * stride)),
        "internode combine",
    )?;
    ctx.check_capacity(
        RegionKind::Rdma,
        (0..topo.num_ranks).map(|rank| (rank, handle.num_rdma_sent(rank) * stride)),
        "internode combine",
    )?;
    ctx.mark_rdma_dirty();

    // Hop 1 backwards: every received row to the forwarder it came from.
    let mut writes: Vec<Vec<(usize, Bytes)>> = vec![Vec::new(); topo.num_nvl_peers];
    for (row, meta) in handle.recv_src_meta.iter().enumerate() {
        let forwarder_slot = topo.nvl_rank_of(meta.src_rank);
        let mut bytes = Vec::with_capacity(stride);
        let values = scaled_row(x, topk_weights, row);
        layout.encode(&values, topk_weights.map(|w| w.row(row)), &mut bytes);
        writes[forwarder_slot].push((meta.slot * stride, Bytes::from(bytes)));
    }
    for (slot, slot_writes) in writes.into_iter().enumerate() {
        let dst = topo.global_rank(topo.rdma_rank, slot);
        ctx.scatter(dst, RegionKind::Nvl, slot_writes)?;
    }
    ctx.signal_all(topo.node_peers(), RegionKind::Nvl, ImmKind::CombineNvl)?;
    ctx.wait(ImmKind::CombineNvl, topo.num_nvl_peers);

    // Reduce per forwarded token and send the partial sums to the sources.
    let forward_prefix = offsets.forward_prefix(me);
    let mut writes: Vec<Vec<(usize, Bytes)>> = vec![Vec::new(); topo.num_rdma_ranks];
    ctx.local_region(RegionKind::Nvl)?.with_slice(
        0,
        offsets.num_combine_slots(me) * stride,
        |bytes| {
            for (j, meta) in handle.rdma_recv_src_meta.iter().enumerate() {
                let mut values = vec![0f32; x.cols()];
                let mut weights = vec![0f32; num_topk];
                for slot in 0..topo.num_nvl_peers {
                    let head = handle.send_nvl_head.get(j, slot);
                    let Ok(head) = usize::try_from(head) else {
                        continue;
                    };
                    let at = (forward_prefix[slot] + head) * stride;
                    layout.accumulate(&bytes[at..at + stride], &mut values, &mut weights);
                }
                let mut out = Vec::with_capacity(stride);
                layout.encode(&values, Some(&weights), &mut out);
                let src_slot =
                    handle.rdma_send_offset(meta.src_rank, topo.rdma_rank) + meta.slot;
                let node = topo.rdma_rank_of(meta.src_rank);
                writes[node].push((src_slot * stride, Bytes::from(out)));
            }
        },
    )?;
    for (node, node_writes) in writes.into_iter().enumerate() {
        let dst = topo.global_rank(node, topo.nvl_rank);
        ctx.scatter(dst, RegionKind::Rdma, node_writes)?;
    }
    let same_slot: Vec<usize> = topo.same_slot_peers().collect();
    ctx.signal_all(same_slot, RegionKind::Rdma, ImmKind::CombineRdma)?;
    ctx.wait(ImmKind::CombineRdma, topo.num_rdma_ranks);

    // Reduce the per-node partial sums of every local token.
    let mut combined_x = Matrix::zeros(handle.num_tokens, x.cols());
    let mut combined_weights = Matrix::zeros(handle.num_tokens, num_topk);
    ctx.local_region(RegionKind::Rdma)?.with_slice(
        0,
        handle.num_rdma_sent(me) * stride,
        |bytes| {
            for token in 0..handle.num_tokens {
                for node in 0..topo.num_rdma_ranks {
                    let Ok(head) = usize::try_from(handle.send_rdma_head.get(token, node))
                    else {
                        continue;
                    };
                    let at = (handle.rdma_send_offset(me, node) + head) * stride;
                    layout.accumulate(
                        &bytes[at..at + stride],
                        combined_x.row_mut(token),
                        combined_weights.row_mut(token),
                    );
                }
            }
        },
    )?;
    ctx.barrier()?;

    Ok(CombineOutput {
        combined_x,
        combined_topk_weights: topk_weights.map(|_| combined_weights),
    })
}
