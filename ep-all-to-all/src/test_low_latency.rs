use std::sync::Arc;

use crate::{
    buffer::{Buffer, BufferOptions},
    error::EpError,
    event::EventHandle,
    handle::{CommHandle, LowLatencyHandle},
    ops::{
        DispatchRequest, ExpertLoadCounter, LowLatencyCombineRequest,
        LowLatencyDispatchOutput, LowLatencyDispatchRequest,
    },
    payload::TokenPayload,
    placement::{ExpertPlacement, PlacementStrategy},
    quant::{dequantize, unpack_ue8m0},
    tensor::Matrix,
    testing::{
        RDMA_BYTES, low_latency_options, normal_options, run_group, selection,
        token_states, topk_indices, topk_weights,
    },
};

const NUM_RANKS: usize = 4;
const NUM_EXPERTS: usize = 8;
const NUM_TOPK: usize = 2;
const HIDDEN: usize = 128;
const NUM_MAX_TOKENS: usize = 8;
const NUM_TOKENS: usize = 6;

fn indices(rank: usize) -> Matrix<i64> {
    topk_indices(rank, NUM_TOKENS, NUM_TOPK, NUM_EXPERTS)
}

fn request(rank: usize) -> LowLatencyDispatchRequest {
    let x = token_states(rank, NUM_TOKENS, HIDDEN);
    LowLatencyDispatchRequest::new(x, indices(rank), NUM_MAX_TOKENS, NUM_EXPERTS)
}

fn ll_dispatch(
    buffer: &Buffer,
    request: LowLatencyDispatchRequest,
) -> LowLatencyDispatchOutput {
    buffer.low_latency_dispatch(request).unwrap().await_completion().unwrap()
}

fn identity_outputs(dispatched: &LowLatencyDispatchOutput) -> Vec<Matrix<f32>> {
    dispatched.recv_x.iter().map(|x| x.as_f32().unwrap().clone()).collect()
}

/// Identity experts: every expert returns its inputs unchanged.
fn ll_round_trip(buffer: &Buffer) -> Matrix<f32> {
    let me = buffer.rank();
    let dispatched = ll_dispatch(buffer, request(me));
    let x = identity_outputs(&dispatched);
    let idx = indices(me);
    let weights = topk_weights(&idx);
    let request = LowLatencyCombineRequest::new(x, idx, weights, dispatched.handle);
    buffer.low_latency_combine(request).unwrap().await_completion().unwrap().combined_x
}

/// `(src rank, src token)` of every token `local_expert` of `rank` receives.
fn expected_sources(rank: usize, local_expert: usize) -> Vec<(usize, usize)> {
    let placement = ExpertPlacement::linear(NUM_EXPERTS, NUM_RANKS).unwrap();
    let expert = placement.global_expert(rank, local_expert) as i64;
    let mut sources = Vec::new();
    for src in 0..NUM_RANKS {
        let idx = indices(src);
        for token in 0..NUM_TOKENS {
            if idx.row(token).contains(&expert) {
                sources.push((src, token));
            }
        }
    }
    sources
}

fn check_combined(rank: usize, combined: &Matrix<f32>) {
    let x = token_states(rank, NUM_TOKENS, HIDDEN);
    let weights = topk_weights(&indices(rank));
    assert_eq!(combined.shape(), (NUM_TOKENS, HIDDEN));
    for token in 0..NUM_TOKENS {
        let factor: f32 = weights.row(token).iter().sum();
        for (value, original) in combined.row(token).iter().zip(x.row(token)) {
            assert!((value - original * factor).abs() < 1e-3, "token {token}");
        }
    }
}

#[test]
fn test_size_hint() {
    let size = Buffer::get_low_latency_rdma_size_hint(NUM_MAX_TOKENS, HIDDEN, 4, 8);
    assert_eq!(size % 128, 0);
    assert!(size <= RDMA_BYTES);
    let larger = Buffer::get_low_latency_rdma_size_hint(2 * NUM_MAX_TOKENS, HIDDEN, 4, 8);
    assert!(larger > size);
}

#[test]
fn test_dispatch_combine_round_trip() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let dispatched = ll_dispatch(&buffer, request(buffer.rank()));
        let x = identity_outputs(&dispatched);
        let idx = indices(buffer.rank());
        let weights = topk_weights(&idx);
        let handle = dispatched.handle.clone();
        let request = LowLatencyCombineRequest::new(x, idx, weights, handle);
        let combined = buffer.low_latency_combine(request).unwrap();
        (dispatched, combined.await_completion().unwrap().combined_x)
    });

    for (me, (dispatched, combined)) in results.iter().enumerate() {
        let CommHandle::LowLatency(handle) = &dispatched.handle else {
            panic!("expected a low-latency handle");
        };
        assert_eq!(dispatched.recv_x.len(), 2);
        for (local_expert, recv_x) in dispatched.recv_x.iter().enumerate() {
            let sources = expected_sources(me, local_expert);
            let recv_x = recv_x.as_f32().unwrap();
            assert_eq!(recv_x.shape(), (NUM_RANKS * NUM_MAX_TOKENS, HIDDEN));
            assert_eq!(dispatched.recv_count[local_expert], sources.len());
            for (row, &(src, token)) in sources.iter().enumerate() {
                let sent = token_states(src, NUM_TOKENS, HIDDEN);
                assert_eq!(recv_x.row(row), sent.row(token));
                let src_token = handle.packed_recv_src_info.get(local_expert, row);
                assert_eq!(src_token as usize, token);
            }
            let mut begin = 0;
            for src in 0..NUM_RANKS {
                let range = handle.packed_recv_layout_range.get(local_expert, src);
                let count = sources.iter().filter(|(s, _)| *s == src).count();
                assert_eq!(LowLatencyHandle::unpack_range(range), (begin, count));
                begin += count;
            }
        }
        check_combined(me, combined);
    }
}

#[test]
fn test_fp8_dispatch() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let mut request = request(buffer.rank());
        request.use_fp8 = true;
        request.round_scale = buffer.rank() % 2 == 0;
        ll_dispatch(&buffer, request)
    });
    for (me, dispatched) in results.iter().enumerate() {
        for (local_expert, recv_x) in dispatched.recv_x.iter().enumerate() {
            let TokenPayload::Fp8 { data, scales } = recv_x else {
                panic!("expected an FP8 payload");
            };
            assert_eq!(scales.cols(), 1);
            let restored = dequantize(data, scales);
            let sources = expected_sources(me, local_expert);
            for (row, &(src, token)) in sources.iter().enumerate() {
                let sent = token_states(src, NUM_TOKENS, HIDDEN);
                for (value, original) in restored.row(row).iter().zip(sent.row(token)) {
                    let tolerance = original.abs() / 16.0 + 1e-3;
                    let error = (value - original).abs();
                    assert!(error <= tolerance, "{value} vs {original}");
                }
            }
        }
    }
}

#[test]
fn test_ue8m0_scales() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let mut request = request(buffer.rank());
        request.use_fp8 = true;
        request.round_scale = true;
        request.use_ue8m0 = true;
        ll_dispatch(&buffer, request)
    });
    for (me, dispatched) in results.iter().enumerate() {
        for (local_expert, recv_x) in dispatched.recv_x.iter().enumerate() {
            let TokenPayload::Fp8Ue8m0 { data, scales } = recv_x else {
                panic!("expected packed UE8M0 scales");
            };
            assert_eq!(scales.cols(), 1);
            let restored = recv_x.to_f32();
            let sources = expected_sources(me, local_expert);
            for (row, &(src, token)) in sources.iter().enumerate() {
                let scale = unpack_ue8m0(scales.row(row), 1)[0];
                assert_eq!(scale.log2().fract(), 0.0, "scale {scale}");
                assert_eq!(data.row(row).len(), HIDDEN);
                let sent = token_states(src, NUM_TOKENS, HIDDEN);
                for (value, original) in restored.row(row).iter().zip(sent.row(token)) {
                    let tolerance = original.abs() / 16.0 + 1e-3;
                    let error = (value - original).abs();
                    assert!(error <= tolerance, "{value} vs {original}");
                }
            }
        }
    }
}

#[test]
fn test_zero_copy_combine_into_out() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let me = buffer.rank();
        let dispatched = ll_dispatch(&buffer, request(me));
        let outputs = identity_outputs(&dispatched);
        buffer
            .with_next_low_latency_combine_buffer(&dispatched.handle, |staged| {
                assert_eq!(staged.num_local_experts(), 2);
                assert_eq!(staged.rows_per_expert(), NUM_RANKS * NUM_MAX_TOKENS);
                for (local_expert, x) in outputs.iter().enumerate() {
                    staged.copy_expert(local_expert, x)?;
                }
                Ok::<_, EpError>(())
            })
            .unwrap()
            .unwrap();

        let idx = indices(me);
        let weights = topk_weights(&idx);
        let mut request =
            LowLatencyCombineRequest::new(Vec::new(), idx, weights, dispatched.handle);
        request.zero_copy = true;
        request.out = Some(Matrix::filled(NUM_TOKENS, HIDDEN, 7.0));
        let combined = buffer.low_latency_combine(request).unwrap();
        combined.await_completion().unwrap().combined_x
    });
    for (me, combined) in results.iter().enumerate() {
        check_combined(me, combined);
    }
}

#[test]
fn test_recv_hook_does_not_wait_for_send() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let me = buffer.rank();
        // Jobs submitted after the layout stay queued until the gate opens.
        let gate = EventHandle::new();
        let (strategy, after) = (PlacementStrategy::Linear, Some(gate.clone()));
        let layout = buffer
            .get_dispatch_layout(indices(me), NUM_EXPERTS, strategy, after, true)
            .unwrap();
        let mut request = request(me);
        request.return_recv_hook = true;
        let pending = buffer.low_latency_dispatch(request).unwrap();
        let send_ran = pending.event().event().is_some_and(EventHandle::query);
        gate.complete();
        layout.await_completion().unwrap();
        (send_ran, pending.await_completion().unwrap().recv_count)
    });
    for (me, (send_ran, recv_count)) in results.iter().enumerate() {
        assert!(!send_ran);
        for (local_expert, &count) in recv_count.iter().enumerate() {
            assert_eq!(count, expected_sources(me, local_expert).len());
        }
    }
}

#[test]
fn test_recv_hook_defers_receive() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let me = buffer.rank();
        let mut dispatch_request = request(me);
        dispatch_request.return_recv_hook = true;
        let pending = buffer.low_latency_dispatch(dispatch_request).unwrap();
        assert!(pending.is_deferred());
        assert!(!pending.is_complete());
        let dispatched = pending.await_completion().unwrap();

        let x = identity_outputs(&dispatched);
        let idx = indices(me);
        let weights = topk_weights(&idx);
        let mut combine_request =
            LowLatencyCombineRequest::new(x, idx, weights, dispatched.handle.clone());
        combine_request.return_recv_hook = true;
        let pending = buffer.low_latency_combine(combine_request).unwrap();
        assert!(pending.is_deferred());
        pending.await_completion().unwrap().combined_x
    });
    for (me, combined) in results.iter().enumerate() {
        check_combined(me, combined);
    }
}

#[test]
fn test_cumulative_stats() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let stats = Arc::new(ExpertLoadCounter::new(2));
        let mut counts = vec![0u64; 2];
        for _ in 0..3 {
            let mut request = request(buffer.rank());
            request.cumulative_local_expert_recv_stats = Some(stats.clone());
            let dispatched = ll_dispatch(&buffer, request);
            for (count, &received) in counts.iter_mut().zip(&dispatched.recv_count) {
                *count += received as u64;
            }
        }
        (stats.snapshot(), counts)
    });
    for (snapshot, counts) in results {
        assert_eq!(snapshot, counts);
    }
}

#[test]
fn test_at_most_two_live_results() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let me = buffer.rank();
        let first = ll_dispatch(&buffer, request(me));
        let second = ll_dispatch(&buffer, request(me));
        assert_eq!((first.lease.half(), second.lease.half()), (0, 1));
        let third = buffer.low_latency_dispatch(request(me)).err();
        drop(first);
        drop(second);
        (third, ll_round_trip(&buffer))
    });
    for (me, (third, combined)) in results.iter().enumerate() {
        assert!(matches!(third, Some(EpError::Usage(_))), "{third:?}");
        check_combined(me, combined);
    }
}

#[test]
fn test_clean_after_normal_traffic() {
    let num_ranks = 16;
    let num_experts = 32;
    let options = BufferOptions { low_latency_mode: true, ..normal_options() };
    let results = run_group(num_ranks, &options, |buffer| {
        let me = buffer.rank();
        let idx = topk_indices(me, NUM_TOKENS, NUM_TOPK, num_experts);
        let topk = selection(idx.clone(), false);
        let strategy = PlacementStrategy::Linear;
        let plan = buffer
            .get_dispatch_layout(idx.clone(), num_experts, strategy, None, false)
            .unwrap()
            .await_completion()
            .unwrap();
        let x = TokenPayload::F32(token_states(me, NUM_TOKENS, HIDDEN));
        let request = DispatchRequest::new(x, plan, Some(topk));
        buffer.dispatch(request).unwrap().await_completion().unwrap();
        let dirty = buffer.is_low_latency_dirty();

        buffer.clean_low_latency_buffer(NUM_MAX_TOKENS, HIDDEN, num_experts).unwrap();
        let cleaned = !buffer.is_low_latency_dirty();

        let x = token_states(me, NUM_TOKENS, HIDDEN);
        let request =
            LowLatencyDispatchRequest::new(x, idx.clone(), NUM_MAX_TOKENS, num_experts);
        let dispatched = ll_dispatch(&buffer, request);
        let x = identity_outputs(&dispatched);
        let weights = topk_weights(&idx);
        let handle = dispatched.handle;
        let request = LowLatencyCombineRequest::new(x, idx, weights.clone(), handle);
        let combined = buffer.low_latency_combine(request).unwrap();
        (dirty, cleaned, combined.await_completion().unwrap().combined_x, weights)
    });
    for (me, (dirty, cleaned, combined, weights)) in results.iter().enumerate() {
        assert!(*dirty && *cleaned);
        let x = token_states(me, NUM_TOKENS, HIDDEN);
        for token in 0..NUM_TOKENS {
            let factor: f32 = weights.row(token).iter().sum();
            for (value, original) in combined.row(token).iter().zip(x.row(token)) {
                assert!((value - original * factor).abs() < 1e-3);
            }
        }
    }
}

#[test]
fn test_usage_errors() {
    let results = run_group(NUM_RANKS, &low_latency_options(RDMA_BYTES), |buffer| {
        let me = buffer.rank();
        let mut errors = Vec::new();

        let mut both = request(me);
        both.async_finish = true;
        both.return_recv_hook = true;
        errors.push(buffer.low_latency_dispatch(both).err());

        let too_many = LowLatencyDispatchRequest::new(
            token_states(me, NUM_MAX_TOKENS + 1, HIDDEN),
            topk_indices(me, NUM_MAX_TOKENS + 1, NUM_TOPK, NUM_EXPERTS),
            NUM_MAX_TOKENS,
            NUM_EXPERTS,
        );
        errors.push(buffer.low_latency_dispatch(too_many).err());

        let mut out_of_range = request(me);
        out_of_range.topk_idx.set(0, 0, NUM_EXPERTS as i64);
        errors.push(buffer.low_latency_dispatch(out_of_range).err());

        let mut stats = request(me);
        let wrong_size = Arc::new(ExpertLoadCounter::new(3));
        stats.cumulative_local_expert_recv_stats = Some(wrong_size);
        errors.push(buffer.low_latency_dispatch(stats).err());

        let mut unrounded = request(me);
        unrounded.use_fp8 = true;
        unrounded.use_ue8m0 = true;
        errors.push(buffer.low_latency_dispatch(unrounded).err());

        let dispatched = ll_dispatch(&buffer, request(me));
        let idx = indices(me);
        let weights = topk_weights(&idx);
        let one_expert = vec![dispatched.recv_x[0].as_f32().unwrap().clone()];
        let request = LowLatencyCombineRequest::new(
            one_expert,
            idx.clone(),
            weights,
            dispatched.handle.clone(),
        );
        errors.push(buffer.low_latency_combine(request).err());

        let transposed = Matrix::zeros(NUM_TOPK, NUM_TOKENS);
        let x = identity_outputs(&dispatched);
        let handle = dispatched.handle.clone();
        let request = LowLatencyCombineRequest::new(x, idx.clone(), transposed, handle);
        errors.push(buffer.low_latency_combine(request).err());

        let weights = topk_weights(&idx);
        let x = identity_outputs(&dispatched);
        let handle = dispatched.handle.clone();
        let mut with_rows =
            LowLatencyCombineRequest::new(x, idx.clone(), weights, handle);
        with_rows.zero_copy = true;
        errors.push(buffer.low_latency_combine(with_rows).err());

        let weights = topk_weights(&idx);
        let x = identity_outputs(&dispatched);
        let handle = dispatched.handle.clone();
        let mut wrong_out = LowLatencyCombineRequest::new(x, idx, weights, handle);
        wrong_out.out = Some(Matrix::zeros(NUM_TOKENS, HIDDEN + 1));
        errors.push(buffer.low_latency_combine(wrong_out).err());

        let wrong_expert = Matrix::zeros(1, HIDDEN);
        let staged = buffer.with_next_low_latency_combine_buffer(&dispatched.handle, |b| {
            b.copy_expert(0, &wrong_expert)
        });
        errors.push(staged.unwrap().err());
        errors
    });
    for errors in results {
        for err in errors {
            assert!(matches!(err, Some(EpError::Usage(_))), "{err:?}");
        }
    }
}

#[test]
fn test_normal_buffer_rejects_low_latency() {
    let results = run_group(NUM_RANKS, &normal_options(), |buffer| {
        let dispatch = buffer.low_latency_dispatch(request(buffer.rank())).err();
        let clean = buffer.clean_low_latency_buffer(NUM_MAX_TOKENS, HIDDEN, NUM_EXPERTS);
        (dispatch, clean)
    });
    for (dispatch, clean) in results {
        assert!(matches!(dispatch, Some(EpError::Usage(_))), "{dispatch:?}");
        clean.unwrap();
    }
}

#[test]
fn test_region_too_small() {
    let results = run_group(NUM_RANKS, &low_latency_options(1024), |buffer| {
        buffer.low_latency_dispatch(request(buffer.rank())).err()
    });
    for err in results {
        assert!(matches!(err, Some(EpError::Capacity(_))), "{err:?}");
    }
}
