use rstest::rstest;

use crate::{
    buffer::{Buffer, BufferOptions},
    error::EpError,
    layout::RoutingPlan,
    ops::{CombineRequest, DispatchOutput, DispatchRequest},
    payload::{TokenPayload, TopkSelection},
    placement::{ExpertPlacement, PlacementStrategy},
    tensor::Matrix,
    testing::{normal_options, run_group, selection, token_states, topk_indices},
};

const NUM_RANKS: usize = 4;
const NUM_EXPERTS: usize = 8;
const NUM_TOPK: usize = 2;
const HIDDEN: usize = 16;
const NUM_TOKENS: usize = 10;

fn placement() -> ExpertPlacement {
    ExpertPlacement::linear(NUM_EXPERTS, NUM_RANKS).unwrap()
}

fn indices(rank: usize) -> Matrix<i64> {
    topk_indices(rank, NUM_TOKENS, NUM_TOPK, NUM_EXPERTS)
}

/// `(src rank, src token)` of every row `rank` should receive, in order.
fn expected_sources(rank: usize) -> Vec<(usize, usize)> {
    let placement = placement();
    (0..NUM_RANKS)
        .flat_map(|src| {
            let idx = indices(src);
            (0..NUM_TOKENS)
                .filter(move |&token| {
                    let row = idx.row(token);
                    row.iter().any(|&e| placement.local_on(rank, e).is_some())
                })
                .map(move |token| (src, token))
        })
        .collect()
}

fn layout(buffer: &Buffer, topk: &TopkSelection) -> RoutingPlan {
    buffer
        .get_dispatch_layout(
            topk.idx.clone(),
            NUM_EXPERTS,
            PlacementStrategy::Linear,
            None,
            false,
        )
        .unwrap()
        .await_completion()
        .unwrap()
}

fn dispatch(buffer: &Buffer, weighted: bool, expert_alignment: usize) -> DispatchOutput {
    let me = buffer.rank();
    let topk = selection(indices(me), weighted);
    let plan = layout(buffer, &topk);
    let x = TokenPayload::F32(token_states(me, NUM_TOKENS, HIDDEN));
    let mut request = DispatchRequest::new(x, plan, Some(topk));
    request.expert_alignment = expert_alignment;
    buffer.dispatch(request).unwrap().await_completion().unwrap()
}

#[rstest]
#[case::weighted(true)]
#[case::unweighted(false)]
fn test_dispatch_combine_round_trip(#[case] weighted: bool) {
    let results = run_group(NUM_RANKS, &normal_options(), |buffer| {
        let dispatched = dispatch(&buffer, weighted, 1);
        let recv_x = dispatched.recv_x.as_f32().unwrap().clone();
        let request = CombineRequest::new(
            recv_x,
            dispatched.handle.clone(),
            dispatched.recv_topk_weights.clone(),
        );
        let combined = buffer.combine(request).unwrap().await_completion().unwrap();
        (dispatched, combined)
    });

    let placement = placement();
    for (me, (dispatched, combined)) in results.iter().enumerate() {
        let sources = expected_sources(me);
        let recv_x = dispatched.recv_x.as_f32().unwrap();
        let recv_idx = dispatched.recv_topk_idx.as_ref().unwrap();
        assert_eq!(recv_x.rows(), sources.len());
        assert_eq!(dispatched.handle.num_recv_tokens(), sources.len());
        for (row, &(src, token)) in sources.iter().enumerate() {
            let sent = token_states(src, NUM_TOKENS, HIDDEN);
            assert_eq!(recv_x.row(row), sent.row(token));
            for (k, &selected) in indices(src).row(token).iter().enumerate() {
                let expected =
                    placement.local_on(me, selected).map_or(-1, |l| l as i64);
                assert_eq!(recv_idx.get(row, k), expected);
            }
        }
        assert_eq!(dispatched.recv_topk_weights.is_some(), weighted);

        let per_expert: Vec<usize> = (0..placement.num_local_experts())
            .map(|local| {
                let expert = placement.global_expert(me, local) as i64;
                let count = |src| {
                    indices(src).as_slice().iter().filter(|&&e| e == expert).count()
                };
                (0..NUM_RANKS).map(count).sum()
            })
            .collect();
        assert_eq!(dispatched.num_recv_tokens_per_expert, per_expert);

        let x = token_states(me, NUM_TOKENS, HIDDEN);
        let idx = indices(me);
        let topk = selection(idx.clone(), true);
        let weights = topk.weights.as_ref().unwrap();
        for token in 0..NUM_TOKENS {
            let factor: f32 = if weighted {
                weights.row(token).iter().sum()
            } else {
                let mut owners: Vec<usize> = idx
                    .row(token)
                    .iter()
                    .filter(|&&e| e >= 0)
                    .map(|&e| placement.owner_rank(e as usize))
                    .collect();
                owners.sort_unstable();
                owners.dedup();
                owners.len() as f32
            };
            let row = combined.combined_x.row(token);
            for (value, original) in row.iter().zip(x.row(token)) {
                assert!((value - original * factor).abs() < 1e-4, "token {token}");
            }
        }
        match &combined.combined_topk_weights {
            Some(combined_weights) => {
                assert!(weighted);
                assert!(combined_weights.max_abs_diff(weights) < 1e-6);
            }
            None => assert!(!weighted),
        }
    }
}

#[test]
fn test_cached_dispatch_replays_routing() {
    let results = run_group(NUM_RANKS, &normal_options(), |buffer| {
        let first = dispatch(&buffer, true, 4);
        let doubled = token_states(buffer.rank(), NUM_TOKENS, HIDDEN);
        let doubled = Matrix::from_vec(
            NUM_TOKENS,
            HIDDEN,
            doubled.as_slice().iter().map(|v| v * 2.0).collect(),
        )
        .unwrap();
        let request =
            DispatchRequest::cached(TokenPayload::F32(doubled), first.handle.clone());
        let second = buffer.dispatch(request).unwrap().await_completion().unwrap();
        (first, second)
    });
    for (first, second) in &results {
        let first_x = first.recv_x.as_f32().unwrap();
        let second_x = second.recv_x.as_f32().unwrap();
        assert_eq!(first_x.shape(), second_x.shape());
        for (a, b) in first_x.as_slice().iter().zip(second_x.as_slice()) {
            assert_eq!(a * 2.0, *b);
        }
        assert_eq!(second.handle, first.handle);
        assert!(second.recv_topk_idx.is_none());
        assert!(second.num_recv_tokens_per_expert.is_empty());
        assert!(first.num_recv_tokens_per_expert.iter().all(|c| c % 4 == 0));
    }
}

#[test]
fn test_worst_tokens_padding() {
    let num_worst_tokens = NUM_RANKS * NUM_TOKENS;
    let results = run_group(NUM_RANKS, &normal_options(), |buffer| {
        let me = buffer.rank();
        let topk = selection(indices(me), true);
        let plan = layout(&buffer, &topk);
        let x = TokenPayload::F32(token_states(me, NUM_TOKENS, HIDDEN));
        let mut request = DispatchRequest::new(x, plan, Some(topk));
        request.num_worst_tokens = num_worst_tokens;
        let dispatched = buffer.dispatch(request).unwrap().await_completion().unwrap();

        // Padding rows go through the combine untouched.
        let recv_x = dispatched.recv_x.as_f32().unwrap().clone();
        let request = CombineRequest::new(recv_x, dispatched.handle.clone(), None);
        let combined = buffer.combine(request).unwrap().await_completion().unwrap();
        (dispatched, combined)
    });
    for (me, (dispatched, combined)) in results.iter().enumerate() {
        let num_recv = expected_sources(me).len();
        let recv_x = dispatched.recv_x.as_f32().unwrap();
        let recv_idx = dispatched.recv_topk_idx.as_ref().unwrap();
        assert_eq!(recv_x.rows(), num_worst_tokens);
        assert_eq!(dispatched.handle.num_recv_tokens(), num_recv);
        assert!(dispatched.num_recv_tokens_per_expert.is_empty());
        for row in num_recv..num_worst_tokens {
            assert!(recv_x.row(row).iter().all(|&v| v == 0.0));
            assert!(recv_idx.row(row).iter().all(|&e| e == -1));
        }
        assert_eq!(combined.combined_x.rows(), NUM_TOKENS);
    }
}

#[test]
fn test_worst_tokens_too_small() {
    let results = run_group(NUM_RANKS, &normal_options(), |buffer| {
        let me = buffer.rank();
        let topk = selection(indices(me), false);
        let plan = layout(&buffer, &topk);
        let x = TokenPayload::F32(token_states(me, NUM_TOKENS, HIDDEN));
        let mut request = DispatchRequest::new(x, plan, Some(topk));
        request.num_worst_tokens = 1;
        let failed = buffer.dispatch(request).unwrap().await_completion();

        // The group stays usable after the collective failure.
        let retried = dispatch(&buffer, false, 1);
        (failed.map(|_| ()), retried.handle.num_recv_tokens())
    });
    for (me, (failed, num_recv)) in results.into_iter().enumerate() {
        assert!(matches!(failed, Err(EpError::Capacity(_))), "{failed:?}");
        assert_eq!(num_recv, expected_sources(me).len());
    }
}

#[test]
fn test_region_too_small() {
    let options = BufferOptions { num_nvl_bytes: 1024, ..normal_options() };
    let results = run_group(NUM_RANKS, &options, |buffer| {
        let me = buffer.rank();
        let topk = selection(indices(me), true);
        let plan = layout(&buffer, &topk);
        let x = TokenPayload::F32(token_states(me, NUM_TOKENS, HIDDEN));
        let request = DispatchRequest::new(x, plan, Some(topk));
        buffer.dispatch(request).unwrap().await_completion().map(|_| ())
    });
    for result in results {
        assert!(matches!(result, Err(EpError::Capacity(_))), "{result:?}");
    }
}

#[test]
fn test_fp8_payload() {
    let results = run_group(NUM_RANKS, &normal_options(), |buffer| {
        let me = buffer.rank();
        let topk = selection(indices(me), false);
        let plan = layout(&buffer, &topk);
        let data = (0..NUM_TOKENS * HIDDEN).map(|i| (me * 40 + i) as u8).collect();
        let data = Matrix::from_vec(NUM_TOKENS, HIDDEN, data).unwrap();
        let scales =
            (0..NUM_TOKENS).map(|t| (me * NUM_TOKENS + t) as f32).collect();
        let scales = Matrix::from_vec(NUM_TOKENS, 1, scales).unwrap();
        let x = TokenPayload::fp8(data, scales).unwrap();
        let request = DispatchRequest::new(x, plan, None);
        buffer.dispatch(request).unwrap().await_completion().unwrap()
    });
    for (me, dispatched) in results.iter().enumerate() {
        let TokenPayload::Fp8 { data, scales } = &dispatched.recv_x else {
            panic!("expected an FP8 payload");
        };
        assert!(dispatched.recv_topk_idx.is_none());
        for (row, &(src, token)) in expected_sources(me).iter().enumerate() {
            let first = (src * 40 + token * HIDDEN) as u8;
            assert_eq!(data.get(row, 0), first);
            assert_eq!(scales.get(row, 0), (src * NUM_TOKENS + token) as f32);
        }
    }
}

#[test]
fn test_async_finish_after_previous_event() {
    let results = run_group(NUM_RANKS, &normal_options(), |buffer| {
        let me = buffer.rank();
        let topk = selection(indices(me), false);
        let plan = layout(&buffer, &topk);
        let x = TokenPayload::F32(token_states(me, NUM_TOKENS, HIDDEN));
        let mut request = DispatchRequest::new(x, plan, Some(topk));
        request.previous_event = Some(buffer.capture().unwrap());
        request.async_finish = true;
        let pending = buffer.dispatch(request).unwrap();
        pending.event().current_stream_wait();
        assert!(pending.is_complete());
        pending.await_completion().unwrap().handle.num_recv_tokens()
    });
    for (me, num_recv) in results.into_iter().enumerate() {
        assert_eq!(num_recv, expected_sources(me).len());
    }
}

#[test]
fn test_usage_errors() {
    let results = run_group(NUM_RANKS, &normal_options(), |buffer| {
        let me = buffer.rank();
        let dispatched = dispatch(&buffer, true, 1);
        let x = token_states(me, NUM_TOKENS, HIDDEN);
        let mut errors = Vec::new();

        let cached = |x: Matrix<f32>| {
            DispatchRequest::cached(TokenPayload::F32(x), dispatched.handle.clone())
        };
        let no_routing = DispatchRequest { handle: None, ..cached(x.clone()) };
        errors.push(buffer.dispatch(no_routing).err());

        let topk = selection(indices(me), false);
        let plan = layout(&buffer, &topk);
        let both = DispatchRequest {
            handle: Some(dispatched.handle.clone()),
            ..DispatchRequest::new(TokenPayload::F32(x.clone()), plan, Some(topk))
        };
        errors.push(buffer.dispatch(both).err());

        errors.push(buffer.dispatch(cached(x.truncated(NUM_TOKENS - 1))).err());

        let num_recv = dispatched.handle.num_recv_tokens();
        if num_recv > 0 {
            let short = dispatched.recv_x.as_f32().unwrap().truncated(num_recv - 1);
            let request = CombineRequest::new(short, dispatched.handle.clone(), None);
            errors.push(buffer.combine(request).err());
        }
        errors
    });
    for errors in results {
        for err in errors {
            assert!(matches!(err, Some(EpError::Usage(_))), "{err:?}");
        }
    }
}
