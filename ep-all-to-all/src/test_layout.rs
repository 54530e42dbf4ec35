use rstest::rstest;

use crate::{
    error::EpError,
    layout::compute_dispatch_layout,
    placement::{ExpertPlacement, PlacementStrategy},
    tensor::Matrix,
    topology::RankTopology,
};

fn selections(rows: &[&[i64]]) -> Matrix<i64> {
    let cols = rows.first().map_or(0, |row| row.len());
    Matrix::from_vec(rows.len(), cols, rows.concat()).unwrap()
}

#[test]
fn test_counts_and_membership() {
    let topology = RankTopology::resolve(0, 4).unwrap();
    let placement = ExpertPlacement::linear(8, 4).unwrap();
    // Experts 0-1 live on rank 0, 2-3 on rank 1, 4-5 on rank 2, 6-7 on rank 3.
    let topk_idx = selections(&[&[0, 1], &[2, 7], &[-1, -1], &[5, -1]]);
    let plan = compute_dispatch_layout(&topk_idx, &placement, &topology).unwrap();

    assert_eq!(plan.num_tokens_per_rank, vec![1, 1, 1, 1]);
    assert_eq!(plan.num_tokens_per_expert, vec![1, 1, 1, 0, 0, 1, 0, 1]);
    assert_eq!(plan.num_tokens_per_rdma_rank, None);
    assert_eq!(plan.ranks_of_token(0).collect::<Vec<_>>(), vec![0]);
    assert_eq!(plan.ranks_of_token(1).collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(plan.ranks_of_token(2).count(), 0);
    assert_eq!(plan.ranks_of_token(3).collect::<Vec<_>>(), vec![2]);
}

#[test]
fn test_two_experts_on_one_rank_count_once() {
    let topology = RankTopology::resolve(1, 2).unwrap();
    let placement = ExpertPlacement::linear(4, 2).unwrap();
    let topk_idx = selections(&[&[2, 3], &[3, 2]]);
    let plan = compute_dispatch_layout(&topk_idx, &placement, &topology).unwrap();
    assert_eq!(plan.num_tokens_per_rank, vec![0, 2]);
    assert_eq!(plan.num_tokens_per_expert, vec![0, 0, 2, 2]);
}

#[test]
fn test_round_robin_placement() {
    let topology = RankTopology::resolve(0, 2).unwrap();
    let placement = ExpertPlacement::new(PlacementStrategy::RoundRobin, 4, 2).unwrap();
    let topk_idx = selections(&[&[0, 2], &[1, -1]]);
    let plan = compute_dispatch_layout(&topk_idx, &placement, &topology).unwrap();
    assert_eq!(plan.num_tokens_per_rank, vec![1, 1]);
    assert!(plan.is_token_in_rank.get(0, 0));
    assert!(plan.is_token_in_rank.get(1, 1));
}

#[test]
fn test_internode_counts_nodes() {
    let topology = RankTopology::resolve(3, 16).unwrap();
    let placement = ExpertPlacement::linear(32, 16).unwrap();
    // Experts 0 and 2 are on node 0, expert 20 on node 1.
    let topk_idx = selections(&[&[0, 2, 20], &[1, 3, -1]]);
    let plan = compute_dispatch_layout(&topk_idx, &placement, &topology).unwrap();
    assert_eq!(plan.num_tokens_per_rdma_rank, Some(vec![2, 1]));
    assert_eq!(plan.num_tokens_per_rank[0], 2);
    assert_eq!(plan.num_tokens_per_rank[1], 2);
    assert_eq!(plan.num_tokens_per_rank[10], 1);
}

#[rstest]
#[case(-2)]
#[case(8)]
#[case(100)]
fn test_invalid_selection(#[case] selection: i64) {
    let topology = RankTopology::resolve(0, 4).unwrap();
    let placement = ExpertPlacement::linear(8, 4).unwrap();
    let topk_idx = selections(&[&[0, selection]]);
    let err = compute_dispatch_layout(&topk_idx, &placement, &topology).unwrap_err();
    assert!(matches!(err, EpError::Usage(_)), "{err}");
}

#[test]
fn test_placement_must_match_group() {
    let topology = RankTopology::resolve(0, 4).unwrap();
    let placement = ExpertPlacement::linear(8, 2).unwrap();
    let topk_idx = selections(&[&[0]]);
    let err = compute_dispatch_layout(&topk_idx, &placement, &topology).unwrap_err();
    assert!(matches!(err, EpError::Usage(_)));
}

#[test]
fn test_uneven_expert_count() {
    let err = ExpertPlacement::linear(6, 4).unwrap_err();
    assert!(matches!(err, EpError::Usage(_)));
}

/// Distinct random experts per token; with `holes`, about a quarter of the
/// selections are replaced by `-1`.
fn random_selections(
    num_tokens: usize,
    num_topk: usize,
    num_experts: usize,
    seed: u64,
    holes: bool,
) -> Matrix<i64> {
    let mut state = seed;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let mut data = Vec::with_capacity(num_tokens * num_topk);
    for _ in 0..num_tokens {
        let mut chosen: Vec<i64> = Vec::with_capacity(num_topk);
        while chosen.len() < num_topk {
            let expert = (next() % num_experts as u64) as i64;
            if !chosen.contains(&expert) {
                chosen.push(expert);
            }
        }
        if holes {
            chosen.iter_mut().filter(|_| next() % 4 == 0).for_each(|e| *e = -1);
        }
        data.extend(chosen);
    }
    Matrix::from_vec(num_tokens, num_topk, data).unwrap()
}

#[rstest]
#[case(1)]
#[case(0x2545_f491)]
#[case(0xdead_beef)]
fn test_eight_ranks_top2(#[case] seed: u64) {
    let topology = RankTopology::resolve(5, 8).unwrap();
    let placement = ExpertPlacement::linear(64, 8).unwrap();
    let topk_idx = random_selections(16, 2, 64, seed, false);
    let plan = compute_dispatch_layout(&topk_idx, &placement, &topology).unwrap();

    assert_eq!(plan.num_tokens_per_expert.iter().sum::<usize>(), 32);
    for token in 0..16 {
        let ranks = plan.ranks_of_token(token).count();
        assert!((1..=2).contains(&ranks), "token {token} goes to {ranks} ranks");
    }
    for rank in 0..8 {
        let column = (0..16).filter(|&t| plan.is_token_in_rank.get(t, rank)).count();
        assert_eq!(plan.num_tokens_per_rank[rank], column, "rank {rank}");
    }
    assert_eq!(plan.num_tokens_per_rdma_rank, None);
}

#[rstest]
#[case(4, 16, 4, 33, PlacementStrategy::Linear, 7)]
#[case(8, 64, 8, 128, PlacementStrategy::RoundRobin, 11)]
#[case(16, 64, 6, 50, PlacementStrategy::Linear, 13)]
#[case(32, 256, 8, 64, PlacementStrategy::RoundRobin, 17)]
fn test_random_batches_with_holes(
    #[case] num_ranks: usize,
    #[case] num_experts: usize,
    #[case] num_topk: usize,
    #[case] num_tokens: usize,
    #[case] strategy: PlacementStrategy,
    #[case] seed: u64,
) {
    let topology = RankTopology::resolve(0, num_ranks).unwrap();
    let placement = ExpertPlacement::new(strategy, num_experts, num_ranks).unwrap();
    let topk_idx = random_selections(num_tokens, num_topk, num_experts, seed, true);
    let plan = compute_dispatch_layout(&topk_idx, &placement, &topology).unwrap();

    let mut per_expert = vec![0usize; num_experts];
    let mut per_rank = vec![0usize; num_ranks];
    let mut per_node = vec![0usize; topology.num_rdma_ranks];
    for (token, selections) in topk_idx.iter_rows().enumerate() {
        let mut ranks = vec![false; num_ranks];
        for &selection in selections.iter().filter(|&&e| e >= 0) {
            per_expert[selection as usize] += 1;
            ranks[placement.owner_rank(selection as usize)] = true;
        }
        for (rank, &expected) in ranks.iter().enumerate() {
            assert_eq!(plan.is_token_in_rank.get(token, rank), expected);
        }
        let mut nodes = vec![false; topology.num_rdma_ranks];
        for rank in (0..num_ranks).filter(|&r| ranks[r]) {
            per_rank[rank] += 1;
            nodes[topology.rdma_rank_of(rank)] = true;
        }
        for node in (0..nodes.len()).filter(|&n| nodes[n]) {
            per_node[node] += 1;
        }
    }
    assert_eq!(plan.num_tokens_per_expert, per_expert);
    assert_eq!(plan.num_tokens_per_rank, per_rank);
    let expected_nodes = topology.is_internode().then_some(per_node);
    assert_eq!(plan.num_tokens_per_rdma_rank, expected_nodes);
}
