use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, ensure_usage},
    placement::ExpertPlacement,
    tensor::Matrix,
    topology::RankTopology,
};

/// How the tokens of one rank spread over ranks and experts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingPlan {
    /// Tokens sent to each rank; a token counts once per rank.
    pub num_tokens_per_rank: Vec<usize>,
    /// Tokens sent to each node, present only for multi-node groups.
    pub num_tokens_per_rdma_rank: Option<Vec<usize>>,
    /// Selections of each expert.
    pub num_tokens_per_expert: Vec<usize>,
    /// `[token][rank]`: whether the token is sent to the rank.
    pub is_token_in_rank: Matrix<bool>,
    pub placement: ExpertPlacement,
}

impl RoutingPlan {
    pub fn num_tokens(&self) -> usize {
        self.is_token_in_rank.rows()
    }

    pub fn num_ranks(&self) -> usize {
        self.is_token_in_rank.cols()
    }

    /// Ranks the token is sent to, ascending.
    pub fn ranks_of_token(&self, token: usize) -> impl Iterator<Item = usize> + '_ {
        self.is_token_in_rank
            .row(token)
            .iter()
            .enumerate()
            .filter_map(|(rank, in_rank)| in_rank.then_some(rank))
    }
}

/// Single pass over the selections computing the routing plan.
///
/// `-1` selections are skipped; a token without valid selections goes
/// nowhere. Any other selection outside `[0, num_experts)` is rejected.
pub fn compute_dispatch_layout(
    topk_idx: &Matrix<i64>,
    placement: &ExpertPlacement,
    topology: &RankTopology,
) -> Result<RoutingPlan> {
    let num_ranks = topology.num_ranks;
    let num_experts = placement.num_experts();
    ensure_usage!(
        placement.num_ranks() == num_ranks,
        "expert placement covers {} ranks but the group has {}",
        placement.num_ranks(),
        num_ranks
    );

    let mut num_tokens_per_rank = vec![0usize; num_ranks];
    let mut num_tokens_per_rdma_rank = vec![0usize; topology.num_rdma_ranks];
    let mut num_tokens_per_expert = vec![0usize; num_experts];
    let mut is_token_in_rank = Matrix::filled(topk_idx.rows(), num_ranks, false);
    let mut in_rdma_rank = vec![false; topology.num_rdma_ranks];

    for (token, selections) in topk_idx.iter_rows().enumerate() {
        in_rdma_rank.fill(false);
        for &selection in selections {
            if selection == -1 {
                continue;
            }
            ensure_usage!(
                (0..num_experts as i64).contains(&selection),
                "token {token} selects expert {selection} outside [0, {num_experts})"
            );
            let expert = selection as usize;
            num_tokens_per_expert[expert] += 1;

            let rank = placement.owner_rank(expert);
            if !is_token_in_rank.get(token, rank) {
                is_token_in_rank.set(token, rank, true);
                num_tokens_per_rank[rank] += 1;
            }
            let rdma_rank = topology.rdma_rank_of(rank);
            if !in_rdma_rank[rdma_rank] {
                in_rdma_rank[rdma_rank] = true;
                num_tokens_per_rdma_rank[rdma_rank] += 1;
            }
        }
    }

    let num_tokens_per_rdma_rank =
        topology.is_internode().then_some(num_tokens_per_rdma_rank);
    Ok(RoutingPlan {
        num_tokens_per_rank,
        num_tokens_per_rdma_rank,
        num_tokens_per_expert,
        is_token_in_rank,
        placement: *placement,
    })
}
