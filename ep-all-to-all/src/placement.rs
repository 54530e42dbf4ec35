//! Static ownership of experts by ranks.
//!
//! - **Linear**: rank `r` owns experts `[r * n / ep, (r + 1) * n / ep)`.
//! - **RoundRobin**: rank `r` owns experts `r, r + ep, r + 2 * ep, ...`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ensure_usage};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlacementStrategy {
    #[default]
    Linear,
    RoundRobin,
}

/// Maps global expert ids to (owner rank, local expert index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertPlacement {
    strategy: PlacementStrategy,
    num_experts: usize,
    num_ranks: usize,
}

impl ExpertPlacement {
    pub fn new(
        strategy: PlacementStrategy,
        num_experts: usize,
        num_ranks: usize,
    ) -> Result<Self> {
        ensure_usage!(num_ranks > 0, "expert placement needs at least one rank");
        ensure_usage!(
            num_experts > 0 && num_experts.is_multiple_of(num_ranks),
            "{num_experts} experts cannot be evenly placed on {num_ranks} ranks"
        );
        Ok(Self { strategy, num_experts, num_ranks })
    }

    pub fn linear(num_experts: usize, num_ranks: usize) -> Result<Self> {
        Self::new(PlacementStrategy::Linear, num_experts, num_ranks)
    }

    pub fn strategy(&self) -> PlacementStrategy {
        self.strategy
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn num_local_experts(&self) -> usize {
        self.num_experts / self.num_ranks
    }

    /// Rank owning `expert`. `expert` must be below `num_experts`.
    pub fn owner_rank(&self, expert: usize) -> usize {
        match self.strategy {
            PlacementStrategy::Linear => expert / self.num_local_experts(),
            PlacementStrategy::RoundRobin => expert % self.num_ranks,
        }
    }

    /// Index of `expert` among the experts of its owner.
    pub fn local_index(&self, expert: usize) -> usize {
        match self.strategy {
            PlacementStrategy::Linear => expert % self.num_local_experts(),
            PlacementStrategy::RoundRobin => expert / self.num_ranks,
        }
    }

    pub fn global_expert(&self, rank: usize, local_index: usize) -> usize {
        match self.strategy {
            PlacementStrategy::Linear => rank * self.num_local_experts() + local_index,
            PlacementStrategy::RoundRobin => local_index * self.num_ranks + rank,
        }
    }

    /// Local index of a selection on `rank`, or `None` when the selection is
    /// the sentinel, out of range, or owned elsewhere.
    pub fn local_on(&self, rank: usize, selection: i64) -> Option<usize> {
        let expert = usize::try_from(selection).ok().filter(|&e| e < self.num_experts)?;
        (self.owner_rank(expert) == rank).then(|| self.local_index(expert))
    }
}
