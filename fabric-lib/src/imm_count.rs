use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering::AcqRel, Ordering::Acquire},
    },
};

use parking_lot::RwLock;

use crate::api::ImmCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmCountStatus {
    Vacant,
    Counted,
}

/// Immediate counters of one rank, keyed by immediate value.
pub struct ImmCountMap {
    map: RwLock<HashMap<u32, Arc<AtomicI64>>>,
}

impl ImmCountMap {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()) }
    }

    /// Return an exposed imm counter. Re-registering an imm resets it to 0.
    pub fn get_imm_counter(&self, imm: u32) -> ImmCounter {
        let counter = Arc::new(AtomicI64::new(0));
        let imm_counter = ImmCounter::new(counter.clone());
        self.map.write().insert(imm, counter);
        imm_counter
    }

    /// Stop treating the imm as a counter.
    /// Return true if the imm was registered.
    pub fn remove(&self, imm: u32) -> bool {
        self.map.write().remove(&imm).is_some()
    }

    /// Get the current value of the counter.
    /// If the imm is not used as a counter, returns None.
    pub fn get(&self, imm: u32) -> Option<i64> {
        self.map.read().get(&imm).map(|counter| counter.load(Acquire))
    }

    /// Increment the counter.
    /// If the imm is not used as a counter, returns Vacant.
    pub fn inc(&self, imm: u32) -> ImmCountStatus {
        match self.map.read().get(&imm) {
            Some(counter) => {
                counter.fetch_add(1, AcqRel);
                ImmCountStatus::Counted
            }
            None => ImmCountStatus::Vacant,
        }
    }
}

impl Default for ImmCountMap {
    fn default() -> Self {
        Self::new()
    }
}
