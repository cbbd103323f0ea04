use std::sync::{Arc, Mutex};

use crate::node::WorkSizes;
use crate::{Error, Result};

/// Tracks pool usage statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    /// Number of times a free slot was reused instead of allocated.
    pub hits: usize,
    /// Number of times the pool grew by a new slot.
    pub misses: usize,
    /// Total number of slots ever allocated.
    pub slots: usize,
}

/// One reusable set of scratch buffers, sized to a node's declared work
/// requirements. `bw` mirrors `w` with the bit-vector element type used by
/// sparsity propagation.
#[derive(Debug)]
pub(crate) struct WorkBuffers {
    pub iw: Vec<i64>,
    pub w: Vec<f64>,
    pub bw: Vec<u64>,
}

impl WorkBuffers {
    fn new(sizes: WorkSizes) -> Self {
        WorkBuffers {
            iw: vec![0; sizes.sz_iw],
            w: vec![0.0; sizes.sz_w],
            bw: vec![0; sizes.sz_w],
        }
    }
}

struct PoolState {
    slots: Vec<Arc<Mutex<WorkBuffers>>>,
    in_use: Vec<bool>,
    free: Vec<usize>,
    metrics: PoolMetrics,
}

/// Pool of scratch-memory slots owned by one node. A checked-out slot is
/// exclusive to its caller until released, so distinct slots can evaluate
/// the same node concurrently. The pool grows on demand and never shrinks.
pub struct WorkPool {
    sizes: WorkSizes,
    state: Mutex<PoolState>,
}

impl WorkPool {
    pub(crate) fn new(sizes: WorkSizes) -> Self {
        WorkPool {
            sizes,
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                in_use: Vec::new(),
                free: Vec::new(),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// Reserve a slot, allocating a new one if no free slot exists.
    pub fn checkout(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.free.pop() {
            state.in_use[idx] = true;
            state.metrics.hits += 1;
            idx
        } else {
            let idx = state.slots.len();
            state
                .slots
                .push(Arc::new(Mutex::new(WorkBuffers::new(self.sizes))));
            state.in_use.push(true);
            state.metrics.misses += 1;
            state.metrics.slots = state.slots.len();
            log::trace!("work pool grew to {} slots", state.slots.len());
            idx
        }
    }

    /// Return a slot to the free set.
    pub fn release(&self, idx: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if idx >= state.slots.len() {
            return Err(Error::Index {
                what: "memory slot",
                index: idx,
                limit: state.slots.len(),
            });
        }
        if !state.in_use[idx] {
            return Err(Error::Msg(format!("memory slot {idx} is not checked out")));
        }
        state.in_use[idx] = false;
        state.free.push(idx);
        Ok(())
    }

    pub(crate) fn slot(&self, idx: usize) -> Result<Arc<Mutex<WorkBuffers>>> {
        let state = self.state.lock().unwrap();
        state.slots.get(idx).cloned().ok_or(Error::Index {
            what: "memory slot",
            index: idx,
            limit: state.slots.len(),
        })
    }

    /// Returns a snapshot of current pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.state.lock().unwrap().metrics.clone()
    }
}
