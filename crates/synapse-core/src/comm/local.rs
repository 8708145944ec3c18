//! In-process rendezvous communicator.
//!
//! [`ThreadGroup`] runs a model-parallel group inside one process: each rank
//! lives on its own thread and collectives meet at a mutex/condvar barrier.
//! The last rank to arrive combines all contributions and every rank leaves
//! with the identical result, matching the semantics a device communication
//! library would provide.

use crate::comm::Communicator;
use crate::error::{Result, SynapseError};
use candle_core::Tensor;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Which collective a round is performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collective {
    ReduceSum,
    Gather(usize),
}

/// State of the current collective round.
#[derive(Default)]
struct RoundState {
    /// Per-rank contributions, indexed by rank.
    inputs: Vec<Option<(Tensor, Collective)>>,
    /// Combined result, or the failure every rank should observe.
    output: Option<std::result::Result<Tensor, String>>,
    /// Ranks that have picked up the result so far.
    departed: usize,
}

struct Inner {
    world_size: usize,
    state: Mutex<RoundState>,
    cond: Condvar,
}

/// Factory for in-process communication groups.
pub struct ThreadGroup;

impl ThreadGroup {
    /// Create a group of `world_size` ranks, returning one handle per rank.
    ///
    /// Each handle implements [`Communicator`] and is meant to be moved onto
    /// its own thread.
    pub fn new(world_size: usize) -> Result<Vec<ThreadGroupHandle>> {
        if world_size == 0 {
            return Err(SynapseError::Config(
                "world_size must be at least 1".to_string(),
            ));
        }
        let inner = Arc::new(Inner {
            world_size,
            state: Mutex::new(RoundState {
                inputs: vec![None; world_size],
                output: None,
                departed: 0,
            }),
            cond: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| ThreadGroupHandle {
                rank,
                inner: Arc::clone(&inner),
            })
            .collect())
    }
}

/// One rank's handle to a [`ThreadGroup`].
pub struct ThreadGroupHandle {
    rank: usize,
    inner: Arc<Inner>,
}

impl ThreadGroupHandle {
    fn run_round(&self, input: Tensor, op: Collective) -> Result<Tensor> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        // Wait for the previous round to fully drain before contributing.
        while state.output.is_some() || state.inputs[self.rank].is_some() {
            inner.cond.wait(&mut state);
        }

        state.inputs[self.rank] = Some((input, op));

        if state.inputs.iter().all(Option::is_some) {
            // Last to arrive: combine and publish.
            let inputs: Vec<(Tensor, Collective)> = state
                .inputs
                .iter_mut()
                .map(|slot| slot.take().expect("all contributions present"))
                .collect();
            state.output = Some(combine(&inputs));
            state.departed = 0;
            inner.cond.notify_all();
        } else {
            while state.output.is_none() {
                inner.cond.wait(&mut state);
            }
        }

        let result = match state.output.as_ref().expect("round result published") {
            Ok(t) => Ok(t.clone()),
            Err(msg) => Err(SynapseError::Comm(msg.clone())),
        };

        state.departed += 1;
        if state.departed == inner.world_size {
            // Round fully consumed; open the barrier for the next collective.
            state.output = None;
            inner.cond.notify_all();
        }
        result
    }
}

/// Combine all contributions for one round.
fn combine(inputs: &[(Tensor, Collective)]) -> std::result::Result<Tensor, String> {
    let op = inputs[0].1;
    let first_dims = inputs[0].0.dims();
    for (rank, (t, rank_op)) in inputs.iter().enumerate() {
        if *rank_op != op {
            return Err(format!(
                "rank {} called {:?} while rank 0 called {:?}",
                rank, rank_op, op
            ));
        }
        let ok = match op {
            Collective::ReduceSum => t.dims() == first_dims,
            Collective::Gather(dim) => {
                t.dims().len() == first_dims.len()
                    && t.dims()
                        .iter()
                        .zip(first_dims)
                        .enumerate()
                        .all(|(d, (a, b))| d == dim || a == b)
            }
        };
        if !ok {
            return Err(format!(
                "rank {} contributed shape {:?}, expected {:?} for {:?}",
                rank,
                t.dims(),
                first_dims,
                op
            ));
        }
    }

    let combined = match op {
        Collective::ReduceSum => {
            let mut acc = inputs[0].0.clone();
            for (t, _) in &inputs[1..] {
                acc = (acc + t).map_err(|e| e.to_string())?;
            }
            acc
        }
        Collective::Gather(dim) => {
            let tensors: Vec<&Tensor> = inputs.iter().map(|(t, _)| t).collect();
            Tensor::cat(&tensors, dim).map_err(|e| e.to_string())?
        }
    };
    Ok(combined)
}

impl Communicator for ThreadGroupHandle {
    fn world_size(&self) -> usize {
        self.inner.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        self.run_round(tensor.clone(), Collective::ReduceSum)
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        self.run_round(tensor.clone(), Collective::Gather(dim))
    }
}
