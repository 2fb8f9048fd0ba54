use crate::{Comm, Communicator};
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::fmt::Debug;
use std::panic::resume_unwind;
use std::sync::Arc;

/// A communicator whose ranks are threads of the current process.
///
/// Collectives are implemented with a generation barrier: every rank deposits its contribution,
/// the last rank to arrive combines them and publishes the outcome, and all ranks pick the
/// outcome up before any of them can start the next collective on the same group.
#[derive(Debug, Clone)]
pub struct ThreadComm {
    rank: usize,
    group: Arc<Group>,
}

impl ThreadComm {
    /// Creates the `size` rank handles of a new world communicator.
    ///
    /// Each handle must be moved to its own thread.
    pub fn world(size: usize) -> Vec<Comm> {
        assert!(size > 0, "a communicator needs at least one rank");
        let group = Group::new(size);
        (0..size)
            .map(|rank| {
                Comm::new(ThreadComm {
                    rank,
                    group: Arc::clone(&group),
                })
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn split(&self, color: usize) -> Comm {
        match &*self.group.exchange(self.rank, Contribution::Color(color)) {
            Outcome::Split(assignment) => {
                let (group, rank) = &assignment[self.rank];
                Comm::new(ThreadComm {
                    rank: *rank,
                    group: Arc::clone(group),
                })
            }
            _ => unreachable!("split contributions always combine into a split outcome"),
        }
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Vec<Vec<u8>> {
        match &*self.group.exchange(self.rank, Contribution::Bytes(payload)) {
            Outcome::Gathered(payloads) => payloads.clone(),
            _ => unreachable!("byte contributions always combine into a gathered outcome"),
        }
    }

    fn all_reduce_sum(&self, values: &mut [f64]) {
        match &*self.group.exchange(self.rank, Contribution::Values(values.to_vec())) {
            Outcome::Reduced(sum) => values.copy_from_slice(sum),
            _ => unreachable!("value contributions always combine into a reduced outcome"),
        }
    }
}

/// Runs `f` on `size` threads, each receiving its own rank of a fresh [`ThreadComm`] world.
///
/// Returns the per-rank results in rank order. A panic on any rank is propagated.
pub fn run_spmd<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Comm) -> T + Sync,
{
    let comms = ThreadComm::world(size);
    let f = &f;
    crossbeam::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move |_| f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|payload| resume_unwind(payload)))
            .collect()
    })
    .unwrap_or_else(|payload| resume_unwind(payload))
}

enum Contribution {
    Bytes(Vec<u8>),
    Values(Vec<f64>),
    Color(usize),
}

enum Outcome {
    Empty,
    Gathered(Vec<Vec<u8>>),
    Reduced(Vec<f64>),
    /// For each rank of the parent group: its new group and its rank within it.
    Split(Vec<(Arc<Group>, usize)>),
}

struct Exchange {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Contribution>>,
    outcome: Arc<Outcome>,
}

struct Group {
    size: usize,
    exchange: Mutex<Exchange>,
    ready: Condvar,
}

impl Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group").field("size", &self.size).finish()
    }
}

impl Group {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            exchange: Mutex::new(Exchange {
                generation: 0,
                arrived: 0,
                slots: (0..size).map(|_| None).collect(),
                outcome: Arc::new(Outcome::Empty),
            }),
            ready: Condvar::new(),
        })
    }

    fn exchange(&self, rank: usize, contribution: Contribution) -> Arc<Outcome> {
        let mut state = self.exchange.lock();
        let generation = state.generation;
        debug_assert!(state.slots[rank].is_none(), "rank {} entered a collective twice", rank);
        state.slots[rank] = Some(contribution);
        state.arrived += 1;

        if state.arrived == self.size {
            let contributions = state
                .slots
                .iter_mut()
                .map(|slot| slot.take().expect("every rank has contributed"))
                .collect();
            state.outcome = Arc::new(combine(contributions));
            state.arrived = 0;
            state.generation += 1;
            trace!("collective generation {} completed on {} ranks", generation, self.size);
            self.ready.notify_all();
        } else {
            while state.generation == generation {
                self.ready.wait(&mut state);
            }
        }

        Arc::clone(&state.outcome)
    }
}

fn combine(contributions: Vec<Contribution>) -> Outcome {
    match contributions.first() {
        Some(Contribution::Bytes(_)) => Outcome::Gathered(
            contributions
                .into_iter()
                .map(|contribution| match contribution {
                    Contribution::Bytes(bytes) => bytes,
                    _ => panic!("ranks issued different collective operations"),
                })
                .collect(),
        ),
        Some(Contribution::Values(first)) => {
            let mut sum = vec![0.0; first.len()];
            for contribution in contributions {
                match contribution {
                    Contribution::Values(values) => {
                        assert_eq!(values.len(), sum.len(), "all-reduce buffers must have equal length");
                        for (s, v) in sum.iter_mut().zip(values) {
                            *s += v;
                        }
                    }
                    _ => panic!("ranks issued different collective operations"),
                }
            }
            Outcome::Reduced(sum)
        }
        Some(Contribution::Color(_)) => {
            let colors: Vec<usize> = contributions
                .into_iter()
                .map(|contribution| match contribution {
                    Contribution::Color(color) => color,
                    _ => panic!("ranks issued different collective operations"),
                })
                .collect();
            let mut groups: Vec<(usize, Arc<Group>)> = Vec::new();
            let mut assignment: Vec<(Arc<Group>, usize)> = Vec::with_capacity(colors.len());
            for (index, &color) in colors.iter().enumerate() {
                let size = colors.iter().filter(|&&c| c == color).count();
                let rank = colors[..index].iter().filter(|&&c| c == color).count();
                let group = match groups.iter().find(|(c, _)| *c == color) {
                    Some((_, group)) => Arc::clone(group),
                    None => {
                        let group = Group::new(size);
                        groups.push((color, Arc::clone(&group)));
                        group
                    }
                };
                assignment.push((group, rank));
            }
            Outcome::Split(assignment)
        }
        None => Outcome::Empty,
    }
}
