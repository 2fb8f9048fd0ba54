//! mdao-comm
//! =========
//!
//! Collective communication for single-program-multiple-data model setup.
//!
//! Every rank of a communicator runs the same program and must issue the same sequence of
//! collective calls. A collective that some rank never reaches blocks forever; this is treated
//! as a programming error and is not detected.

mod thread;

pub use thread::{run_spmd, ThreadComm};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::sync::Arc;

/// The collective operations required by hierarchical model setup and distributed norms.
pub trait Communicator: Debug + Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Splits the communicator into disjoint sub-communicators.
    ///
    /// Ranks passing the same `color` end up in the same sub-communicator, ordered by their rank
    /// in `self`. Collective over `self`.
    fn split(&self, color: usize) -> Comm;

    /// Gathers one opaque payload from every rank, returned in rank order on every rank.
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Vec<Vec<u8>>;

    /// Element-wise sum of `values` across all ranks, written back into `values` on every rank.
    ///
    /// All ranks must pass slices of the same length.
    fn all_reduce_sum(&self, values: &mut [f64]);
}

#[derive(Debug)]
pub enum CommError {
    /// A payload could not be encoded before sending.
    Encode(String),
    /// A received payload could not be decoded.
    Decode { rank: usize, message: String },
}

impl Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            CommError::Encode(msg) => write!(f, "failed to encode collective payload: {}", msg),
            CommError::Decode { rank, message } => {
                write!(f, "failed to decode collective payload from rank {}: {}", rank, message)
            }
        }
    }
}

impl Error for CommError {}

/// A shared handle to a communicator.
///
/// Cloning is cheap; all clones refer to the same communicator.
#[derive(Debug, Clone)]
pub struct Comm(Arc<dyn Communicator>);

impl Comm {
    pub fn new(communicator: impl Communicator + 'static) -> Self {
        Self(Arc::new(communicator))
    }

    /// A communicator containing only the calling process.
    pub fn serial() -> Self {
        Self::new(SerialComm)
    }

    pub fn rank(&self) -> usize {
        self.0.rank()
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub fn split(&self, color: usize) -> Comm {
        self.0.split(color)
    }

    pub fn all_gather_bytes(&self, payload: Vec<u8>) -> Vec<Vec<u8>> {
        self.0.all_gather_bytes(payload)
    }

    pub fn all_reduce_sum(&self, values: &mut [f64]) {
        self.0.all_reduce_sum(values)
    }

    /// Gathers a serializable value from every rank, in rank order.
    pub fn all_gather<T>(&self, value: &T) -> Result<Vec<T>, CommError>
    where
        T: Serialize + DeserializeOwned,
    {
        let bytes = serde_json::to_vec(value).map_err(|err| CommError::Encode(err.to_string()))?;
        self.all_gather_bytes(bytes)
            .into_iter()
            .enumerate()
            .map(|(rank, payload)| {
                serde_json::from_slice(&payload).map_err(|err| CommError::Decode {
                    rank,
                    message: err.to_string(),
                })
            })
            .collect()
    }

    pub fn all_reduce_scalar(&self, value: f64) -> f64 {
        let mut buffer = [value];
        self.all_reduce_sum(&mut buffer);
        buffer[0]
    }
}

/// The trivial communicator of a single process.
#[derive(Debug, Copy, Clone, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn split(&self, _color: usize) -> Comm {
        Comm::serial()
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Vec<Vec<u8>> {
        vec![payload]
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) {}
}
