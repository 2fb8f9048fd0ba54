//! Distribution of the processes of a group among its subsystems.
use crate::error::Error;
use std::fmt::Debug;
use std::ops::Range;

/// A contiguous range of world ranks.
pub type ProcRange = Range<usize>;

/// Assigns a contiguous block of subsystems to a contiguous range of processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcAssignment {
    pub children: Range<usize>,
    pub procs: ProcRange,
}

pub trait ProcAllocator: Debug {
    /// Partitions `procs` among subsystems with the given weights.
    ///
    /// The returned assignments must cover the subsystems `0..weights.len()` and the processes
    /// `procs` with consecutive, non-empty ranges, in order.
    fn allocate(&self, weights: &[usize], procs: ProcRange) -> Result<Vec<ProcAssignment>, Error>;
}

/// Proportional, contiguous allocation.
///
/// With at least as many processes as subsystems, every subsystem gets one process and the
/// surplus is shared in proportion to the weights (largest remainder, ties going to the earlier
/// subsystem). With fewer processes, subsystems are cut into one contiguous block per process so
/// that the cumulative weights of the blocks are as even as the cut points allow.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProcAllocator;

impl ProcAllocator for DefaultProcAllocator {
    fn allocate(&self, weights: &[usize], procs: ProcRange) -> Result<Vec<ProcAssignment>, Error> {
        let n = weights.len();
        let nproc = procs.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        if nproc == 0 {
            return Err(Error::configuration("cannot allocate subsystems to an empty process range"));
        }

        // All-zero weights count as equal weights
        let weights: Vec<usize> = if weights.iter().all(|&w| w == 0) {
            vec![1; n]
        } else {
            weights.to_vec()
        };
        let total: usize = weights.iter().sum();

        if nproc >= n {
            let counts = proportional_counts(&weights, total, nproc - n);
            let mut start = procs.start;
            Ok(counts
                .iter()
                .enumerate()
                .map(|(i, &extra)| {
                    let end = start + 1 + extra;
                    let assignment = ProcAssignment {
                        children: i..i + 1,
                        procs: start..end,
                    };
                    start = end;
                    assignment
                })
                .collect())
        } else {
            let mut prefix = vec![0; n + 1];
            for (i, &w) in weights.iter().enumerate() {
                prefix[i + 1] = prefix[i] + w;
            }
            let mut cuts = vec![0];
            for k in 1..nproc {
                let lo = cuts[k - 1] + 1;
                let hi = n - (nproc - k);
                let cut = (lo..=hi)
                    .find(|&i| prefix[i] * nproc >= k * total)
                    .unwrap_or(hi);
                cuts.push(cut);
            }
            cuts.push(n);
            Ok(cuts
                .windows(2)
                .enumerate()
                .map(|(k, w)| ProcAssignment {
                    children: w[0]..w[1],
                    procs: procs.start + k..procs.start + k + 1,
                })
                .collect())
        }
    }
}

/// Shares `surplus` units among `weights` by the largest remainder method.
fn proportional_counts(weights: &[usize], total: usize, surplus: usize) -> Vec<usize> {
    let mut counts: Vec<usize> = weights.iter().map(|&w| surplus * w / total).collect();
    let assigned: usize = counts.iter().sum();
    let mut order: Vec<usize> = (0..weights.len()).collect();
    // Stable sort keeps lower indices first among equal remainders
    order.sort_by_key(|&i| std::cmp::Reverse(surplus * weights[i] % total));
    for &i in order.iter().take(surplus - assigned) {
        counts[i] += 1;
    }
    counts
}

/// Checks that a plan tiles both the subsystems and the process range.
pub(crate) fn validate_plan(
    path_name: &str,
    plan: &[ProcAssignment],
    num_children: usize,
    procs: &ProcRange,
) -> Result<(), Error> {
    let invalid = |reason: &str| {
        Error::configuration(format!(
            "invalid process allocation in '{}': {} (plan: {:?}, {} subsystems, procs {:?})",
            crate::variables::display_path(path_name),
            reason,
            plan,
            num_children,
            procs
        ))
    };

    if num_children == 0 {
        return if plan.is_empty() {
            Ok(())
        } else {
            Err(invalid("a group without subsystems must have an empty plan"))
        };
    }
    let (mut next_child, mut next_proc) = (0, procs.start);
    for assignment in plan {
        if assignment.children.is_empty() || assignment.procs.is_empty() {
            return Err(invalid("assignments must be non-empty"));
        }
        if assignment.children.start != next_child || assignment.procs.start != next_proc {
            return Err(invalid("assignments must be consecutive and non-overlapping"));
        }
        next_child = assignment.children.end;
        next_proc = assignment.procs.end;
    }
    if next_child != num_children || next_proc != procs.end {
        return Err(invalid("assignments must cover every subsystem and process"));
    }
    Ok(())
}
