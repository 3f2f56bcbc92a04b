use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Communicator;

/// The timed phases of a run. Step phases are listed in the order a step
/// executes them.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Initialization,
    Source,
    ElementForces,
    DanglingContribute,
    Distribute,
    AnchoredContribute,
    NodalUpdate,
    AnchoredShare,
    Assign,
    DanglingShare,
    Output,
    Checkpoint,
}

/// Group-wide wall time of one phase, in seconds.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl PhaseSummary {
    fn single(seconds: f64) -> Self {
        Self {
            min: seconds,
            max: seconds,
            sum: seconds,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            sum: self.sum + other.sum,
        }
    }
}




/**
 * Wall time accumulated per phase by one process.
 */
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    phases: BTreeMap<Phase, Duration>,
}




// ============================================================================
impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` and charge its wall time to `phase`.
    ///
    pub fn time<T, F: FnOnce() -> T>(&mut self, phase: Phase, f: F) -> T {
        let start = Instant::now();
        let result = f();
        self.add(phase, start.elapsed());
        result
    }

    pub fn add(&mut self, phase: Phase, elapsed: Duration) {
        *self.phases.entry(phase).or_default() += elapsed;
    }

    pub fn seconds(&self, phase: Phase) -> f64 {
        self.phases.get(&phase).map_or(0.0, Duration::as_secs_f64)
    }

    pub fn phases(&self) -> impl Iterator<Item = (Phase, Duration)> + '_ {
        self.phases.iter().map(|(p, d)| (*p, *d))
    }

    /// Reduce every phase to its (min, max, sum) over the group, in a
    /// single reduction. Returns `Some` on rank 0 only. A phase a process
    /// never entered counts as zero seconds there.
    ///
    pub fn reduce<C: Communicator>(&self, comm: &C) -> Result<Option<BTreeMap<Phase, PhaseSummary>>> {
        let local: BTreeMap<Phase, PhaseSummary> = self
            .phases
            .iter()
            .map(|(p, d)| (*p, PhaseSummary::single(d.as_secs_f64())))
            .collect();

        let combine = |a: Vec<u8>, b: Vec<u8>| -> Result<Vec<u8>> {
            let mut a: BTreeMap<Phase, PhaseSummary> = rmp_serde::decode::from_slice(&a)?;
            let b: BTreeMap<Phase, PhaseSummary> = rmp_serde::decode::from_slice(&b)?;
            let zero = PhaseSummary::single(0.0);

            for (phase, s) in &mut a {
                if !b.contains_key(phase) {
                    *s = s.merge(zero);
                }
            }
            for (phase, s) in b {
                let merged = match a.get(&phase) {
                    Some(t) => t.merge(s),
                    None => s.merge(zero),
                };
                a.insert(phase, merged);
            }
            Ok(rmp_serde::encode::to_vec(&a)?)
        };

        match comm.reduce(combine, rmp_serde::encode::to_vec(&local)?)? {
            Some(bytes) => Ok(Some(rmp_serde::decode::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Log a reduced timing table, with the mean over `size` processes.
///
pub fn log_summary(summary: &BTreeMap<Phase, PhaseSummary>, size: usize) {
    info!("{:<20} {:>10} {:>10} {:>10}", "phase", "min [s]", "avg [s]", "max [s]");
    for (phase, s) in summary {
        info!(
            "{:<20} {:>10.4} {:>10.4} {:>10.4}",
            format!("{:?}", phase),
            s.min,
            s.sum / size.max(1) as f64,
            s.max
        );
    }
}
