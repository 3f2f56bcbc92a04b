use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::error::{Error, Result};
use crate::message::{Communicator, ReduceOp};
use crate::stats::{Metrics, Phase};

/**
 * Per-process state every solver component reads: the process group, the
 * phase timers, and whether a stop was requested. There is exactly one per
 * process, passed by reference.
 */
pub struct SimulationContext<C: Communicator> {
    comm: C,
    metrics: Metrics,
    timing_barriers: bool,
    stop: Option<Arc<AtomicBool>>,
}




// ============================================================================
impl<C: Communicator> SimulationContext<C> {
    pub fn new(comm: C, timing_barriers: bool) -> Self {
        Self {
            comm,
            metrics: Metrics::new(),
            timing_barriers,
            stop: None,
        }
    }

    /// Set the stop flag on SIGINT or SIGTERM. Either every process in the
    /// group installs handlers or none does, since polling the flag is
    /// collective.
    ///
    pub fn install_signal_handlers(&mut self) -> Result<()> {
        let flag = Arc::new(AtomicBool::new(false));
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&flag))
                .map_err(|e| Error::io(format!("registering handler for signal {}", signal), e))?;
        }
        debug!("[{}] stop handlers installed", self.comm.rank());
        self.stop = Some(flag);
        Ok(())
    }

    /// Use an externally controlled stop flag instead of signal handlers.
    ///
    pub fn with_stop_flag(self, flag: Arc<AtomicBool>) -> Self {
        Self {
            stop: Some(flag),
            ..self
        }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run one phase of a step and charge its wall time. With timing
    /// barriers the group synchronizes first, so time spent waiting for
    /// slower processes is not billed to this phase.
    ///
    pub fn phase<T, F>(&mut self, phase: Phase, f: F) -> Result<T>
    where
        F: FnOnce(&C) -> Result<T>,
    {
        if self.timing_barriers {
            self.comm.barrier()?;
        }
        let start = Instant::now();
        let result = f(&self.comm);
        self.metrics.add(phase, start.elapsed());
        result
    }

    /// True if any process has a pending stop request. Collective when a
    /// stop flag is present; otherwise always false.
    ///
    pub fn stop_requested(&self) -> Result<bool> {
        match &self.stop {
            Some(flag) => {
                let local = flag.load(Ordering::Relaxed) as u64;
                Ok(self.comm.all_reduce_u64(ReduceOp::Max, local)? != 0)
            }
            None => Ok(false),
        }
    }

    pub fn polls_stop(&self) -> bool {
        self.stop.is_some()
    }
}
