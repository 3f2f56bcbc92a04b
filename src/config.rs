use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::boundary::AbsorbingBoundary;
use crate::coefficients::{Damping, DampingType, Parameters, QualityModel};
use crate::error::{Error, Result};

/**
 * Everything the solver needs to know about a run besides the mesh. The
 * binary fills this in from the command line; it is validated once, before
 * any communication, and then treated as read-only.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub start_time: f64,
    pub end_time: f64,
    pub delta_t: f64,
    /// Highest frequency the damping fit covers, in Hz.
    pub max_frequency: f64,
    pub damping: DampingType,
    pub quality_model: QualityModel,
    /// Largest damping ratio any element gets.
    pub threshold_damping: f64,
    /// Largest Vp / Vs ratio used to compute an element's lambda.
    pub threshold_vp_vs: f64,
    pub output_rate: usize,
    /// Steps between checkpoints; zero disables them.
    pub checkpoint_rate: usize,
    /// Resume from a checkpoint instead of starting at rest.
    pub use_checkpoint: bool,
    pub checkpoint_dir: PathBuf,
    pub restart_file: Option<PathBuf>,
    /// Append the global id to every exchanged record, and check it.
    pub debug_global_ids: bool,
    /// Synchronize the group between step phases so per-phase timings are
    /// comparable across processes.
    pub timing_barriers: bool,
    pub absorbing_boundary: AbsorbingBoundary,
    pub damping_statistics: bool,
    pub volume_output: Option<PathBuf>,
    /// Where to write the CBOR run report.
    pub report: Option<PathBuf>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            end_time: 1.0,
            delta_t: 1e-3,
            max_frequency: 1.0,
            damping: DampingType::Rayleigh,
            quality_model: QualityModel::Hartzell,
            threshold_damping: 0.1,
            threshold_vp_vs: 3.0,
            output_rate: 10,
            checkpoint_rate: 0,
            use_checkpoint: false,
            checkpoint_dir: PathBuf::from("checkpoints"),
            restart_file: None,
            debug_global_ids: false,
            timing_barriers: false,
            absorbing_boundary: AbsorbingBoundary::Off,
            damping_statistics: false,
            volume_output: None,
            report: None,
        }
    }
}




// ============================================================================
impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.start_time < 0.0 || self.end_time < 0.0 || self.start_time > self.end_time {
            return fail(format!(
                "illegal start time {} or end time {}",
                self.start_time, self.end_time
            ));
        }
        if !(self.delta_t > 0.0) {
            return fail(format!("illegal delta t {}", self.delta_t));
        }
        if !(self.max_frequency > 0.0) {
            return fail(format!("illegal max frequency {}", self.max_frequency));
        }
        if self.output_rate == 0 {
            return fail("output rate must be positive".into());
        }
        if self.threshold_damping < 0.0 {
            return fail(format!("illegal threshold damping {}", self.threshold_damping));
        }
        if self.threshold_vp_vs < 0.0 {
            return fail(format!("illegal threshold Vp over Vs {}", self.threshold_vp_vs));
        }
        if self.total_steps() == 0 {
            return fail(format!(
                "no time steps between {} and {} with delta t {}",
                self.start_time, self.end_time, self.delta_t
            ));
        }
        Ok(())
    }

    pub fn total_steps(&self) -> usize {
        ((self.end_time - self.start_time) / self.delta_t).floor() as usize
    }

    pub fn damping_model(&self) -> Damping {
        Damping::new(
            self.damping,
            self.max_frequency,
            self.quality_model,
            self.threshold_damping,
        )
    }

    pub fn parameters(&self) -> Parameters {
        Parameters {
            delta_t: self.delta_t,
            damping: self.damping_model(),
            threshold_vp_vs: self.threshold_vp_vs,
            boundary: self.absorbing_boundary,
        }
    }
}
