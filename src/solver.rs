use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoints;
use crate::coefficients::{self, Coefficients, NodeMass, TimeStepReport};
use crate::config::SolverConfig;
use crate::constraint::{self, Adjust};
use crate::context::SimulationContext;
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::message::{Communicator, Direction, Payload, ReduceOp};
use crate::num_vec::Vec3;
use crate::output::{OutputHook, VolumeOutput};
use crate::record::RecordLayout;
use crate::schedule::{self, Schedule};
use crate::source::LoadSource;
use crate::stats::{self, Phase, PhaseSummary};
use crate::stiffness::{ElementConstants, ReferenceStiffness};

/// Steps between polls of the stop flag.
const STOP_POLL_INTERVAL: usize = 10;

/// Steps between progress messages.
const PROGRESS_INTERVAL: usize = 50;

/// How a call to `Solver::run` ended.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub start_step: usize,
    pub final_step: usize,
    pub stopped: bool,
    /// Per-phase wall time over the group; present on rank 0 only.
    pub timings: Option<BTreeMap<Phase, PhaseSummary>>,
}

#[derive(Serialize)]
struct RunReport<'a> {
    config: &'a SolverConfig,
    group_size: usize,
    time_step: &'a TimeStepReport,
    summary: &'a RunSummary,
}

/// Add the internal forces of every included element to `force`, from the
/// current displacement `tm1` and its increment since `tm2`.
///
pub fn element_forces(
    mesh: &Mesh,
    stiffness: &ReferenceStiffness,
    constants: &[ElementConstants],
    tm1: &[Vec3],
    tm2: &[Vec3],
    force: &mut [Vec3],
) {
    for (element, c) in mesh.elements().iter().zip(constants) {
        if element.is_excluded() {
            continue;
        }
        let mut u = [Vec3::zeros(); 8];
        let mut du = [Vec3::zeros(); 8];

        for (j, &n) in element.nodes.iter().enumerate() {
            u[j] = tm1[n];
            du[j] = tm1[n] - tm2[n];
        }
        let mut f = [Vec3::zeros(); 8];
        stiffness.add_element_force(c, &u, &du, &mut f);

        for (j, &n) in element.nodes.iter().enumerate() {
            force[n] += f[j];
        }
    }
}

/// The leapfrog update of every harbored node: the new displacement goes
/// into `tm2`, and the force accumulator is cleared. A node with no mass
/// here (an anchor harbored only for its dangling nodes) gets zero; its
/// owner sends the real value afterwards.
///
pub fn nodal_update(mass: &[NodeMass], tm1: &[Vec3], tm2: &mut [Vec3], force: &mut [Vec3]) {
    for (((m, u1), u2), f) in mass.iter().zip(tm1).zip(tm2.iter_mut()).zip(force.iter_mut()) {
        let mut total = *f;
        for k in 0..3 {
            total[k] += m.mass2_minus_am[k] * u1[k] - m.mass_minus_am[k] * u2[k];
        }
        *u2 = if m.mass_simple == 0.0 {
            Vec3::zeros()
        } else {
            total / m.mass_simple
        };
        *f = Vec3::zeros();
    }
}




/**
 * The explicit time integrator of one process. Construction runs the whole
 * initialization (damping report, element constants, mass exchange);
 * `step` advances one time step, and `run` drives the loop with checkpoints,
 * outputs and stop requests.
 */
pub struct Solver<C: Communicator> {
    context: SimulationContext<C>,
    mesh: Mesh,
    config: SolverConfig,
    stiffness: ReferenceStiffness,
    constants: Vec<ElementConstants>,
    mass: Vec<NodeMass>,
    dangling: Schedule,
    anchored: Schedule,
    tm1: Vec<Vec3>,
    tm2: Vec<Vec3>,
    force: Vec<Vec3>,
    sources: Vec<Box<dyn LoadSource>>,
    outputs: Vec<Box<dyn OutputHook<C>>>,
    checkpoints: Checkpoints,
    time_step: TimeStepReport,
    start_step: usize,
}




// ============================================================================
impl<C: Communicator> Solver<C> {
    pub fn new(mut context: SimulationContext<C>, mesh: Mesh, config: SolverConfig) -> Result<Self> {
        config.validate()?;

        let damping = config.damping_model();
        let time_step = coefficients::time_step_report(
            context.comm(),
            &mesh,
            &damping,
            config.damping_statistics,
        )?;
        if context.rank() == 0 {
            log_time_step_report(&time_step, config.delta_t);
        }

        let params = config.parameters();
        let Coefficients { elements, nodes } =
            context.phase(Phase::Initialization, |_| Coefficients::build(&mesh, &params))?;
        let mut mass = nodes;

        let (mut dangling, mut anchored) = Schedule::build(&mesh)?;
        schedule::report(context.comm(), &dangling, &anchored)?;

        let debug = config.debug_global_ids;
        dangling.prepare_uniform(RecordLayout::of::<NodeMass>(debug));
        anchored.prepare_uniform(RecordLayout::of::<NodeMass>(debug));

        context.phase(Phase::Initialization, |comm| {
            dangling.exchange(comm, &mesh, &mut mass, Direction::Contribute, Payload::Mass)?;
            constraint::adjust(&mesh, &mut mass, Adjust::Distribute);
            anchored.exchange(comm, &mesh, &mut mass, Direction::Contribute, Payload::Mass)
        })?;

        dangling.prepare_uniform(RecordLayout::of::<Vec3>(debug));
        anchored.prepare_uniform(RecordLayout::of::<Vec3>(debug));

        let n = mesh.num_harbored();
        let mut tm1 = vec![Vec3::zeros(); n];
        let mut tm2 = vec![Vec3::zeros(); n];
        let checkpoints = Checkpoints::new(&config.checkpoint_dir, config.restart_file.clone());

        let start_step = if config.use_checkpoint {
            let step = checkpoints.read(context.comm(), &mut tm1, &mut tm2)?;
            if context.rank() == 0 {
                info!("restarting from {} at step {}", checkpoints.restart_path().display(), step);
            }
            step
        } else {
            0
        };

        let mut outputs: Vec<Box<dyn OutputHook<C>>> = Vec::new();
        if let Some(path) = &config.volume_output {
            let volume = VolumeOutput::create(
                context.comm(),
                &mesh,
                path,
                config.total_steps(),
                config.output_rate,
            )?;
            outputs.push(Box::new(volume));
        }

        Ok(Self {
            context,
            mesh,
            config,
            stiffness: ReferenceStiffness::new(),
            constants: elements,
            mass,
            dangling,
            anchored,
            tm1,
            tm2,
            force: vec![Vec3::zeros(); n],
            sources: Vec::new(),
            outputs,
            checkpoints,
            time_step,
            start_step,
        })
    }

    pub fn add_source<S: LoadSource + 'static>(&mut self, source: S) {
        self.sources.push(Box::new(source));
    }

    pub fn add_output<H: OutputHook<C> + 'static>(&mut self, hook: H) {
        self.outputs.push(Box::new(hook));
    }

    pub fn context(&self) -> &SimulationContext<C> {
        &self.context
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn mass(&self) -> &[NodeMass] {
        &self.mass
    }

    pub fn time_step_report(&self) -> &TimeStepReport {
        &self.time_step
    }

    pub fn start_step(&self) -> usize {
        self.start_step
    }

    /// The newest displacement: after a step it is held in `tm2`, until
    /// the next step swaps the buffers.
    ///
    pub fn displacement(&self) -> &[Vec3] {
        &self.tm2
    }

    pub fn previous_displacement(&self) -> &[Vec3] {
        &self.tm1
    }

    pub fn force(&self) -> &[Vec3] {
        &self.force
    }

    /// Replace the displacement history, as if `previous` and `current`
    /// were the last two computed displacements.
    ///
    pub fn set_history(&mut self, previous: Vec<Vec3>, current: Vec<Vec3>) -> Result<()> {
        let n = self.mesh.num_harbored();
        if previous.len() != n || current.len() != n {
            return Err(Error::InvalidMesh(format!(
                "history of {} and {} nodes for a mesh of {}",
                previous.len(),
                current.len(),
                n
            )));
        }
        self.tm1 = previous;
        self.tm2 = current;
        Ok(())
    }

    /// Total mass of the group's mesh, summed over the anchored nodes each
    /// process owns. Collective.
    ///
    pub fn total_mass(&self) -> Result<f64> {
        let local: f64 = self
            .mesh
            .nodes()
            .iter()
            .zip(&self.mass)
            .filter(|(node, _)| node.is_owned() && !node.conformity.is_dangling())
            .map(|(_, m)| m.mass_simple)
            .sum();
        self.context.comm().all_reduce_f64(ReduceOp::Sum, local)
    }

    /// Advance one time step. Every process in the group must call this
    /// with the same step number.
    ///
    pub fn step(&mut self, step: usize) -> Result<()> {
        let Self {
            context,
            mesh,
            config,
            stiffness,
            constants,
            mass,
            dangling,
            anchored,
            tm1,
            tm2,
            force,
            sources,
            outputs,
            ..
        } = self;

        std::mem::swap(tm1, tm2);
        let dt = config.delta_t;

        if step % config.output_rate == 0 && !outputs.is_empty() {
            context.phase(Phase::Output, |comm| {
                for hook in outputs.iter_mut() {
                    hook.write_step(comm, mesh, step, tm1, tm2, dt)?;
                }
                Ok(())
            })?;
        }

        context.phase(Phase::Source, |_| {
            for source in sources.iter_mut() {
                source.apply(step, dt * dt, force)?;
            }
            Ok(())
        })?;

        context.phase(Phase::ElementForces, |_| {
            element_forces(mesh, stiffness, constants, tm1, tm2, force);
            Ok(())
        })?;

        context.phase(Phase::DanglingContribute, |comm| {
            dangling.exchange(comm, mesh, force, Direction::Contribute, Payload::Force)
        })?;
        context.phase(Phase::Distribute, |_| {
            constraint::adjust(mesh, force, Adjust::Distribute);
            Ok(())
        })?;
        context.phase(Phase::AnchoredContribute, |comm| {
            anchored.exchange(comm, mesh, force, Direction::Contribute, Payload::Force)
        })?;

        context.phase(Phase::NodalUpdate, |_| {
            nodal_update(mass, tm1, tm2, force);
            Ok(())
        })?;

        context.phase(Phase::AnchoredShare, |comm| {
            anchored.exchange(comm, mesh, tm2, Direction::Share, Payload::Displacement)
        })?;
        context.phase(Phase::Assign, |_| {
            constraint::adjust(mesh, tm2, Adjust::Assign);
            Ok(())
        })?;
        context.phase(Phase::DanglingShare, |comm| {
            dangling.exchange(comm, mesh, tm2, Direction::Share, Payload::Displacement)
        })
    }

    /// Write a checkpoint that resumes at `step`. Collective.
    ///
    pub fn write_checkpoint(&mut self, step: usize) -> Result<PathBuf> {
        let Self {
            context,
            checkpoints,
            tm1,
            tm2,
            ..
        } = self;
        context.phase(Phase::Checkpoint, |comm| checkpoints.write(comm, step, tm1, tm2))
    }

    /// Step from the start step to the configured total, checkpointing and
    /// honoring stop requests along the way, then reduce the timings and
    /// write the run report.
    ///
    pub fn run(&mut self) -> Result<RunSummary> {
        let total = self.config.total_steps();
        let rate = self.config.checkpoint_rate;
        let mut step = self.start_step;
        let mut stopped = false;

        if self.context.rank() == 0 {
            info!("running steps {} to {} with dt = {}", step, total, self.config.delta_t);
        }

        while step < total {
            if rate != 0 && step != self.start_step && step % rate == 0 {
                self.write_checkpoint(step)?;
            }
            self.step(step)?;
            step += 1;

            if self.context.rank() == 0 && step % PROGRESS_INTERVAL == 0 {
                info!("step {} / {}", step, total);
            }
            if self.context.polls_stop() && step % STOP_POLL_INTERVAL == 0 && self.context.stop_requested()? {
                if self.context.rank() == 0 {
                    warn!("stop requested, checkpointing at step {}", step);
                }
                self.write_checkpoint(step)?;
                stopped = true;
                break;
            }
        }

        let timings = self.context.metrics().reduce(self.context.comm())?;
        let summary = RunSummary {
            start_step: self.start_step,
            final_step: step,
            stopped,
            timings,
        };

        if let Some(timings) = &summary.timings {
            stats::log_summary(timings, self.context.size());
        }
        if self.context.rank() == 0 {
            if let Some(path) = &self.config.report {
                self.write_report(path, &summary)?;
            }
        }
        Ok(summary)
    }

    fn write_report(&self, path: &Path, summary: &RunSummary) -> Result<()> {
        let io = |e| Error::io(format!("writing report {}", path.display()), e);
        let file = File::create(path).map_err(io)?;
        let report = RunReport {
            config: &self.config,
            group_size: self.context.size(),
            time_step: &self.time_step,
            summary,
        };
        let mut writer = BufWriter::new(file);
        ciborium::ser::into_writer(&report, &mut writer)?;
        writer.flush().map_err(io)?;
        info!("wrote run report {}", path.display());
        Ok(())
    }
}

fn log_time_step_report(report: &TimeStepReport, delta_t: f64) {
    info!("critical delta t = {:.6e}", report.critical_delta_t);
    info!("minimum edge size = {:.6}", report.minimum_edge);

    if delta_t > report.critical_delta_t {
        warn!(
            "delta t = {:.6e} exceeds the critical delta t = {:.6e}",
            delta_t, report.critical_delta_t
        );
    }
    if let Some(s) = &report.statistics {
        info!("zeta          {:>12.6} {:>12.6}", s.zeta.0, s.zeta.1);
        info!("xi            {:>12.6} {:>12.6}", s.xi.0, s.xi.1);
        info!("vs / vp       {:>12.6} {:>12.6}", s.vs_over_vp.0, s.vs_over_vp.1);
        info!("zeta vp / vs  {:>12.6} {:>12.6}", s.vp_over_vs_zeta.0, s.vp_over_vs_zeta.1);
        info!("vs            {:>12.3} {:>12.3}", s.vs.0, s.vs.1);
        info!("dt factor (xi)   {:.6e}", s.dt_factor_x);
        info!("dt factor (zeta) {:.6e}", s.dt_factor_z);
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use std::sync::Mutex;

    use crate::boundary::AbsorbingBoundary;
    use crate::coefficients::DampingType;
    use crate::mesh::{ElementKind, Material};
    use crate::meshing::GlobalMesh;
    use crate::message::local;
    use crate::source::PointLoad;

    const ROCK: Material = Material {
        vp: 1000.0,
        vs: 500.0,
        rho: 2000.0,
    };

    fn config(delta_t: f64, steps: usize) -> SolverConfig {
        SolverConfig {
            delta_t,
            end_time: delta_t * (steps as f64 + 0.5),
            damping: DampingType::None,
            absorbing_boundary: AbsorbingBoundary::Off,
            output_rate: 1000000,
            debug_global_ids: true,
            ..Default::default()
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tremor-solver-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    /// Deterministic values in [-scale, scale).
    fn noise(n: usize, seed: u64, scale: f64) -> Vec<Vec3> {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0) * scale
        };
        (0..n).map(|_| Vec3::new(next(), next(), next())).collect()
    }

    /// Largest displacement of a free element over 1000 steps, released at
    /// rest from a random deformation.
    fn single_element_peak(courant: f64) -> f64 {
        let edge = 10.0;
        let meshes = GlobalMesh::uniform([1, 1, 1], edge, |_| ROCK).partition(1).unwrap();
        let delta_t = courant * edge / ROCK.vp;

        let peaks = local::run(1, |comm| {
            let context = SimulationContext::new(comm, false);
            let mut solver = Solver::new(context, meshes[0].clone(), config(delta_t, 1000)).unwrap();
            let critical = solver.time_step_report().critical_delta_t;
            assert!((critical - edge / ROCK.vp).abs() < 1e-15);

            let start = noise(8, 1, 1e-3);
            solver.set_history(start.clone(), start).unwrap();

            let mut peak: f64 = 0.0;
            for step in 0..1000 {
                solver.step(step).unwrap();
                for u in solver.displacement() {
                    peak = if u.max_abs().is_finite() { peak.max(u.max_abs()) } else { f64::INFINITY };
                }
            }
            peak
        });
        peaks[0]
    }

    #[test]
    fn leapfrog_is_stable_below_the_critical_step() {
        assert!(single_element_peak(0.4) < 1e-1);
    }

    #[test]
    fn leapfrog_diverges_above_the_critical_step() {
        assert!(!(single_element_peak(1.2) < 1e3));
    }

    #[test]
    fn total_mass_is_conserved_across_partitions() {
        let uniform = GlobalMesh::uniform([2, 2, 1], 10.0, |_| ROCK);
        let refined = GlobalMesh::coarse_fine_interface(10.0, ROCK);
        let cases = [
            (uniform.partition(3).unwrap(), 4.0 * 1000.0 * ROCK.rho),
            (refined.partition(2).unwrap(), 1500.0 * ROCK.rho),
            (
                refined.partition_with(3, |e| [2, 0, 1, 0, 2][e]).unwrap(),
                1500.0 * ROCK.rho,
            ),
        ];

        for (meshes, expected) in cases {
            let totals = local::run(meshes.len(), |comm| {
                let mesh = meshes[comm.rank()].clone();
                let solver = Solver::new(SimulationContext::new(comm, false), mesh, config(1e-3, 10)).unwrap();
                solver.total_mass().unwrap()
            });
            for total in totals {
                assert!((total - expected).abs() < 1e-9 * expected, "{} != {}", total, expected);
            }
        }
    }

    #[test]
    fn shared_nodes_agree_after_each_step() {
        let meshes = GlobalMesh::uniform([2, 1, 1], 10.0, |_| ROCK).partition(2).unwrap();
        let shared: Vec<u64> = meshes[1]
            .nodes()
            .iter()
            .filter(|n| !n.is_owned())
            .map(|n| n.gid)
            .collect();
        assert_eq!(shared.len(), 4);
        assert!(meshes.iter().all(|m| m.owned_dangling().is_empty()));

        let results = local::run(2, |comm| {
            let mesh = meshes[comm.rank()].clone();
            let mut solver = Solver::new(SimulationContext::new(comm, false), mesh, config(1e-3, 3)).unwrap();
            solver.add_source(PointLoad::new(solver.mesh(), 0, Vec3::new(1.0, 0.0, 0.0), 0..1));

            let mut history = Vec::new();
            for step in 0..3 {
                let before = solver.displacement().to_vec();
                solver.step(step).unwrap();
                assert_eq!(solver.previous_displacement(), &before[..]);
                assert!(solver.force().iter().all(|f| *f == Vec3::zeros()));
                let values: Vec<Vec3> = shared
                    .iter()
                    .map(|&g| solver.displacement()[solver.mesh().local_index(g).unwrap()])
                    .collect();
                history.push(values);
            }
            history
        });

        assert_eq!(results[0], results[1]);
        assert!(results[0][2].iter().any(|u| u.max_abs() > 0.0));
    }

    #[test]
    fn dangling_nodes_follow_their_anchors() {
        let global = GlobalMesh::coarse_fine_interface(10.0, ROCK);
        let loaded = global
            .nodes()
            .iter()
            .position(|n| n.ticks == [3, 1, 1])
            .unwrap();

        for table in [[0, 1, 1, 1, 1], [1, 0, 1, 0, 1], [0, 0, 1, 1, 0]] {
            let meshes = global.partition_with(2, |e| table[e]).unwrap();

            local::run(2, |comm| {
                let mesh = meshes[comm.rank()].clone();
                let mut solver =
                    Solver::new(SimulationContext::new(comm, false), mesh, config(1e-3, 4)).unwrap();

                let gid = solver
                    .mesh()
                    .nodes()
                    .iter()
                    .find(|n| n.ticks == global.nodes()[loaded].ticks)
                    .map(|n| n.gid);
                let gid = solver.context().comm().all_reduce_u64(ReduceOp::Min, gid.unwrap_or(u64::MAX)).unwrap();
                solver.add_source(PointLoad::new(solver.mesh(), gid, Vec3::new(0.0, 1.0, 1.0), 0..2));

                for step in 0..4 {
                    solver.step(step).unwrap();
                }

                let u = solver.displacement();
                let mut moved = false;
                for (d, node) in solver.mesh().nodes().iter().enumerate() {
                    if let crate::mesh::Conformity::Dangling { anchors, deps } = &node.conformity {
                        let expected = anchors.iter().fold(Vec3::zeros(), |sum, &a| sum + u[a] / *deps);
                        let scale = expected.max_abs().max(1e-30);
                        assert!((u[d] - expected).max_abs() <= 1e-12 * scale, "node {}", node.gid);
                        moved |= u[d].max_abs() > 0.0;
                    }
                }
                if !solver.mesh().owned_dangling().is_empty() {
                    assert!(moved);
                }
            });
        }
    }

    #[test]
    fn restart_continues_the_same_trajectory() {
        let dir = scratch_dir("restart");
        let meshes = GlobalMesh::uniform([2, 1, 1], 10.0, |_| ROCK).partition(2).unwrap();
        let base = SolverConfig {
            checkpoint_rate: 5,
            checkpoint_dir: dir.clone(),
            ..config(1e-3, 12)
        };

        let straight = local::run(2, |comm| {
            let mesh = meshes[comm.rank()].clone();
            let mut solver = Solver::new(SimulationContext::new(comm, false), mesh, base.clone()).unwrap();
            solver.add_source(PointLoad::new(solver.mesh(), 0, Vec3::new(1.0, -1.0, 0.5), 0..3));
            let summary = solver.run().unwrap();
            assert_eq!(summary.final_step, 12);
            solver.displacement().to_vec()
        });
        assert!(dir.join("checkpoint.out0").exists());
        assert!(dir.join("checkpoint.out1").exists());

        let resumed = local::run(2, |comm| {
            let config = SolverConfig {
                use_checkpoint: true,
                restart_file: Some(dir.join("checkpoint.out1")),
                ..base.clone()
            };
            let mesh = meshes[comm.rank()].clone();
            let mut solver = Solver::new(SimulationContext::new(comm, false), mesh, config).unwrap();
            assert_eq!(solver.start_step(), 10);
            solver.run().unwrap();
            solver.displacement().to_vec()
        });

        assert_eq!(straight, resumed);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stop_request_checkpoints_and_reports() {
        let dir = scratch_dir("stop");
        let meshes = GlobalMesh::uniform([2, 1, 1], 10.0, |_| ROCK).partition(2).unwrap();
        let config = SolverConfig {
            checkpoint_dir: dir.clone(),
            report: Some(dir.join("report.cbor")),
            ..config(1e-3, 100)
        };
        std::fs::create_dir_all(&dir).unwrap();

        let summaries = local::run(2, |comm| {
            let rank = comm.rank();
            let flag = Arc::new(AtomicBool::new(true));
            let context = SimulationContext::new(comm, true).with_stop_flag(flag);
            let mut solver = Solver::new(context, meshes[rank].clone(), config.clone()).unwrap();
            solver.run().unwrap()
        });

        for s in &summaries {
            assert_eq!(s.final_step, 10);
            assert!(s.stopped);
        }
        let timings = summaries[0].timings.as_ref().unwrap();
        assert!(timings.contains_key(&Phase::NodalUpdate));
        assert!(summaries[1].timings.is_none());

        let bytes = std::fs::read(dir.join("checkpoint.out0")).unwrap();
        assert_eq!(i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 10);

        let report: ciborium::value::Value =
            ciborium::de::from_reader(File::open(dir.join("report.cbor")).unwrap()).unwrap();
        assert!(matches!(report, ciborium::value::Value::Map(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn air_elements_carry_mass_but_no_force() {
        const AIR: Material = Material {
            vp: 300.0,
            vs: 150.0,
            rho: 1.2,
        };
        let build = |air: ElementKind| {
            let mut global = GlobalMesh::new(10.0, [2, 1, 1]);
            global.add_element([0, 0, 0], 1, ROCK, ElementKind::Solid);
            global.add_element([1, 0, 0], 1, AIR, air);
            global.partition(1).unwrap().remove(0)
        };
        let mesh = build(ElementKind::Air);
        let far: Vec<usize> = (0..mesh.num_harbored())
            .filter(|&i| mesh.nodes()[i].ticks[0] == 2)
            .collect();
        assert_eq!(far.len(), 4);

        let mut u = vec![Vec3::zeros(); mesh.num_harbored()];
        for &i in &far {
            u[i] = Vec3::new(1e-3, -2e-3, 5e-4);
        }

        // The same displacement pushes back once the element is solid.
        let params = config(1e-3, 3).parameters();
        let forces = |mesh: &Mesh| {
            let coefficients = Coefficients::build(mesh, &params).unwrap();
            let mut force = vec![Vec3::zeros(); mesh.num_harbored()];
            element_forces(mesh, &ReferenceStiffness::new(), &coefficients.elements, &u, &u, &mut force);
            force
        };
        assert!(forces(&mesh).iter().all(|f| *f == Vec3::zeros()));
        assert!(forces(&build(ElementKind::Solid)).iter().any(|f| f.max_abs() > 0.0));

        let results = local::run(1, |comm| {
            let mut solver = Solver::new(SimulationContext::new(comm, false), mesh.clone(), config(1e-3, 3)).unwrap();
            solver.set_history(u.clone(), u.clone()).unwrap();
            solver.step(0).unwrap();
            let mass: Vec<f64> = solver.mass().iter().map(|m| m.mass_simple).collect();
            (solver.displacement().to_vec(), mass, solver.total_mass().unwrap())
        });
        let (after, mass, total) = &results[0];

        for (a, b) in after.iter().zip(&u) {
            assert!((*a - *b).max_abs() <= 1e-15);
        }
        for &i in &far {
            assert!((mass[i] - AIR.rho * 1000.0 / 8.0).abs() < 1e-9);
        }
        let expected = (ROCK.rho + AIR.rho) * 1000.0;
        assert!((total - expected).abs() < 1e-9 * expected);
    }

    #[derive(Clone, Default)]
    struct StepLog(Arc<Mutex<Vec<(usize, usize, f64)>>>);

    impl<C: Communicator> OutputHook<C> for StepLog {
        fn write_step(
            &mut self,
            _comm: &C,
            mesh: &Mesh,
            step: usize,
            tm1: &[Vec3],
            tm2: &[Vec3],
            delta_t: f64,
        ) -> Result<()> {
            assert_eq!(tm1.len(), tm2.len());
            let velocities = crate::output::velocity_buffer(mesh, tm1, tm2, delta_t).len();
            self.0.lock().unwrap().push((step, velocities, delta_t));
            Ok(())
        }
    }

    #[test]
    fn output_hooks_run_at_the_output_rate() {
        let meshes = GlobalMesh::uniform([2, 1, 1], 10.0, |_| ROCK).partition(2).unwrap();
        let config = SolverConfig {
            output_rate: 3,
            ..config(1e-3, 10)
        };

        let logs = local::run(2, |comm| {
            let rank = comm.rank();
            let log = StepLog::default();
            let mut solver = Solver::new(SimulationContext::new(comm, false), meshes[rank].clone(), config.clone()).unwrap();
            solver.add_output(log.clone());
            solver.run().unwrap();
            let owned = solver.mesh().num_owned();
            let steps = log.0.lock().unwrap().clone();
            (owned, steps)
        });

        for (owned, steps) in logs {
            assert_eq!(steps, [0, 3, 6, 9].iter().map(|&s| (s, owned, 1e-3)).collect::<Vec<_>>());
        }
    }

    #[test]
    fn invalid_config_is_rejected_before_communication() {
        let meshes = GlobalMesh::uniform([1, 1, 1], 10.0, |_| ROCK).partition(1).unwrap();
        let results = local::run(1, |comm| {
            let config = SolverConfig {
                delta_t: -1.0,
                ..Default::default()
            };
            Solver::new(SimulationContext::new(comm, false), meshes[0].clone(), config).map(|_| ())
        });
        assert!(matches!(results[0], Err(Error::Config(_))));
    }
}
