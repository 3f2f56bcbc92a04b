use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use tremor::boundary::AbsorbingBoundary;
use tremor::coefficients::{DampingType, QualityModel};
use tremor::config::SolverConfig;
use tremor::context::SimulationContext;
use tremor::mesh::{Material, Mesh};
use tremor::meshing::GlobalMesh;
use tremor::message::local;
use tremor::message::tcp::TcpCommunicator;
use tremor::message::Communicator;
use tremor::num_vec::Vec3;
use tremor::solver::Solver;
use tremor::source::{NodalForceFile, PointLoad};
use tremor::Error;

/// Explicit finite element solver for seismic wave propagation on a box of
/// hexahedral elements.
#[derive(Parser, Debug)]
#[clap(version, author)]
struct Cli {
    /// Number of ranks to run as threads of this process
    #[clap(long, default_value = "1", conflicts_with = "rank")]
    ranks: usize,

    /// Rank of this process in a TCP group
    #[clap(long, requires = "peers")]
    rank: Option<usize>,

    /// Addresses of every rank of the TCP group, in rank order
    #[clap(long, value_delimiter = ',')]
    peers: Vec<SocketAddr>,

    /// Elements along x, y and z
    #[clap(long, value_delimiter = ',', default_value = "8,8,8")]
    dims: Vec<u64>,

    /// Element edge length [m]
    #[clap(long, default_value = "100.0")]
    edge: f64,

    #[clap(long, default_value = "1000.0")]
    vp: f64,

    #[clap(long, default_value = "500.0")]
    vs: f64,

    #[clap(long, default_value = "2000.0")]
    rho: f64,

    #[clap(long, default_value = "0.0")]
    start_time: f64,

    #[clap(long, default_value = "1.0")]
    end_time: f64,

    #[clap(long, default_value = "0.001")]
    delta_t: f64,

    #[clap(long, default_value = "1.0")]
    max_frequency: f64,

    #[clap(long, value_enum, default_value = "rayleigh")]
    damping: DampingType,

    #[clap(long, value_enum, default_value = "hartzell")]
    quality_model: QualityModel,

    #[clap(long, default_value = "0.1")]
    threshold_damping: f64,

    #[clap(long, default_value = "3.0")]
    threshold_vp_vs: f64,

    #[clap(long, default_value = "10")]
    output_rate: usize,

    /// Steps between checkpoints; 0 disables them
    #[clap(long, default_value = "0")]
    checkpoint_rate: usize,

    /// Resume from a checkpoint
    #[clap(long)]
    use_checkpoint: bool,

    #[clap(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Checkpoint to resume from [default: <checkpoint-dir>/checkpoint.in]
    #[clap(long)]
    restart_file: Option<PathBuf>,

    /// Append and check global ids on every exchanged record
    #[clap(long)]
    debug_global_ids: bool,

    /// Synchronize between step phases for comparable timings
    #[clap(long)]
    timing_barriers: bool,

    #[clap(long, value_enum, default_value = "off")]
    absorbing_boundary: AbsorbingBoundary,

    #[clap(long)]
    damping_statistics: bool,

    /// Write node velocities to this file every output step
    #[clap(long)]
    volume_output: Option<PathBuf>,

    /// Write a CBOR run report to this file
    #[clap(long)]
    report: Option<PathBuf>,

    /// Global id of a node to load with a point force
    #[clap(long)]
    load_node: Option<u64>,

    /// Point force components
    #[clap(long, value_delimiter = ',', default_value = "0,0,1")]
    load: Vec<f64>,

    /// Number of steps the point force is applied for
    #[clap(long, default_value = "1")]
    load_steps: usize,

    /// Prefix of per-rank nodal force files, read from <prefix>.<rank>
    #[clap(long)]
    force_file: Option<String>,

    /// One of off, error, warn, info, debug, trace
    #[clap(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn config(&self) -> SolverConfig {
        SolverConfig {
            start_time: self.start_time,
            end_time: self.end_time,
            delta_t: self.delta_t,
            max_frequency: self.max_frequency,
            damping: self.damping,
            quality_model: self.quality_model,
            threshold_damping: self.threshold_damping,
            threshold_vp_vs: self.threshold_vp_vs,
            output_rate: self.output_rate,
            checkpoint_rate: self.checkpoint_rate,
            use_checkpoint: self.use_checkpoint,
            checkpoint_dir: self.checkpoint_dir.clone(),
            restart_file: self.restart_file.clone(),
            debug_global_ids: self.debug_global_ids,
            timing_barriers: self.timing_barriers,
            absorbing_boundary: self.absorbing_boundary,
            damping_statistics: self.damping_statistics,
            volume_output: self.volume_output.clone(),
            report: self.report.clone(),
        }
    }

    fn global_mesh(&self) -> Result<GlobalMesh, Error> {
        let dims: [u64; 3] = self
            .dims
            .as_slice()
            .try_into()
            .map_err(|_| Error::Config(format!("--dims needs 3 values, got {}", self.dims.len())))?;
        let material = Material {
            vp: self.vp,
            vs: self.vs,
            rho: self.rho,
        };
        Ok(GlobalMesh::uniform(dims, self.edge, |_| material))
    }

    fn load(&self) -> Result<Vec3, Error> {
        match self.load.as_slice() {
            &[x, y, z] => Ok(Vec3::new(x, y, z)),
            other => Err(Error::Config(format!("--load needs 3 values, got {}", other.len()))),
        }
    }
}

fn simulate<C: Communicator>(comm: C, mesh: Mesh, config: SolverConfig, cli: &Cli) -> Result<(), Error> {
    let rank = comm.rank();
    let mut context = SimulationContext::new(comm, config.timing_barriers);
    context.install_signal_handlers()?;

    let mut solver = Solver::new(context, mesh, config)?;

    if let Some(gid) = cli.load_node {
        let load = PointLoad::new(solver.mesh(), gid, cli.load()?, 0..cli.load_steps);
        solver.add_source(load);
    }
    if let Some(prefix) = &cli.force_file {
        let forces = NodalForceFile::open(format!("{}.{}", prefix, rank), solver.mesh())?;
        solver.add_source(forces);
    }

    let summary = solver.run()?;
    if rank == 0 {
        info!(
            "finished at step {}{}",
            summary.final_step,
            if summary.stopped { " (stopped)" } else { "" }
        );
    }
    Ok(())
}

/// Run one rank, and on failure take the whole group down with it. An abort
/// raised by this rank's own transport (a message it could not deliver)
/// counts as a failure here too.
///
fn run_rank<C: Communicator>(comm: C, mesh: Mesh, config: SolverConfig, cli: &Cli) -> bool {
    match simulate(&comm, mesh, config, cli) {
        Ok(()) => true,
        Err(Error::Aborted { rank, reason }) if rank != comm.rank() => {
            error!("[{}] stopping, process {} aborted: {}", comm.rank(), rank, reason);
            false
        }
        Err(e) => {
            error!("[{}] fatal: {}", comm.rank(), e);
            comm.abort(&e.to_string());
            false
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let level = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("could not install logger: {}", e);
    }

    let config = cli.config();
    let meshes = config.validate().and_then(|_| {
        let size = match cli.rank {
            Some(_) => cli.peers.len(),
            None => cli.ranks,
        };
        cli.global_mesh()?.partition(size)
    });
    let meshes = match meshes {
        Ok(meshes) => meshes,
        Err(e) => {
            error!("fatal: {}", e);
            std::process::exit(1)
        }
    };

    let success = match cli.rank {
        Some(rank) if rank < cli.peers.len() => {
            let (mut host, comm) = TcpCommunicator::connect(rank, cli.peers.clone());
            let success = run_rank(&comm, meshes[rank].clone(), config, &cli);
            drop(comm);
            host.join();
            success
        }
        Some(rank) => {
            error!("fatal: rank {} outside a group of {}", rank, cli.peers.len());
            false
        }
        None => local::run(cli.ranks, |comm| {
            let mesh = meshes[comm.rank()].clone();
            run_rank(comm, mesh, config.clone(), &cli)
        })
        .into_iter()
        .all(|ok| ok),
    };

    if !success {
        std::process::exit(1)
    }
}
