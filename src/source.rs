use std::fs::File;
use std::io::{prelude::*, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::num_vec::Vec3;

/// Anything that injects prescribed nodal forces into the force
/// accumulator at the start of a step. Implementations assign (not add)
/// `dt_squared` times their force to the nodes they load, and only ever
/// touch local nodes.
///
pub trait LoadSource {
    fn apply(&mut self, step: usize, dt_squared: f64, force: &mut [Vec3]) -> Result<()>;
}

impl<S: LoadSource + ?Sized> LoadSource for Box<S> {
    fn apply(&mut self, step: usize, dt_squared: f64, force: &mut [Vec3]) -> Result<()> {
        (**self).apply(step, dt_squared, force)
    }
}




/**
 * A constant force on one node over a range of steps. Only the owner of
 * the node applies it, so the force enters the solve exactly once.
 */
#[derive(Clone, Debug)]
pub struct PointLoad {
    node: Option<usize>,
    force: Vec3,
    steps: Range<usize>,
}

impl PointLoad {
    pub fn new(mesh: &Mesh, gid: u64, force: Vec3, steps: Range<usize>) -> Self {
        let node = mesh
            .local_index(gid)
            .filter(|&i| mesh.nodes()[i].is_owned());

        if node.is_some() {
            debug!("[{}] point load on node {} for steps {:?}", mesh.rank(), gid, steps);
        }
        Self { node, force, steps }
    }

    pub fn is_local(&self) -> bool {
        self.node.is_some()
    }
}

impl LoadSource for PointLoad {
    fn apply(&mut self, step: usize, dt_squared: f64, force: &mut [Vec3]) -> Result<()> {
        if let Some(n) = self.node {
            if self.steps.contains(&step) {
                force[n] = self.force * dt_squared;
            }
        }
        Ok(())
    }
}




/**
 * Per-process nodal forces read from a binary file: an i32 node count n,
 * n i32 local node indices, then for each step n force vectors of three
 * f64, all native-endian. Steps past the end of the file apply nothing.
 */
#[derive(Debug)]
pub struct NodalForceFile {
    path: PathBuf,
    file: File,
    nodes: Vec<usize>,
    num_steps: usize,
    buffer: Vec<u8>,
}

impl NodalForceFile {
    pub fn open<P: AsRef<Path>>(path: P, mesh: &Mesh) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io = |e| Error::io(format!("reading force file {}", path.display()), e);
        let malformed = |reason: String| Error::MalformedSource {
            path: path.clone(),
            reason,
        };

        let mut file = File::open(&path).map_err(io)?;
        let length = file.metadata().map_err(io)?.len();

        let mut word = [0; 4];
        file.read_exact(&mut word).map_err(io)?;
        let count = i32::from_ne_bytes(word);

        if count < 0 {
            return Err(malformed(format!("negative node count {}", count)));
        }
        let count = count as usize;
        let data_start = 4 + 4 * count as u64;

        if length < data_start {
            return Err(malformed(format!("{} bytes cannot hold {} node indices", length, count)));
        }

        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            file.read_exact(&mut word).map_err(io)?;
            let index = i32::from_ne_bytes(word);

            if index < 0 || index as usize >= mesh.num_harbored() {
                return Err(malformed(format!(
                    "node index {} outside 0..{}",
                    index,
                    mesh.num_harbored()
                )));
            }
            nodes.push(index as usize);
        }

        let step_size = count as u64 * 24;
        let num_steps = if step_size == 0 {
            0
        } else {
            ((length - data_start) / step_size) as usize
        };
        info!(
            "[{}] force file {}: {} nodes, {} steps",
            mesh.rank(),
            path.display(),
            count,
            num_steps
        );

        Ok(Self {
            path,
            file,
            nodes,
            num_steps,
            buffer: vec![0; step_size as usize],
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }
}

impl LoadSource for NodalForceFile {
    fn apply(&mut self, step: usize, dt_squared: f64, force: &mut [Vec3]) -> Result<()> {
        if step >= self.num_steps {
            return Ok(());
        }
        let n = self.nodes.len() as u64;
        let offset = 4 + 4 * n + n * step as u64 * 24;
        let path = &self.path;
        let io = |e| Error::io(format!("reading force file {}", path.display()), e);

        self.file.seek(SeekFrom::Start(offset)).map_err(io)?;
        self.file.read_exact(&mut self.buffer).map_err(io)?;

        for (&node, chunk) in self.nodes.iter().zip(self.buffer.chunks_exact(24)) {
            let mut f = Vec3::zeros();
            for (x, b) in f.as_mut_array().iter_mut().zip(chunk.chunks_exact(8)) {
                *x = f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            }
            force[node] = f * dt_squared;
        }
        Ok(())
    }
}
