use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::message::{Communicator, Tag};
use crate::num_vec::Vec3;

/// Vectors per output message.
pub const BATCH_SIZE: usize = 10240;

/// Domain extents, node and element totals, tick size and output step
/// count.
pub const HEADER_SIZE: u64 = 3 * 8 + 8 + 8 + 8 + 4;

/// Something invoked at every output step, after the history swap and
/// before force assembly. `tm1` holds the current displacement and `tm2`
/// the previous one.
///
pub trait OutputHook<C: Communicator> {
    fn write_step(
        &mut self,
        comm: &C,
        mesh: &Mesh,
        step: usize,
        tm1: &[Vec3],
        tm2: &[Vec3],
        delta_t: f64,
    ) -> Result<()>;
}

/// The velocity `(tm1 - tm2) / dt` of every node this process owns, in
/// increasing global id.
///
pub fn velocity_buffer(mesh: &Mesh, tm1: &[Vec3], tm2: &[Vec3], delta_t: f64) -> Vec<Vec3> {
    mesh.nodes()
        .iter()
        .zip(tm1.iter().zip(tm2))
        .filter(|(node, _)| node.is_owned())
        .map(|(_, (a, b))| (*a - *b) / delta_t)
        .collect()
}

/// Number of output steps a run of `total_steps` produces.
///
pub fn output_steps(total_steps: usize, output_rate: usize) -> usize {
    total_steps.saturating_sub(1) / output_rate.max(1) + 1
}

fn vectors_to_bytes(v: &[Vec3]) -> Vec<u8> {
    v.iter()
        .flat_map(|x| x.as_array().iter().flat_map(|c| c.to_ne_bytes()))
        .collect()
}




/**
 * The volumetric velocity file. Rank 0 writes the header once, then at
 * each output step the owned-node velocities of every rank, in rank order.
 * Ranks stream their buffers to rank 0 only when it hands them the go-ahead,
 * so rank 0 never holds more than one batch from a peer at a time.
 */
pub struct VolumeOutput {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    batch_size: usize,
}




// ============================================================================
impl VolumeOutput {
    /// Create the file and write its header. Collective.
    ///
    pub fn create<C: Communicator, P: AsRef<Path>>(
        comm: &C,
        mesh: &Mesh,
        path: P,
        total_steps: usize,
        output_rate: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = if comm.rank() == 0 {
            let io = |e| Error::io(format!("creating volume output {}", path.display()), e);
            let created = File::create(&path).map_err(io).and_then(|file| {
                let mut file = BufWriter::new(file);
                let mut header = Vec::with_capacity(HEADER_SIZE as usize);
                for x in mesh.domain_size() {
                    header.extend_from_slice(&x.to_ne_bytes());
                }
                header.extend_from_slice(&(mesh.total_nodes() as i64).to_ne_bytes());
                header.extend_from_slice(&(mesh.total_elements() as i64).to_ne_bytes());
                header.extend_from_slice(&mesh.tick_size().to_ne_bytes());
                header.extend_from_slice(&(output_steps(total_steps, output_rate) as i32).to_ne_bytes());
                file.write_all(&header).map_err(io)?;
                Ok(file)
            });
            comm.agree(created.map(Some), "volume output create")?
        } else {
            comm.agree(Ok(None), "volume output create")?
        };

        if comm.rank() == 0 {
            info!(
                "volume output {}: {} steps of {} nodes",
                path.display(),
                output_steps(total_steps, output_rate),
                mesh.total_nodes()
            );
        }
        Ok(Self {
            path,
            file,
            batch_size: BATCH_SIZE,
        })
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..self
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn gather_and_write<C: Communicator>(&mut self, comm: &C, velocity: &[Vec3]) -> Result<()> {
        let path = &self.path;
        let io = |e| Error::io(format!("writing volume output {}", path.display()), e);
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Err(Error::Transport("volume output is not open on rank 0".into())),
        };

        // Keep draining peers after a failed write so none is left blocked.
        let mut written = file.write_all(&vectors_to_bytes(velocity)).map_err(io);

        for remote in 1..comm.size() {
            comm.send(remote, Tag::GoAhead, Vec::new())?;
            loop {
                let batch = comm.recv(remote, Tag::Output)?;
                if batch.is_empty() {
                    break;
                }
                if written.is_ok() {
                    written = file.write_all(&batch).map_err(io);
                }
            }
        }
        written?;
        file.flush().map_err(io)
    }

    fn send_to_root<C: Communicator>(&self, comm: &C, velocity: &[Vec3]) -> Result<()> {
        comm.recv(0, Tag::GoAhead)?;
        for batch in velocity.chunks(self.batch_size) {
            comm.send(0, Tag::Output, vectors_to_bytes(batch))?;
        }
        comm.send(0, Tag::Output, Vec::new())
    }
}

impl<C: Communicator> OutputHook<C> for VolumeOutput {
    fn write_step(
        &mut self,
        comm: &C,
        mesh: &Mesh,
        _step: usize,
        tm1: &[Vec3],
        tm2: &[Vec3],
        delta_t: f64,
    ) -> Result<()> {
        let velocity = velocity_buffer(mesh, tm1, tm2, delta_t);
        let result = if comm.rank() == 0 {
            self.gather_and_write(comm, &velocity)
        } else {
            self.send_to_root(comm, &velocity)
        };
        comm.agree(result, "volume output write")
    }
}
