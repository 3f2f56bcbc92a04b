use std::fs::{self, File, OpenOptions};
use std::io::{prelude::*, SeekFrom};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Communicator, ReduceOp};
use crate::num_vec::Vec3;

/// Three native-endian i32 values.
pub const HEADER_SIZE: u64 = 12;

/// One displacement vector: three native-endian f64 values.
pub const VECTOR_SIZE: u64 = 24;

/// The fixed header at the start of a checkpoint file.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub group_size: i32,
    pub step: i32,
    pub max_harbored: i32,
}

impl Header {
    /// A header for the given counts, or `None` if one does not fit in an
    /// i32.
    ///
    pub fn new(group_size: usize, step: usize, max_harbored: usize) -> Option<Self> {
        Some(Self {
            group_size: i32::try_from(group_size).ok()?,
            step: i32::try_from(step).ok()?,
            max_harbored: i32::try_from(max_harbored).ok()?,
        })
    }

    /// The group size, step and maximum node count, or why the header
    /// cannot have been written by a checkpoint.
    ///
    pub fn counts(&self) -> std::result::Result<(usize, usize, usize), String> {
        let group_size = usize::try_from(self.group_size)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| format!("group size {}", self.group_size))?;
        let step = usize::try_from(self.step).map_err(|_| format!("negative step {}", self.step))?;
        let max = usize::try_from(self.max_harbored)
            .map_err(|_| format!("negative node count {}", self.max_harbored))?;
        Ok((group_size, step, max))
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        let mut bytes = [0; 12];
        bytes[0..4].copy_from_slice(&self.group_size.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.step.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.max_harbored.to_ne_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 12]) -> Self {
        let field = |i: usize| i32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            group_size: field(0),
            step: field(4),
            max_harbored: field(8),
        }
    }
}

/// The two displacement history buffers: `Recent` is `tm1`, `Previous` is
/// `tm2`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Recent,
    Previous,
}

/// Byte offset of one of a process's history buffers in a checkpoint file.
/// Every process reserves room for two buffers of `max_harbored` vectors;
/// its second buffer follows its first directly. `None` if the offset does
/// not fit in a u64.
///
pub fn offset(rank: usize, max_harbored: usize, harbored: usize, slot: Slot) -> Option<u64> {
    let base = block_bytes(rank, max_harbored)?.checked_add(HEADER_SIZE)?;
    match slot {
        Slot::Recent => Some(base),
        Slot::Previous => base.checked_add((harbored as u64).checked_mul(VECTOR_SIZE)?),
    }
}

pub fn file_size(group_size: usize, max_harbored: usize) -> Option<u64> {
    block_bytes(group_size, max_harbored)?.checked_add(HEADER_SIZE)
}

/// Bytes taken by the history buffers of `ranks` processes.
fn block_bytes(ranks: usize, max_harbored: usize) -> Option<u64> {
    (ranks as u64)
        .checked_mul(2)?
        .checked_mul(max_harbored as u64)?
        .checked_mul(VECTOR_SIZE)
}

fn vectors_to_bytes(v: &[Vec3]) -> Vec<u8> {
    v.iter()
        .flat_map(|x| x.as_array().iter().flat_map(|c| c.to_ne_bytes()))
        .collect()
}

fn vectors_from_bytes(bytes: &[u8], v: &mut [Vec3]) {
    for (x, chunk) in v.iter_mut().zip(bytes.chunks_exact(24)) {
        for (c, b) in x.as_mut_array().iter_mut().zip(chunk.chunks_exact(8)) {
            *c = f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        }
    }
}




/**
 * Writes and restores the displacement history of the whole group. Each
 * write goes to the older of two alternating files in the checkpoint
 * directory, so a crash during a write leaves the previous checkpoint
 * intact.
 */
#[derive(Clone, Debug)]
pub struct Checkpoints {
    dir: PathBuf,
    restart: PathBuf,
    next: usize,
}




// ============================================================================
impl Checkpoints {
    /// Restart reads `restart`, or `<dir>/checkpoint.in` if not given.
    ///
    pub fn new<P: Into<PathBuf>>(dir: P, restart: Option<PathBuf>) -> Self {
        let dir = dir.into();
        let restart = restart.unwrap_or_else(|| dir.join("checkpoint.in"));
        Self {
            dir,
            restart,
            next: 0,
        }
    }

    pub fn output_path(&self, which: usize) -> PathBuf {
        self.dir.join(format!("checkpoint.out{}", which))
    }

    pub fn restart_path(&self) -> &Path {
        &self.restart
    }

    /// Write both history buffers of every process, recording `step` as
    /// the step to resume from. Collective. Returns the file written.
    ///
    pub fn write<C: Communicator>(
        &mut self,
        comm: &C,
        step: usize,
        tm1: &[Vec3],
        tm2: &[Vec3],
    ) -> Result<PathBuf> {
        let harbored = tm1.len();
        let max = comm.all_reduce_u64(ReduceOp::Max, harbored as u64)? as usize;

        let matched = if tm2.len() == harbored {
            Ok(())
        } else {
            Err(Error::InvalidMesh(format!(
                "history buffers of {} and {} nodes",
                harbored,
                tm2.len()
            )))
        };
        comm.agree(matched, "checkpoint history check")?;
        let path = self.output_path(self.next);

        let created = if comm.rank() == 0 {
            self.create(&path, comm.size(), step, max)
        } else {
            Ok(())
        };
        comm.agree(created, "checkpoint create")?;

        let written = self.write_slots(&path, comm.rank(), max, tm1, tm2);
        comm.agree(written, "checkpoint write")?;

        if comm.rank() == 0 {
            info!("wrote checkpoint {} at step {}", path.display(), step);
        }
        self.next = 1 - self.next;
        Ok(path)
    }

    /// Restore both history buffers from the restart file and return the
    /// step to resume from. Collective.
    ///
    pub fn read<C: Communicator>(&self, comm: &C, tm1: &mut [Vec3], tm2: &mut [Vec3]) -> Result<usize> {
        let header = if comm.rank() == 0 {
            let local = self.read_header();
            let shared = local.as_ref().map(|h| *h).map_err(|e| e.to_string());
            comm.broadcast(Some(rmp_serde::encode::to_vec(&shared)?))?;
            local?
        } else {
            let bytes = comm.broadcast(None)?;
            let shared: std::result::Result<Header, String> = rmp_serde::decode::from_slice(&bytes)?;
            shared.map_err(|_| Error::PeerFailed {
                operation: "checkpoint header read",
            })?
        };
        let path = &self.restart;
        let malformed = |reason: String| Error::MalformedCheckpoint {
            path: path.clone(),
            reason,
        };

        let (group_size, step, max) = header.counts().map_err(malformed)?;
        if group_size != comm.size() {
            return Err(Error::CheckpointGroupSize {
                file: header.group_size,
                group: comm.size(),
            });
        }

        let harbored = tm1.len();
        if harbored > max || tm2.len() != harbored {
            return Err(Error::CheckpointNodeCount { harbored, max });
        }

        let rank = comm.rank();
        let recent = offset(rank, max, harbored, Slot::Recent);
        let previous = offset(rank, max, harbored, Slot::Previous);
        let end = previous.and_then(|p| p.checked_add(harbored as u64 * VECTOR_SIZE));
        let (recent, previous, end) = match (recent, previous, end) {
            (Some(r), Some(p), Some(e)) => (r, p, e),
            _ => return Err(malformed(format!("{} nodes per process overflow the file", max))),
        };

        let io = |e| Error::io(format!("reading checkpoint {}", path.display()), e);
        let mut file = File::open(path).map_err(io)?;
        let length = file.metadata().map_err(io)?.len();

        if length < end {
            return Err(malformed(format!("{} bytes, need at least {}", length, end)));
        }

        let mut bytes = vec![0; harbored * VECTOR_SIZE as usize];
        for (start, buffer) in [(recent, &mut *tm1), (previous, &mut *tm2)] {
            file.seek(SeekFrom::Start(start)).map_err(io)?;
            file.read_exact(&mut bytes).map_err(io)?;
            vectors_from_bytes(&bytes, buffer);
        }
        Ok(step)
    }

    fn read_header(&self) -> Result<Header> {
        let path = &self.restart;
        let io = |e| Error::io(format!("reading checkpoint {}", path.display()), e);
        let mut bytes = [0; 12];
        File::open(path)
            .and_then(|mut f| f.read_exact(&mut bytes))
            .map_err(io)?;
        Ok(Header::from_bytes(&bytes))
    }

    fn create(&self, path: &Path, group_size: usize, step: usize, max: usize) -> Result<()> {
        let io = |e| Error::io(format!("creating checkpoint {}", path.display()), e);
        let too_large = || Error::MalformedCheckpoint {
            path: path.to_path_buf(),
            reason: format!("{} processes at step {} with {} nodes do not fit the format", group_size, step, max),
        };
        let header = Header::new(group_size, step, max).ok_or_else(too_large)?;
        let size = file_size(group_size, max).ok_or_else(too_large)?;

        fs::create_dir_all(&self.dir).map_err(io)?;
        let mut file = File::create(path).map_err(io)?;
        file.set_len(size).map_err(io)?;
        file.write_all(&header.to_bytes()).map_err(io)?;
        Ok(())
    }

    fn write_slots(&self, path: &Path, rank: usize, max: usize, tm1: &[Vec3], tm2: &[Vec3]) -> Result<()> {
        let io = |e| Error::io(format!("writing checkpoint {}", path.display()), e);
        let mut file = OpenOptions::new().write(true).open(path).map_err(io)?;

        for (slot, buffer) in [(Slot::Recent, tm1), (Slot::Previous, tm2)] {
            let start = offset(rank, max, tm1.len(), slot).ok_or_else(|| Error::MalformedCheckpoint {
                path: path.to_path_buf(),
                reason: format!("offset of process {} overflows", rank),
            })?;
            file.seek(SeekFrom::Start(start)).map_err(io)?;
            file.write_all(&vectors_to_bytes(buffer)).map_err(io)?;
        }
        file.sync_data().map_err(io)
    }
}
