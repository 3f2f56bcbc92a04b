//! Tremor is the distributed core of an explicit finite element solver for
//! seismic wave propagation. The domain is an octree-style mesh of
//! hexahedral elements, cut into one partition per process. Nodes on a
//! partition boundary are owned by one process and harbored as copies by
//! others, and hanging nodes on coarse/fine interfaces are constrained to
//! the average of their anchors. Each time step assembles element forces
//! locally, gathers them at the owners through reusable communication
//! schedules, advances a leapfrog update, and scatters the new
//! displacements back to every copy.

pub mod boundary;
pub mod checkpoint;
pub mod coefficients;
pub mod config;
pub mod constraint;
pub mod context;
pub mod error;
pub mod mesh;
pub mod meshing;
pub mod message;
pub mod num_vec;
pub mod output;
pub mod record;
pub mod schedule;
pub mod solver;
pub mod source;
pub mod stats;
pub mod stiffness;

pub use error::{Error, Result};
