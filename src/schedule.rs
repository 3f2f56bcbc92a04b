use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mesh::{Mesh, Ownership};
use crate::message::{Channel, Communicator, Direction, NodeClass, Payload, Tag};
use crate::record::{Combine, Record, RecordLayout};

/// The endpoint of a schedule role for one remote process: which local
/// nodes travel to or from it, in what order, and the byte buffers for one
/// message in each direction.
///
#[derive(Debug)]
pub struct Messenger {
    remote: usize,
    node_count: usize,
    out_layout: RecordLayout,
    in_layout: RecordLayout,
    mapping: Vec<usize>,
    out_buffer: Vec<u8>,
    in_buffer: Vec<u8>,
}

impl Messenger {
    fn new(remote: usize) -> Self {
        let layout = RecordLayout {
            fields: 0,
            with_global_id: false,
        };
        Self {
            remote,
            node_count: 0,
            out_layout: layout,
            in_layout: layout,
            mapping: Vec::new(),
            out_buffer: Vec::new(),
            in_buffer: Vec::new(),
        }
    }

    pub fn remote(&self) -> usize {
        self.remote
    }

    /// Local node indices in the order their records appear in a message.
    pub fn mapping(&self) -> &[usize] {
        &self.mapping
    }

    pub fn out_layout(&self) -> RecordLayout {
        self.out_layout
    }

    pub fn in_layout(&self) -> RecordLayout {
        self.in_layout
    }

    fn set(&mut self, out_layout: RecordLayout, in_layout: RecordLayout) {
        self.out_layout = out_layout;
        self.in_layout = in_layout;
        self.out_buffer.resize(self.mapping.len() * out_layout.size(), 0);
        self.in_buffer.resize(self.mapping.len() * in_layout.size(), 0);
    }
}

/// One of the two roles of a schedule: a list of messengers plus a lookup
/// from remote process to position in that list.
///
#[derive(Debug, Default)]
pub struct Role {
    messengers: Vec<Messenger>,
    by_remote: HashMap<usize, usize>,
}

impl Role {
    pub fn messengers(&self) -> &[Messenger] {
        &self.messengers
    }

    pub fn num_nodes(&self) -> usize {
        self.messengers.iter().map(|m| m.mapping.len()).sum()
    }

    fn count(&mut self, remote: usize) {
        let messengers = &mut self.messengers;
        let i = *self.by_remote.entry(remote).or_insert_with(|| {
            messengers.push(Messenger::new(remote));
            messengers.len() - 1
        });
        self.messengers[i].node_count += 1;
    }

    fn allocate_mappings(&mut self) {
        for m in &mut self.messengers {
            m.mapping = Vec::with_capacity(m.node_count);
        }
    }

    fn map(&mut self, remote: usize, index: usize, role: &'static str) -> Result<()> {
        let m = self
            .by_remote
            .get(&remote)
            .and_then(|&i| self.messengers.get_mut(i))
            .ok_or(Error::MissingMessenger { remote, role })?;
        m.mapping.push(index);
        Ok(())
    }

    fn check_mappings(&self, role: &'static str) -> Result<()> {
        for m in &self.messengers {
            if m.mapping.len() != m.node_count {
                return Err(Error::InvalidMesh(format!(
                    "{} messenger for process {} mapped {} of {} nodes",
                    role,
                    m.remote,
                    m.mapping.len(),
                    m.node_count
                )));
            }
        }
        Ok(())
    }
}

/// Per-process totals of one schedule.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSummary {
    pub contribute_processes: usize,
    pub contribute_nodes: usize,
    pub share_processes: usize,
    pub share_nodes: usize,
}




/**
 * A reusable set of message routes for one class of nodes. The contribute
 * role talks to the owners of nodes this process harbors but does not own;
 * the share role talks to the processes that harbor nodes this process
 * owns. The same schedule carries masses, forces and displacements: only
 * the record layout changes, via `prepare`.
 */
#[derive(Debug)]
pub struct Schedule {
    class: NodeClass,
    contribute: Role,
    share: Role,
}




// ============================================================================
impl Schedule {
    fn new(class: NodeClass) -> Self {
        Self {
            class,
            contribute: Role::default(),
            share: Role::default(),
        }
    }

    /// Build the dangling and anchored schedules of a mesh. The first pass
    /// counts nodes per remote process, the second fills the mappings, so
    /// every mapping is allocated once at its final size.
    ///
    pub fn build(mesh: &Mesh) -> Result<(Schedule, Schedule)> {
        let mut dangling = Schedule::new(NodeClass::Dangling);
        let mut anchored = Schedule::new(NodeClass::Anchored);

        for node in mesh.nodes() {
            let schedule = if node.conformity.is_dangling() {
                &mut dangling
            } else {
                &mut anchored
            };
            match &node.ownership {
                Ownership::Harbored { owner } => schedule.contribute.count(*owner),
                Ownership::Owned { sharers } => {
                    for &sharer in sharers {
                        schedule.share.count(sharer)
                    }
                }
            }
        }

        for schedule in [&mut dangling, &mut anchored] {
            schedule.contribute.allocate_mappings();
            schedule.share.allocate_mappings();
        }

        for (index, node) in mesh.nodes().iter().enumerate() {
            let schedule = if node.conformity.is_dangling() {
                &mut dangling
            } else {
                &mut anchored
            };
            match &node.ownership {
                Ownership::Harbored { owner } => schedule.contribute.map(*owner, index, "contribute")?,
                Ownership::Owned { sharers } => {
                    for &sharer in sharers {
                        schedule.share.map(sharer, index, "share")?
                    }
                }
            }
        }

        for schedule in [&dangling, &anchored] {
            schedule.contribute.check_mappings("contribute")?;
            schedule.share.check_mappings("share")?;
        }
        Ok((dangling, anchored))
    }

    pub fn class(&self) -> NodeClass {
        self.class
    }

    pub fn contribute(&self) -> &Role {
        &self.contribute
    }

    pub fn share(&self) -> &Role {
        &self.share
    }

    /// Size every messenger's buffers for the given record layouts. The two
    /// roles are set independently; within a role, `out` is the layout this
    /// process sends and `in` is the layout it receives.
    ///
    pub fn prepare(
        &mut self,
        contribute_out: RecordLayout,
        contribute_in: RecordLayout,
        share_out: RecordLayout,
        share_in: RecordLayout,
    ) {
        for m in &mut self.contribute.messengers {
            m.set(contribute_out, contribute_in);
        }
        for m in &mut self.share.messengers {
            m.set(share_out, share_in);
        }
    }

    /// Use one layout for every direction of both roles.
    ///
    pub fn prepare_uniform(&mut self, layout: RecordLayout) {
        self.prepare(layout, layout, layout, layout)
    }

    /// Run one exchange of per-node records. With `Direction::Contribute`,
    /// harborers send their values to the owners, which add them in; with
    /// `Direction::Share`, owners send their values to the harborers, which
    /// overwrite theirs. Sends never block, so every process can send
    /// everything before waiting on its receives.
    ///
    pub fn exchange<C, R>(
        &mut self,
        comm: &C,
        mesh: &Mesh,
        values: &mut [R],
        direction: Direction,
        payload: Payload,
    ) -> Result<()>
    where
        C: Communicator,
        R: Record,
    {
        let tag = Tag::Exchange(Channel::new(self.class, payload, direction));
        let (outbound, inbound, combine) = match direction {
            Direction::Contribute => (&mut self.contribute, &mut self.share, Combine::Accumulate),
            Direction::Share => (&mut self.share, &mut self.contribute, Combine::Overwrite),
        };

        for m in &outbound.messengers {
            if m.out_layout.fields != R::FIELDS {
                return Err(Error::LayoutMismatch {
                    prepared: m.out_layout.fields,
                    requested: R::FIELDS,
                });
            }
        }
        for m in &inbound.messengers {
            if m.in_layout.fields != R::FIELDS {
                return Err(Error::LayoutMismatch {
                    prepared: m.in_layout.fields,
                    requested: R::FIELDS,
                });
            }
        }

        let nodes = mesh.nodes();
        let mut scratch = vec![0.0; R::FIELDS];

        for m in &mut outbound.messengers {
            let size = m.out_layout.size();
            for (slot, &index) in m.out_buffer.chunks_exact_mut(size).zip(&m.mapping) {
                m.out_layout.pack(&values[index], nodes[index].gid, slot, &mut scratch);
            }
            comm.send(m.remote, tag, m.out_buffer.clone())?;
        }

        for m in &mut inbound.messengers {
            let data = comm.recv(m.remote, tag)?;
            if data.len() != m.in_buffer.len() {
                return Err(Error::MessageSize {
                    remote: m.remote,
                    expected: m.in_buffer.len(),
                    received: data.len(),
                });
            }
            m.in_buffer.copy_from_slice(&data);
        }

        for m in &inbound.messengers {
            let size = m.in_layout.size();
            for (slot, &index) in m.in_buffer.chunks_exact(size).zip(&m.mapping) {
                if let Some(gid) = m.in_layout.unpack(slot, &mut scratch) {
                    if gid != nodes[index].gid {
                        return Err(Error::GlobalIdMismatch {
                            local: nodes[index].gid,
                            received: gid,
                        });
                    }
                }
                values[index].write_fields(&scratch, combine);
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> ScheduleSummary {
        ScheduleSummary {
            contribute_processes: self.contribute.messengers.len(),
            contribute_nodes: self.contribute.num_nodes(),
            share_processes: self.share.messengers.len(),
            share_nodes: self.share.num_nodes(),
        }
    }

    /// Log one line per messenger: rank, schedule class, role, remote rank,
    /// node count, outbound and inbound record sizes.
    ///
    pub fn log_detail(&self, rank: usize) {
        let class = match self.class {
            NodeClass::Dangling => 'd',
            NodeClass::Anchored => 'a',
        };
        for (role, messengers) in [('c', &self.contribute.messengers), ('s', &self.share.messengers)] {
            for m in messengers.iter() {
                debug!(
                    "[{}] {} {} {:>6} {:>8} {:>4} {:>4}",
                    rank,
                    class,
                    role,
                    m.remote,
                    m.mapping.len(),
                    m.out_layout.size(),
                    m.in_layout.size()
                );
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RankSummary {
    dangling: ScheduleSummary,
    anchored: ScheduleSummary,
}

/// Gather every rank's schedule totals to rank 0 and log them as a table.
/// Every rank logs its own messenger detail at debug level.
///
pub fn report<C: Communicator>(comm: &C, dangling: &Schedule, anchored: &Schedule) -> Result<()> {
    dangling.log_detail(comm.rank());
    anchored.log_detail(comm.rank());

    let mine = RankSummary {
        dangling: dangling.summary(),
        anchored: anchored.summary(),
    };
    if let Some(all) = comm.gather(rmp_serde::encode::to_vec(&mine)?)? {
        info!("schedule summary");
        info!("  pe   dc_p   dc_n   ds_p   ds_n   ac_p   ac_n   as_p   as_n   total");
        for (rank, bytes) in all.iter().enumerate() {
            let s: RankSummary = rmp_serde::decode::from_slice(bytes)?;
            let total = s.dangling.contribute_nodes
                + s.dangling.share_nodes
                + s.anchored.contribute_nodes
                + s.anchored.share_nodes;
            info!(
                "{:>4} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>7}",
                rank,
                s.dangling.contribute_processes,
                s.dangling.contribute_nodes,
                s.dangling.share_processes,
                s.dangling.share_nodes,
                s.anchored.contribute_processes,
                s.anchored.contribute_nodes,
                s.anchored.share_processes,
                s.anchored.share_nodes,
                total
            );
        }
    }
    Ok(())
}
