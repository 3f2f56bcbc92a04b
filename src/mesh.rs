use std::collections::HashSet;

/// Which process is allowed to write a node's authoritative value.
///
#[derive(Clone, Debug, PartialEq)]
pub enum Ownership {
    /// This process is the single writer; the listed processes also harbor
    /// the node and receive copies of its value.
    Owned { sharers: Vec<usize> },

    /// Some other process owns the node; this one holds a copy.
    Harbored { owner: usize },
}

/// Whether a node is a degree of freedom of the conforming system, or a
/// hanging node whose value is an average over its anchors.
///
#[derive(Clone, Debug, PartialEq)]
pub enum Conformity {
    Anchored,
    Dangling {
        /// Local indices of the anchored nodes this node hangs from.
        anchors: Vec<usize>,
        /// The averaging weight, always equal to `anchors.len()`.
        deps: f64,
    },
}

impl Conformity {
    pub fn dangling(anchors: Vec<usize>) -> Self {
        let deps = anchors.len() as f64;
        Conformity::Dangling { anchors, deps }
    }

    pub fn is_dangling(&self) -> bool {
        matches!(self, Conformity::Dangling { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub gid: u64,
    /// Position on the integer tick lattice of the whole domain.
    pub ticks: [u64; 3],
    pub ownership: Ownership,
    pub conformity: Conformity,
}

impl Node {
    pub fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::Owned { .. })
    }
}

/// Material properties sampled for one element.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub vp: f64,
    pub vs: f64,
    pub rho: f64,
}

/// Elements of kind `Air` are kept in the mesh (they still carry mass) but
/// produce no internal force.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Solid,
    Air,
}

/// A hexahedral element. Corner `j` sits at offset `(j & 1, (j >> 1) & 1,
/// (j >> 2) & 1)` edge lengths from the lower-left-bottom corner.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    pub nodes: [usize; 8],
    /// Edge length in meters.
    pub edge: f64,
    pub material: Material,
    pub kind: ElementKind,
}

impl Element {
    pub fn is_excluded(&self) -> bool {
        self.kind == ElementKind::Air
    }
}




/**
 * The part of a partitioned mesh that one process holds: the elements it
 * computes, and every node those elements touch (the harbored nodes).
 * Local node indices are sorted by global id, which is what lets two
 * processes agree on the order of records in an exchange message without
 * sending the ids themselves.
 */
#[derive(Clone, Debug)]
pub struct Mesh {
    rank: usize,
    tick_size: f64,
    domain_ticks: [u64; 3],
    total_nodes: u64,
    total_elements: u64,
    nodes: Vec<Node>,
    elements: Vec<Element>,
    owned_dangling: Vec<usize>,
}




// ============================================================================
impl Mesh {
    /// Assemble and check the local view of a mesh. Fails with
    /// `Error::InvalidMesh` if any ownership or anchoring invariant is
    /// violated.
    ///
    pub fn new(
        rank: usize,
        tick_size: f64,
        domain_ticks: [u64; 3],
        totals: (u64, u64),
        nodes: Vec<Node>,
        elements: Vec<Element>,
    ) -> crate::Result<Self> {
        let owned_dangling = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_owned() && n.conformity.is_dangling())
            .map(|(i, _)| i)
            .collect();

        let mesh = Self {
            rank,
            tick_size,
            domain_ticks,
            total_nodes: totals.0,
            total_elements: totals.1,
            nodes,
            elements,
            owned_dangling,
        };
        mesh.validate()?;
        Ok(mesh)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn tick_size(&self) -> f64 {
        self.tick_size
    }

    /// The far corner of the domain in ticks; the near corner is the origin.
    pub fn domain_ticks(&self) -> [u64; 3] {
        self.domain_ticks
    }

    pub fn domain_size(&self) -> [f64; 3] {
        let [x, y, z] = self.domain_ticks;
        [
            x as f64 * self.tick_size,
            y as f64 * self.tick_size,
            z as f64 * self.tick_size,
        ]
    }

    pub fn total_nodes(&self) -> u64 {
        self.total_nodes
    }

    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn num_harbored(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_owned(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_owned()).count()
    }

    /// Local indices of the dangling nodes this process owns. These are the
    /// only nodes the constraint propagator touches.
    ///
    pub fn owned_dangling(&self) -> &[usize] {
        &self.owned_dangling
    }

    /// Local index of the node with the given global id, if harbored here.
    ///
    pub fn local_index(&self, gid: u64) -> Option<usize> {
        self.nodes.binary_search_by_key(&gid, |n| n.gid).ok()
    }

    /// Lower-left-bottom and upper-right-front corners of an element, in
    /// ticks.
    ///
    pub fn element_corners(&self, element: &Element) -> ([u64; 3], [u64; 3]) {
        let ldb = self.nodes[element.nodes[0]].ticks;
        let ruf = self.nodes[element.nodes[7]].ticks;
        (ldb, ruf)
    }

    fn validate(&self) -> crate::Result<()> {
        use crate::Error::InvalidMesh;

        if !(self.tick_size > 0.0) {
            return Err(InvalidMesh(format!("tick size {} is not positive", self.tick_size)));
        }
        for pair in self.nodes.windows(2) {
            if pair[0].gid >= pair[1].gid {
                return Err(InvalidMesh(format!(
                    "local nodes are not sorted by global id ({} before {})",
                    pair[0].gid, pair[1].gid
                )));
            }
        }
        for node in &self.nodes {
            match &node.ownership {
                Ownership::Owned { sharers } => {
                    let unique: HashSet<_> = sharers.iter().collect();
                    if unique.len() != sharers.len() || unique.contains(&self.rank) {
                        return Err(InvalidMesh(format!(
                            "node {} has an invalid sharer list {:?}",
                            node.gid, sharers
                        )));
                    }
                }
                Ownership::Harbored { owner } => {
                    if *owner == self.rank {
                        return Err(InvalidMesh(format!(
                            "node {} is harbored from its own process",
                            node.gid
                        )));
                    }
                }
            }
            if let Conformity::Dangling { anchors, deps } = &node.conformity {
                if anchors.is_empty() || *deps != anchors.len() as f64 {
                    return Err(InvalidMesh(format!(
                        "dangling node {} has {} anchors but weight {}",
                        node.gid,
                        anchors.len(),
                        deps
                    )));
                }
                for &a in anchors {
                    match self.nodes.get(a) {
                        Some(anchor) if !anchor.conformity.is_dangling() => {}
                        _ => {
                            return Err(InvalidMesh(format!(
                                "dangling node {} has an unresolvable anchor {}",
                                node.gid, a
                            )))
                        }
                    }
                }
            }
        }
        for (i, element) in self.elements.iter().enumerate() {
            if element.nodes.iter().any(|&n| n >= self.nodes.len()) {
                return Err(InvalidMesh(format!("element {} references a missing node", i)));
            }
            let m = &element.material;
            if !(element.edge > 0.0 && m.vp > 0.0 && m.vs > 0.0 && m.rho > 0.0) {
                return Err(InvalidMesh(format!(
                    "element {} has non-positive size or material {:?}",
                    i, m
                )));
            }
        }
        Ok(())
    }
}
