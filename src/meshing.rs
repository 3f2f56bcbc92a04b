use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::error::{Error, Result};
use crate::mesh::{Conformity, Element, ElementKind, Material, Mesh, Node, Ownership};

/// A node of the unpartitioned mesh. An empty anchor list means the node
/// is anchored.
///
#[derive(Clone, Debug)]
pub struct GlobalNode {
    pub ticks: [u64; 3],
    pub anchors: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct GlobalElement {
    pub lower: [u64; 3],
    pub edge_ticks: u64,
    pub nodes: [usize; 8],
    pub material: Material,
    pub kind: ElementKind,
}

/**
 * An unpartitioned hexahedral mesh on an integer tick lattice. This stands
 * in for the octree mesher: it can build small uniform or refined meshes,
 * detect the hanging nodes of a 2:1 balanced refinement, and cut the mesh
 * into the per-process views the solver consumes.
 */
#[derive(Clone, Debug)]
pub struct GlobalMesh {
    tick_size: f64,
    domain_ticks: [u64; 3],
    nodes: Vec<GlobalNode>,
    elements: Vec<GlobalElement>,
    node_at: HashMap<[u64; 3], usize>,
}




// ============================================================================
impl GlobalMesh {
    pub fn new(tick_size: f64, domain_ticks: [u64; 3]) -> Self {
        Self {
            tick_size,
            domain_ticks,
            nodes: Vec::new(),
            elements: Vec::new(),
            node_at: HashMap::new(),
        }
    }

    /// A box of `dims` cubes with the given edge length. Elements are
    /// numbered with x outermost, so contiguous blocks of elements are
    /// slabs along x.
    ///
    pub fn uniform<M>(dims: [u64; 3], edge: f64, material: M) -> Self
    where
        M: Fn([f64; 3]) -> Material,
    {
        let mut mesh = Self::new(edge, dims);
        for i in 0..dims[0] {
            for j in 0..dims[1] {
                for k in 0..dims[2] {
                    let center = [
                        (i as f64 + 0.5) * edge,
                        (j as f64 + 0.5) * edge,
                        (k as f64 + 0.5) * edge,
                    ];
                    mesh.add_element([i, j, k], 1, material(center), ElementKind::Solid);
                }
            }
        }
        mesh
    }

    /// One coarse cube of edge `edge` at the origin, with four cubes of
    /// half that edge glued to its +x face. The shared face carries five
    /// hanging nodes: four edge midpoints and the face center.
    ///
    pub fn coarse_fine_interface(edge: f64, material: Material) -> Self {
        let mut mesh = Self::new(edge / 2.0, [3, 2, 2]);
        mesh.add_element([0, 0, 0], 2, material, ElementKind::Solid);
        for j in 0..2 {
            for k in 0..2 {
                mesh.add_element([2, j, k], 1, material, ElementKind::Solid);
            }
        }
        mesh.resolve_hanging_nodes();
        mesh
    }

    pub fn tick_size(&self) -> f64 {
        self.tick_size
    }

    pub fn nodes(&self) -> &[GlobalNode] {
        &self.nodes
    }

    pub fn elements(&self) -> &[GlobalElement] {
        &self.elements
    }

    pub fn add_element(&mut self, lower: [u64; 3], edge_ticks: u64, material: Material, kind: ElementKind) {
        let mut nodes = [0; 8];
        for (j, node) in nodes.iter_mut().enumerate() {
            let ticks = corner(lower, edge_ticks, j);
            *node = self.node_index(ticks);
        }
        self.elements.push(GlobalElement {
            lower,
            edge_ticks,
            nodes,
            material,
            kind,
        });
    }

    /// Mark every node sitting at an edge midpoint or face center of a
    /// larger element as dangling from that edge's or face's corners.
    ///
    pub fn resolve_hanging_nodes(&mut self) {
        let mut hanging = Vec::new();

        for element in &self.elements {
            if element.edge_ticks < 2 || element.edge_ticks % 2 != 0 {
                continue;
            }

            for j in 0..8 {
                for l in (0..8).filter(|&l| l > j) {
                    let a = corner(element.lower, element.edge_ticks, j);
                    let b = corner(element.lower, element.edge_ticks, l);
                    let differ = (0..3).filter(|&d| a[d] != b[d]).count();

                    // Corners differing along one axis bound an edge, along
                    // two axes they are diagonal on a face.
                    let midpoint = [(a[0] + b[0]) / 2, (a[1] + b[1]) / 2, (a[2] + b[2]) / 2];
                    if let Some(&n) = self.node_at.get(&midpoint) {
                        match differ {
                            1 => hanging.push((n, vec![j, l], element.nodes)),
                            2 => {
                                let face = face_corners(j, l);
                                hanging.push((n, face.to_vec(), element.nodes))
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        for (n, corners, element_nodes) in hanging {
            let mut anchors: Vec<_> = corners.iter().map(|&c| element_nodes[c]).collect();
            anchors.sort_unstable();
            anchors.dedup();
            self.nodes[n].anchors = anchors;
        }
    }

    /// Cut the mesh into `size` contiguous blocks of elements.
    ///
    pub fn partition(&self, size: usize) -> Result<Vec<Mesh>> {
        let count = self.elements.len();
        self.partition_with(size, |e| (e * size) / count.max(1))
    }

    /// Cut the mesh into per-process views, with element `e` computed by
    /// process `assign(e)`. A node is owned by the lowest rank whose
    /// elements touch it. Every process that harbors a dangling node also
    /// harbors that node's anchors. Global ids are renumbered so that each
    /// process owns a contiguous, increasing range of them.
    ///
    pub fn partition_with<F>(&self, size: usize, assign: F) -> Result<Vec<Mesh>>
    where
        F: Fn(usize) -> usize,
    {
        let element_rank: Vec<usize> = (0..self.elements.len()).map(&assign).collect();

        if let Some(bad) = element_rank.iter().find(|&&r| r >= size) {
            return Err(Error::InvalidMesh(format!(
                "element assigned to rank {} of a {}-process group",
                bad, size
            )));
        }

        let mut touching = vec![BTreeSet::new(); self.nodes.len()];
        for (element, &rank) in self.elements.iter().zip(&element_rank) {
            for &n in &element.nodes {
                touching[n].insert(rank);
            }
        }

        let mut owner = Vec::with_capacity(self.nodes.len());
        for (n, ranks) in touching.iter().enumerate() {
            match ranks.iter().next() {
                Some(&r) => owner.push(r),
                None => {
                    return Err(Error::InvalidMesh(format!(
                        "node at {:?} touches no element",
                        self.nodes[n].ticks
                    )))
                }
            }
        }

        let mut harborers = touching.clone();
        for (n, node) in self.nodes.iter().enumerate() {
            for &a in &node.anchors {
                let extra = touching[n].clone();
                harborers[a].extend(extra);
            }
        }

        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&n| (owner[n], n));
        let mut gid = vec![0u64; self.nodes.len()];
        for (g, &n) in order.iter().enumerate() {
            gid[n] = g as u64;
        }

        let totals = (self.nodes.len() as u64, self.elements.len() as u64);
        let mut meshes = Vec::with_capacity(size);

        for rank in 0..size {
            let local: Vec<usize> = order
                .iter()
                .copied()
                .filter(|&n| harborers[n].contains(&rank))
                .collect();
            let local_index: HashMap<usize, usize> =
                local.iter().enumerate().map(|(i, &n)| (n, i)).collect();

            let nodes = local
                .iter()
                .map(|&n| {
                    let ownership = if owner[n] == rank {
                        Ownership::Owned {
                            sharers: harborers[n].iter().copied().filter(|&r| r != rank).collect(),
                        }
                    } else {
                        Ownership::Harbored { owner: owner[n] }
                    };
                    let conformity = if self.nodes[n].anchors.is_empty() {
                        Conformity::Anchored
                    } else {
                        Conformity::dangling(
                            self.nodes[n].anchors.iter().map(|a| local_index[a]).collect(),
                        )
                    };
                    Node {
                        gid: gid[n],
                        ticks: self.nodes[n].ticks,
                        ownership,
                        conformity,
                    }
                })
                .collect();

            let elements = self
                .elements
                .iter()
                .zip(&element_rank)
                .filter(|&(_, &r)| r == rank)
                .map(|(e, _)| Element {
                    nodes: e.nodes.map(|n| local_index[&n]),
                    edge: e.edge_ticks as f64 * self.tick_size,
                    material: e.material,
                    kind: e.kind,
                })
                .collect::<Vec<_>>();

            debug!(
                "[{}] partition holds {} elements and {} nodes",
                rank,
                elements.len(),
                local.len()
            );
            meshes.push(Mesh::new(
                rank,
                self.tick_size,
                self.domain_ticks,
                totals,
                nodes,
                elements,
            )?);
        }
        Ok(meshes)
    }

    fn node_index(&mut self, ticks: [u64; 3]) -> usize {
        let nodes = &mut self.nodes;
        *self.node_at.entry(ticks).or_insert_with(|| {
            nodes.push(GlobalNode {
                ticks,
                anchors: Vec::new(),
            });
            nodes.len() - 1
        })
    }
}

fn corner(lower: [u64; 3], edge_ticks: u64, j: usize) -> [u64; 3] {
    [
        lower[0] + edge_ticks * (j as u64 & 1),
        lower[1] + edge_ticks * ((j as u64 >> 1) & 1),
        lower[2] + edge_ticks * ((j as u64 >> 2) & 1),
    ]
}

/// The four corners of the face containing the diagonal from corner `j` to
/// corner `l`.
fn face_corners(j: usize, l: usize) -> [usize; 4] {
    let fixed = !(j ^ l) & 7;
    let base = j & fixed;
    let free: Vec<usize> = (0..3).map(|d| 1 << d).filter(|b| fixed & b == 0).collect();
    [base, base | free[0], base | free[1], base | free[0] | free[1]]
}
