use crate::mesh::{Conformity, Mesh};
use crate::record::{Combine, Record};

/// Direction of the constraint between a dangling node and its anchors.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjust {
    /// Add `value / deps` of each dangling node into each of its anchors.
    /// The dangling node keeps its value.
    Distribute,

    /// Replace each dangling node's value with the sum over its anchors of
    /// `anchor / deps`.
    Assign,
}

/// Apply the constraint to the dangling nodes this process owns. Anchors
/// must already hold locally correct values for `Adjust::Assign`.
///
pub fn adjust<R: Record>(mesh: &Mesh, values: &mut [R], how: Adjust) {
    let mut scratch = vec![0.0; R::FIELDS];
    let nodes = mesh.nodes();

    for &d in mesh.owned_dangling() {
        let (anchors, deps) = match &nodes[d].conformity {
            Conformity::Dangling { anchors, deps } => (anchors, *deps),
            Conformity::Anchored => continue,
        };

        match how {
            Adjust::Distribute => {
                values[d].read_fields(&mut scratch);
                scratch.iter_mut().for_each(|x| *x /= deps);

                for &a in anchors {
                    values[a].write_fields(&scratch, Combine::Accumulate);
                }
            }
            Adjust::Assign => {
                values[d].zero();

                for &a in anchors {
                    values[a].read_fields(&mut scratch);
                    scratch.iter_mut().for_each(|x| *x /= deps);
                    values[d].write_fields(&scratch, Combine::Accumulate);
                }
            }
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::mesh::{Node, Ownership};
    use crate::num_vec::Vec3;

    /// Four anchored nodes and one dangling node at the center of their
    /// face, all owned by rank 0.
    fn face_mesh() -> Mesh {
        let owned = || Ownership::Owned { sharers: vec![] };
        let mut nodes: Vec<_> = (0..4)
            .map(|g| Node {
                gid: g,
                ticks: [0, 2 * (g & 1), 2 * (g >> 1)],
                ownership: owned(),
                conformity: Conformity::Anchored,
            })
            .collect();
        nodes.push(Node {
            gid: 4,
            ticks: [0, 1, 1],
            ownership: owned(),
            conformity: Conformity::dangling(vec![0, 1, 2, 3]),
        });
        Mesh::new(0, 1.0, [1, 2, 2], (5, 0), nodes, vec![]).unwrap()
    }

    #[test]
    fn distribute_prorates_into_anchors() {
        let mesh = face_mesh();
        let mut values = vec![Vec3::zeros(); 5];
        values[4] = Vec3::new(4.0, -8.0, 2.0);

        adjust(&mesh, &mut values, Adjust::Distribute);
        for v in &values[..4] {
            assert_eq!(*v, Vec3::new(1.0, -2.0, 0.5));
        }
        assert_eq!(values[4], Vec3::new(4.0, -8.0, 2.0));
    }

    #[test]
    fn assign_averages_the_anchors() {
        let mesh = face_mesh();
        let mut values = vec![
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 4.0),
            Vec3::new(6.0, 0.0, 0.0),
            Vec3::new(99.0, 99.0, 99.0),
        ];
        adjust(&mesh, &mut values, Adjust::Assign);
        assert_eq!(values[4], Vec3::new(3.0, 0.0, 1.0));
    }

    #[test]
    fn distribute_then_assign_recovers_the_prorated_value() {
        let mesh = face_mesh();
        let x = Vec3::new(4.0, 12.0, -20.0);
        let mut values = vec![Vec3::zeros(); 5];
        values[4] = x;

        adjust(&mesh, &mut values, Adjust::Distribute);
        adjust(&mesh, &mut values, Adjust::Assign);

        // Each anchor holds x / 4; the dangling node averages them.
        assert_eq!(values[4], x / 4.0);

        let total = values[..4].iter().fold(Vec3::zeros(), |a, b| a + *b);
        assert_eq!(total, x);
    }

    #[test]
    fn single_anchor_round_trip_is_exact() {
        let owned = || Ownership::Owned { sharers: vec![] };
        let nodes = vec![
            Node {
                gid: 0,
                ticks: [0, 0, 0],
                ownership: owned(),
                conformity: Conformity::Anchored,
            },
            Node {
                gid: 1,
                ticks: [1, 0, 0],
                ownership: owned(),
                conformity: Conformity::dangling(vec![0]),
            },
        ];
        let mesh = Mesh::new(0, 1.0, [1, 1, 1], (2, 0), nodes, vec![]).unwrap();
        let mut values = vec![Vec3::zeros(), Vec3::new(0.3, 0.7, -1.1)];

        adjust(&mesh, &mut values, Adjust::Distribute);
        adjust(&mesh, &mut values, Adjust::Assign);
        assert_eq!(values[1], Vec3::new(0.3, 0.7, -1.1));
    }

    #[test]
    fn harbored_dangling_nodes_are_left_alone() {
        let nodes = vec![
            Node {
                gid: 0,
                ticks: [0, 0, 0],
                ownership: Ownership::Owned { sharers: vec![1] },
                conformity: Conformity::Anchored,
            },
            Node {
                gid: 1,
                ticks: [1, 0, 0],
                ownership: Ownership::Harbored { owner: 1 },
                conformity: Conformity::dangling(vec![0]),
            },
        ];
        let mesh = Mesh::new(0, 1.0, [1, 1, 1], (2, 0), nodes, vec![]).unwrap();
        let mut values = vec![Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0)];
        adjust(&mesh, &mut values, Adjust::Distribute);
        assert_eq!(values[0], Vec3::zeros());
    }
}
