use crate::num_vec::Vec3;

/// A 3x3 block of an element stiffness matrix, coupling the displacement
/// components of two element nodes.
///
pub type Mat3 = [[f64; 3]; 3];

/// Coordinates of the eight corners of the reference cube `[-1, 1]^3`,
/// one row per axis.
///
const CORNERS: [[f64; 8]; 3] = [
    [-1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0],
    [-1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0],
    [-1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0],
];

fn integral_1(xki: f64, xkj: f64, xli: f64, xlj: f64, xmi: f64, xmj: f64) -> f64 {
    4.5 * xki * xkj * (1.0 + xli * xlj / 3.0) * (1.0 + xmi * xmj / 3.0) / 8.0
}

fn integral_2(xki: f64, xlj: f64, xmi: f64, xmj: f64) -> f64 {
    4.5 * xki * xlj * (1.0 + xmi * xmj / 3.0) / 8.0
}

/// Per-element scalars that scale the reference stiffness to one element:
/// `c1`, `c2` multiply the displacement through the shear and bulk parts,
/// `c3`, `c4` multiply the displacement increment (stiffness damping).
///
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ElementConstants {
    pub c1: f64,
    pub c2: f64,
    pub c3: f64,
    pub c4: f64,
}




/**
 * The stiffness of the reference trilinear hexahedron, as 8x8 blocks of
 * 3x3 matrices. `k1` carries the shear-modulus terms (with the diagonal
 * Laplacian part folded in) and `k2` the Lame lambda terms. An element of
 * any size and material reuses these, scaled by its `ElementConstants`.
 */
#[derive(Clone, Debug)]
pub struct ReferenceStiffness {
    k1: [[Mat3; 8]; 8],
    k2: [[Mat3; 8]; 8],
}




// ============================================================================
impl ReferenceStiffness {
    pub fn new() -> Self {
        let k3 = laplacian_blocks();
        let (mut k1, k2) = gradient_blocks();

        for i in 0..8 {
            for j in 0..8 {
                for k in 0..3 {
                    k1[i][j][k][k] += k3[i][j][k][k];
                }
            }
        }
        Self { k1, k2 }
    }

    pub fn k1(&self) -> &[[Mat3; 8]; 8] {
        &self.k1
    }

    pub fn k2(&self) -> &[[Mat3; 8]; 8] {
        &self.k2
    }

    /// Add the internal force of one element to `force`, given its node
    /// displacements `u` at the current step and the increments `du` since
    /// the previous step:
    ///
    /// `f_i -= K1_ij (c1 u_j + c3 du_j) + K2_ij (c2 u_j + c4 du_j)`
    ///
    /// Node vectors whose components are all negligible are treated as
    /// exactly zero, and pairs where both are skip the product entirely.
    ///
    pub fn add_element_force(
        &self,
        c: &ElementConstants,
        u: &[Vec3; 8],
        du: &[Vec3; 8],
        force: &mut [Vec3; 8],
    ) {
        for j in 0..8 {
            let u_zero = u[j].is_negligible();
            let du_zero = du[j].is_negligible();

            if u_zero && du_zero {
                continue;
            }
            let uj = if u_zero { Vec3::zeros() } else { u[j] };
            let duj = if du_zero { Vec3::zeros() } else { du[j] };

            let mut a = [0.0; 3];
            let mut b = [0.0; 3];
            for l in 0..3 {
                a[l] = -c.c1 * uj[l] - c.c3 * duj[l];
                b[l] = -c.c2 * uj[l] - c.c4 * duj[l];
            }
            for i in 0..8 {
                let m1 = &self.k1[i][j];
                let m2 = &self.k2[i][j];
                for k in 0..3 {
                    force[i][k] += m1[k][0] * a[0] + m1[k][1] * a[1] + m1[k][2] * a[2]
                        + m2[k][0] * b[0]
                        + m2[k][1] * b[1]
                        + m2[k][2] * b[2];
                }
            }
        }
    }
}

impl Default for ReferenceStiffness {
    fn default() -> Self {
        Self::new()
    }
}

/// The diagonal blocks `sum_k dphi_i/dx_k dphi_j/dx_k` of the vector
/// Laplacian.
///
fn laplacian_blocks() -> [[Mat3; 8]; 8] {
    let x = &CORNERS;
    let mut k3 = [[[[0.0; 3]; 3]; 8]; 8];

    for i in 0..8 {
        for j in 0..8 {
            for k in 0..3 {
                let mut sum = 0.0;
                for r in 0..3 {
                    let a = (k + r) % 3;
                    let b = (k + r + 1) % 3;
                    let m = (k + r + 2) % 3;
                    sum += integral_1(x[a][i], x[a][j], x[b][i], x[b][j], x[m][i], x[m][j]);
                }
                k3[i][j][k][k] = sum;
            }
        }
    }
    k3
}

/// The blocks `dphi_i/dx_l dphi_j/dx_k` (first) and its transpose
/// counterpart `dphi_i/dx_k dphi_j/dx_l` (second).
///
fn gradient_blocks() -> ([[Mat3; 8]; 8], [[Mat3; 8]; 8]) {
    let x = &CORNERS;
    let mut k1 = [[[[0.0; 3]; 3]; 8]; 8];
    let mut k2 = [[[[0.0; 3]; 3]; 8]; 8];

    for i in 0..8 {
        for j in 0..8 {
            for k in 0..3 {
                for l in 0..3 {
                    if k == l {
                        let b = (k + 1) % 3;
                        let m = (k + 2) % 3;
                        k1[i][j][k][k] =
                            integral_1(x[k][i], x[k][j], x[b][i], x[b][j], x[m][i], x[m][j]);
                        k2[i][j][k][k] =
                            integral_1(x[k][j], x[k][i], x[b][j], x[b][i], x[m][j], x[m][i]);
                    } else {
                        let m = 3 - k - l;
                        k1[i][j][k][l] = integral_2(x[k][j], x[l][i], x[m][j], x[m][i]);
                        k2[i][j][k][l] = integral_2(x[k][i], x[l][j], x[m][i], x[m][j]);
                    }
                }
            }
        }
    }
    (k1, k2)
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn rows_annihilate_rigid_translation() {
        let k = ReferenceStiffness::new();
        for blocks in [k.k1(), k.k2()] {
            for i in 0..8 {
                for a in 0..3 {
                    for b in 0..3 {
                        let sum: f64 = (0..8).map(|j| blocks[i][j][a][b]).sum();
                        assert!(close(sum, 0.0), "row {} ({}, {}) sums to {}", i, a, b, sum);
                    }
                }
            }
        }
    }

    #[test]
    fn lambda_blocks_are_symmetric() {
        let k = ReferenceStiffness::new();
        for i in 0..8 {
            for j in 0..8 {
                for a in 0..3 {
                    for b in 0..3 {
                        assert!(close(k.k2()[i][j][a][b], k.k2()[j][i][b][a]));
                        assert!(close(k.k1()[i][j][a][b], k.k1()[j][i][b][a]));
                    }
                }
            }
        }
    }

    #[test]
    fn gradient_blocks_mirror_each_other() {
        let (k1, k2) = gradient_blocks();
        for i in 0..8 {
            for j in 0..8 {
                for a in 0..3 {
                    for b in 0..3 {
                        assert!(close(k2[j][i][a][b], k1[i][j][a][b]));
                    }
                }
            }
        }
    }

    #[test]
    fn laplacian_diagonal_is_positive() {
        let k3 = laplacian_blocks();
        for i in 0..8 {
            for k in 0..3 {
                assert!(k3[i][i][k][k] > 0.0);
                assert!(close(k3[i][i][k][k], k3[i][i][0][0]));
            }
        }
    }

    #[test]
    fn rigid_motion_produces_no_force() {
        let k = ReferenceStiffness::new();
        let c = ElementConstants {
            c1: 1.5,
            c2: 2.5,
            c3: 0.1,
            c4: 0.2,
        };
        let u = [Vec3::new(0.3, -0.2, 0.1); 8];
        let du = [Vec3::new(0.01, 0.0, 0.02); 8];
        let mut force = [Vec3::zeros(); 8];
        k.add_element_force(&c, &u, &du, &mut force);
        assert!(force.iter().all(|f| f.max_abs() < 1e-12));
    }

    #[test]
    fn stretching_pulls_nodes_back() {
        let k = ReferenceStiffness::new();
        let c = ElementConstants {
            c1: 1.0,
            c2: 1.0,
            c3: 0.0,
            c4: 0.0,
        };
        let mut u = [Vec3::zeros(); 8];
        for (j, uj) in u.iter_mut().enumerate() {
            uj[0] = CORNERS[0][j] * 1e-3;
        }
        let mut force = [Vec3::zeros(); 8];
        k.add_element_force(&c, &u, &[Vec3::zeros(); 8], &mut force);
        for j in 0..8 {
            assert!(force[j][0] * CORNERS[0][j] < 0.0);
        }
    }

    #[test]
    fn negligible_vectors_contribute_nothing() {
        let k = ReferenceStiffness::new();
        let c = ElementConstants {
            c1: 1.0,
            c2: 1.0,
            c3: 1.0,
            c4: 1.0,
        };
        let u = [Vec3::new(1e-21, 0.0, 0.0); 8];
        let mut force = [Vec3::zeros(); 8];
        k.add_element_force(&c, &u, &u, &mut force);
        assert_eq!(force, [Vec3::zeros(); 8]);
    }
}
