use serde::{Deserialize, Serialize};

/// Absorbing boundary treatment of the domain faces.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum AbsorbingBoundary {
    /// No dashpots: every face reflects.
    Off,
    /// Dashpots on all six faces.
    FullSpace,
    /// Dashpots on every face except the near z face, which is a free
    /// surface.
    HalfSpace,
}

/// The flag of an element that touches no domain face.
pub const INTERIOR: u8 = 13;

/// For each boundary flag and each element node, a bitmark of the domain
/// faces the node lies on that absorb: bit `d` is set if the node's face
/// normal is along axis `d`.
///
const BOUNDARY_MATRIX: [[u8; 8]; 27] = [
    [7, 6, 5, 4, 3, 2, 1, 0],
    [6, 6, 4, 4, 2, 2, 0, 0],
    [6, 7, 4, 5, 2, 3, 0, 1],
    [5, 4, 5, 4, 1, 0, 1, 0],
    [4, 4, 4, 4, 0, 0, 0, 0],
    [4, 5, 4, 5, 0, 1, 0, 1],
    [5, 4, 7, 6, 1, 0, 3, 2],
    [4, 4, 6, 6, 0, 0, 2, 2],
    [4, 5, 6, 7, 0, 1, 2, 3],
    [3, 2, 1, 0, 3, 2, 1, 0],
    [2, 2, 0, 0, 2, 2, 0, 0],
    [2, 3, 0, 1, 2, 3, 0, 1],
    [1, 0, 1, 0, 1, 0, 1, 0],
    [0, 0, 0, 0, 0, 0, 0, 0],
    [0, 1, 0, 1, 0, 1, 0, 1],
    [1, 0, 3, 2, 1, 0, 3, 2],
    [0, 0, 2, 2, 0, 0, 2, 2],
    [0, 1, 2, 3, 0, 1, 2, 3],
    [3, 2, 1, 0, 7, 6, 5, 4],
    [2, 2, 0, 0, 6, 6, 4, 4],
    [2, 3, 0, 1, 6, 7, 4, 5],
    [1, 0, 1, 0, 5, 4, 5, 4],
    [0, 0, 0, 0, 4, 4, 4, 4],
    [0, 1, 0, 1, 4, 5, 4, 5],
    [1, 0, 3, 2, 5, 4, 7, 6],
    [0, 0, 2, 2, 4, 4, 6, 6],
    [0, 1, 2, 3, 4, 5, 6, 7],
];

/// Classify an element by the domain faces it touches. `ldb` and `ruf` are
/// the element's lower-left-bottom and upper-right-front corners, `near`
/// and `far` those of the domain. The result indexes a 3x3x3 grid of
/// positions (x fastest): 13 is the interior, faces are 4, 10, 12, 14, 16
/// and 22, and the remaining values are edges and corners. When an
/// element spans the whole domain along an axis, the far face wins.
///
pub fn boundary_flag(ldb: [u64; 3], ruf: [u64; 3], near: [u64; 3], far: [u64; 3]) -> u8 {
    let lo = |d: usize| ldb[d] == near[d];
    let hi = |d: usize| ruf[d] == far[d];
    let mut flag = INTERIOR;

    if lo(0) {
        flag = 12;
    }
    if lo(1) {
        flag = 10;
    }
    if lo(2) {
        flag = 4;
    }
    if hi(0) {
        flag = 14;
    }
    if hi(1) {
        flag = 16;
    }
    if hi(2) {
        flag = 22;
    }

    if lo(0) && lo(1) {
        flag = 9;
    }
    if hi(0) && lo(1) {
        flag = 11;
    }
    if lo(0) && hi(1) {
        flag = 15;
    }
    if hi(0) && hi(1) {
        flag = 17;
    }

    if lo(0) && lo(2) {
        flag = 3;
    }
    if hi(0) && lo(2) {
        flag = 5;
    }
    if lo(0) && hi(2) {
        flag = 21;
    }
    if hi(0) && hi(2) {
        flag = 23;
    }

    if lo(1) && lo(2) {
        flag = 1;
    }
    if hi(1) && lo(2) {
        flag = 7;
    }
    if lo(1) && hi(2) {
        flag = 19;
    }
    if hi(1) && hi(2) {
        flag = 25;
    }

    for (x, y, z, corner) in [
        (false, false, false, 0),
        (true, false, false, 2),
        (false, true, false, 6),
        (true, true, false, 8),
        (false, false, true, 18),
        (true, false, true, 20),
        (false, true, true, 24),
        (true, true, true, 26),
    ] {
        let on_x = if x { hi(0) } else { lo(0) };
        let on_y = if y { hi(1) } else { lo(1) };
        let on_z = if z { hi(2) } else { lo(2) };
        if on_x && on_y && on_z {
            flag = corner;
        }
    }
    flag
}

/// Dashpot coefficients per element node and axis for an element with the
/// given boundary flag. A node on one absorbing face gets `Vp` along the
/// face normal and `Vs` along the other axes; nodes on two or three faces
/// sum the contributions of each face. Everything is scaled by
/// `rho (h / 2)^2`.
///
pub fn dashpots(edge: f64, vp: f64, vs: f64, rho: f64, flag: u8, mode: AbsorbingBoundary) -> [[f64; 3]; 8] {
    let flag = match mode {
        AbsorbingBoundary::HalfSpace if flag < 9 => flag + 9,
        _ => flag,
    };
    let scale = rho * (edge / 2.0) * (edge / 2.0);
    let mut dashpot = [[0.0; 3]; 8];

    if mode == AbsorbingBoundary::Off {
        return dashpot;
    }

    for (node, d) in dashpot.iter_mut().enumerate() {
        let bitmark = BOUNDARY_MATRIX[flag as usize][node];
        let along = |axis: usize| if bitmark & (1 << axis) != 0 { vp } else { vs };

        match bitmark.count_ones() {
            0 => {}
            1 => {
                for (axis, x) in d.iter_mut().enumerate() {
                    *x = along(axis) * scale;
                }
            }
            2 => {
                for (axis, x) in d.iter_mut().enumerate() {
                    *x = (vs + along(axis)) * scale;
                }
            }
            _ => *d = [(vp + 2.0 * vs) * scale; 3],
        }
    }
    dashpot
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    const NEAR: [u64; 3] = [0, 0, 0];
    const FAR: [u64; 3] = [4, 4, 4];

    fn flag_at(i: u64, j: u64, k: u64) -> u8 {
        boundary_flag([i, j, k], [i + 1, j + 1, k + 1], NEAR, FAR)
    }

    #[test]
    fn flags_follow_the_position_grid() {
        // Position (a, b, c) in {0, 1, 2}^3 maps to a + 3b + 9c.
        let coord = |n: u64| match n {
            0 => 0,
            3 => 2,
            _ => 1,
        };
        for i in 0..4 {
            for j in 0..4 {
                for k in 0..4 {
                    let expected = coord(i) + 3 * coord(j) + 9 * coord(k);
                    assert_eq!(flag_at(i, j, k) as u64, expected, "element at ({}, {}, {})", i, j, k);
                }
            }
        }
    }

    #[test]
    fn interior_elements_have_no_dashpots() {
        let d = dashpots(2.0, 1000.0, 500.0, 2000.0, INTERIOR, AbsorbingBoundary::FullSpace);
        assert_eq!(d, [[0.0; 3]; 8]);
    }

    #[test]
    fn one_face_uses_vp_along_the_normal() {
        // Flag 12 is the near x face: nodes 0, 2, 4, 6 lie on it.
        let scale = 2000.0 * 1.0 * 1.0;
        let d = dashpots(2.0, 1000.0, 500.0, 2000.0, 12, AbsorbingBoundary::FullSpace);
        for node in [0, 2, 4, 6] {
            assert_eq!(d[node], [1000.0 * scale, 500.0 * scale, 500.0 * scale]);
        }
        for node in [1, 3, 5, 7] {
            assert_eq!(d[node], [0.0; 3]);
        }
    }

    #[test]
    fn corner_node_gets_three_faces() {
        let scale = 2000.0;
        let d = dashpots(2.0, 1000.0, 500.0, 2000.0, 0, AbsorbingBoundary::FullSpace);
        assert_eq!(d[0], [2000.0 * scale; 3]);
        assert_eq!(d[1], [(500.0 + 500.0) * scale, (500.0 + 1000.0) * scale, (500.0 + 1000.0) * scale]);
        assert_eq!(d[7], [0.0; 3]);
    }

    #[test]
    fn half_space_frees_the_near_z_face() {
        let full = dashpots(2.0, 1000.0, 500.0, 2000.0, 4, AbsorbingBoundary::FullSpace);
        let half = dashpots(2.0, 1000.0, 500.0, 2000.0, 4, AbsorbingBoundary::HalfSpace);
        assert!(full[0][2] > 0.0);
        assert_eq!(half, [[0.0; 3]; 8]);

        let off = dashpots(2.0, 1000.0, 500.0, 2000.0, 0, AbsorbingBoundary::Off);
        assert_eq!(off, [[0.0; 3]; 8]);
    }
}
