use std::f64::consts::PI;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::boundary::{self, AbsorbingBoundary, INTERIOR};
use crate::error::{Error, Result};
use crate::mesh::{Element, Material, Mesh};
use crate::message::{Communicator, ReduceOp};
use crate::num_vec::Vec3;
use crate::record::{Combine, Record};
use crate::stiffness::ElementConstants;

/// How the damping coefficients `a` (mass proportional) and `b` (stiffness
/// proportional) are fitted to a target damping ratio.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum DampingType {
    Rayleigh,
    Mass,
    None,
}

/// Curves mapping shear wave velocity (m/s) to a quality factor Q.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum QualityModel {
    Ceus,
    CeusHard,
    Hartzell,
    NewCeus,
    NewCeus2,
    Elastic,
}

impl QualityModel {
    /// The quality factor for shear velocity `vs`. Later bands override
    /// earlier ones where their ranges meet.
    ///
    pub fn quality_factor(self, vs: f64) -> f64 {
        let mut q = 0.0;
        match self {
            QualityModel::Ceus | QualityModel::CeusHard => {
                let (top, offset, slope) = match self {
                    QualityModel::Ceus => (700.0, -166.667, 650.0 / 1500.0),
                    _ => (1000.0, -266.667, 950.0 / 1500.0),
                };
                if vs <= 350.0 {
                    q = 35.0;
                }
                if vs >= 2000.0 {
                    q = top;
                }
                if vs > 350.0 && vs <= 500.0 {
                    q = 0.1 * vs;
                }
                if (500.0..=2000.0).contains(&vs) {
                    q = offset + slope * vs;
                }
            }
            QualityModel::Hartzell => {
                if vs < 500.0 {
                    q = 0.05 * vs;
                }
                if (500.0..=1000.0).contains(&vs) {
                    q = 0.23 * vs - 90.0;
                }
                if vs > 1000.0 && vs < 4000.0 {
                    q = 0.14 * vs;
                }
                if vs >= 4000.0 {
                    q = 700.0;
                }
            }
            QualityModel::NewCeus | QualityModel::NewCeus2 => {
                let new = self == QualityModel::NewCeus;
                if vs < 500.0 {
                    q = 0.1 * vs;
                }
                if (500.0..=1000.0).contains(&vs) {
                    q = if new { 0.18 * vs - 40.0 } else { 0.3 * vs - 100.0 };
                }
                if vs > 1000.0 && vs < 4000.0 {
                    q = if new { 0.14 * vs } else { 0.167 * vs + 33.0 };
                }
                if vs >= 4000.0 {
                    q = 700.0;
                }
                if vs < 350.0 {
                    q = 35.0;
                }
            }
            QualityModel::Elastic => q = 10000.0,
        }
        q
    }
}




/**
 * The damping model: base coefficients `a / zeta` and `b / zeta` fitted
 * over the simulated frequency band, the Q curve giving each element its
 * `zeta`, and the largest `zeta` allowed.
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Damping {
    pub a_base: f64,
    pub b_base: f64,
    pub model: QualityModel,
    pub threshold: f64,
}

impl Damping {
    pub fn new(kind: DampingType, max_frequency: f64, model: QualityModel, threshold: f64) -> Self {
        let (a_base, b_base) = match kind {
            DampingType::Rayleigh => {
                let w1 = 2.0 * PI * max_frequency * 0.2;
                let w2 = 2.0 * PI * max_frequency;
                let (lw1, lw2) = (w1.ln(), w2.ln());
                let (sw1, sw2) = (w1 * w1, w2 * w2);
                let (cw1, cw2) = (sw1 * w1, sw2 * w2);

                let numer = w1
                    * w2
                    * (-2.0 * sw1 * lw2 + 2.0 * sw1 * lw1 - 2.0 * w1 * w2 * lw2
                        + 2.0 * w1 * w2 * lw1
                        + 3.0 * sw2
                        - 3.0 * sw1
                        - 2.0 * sw2 * lw2
                        + 2.0 * sw2 * lw1);
                let denom = cw1 - cw2 + 3.0 * sw2 * w1 - 3.0 * sw1 * w2;
                let b_numer = 3.0 * (2.0 * w1 * w2 * lw2 - 2.0 * w1 * w2 * lw1 + sw1 - sw2);
                (numer / denom, b_numer / denom)
            }
            DampingType::Mass => {
                let w1 = 2.0 * PI * max_frequency * 0.1;
                let w2 = 2.0 * PI * max_frequency * 8.0;
                let numer = 2.0 * w2 * w1 * (w2 / w1).ln();
                (1.3 * numer / (w2 - w1), 0.0)
            }
            DampingType::None => (0.0, 0.0),
        };
        Self {
            a_base,
            b_base,
            model,
            threshold,
        }
    }

    /// The unclipped damping ratio `1 / 2Q`.
    pub fn raw_zeta(&self, vs: f64) -> f64 {
        1.0 / (2.0 * self.model.quality_factor(vs))
    }

    pub fn zeta(&self, vs: f64) -> f64 {
        self.raw_zeta(vs).min(self.threshold)
    }
}

/// Everything derived from one element's material at initialization.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ElementTerms {
    pub constants: ElementConstants,
    /// Mass-proportional damping coefficient `a = zeta a_base`.
    pub a: f64,
    /// Vp after the Poisson ratio correction, if one was needed.
    pub vp: f64,
}

/// Compute the stiffness scalars of one element. If the material implies a
/// negative Lame lambda, Vp is rebuilt from Vs before trying again.
///
pub fn element_terms(
    index: usize,
    element: &Element,
    delta_t: f64,
    damping: &Damping,
    threshold_vp_vs: f64,
) -> Result<ElementTerms> {
    let h = element.edge;
    let rho = element.material.rho;
    let vs = element.material.vs;
    let mut vp = element.material.vp;

    let mu = rho * vs * vs;
    let mut lambda = if vp > vs * threshold_vp_vs {
        rho * vs * vs * threshold_vp_vs * threshold_vp_vs - 2.0 * mu
    } else {
        rho * vp * vp - 2.0 * mu
    };

    if lambda < 0.0 {
        vp = if vs < 500.0 {
            2.45 * vs
        } else if vs < 1200.0 {
            2.0 * vs
        } else {
            1.87 * vs
        };
        lambda = rho * vp * vp;
    }
    if lambda < 0.0 {
        return Err(Error::NegativeLambda { element: index, lambda });
    }

    let zeta = damping.zeta(vs);
    let a = zeta * damping.a_base;
    let b = zeta * damping.b_base;
    let dt2 = delta_t * delta_t;

    Ok(ElementTerms {
        constants: ElementConstants {
            c1: dt2 * h * mu / 9.0,
            c2: dt2 * h * lambda / 9.0,
            c3: b * delta_t * h * mu / 9.0,
            c4: b * delta_t * h * lambda / 9.0,
        },
        a,
        vp,
    })
}




/**
 * Lumped nodal mass, and the two damping-adjusted variants used by the
 * leapfrog update: per axis, `M - dt a M` and `2M - dt a M`, each less
 * `dt` times any boundary dashpot.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeMass {
    pub mass_simple: f64,
    pub mass_minus_am: Vec3,
    pub mass2_minus_am: Vec3,
}

impl NodeMass {
    fn accumulate(&mut self, m: f64, dt: f64, a: f64, dashpot: Option<&[f64; 3]>) {
        self.mass_simple += m;

        for axis in 0..3 {
            self.mass_minus_am[axis] -= dt * a * m;
            self.mass2_minus_am[axis] -= dt * a * m;

            if let Some(d) = dashpot {
                self.mass_minus_am[axis] -= dt * d[axis];
                self.mass2_minus_am[axis] -= dt * d[axis];
            }
            self.mass_minus_am[axis] += m;
            self.mass2_minus_am[axis] += m * 2.0;
        }
    }
}

impl Record for NodeMass {
    const FIELDS: usize = 7;

    fn read_fields(&self, out: &mut [f64]) {
        out[0] = self.mass_simple;
        out[1..4].copy_from_slice(self.mass_minus_am.as_array());
        out[4..7].copy_from_slice(self.mass2_minus_am.as_array());
    }

    fn write_fields(&mut self, fields: &[f64], combine: Combine) {
        match combine {
            Combine::Accumulate => self.mass_simple += fields[0],
            Combine::Overwrite => self.mass_simple = fields[0],
        }
        self.mass_minus_am.write_fields(&fields[1..4], combine);
        self.mass2_minus_am.write_fields(&fields[4..7], combine);
    }

    fn zero(&mut self) {
        *self = Self::default()
    }
}

/// Per-element constants and per-node masses of one process's mesh.
/// Masses hold only this process's element contributions until they are
/// exchanged.
///
#[derive(Clone, Debug)]
pub struct Coefficients {
    pub elements: Vec<ElementConstants>,
    pub nodes: Vec<NodeMass>,
}

/// Material and time-step parameters the coefficients are built from.
///
#[derive(Clone, Copy, Debug)]
pub struct Parameters {
    pub delta_t: f64,
    pub damping: Damping,
    pub threshold_vp_vs: f64,
    pub boundary: AbsorbingBoundary,
}

impl Coefficients {
    /// Element terms are independent, so they are computed in parallel;
    /// the scatter into nodal masses is serial. Excluded elements still
    /// contribute mass.
    ///
    pub fn build(mesh: &Mesh, params: &Parameters) -> Result<Self> {
        let terms = mesh
            .elements()
            .par_iter()
            .enumerate()
            .map(|(i, e)| element_terms(i, e, params.delta_t, &params.damping, params.threshold_vp_vs))
            .collect::<Result<Vec<_>>>()?;

        let mut nodes = vec![NodeMass::default(); mesh.num_harbored()];
        let near = [0, 0, 0];
        let far = mesh.domain_ticks();

        for (element, t) in mesh.elements().iter().zip(&terms) {
            let dashpot = match params.boundary {
                AbsorbingBoundary::Off => None,
                mode => {
                    let (ldb, ruf) = mesh.element_corners(element);
                    let flag = boundary::boundary_flag(ldb, ruf, near, far);
                    if flag == INTERIOR {
                        None
                    } else {
                        let m = &element.material;
                        Some(boundary::dashpots(element.edge, t.vp, m.vs, m.rho, flag, mode))
                    }
                }
            };
            let h = element.edge;
            let m = element.material.rho * h * h * h / 8.0;

            for (j, &n) in element.nodes.iter().enumerate() {
                nodes[n].accumulate(m, params.delta_t, t.a, dashpot.as_ref().map(|d| &d[j]));
            }
        }

        Ok(Self {
            elements: terms.iter().map(|t| t.constants).collect(),
            nodes,
        })
    }
}




/// Group-wide extremes of the stability and damping indicators. Damping
/// ratios here are unclipped.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DampingStatistics {
    pub zeta: (f64, f64),
    pub xi: (f64, f64),
    pub dt_factor_x: f64,
    pub dt_factor_z: f64,
    pub vs_over_vp: (f64, f64),
    pub vp_over_vs_zeta: (f64, f64),
    pub vs: (f64, f64),
}

/// Critical time step (the smallest `h / Vp` in the group), smallest edge,
/// and optionally the damping statistics.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeStepReport {
    pub critical_delta_t: f64,
    pub minimum_edge: f64,
    pub statistics: Option<DampingStatistics>,
}

/// Reduce the time step indicators over every element of the group. All
/// ranks must call this together.
///
pub fn time_step_report<C: Communicator>(
    comm: &C,
    mesh: &Mesh,
    damping: &Damping,
    with_statistics: bool,
) -> Result<TimeStepReport> {
    const BIG: f64 = 1e32;
    let mut min = [BIG; 9];
    let mut max = [0.0f64; 6];

    for element in mesh.elements() {
        let h = element.edge;
        let Material { vp, vs, .. } = element.material;

        let ratio = h / vp;
        let zeta = damping.raw_zeta(vs);
        let omega = 3.46410161514 / ratio;
        let a = zeta * damping.a_base;
        let b = zeta * damping.b_base;
        let xi = a / (2.0 * omega) + b * omega / 2.0;
        let dt_x = 0.57735026919 * (1.0 - xi) * ratio;
        let dt_z = 0.57735026919 * (1.0 - zeta) * ratio;

        let low = [ratio, h, dt_x, dt_z, zeta, xi, vs / vp, zeta * vp / vs, vs];
        let high = [zeta, xi, vs / vp, zeta * vp / vs, vs, 0.0];
        for (m, x) in min.iter_mut().zip(low) {
            *m = m.min(x);
        }
        for (m, x) in max.iter_mut().zip(high) {
            *m = m.max(x);
        }
    }

    if !with_statistics {
        let reduced = comm.all_reduce_f64s(ReduceOp::Min, &min[..2])?;
        return Ok(TimeStepReport {
            critical_delta_t: reduced[0],
            minimum_edge: reduced[1],
            statistics: None,
        });
    }

    let min = comm.all_reduce_f64s(ReduceOp::Min, &min)?;
    let max = comm.all_reduce_f64s(ReduceOp::Max, &max)?;

    Ok(TimeStepReport {
        critical_delta_t: min[0],
        minimum_edge: min[1],
        statistics: Some(DampingStatistics {
            dt_factor_x: min[2],
            dt_factor_z: min[3],
            zeta: (min[4], max[0]),
            xi: (min[5], max[1]),
            vs_over_vp: (min[6], max[2]),
            vp_over_vs_zeta: (min[7], max[3]),
            vs: (min[8], max[4]),
        }),
    })
}





// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::meshing::GlobalMesh;
    use crate::message::local;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn hartzell_breakpoints() {
        let q = |vs| QualityModel::Hartzell.quality_factor(vs);
        assert!(close(q(400.0), 20.0));
        assert!(close(q(500.0), 25.0));
        assert!(close(q(1000.0), 140.0));
        assert!(close(q(2000.0), 280.0));
        assert!(close(q(4000.0), 700.0));
    }

    #[test]
    fn ceus_bands_meet() {
        let q = |vs| QualityModel::Ceus.quality_factor(vs);
        assert_eq!(q(300.0), 35.0);
        assert!(close(q(400.0), 40.0));
        assert!((q(500.0) - 50.0).abs() < 1e-3);
        assert!((q(2000.0) - 700.0).abs() < 1e-3);
        assert_eq!(q(2500.0), 700.0);
        assert!((QualityModel::CeusHard.quality_factor(2000.0) - 1000.0).abs() < 1e-3);
    }

    #[test]
    fn new_ceus_floors_at_35() {
        assert_eq!(QualityModel::NewCeus.quality_factor(200.0), 35.0);
        assert!(close(QualityModel::NewCeus.quality_factor(400.0), 40.0));
        assert!(close(QualityModel::NewCeus.quality_factor(800.0), 104.0));
        assert!(close(QualityModel::NewCeus2.quality_factor(800.0), 140.0));
        assert!(close(QualityModel::NewCeus2.quality_factor(2000.0), 367.0));
        assert_eq!(QualityModel::Elastic.quality_factor(123.0), 10000.0);
    }

    #[test]
    fn damping_bases() {
        let none = Damping::new(DampingType::None, 1.0, QualityModel::Hartzell, 1.0);
        assert_eq!((none.a_base, none.b_base), (0.0, 0.0));

        let mass = Damping::new(DampingType::Mass, 1.0, QualityModel::Hartzell, 1.0);
        let (w1, w2) = (0.2 * PI, 16.0 * PI);
        assert!(close(mass.a_base, 1.3 * 2.0 * w1 * w2 * (w2 / w1).ln() / (w2 - w1)));
        assert_eq!(mass.b_base, 0.0);

        let rayleigh = Damping::new(DampingType::Rayleigh, 1.0, QualityModel::Hartzell, 1.0);
        assert!(rayleigh.a_base > 0.0);
        assert!(rayleigh.b_base > 0.0);
    }

    #[test]
    fn zeta_is_clipped() {
        let d = Damping::new(DampingType::None, 1.0, QualityModel::Hartzell, 0.01);
        assert!(close(d.raw_zeta(400.0), 0.025));
        assert_eq!(d.zeta(400.0), 0.01);
    }

    fn element(vp: f64, vs: f64) -> Element {
        Element {
            nodes: [0; 8],
            edge: 3.0,
            material: Material { vp, vs, rho: 2.0 },
            kind: crate::mesh::ElementKind::Solid,
        }
    }

    #[test]
    fn element_constants_scale_with_material() {
        let d = Damping::new(DampingType::None, 1.0, QualityModel::Hartzell, 1.0);
        let t = element_terms(0, &element(4.0, 2.0), 0.5, &d, 10.0).unwrap();
        let mu = 2.0 * 4.0;
        let lambda = 2.0 * 16.0 - 2.0 * mu;
        assert!(close(t.constants.c1, 0.25 * 3.0 * mu / 9.0));
        assert!(close(t.constants.c2, 0.25 * 3.0 * lambda / 9.0));
        assert_eq!(t.constants.c3, 0.0);
        assert_eq!(t.vp, 4.0);
    }

    #[test]
    fn poisson_ratio_fix_rebuilds_vp() {
        let d = Damping::new(DampingType::None, 1.0, QualityModel::Hartzell, 1.0);
        let t = element_terms(0, &element(100.0, 90.0), 1.0, &d, 10.0).unwrap();
        assert!(close(t.vp, 2.45 * 90.0));
        assert!(close(t.constants.c2, 3.0 * 2.0 * t.vp * t.vp / 9.0));

        let t = element_terms(0, &element(700.0, 600.0), 1.0, &d, 10.0).unwrap();
        assert!(close(t.vp, 1200.0));
    }

    #[test]
    fn vp_vs_threshold_caps_lambda() {
        let d = Damping::new(DampingType::None, 1.0, QualityModel::Hartzell, 1.0);
        let t = element_terms(0, &element(10.0, 1.0), 1.0, &d, 3.0).unwrap();
        let mu = 2.0;
        assert!(close(t.constants.c2, 3.0 * (2.0 * 9.0 - 2.0 * mu) / 9.0));
    }

    #[test]
    fn mass_includes_damping_and_dashpots() {
        let mut n = NodeMass::default();
        n.accumulate(2.0, 0.1, 0.5, Some(&[1.0, 2.0, 3.0]));
        assert_eq!(n.mass_simple, 2.0);
        assert!(close(n.mass_minus_am[0], 2.0 - 0.1 - 0.1));
        assert!(close(n.mass2_minus_am[2], 4.0 - 0.1 - 0.3));
    }

    #[test]
    fn total_mass_matches_volume_times_density() {
        let global = GlobalMesh::uniform([2, 2, 1], 3.0, |_| Material {
            vp: 1000.0,
            vs: 500.0,
            rho: 2.0,
        });
        let mesh = &global.partition(1).unwrap()[0];
        let params = Parameters {
            delta_t: 1e-3,
            damping: Damping::new(DampingType::Rayleigh, 1.0, QualityModel::Hartzell, 1.0),
            threshold_vp_vs: 10.0,
            boundary: AbsorbingBoundary::FullSpace,
        };
        let c = Coefficients::build(mesh, &params).unwrap();
        let total: f64 = c.nodes.iter().map(|n| n.mass_simple).sum();
        assert!(close(total, 4.0 * 27.0 * 2.0));
        assert!(c.nodes.iter().all(|n| n.mass_minus_am[0] < n.mass_simple));
    }

    #[test]
    fn critical_step_is_the_group_minimum() {
        let global = GlobalMesh::uniform([4, 1, 1], 10.0, |x| Material {
            vp: 1000.0 + x[0],
            vs: 500.0,
            rho: 2000.0,
        });
        let meshes = global.partition(2).unwrap();
        let d = Damping::new(DampingType::Rayleigh, 1.0, QualityModel::Hartzell, 1.0);
        let reports = local::run(2, |comm| {
            time_step_report(&comm, &meshes[comm.rank()], &d, true).unwrap()
        });
        for r in &reports {
            assert!(close(r.critical_delta_t, 10.0 / 1035.0));
            assert_eq!(r.minimum_edge, 10.0);
            let s = r.statistics.unwrap();
            assert_eq!(s.vs, (500.0, 500.0));
            assert!(close(s.zeta.0, 1.0 / 50.0));
        }
        assert_eq!(reports[0], reports[1]);
    }
}
