//! TDOA position solver — weighted nonlinear least squares.
//!
//! The unknown transmission time is eliminated by differencing every
//! arrival against a reference receiver (the one with the smallest timing
//! variance), leaving M-1 hyperbolic equations in the transmitter
//! position. Levenberg-Marquardt iterates on the ECEF position; the
//! normal-equations matrix is 3x3 and inverted in closed form.
//!
//! An accompanying Mode S altitude reply adds an ellipsoidal-height
//! residual; without one, 3-receiver groups are underdetermined and
//! rejected up front.

use std::time::Instant;

use crate::config::SolverParams;
use crate::geo::{ecef_to_geodetic, enu_basis, geodetic_to_ecef, Ecef, Geodetic, SPEED_OF_LIGHT};
use crate::linalg::{mat2_eigvals_sym, mat3_eigvals_sym, mat3_inv, mat3_solve, Mat3, Vec3};
use crate::types::{Icao, MlatError, ReceiverId, Result};

/// Timing variances below this floor are clamped [s^2].
const VARIANCE_FLOOR: f64 = 1e-16;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// One receiver's contribution to a solve.
#[derive(Debug, Clone)]
pub struct SolverInput {
    pub receiver: ReceiverId,
    /// Antenna position, ECEF [m].
    pub position: Ecef,
    /// Arrival time in the canonical timebase [s].
    pub t: f64,
    /// Timing variance: receiver noise plus clock-translation variance [s^2].
    pub variance: f64,
    /// Un-wrapped hardware tick, echoed into the output record.
    pub tick: u64,
}

/// Per-receiver residual against the converged solution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReceiverResidual {
    pub receiver: ReceiverId,
    pub tick: u64,
    pub residual_s: f64,
}

/// An accepted position fix.
#[derive(Debug, Clone)]
pub struct Fix {
    pub icao: Icao,
    pub ecef: Ecef,
    pub geodetic: Geodetic,
    /// ECEF position covariance [m^2].
    pub covariance: Mat3,
    pub chi2_dof: f64,
    /// Transmission time in the canonical timebase [s].
    pub t0: f64,
    pub receivers: Vec<ReceiverResidual>,
    pub iterations: u32,
}

impl Fix {
    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }
}

// ---------------------------------------------------------------------------
// Solve
// ---------------------------------------------------------------------------

/// Solve one closed group for the transmitter position.
pub fn solve(
    icao: Icao,
    inputs: &[SolverInput],
    altitude_m: Option<f64>,
    initial: Option<Ecef>,
    params: &SolverParams,
) -> Result<Fix> {
    let started = Instant::now();
    let m = inputs.len();
    if m < 3 {
        return Err(MlatError::PoorGeometry(format!("only {m} receivers")));
    }

    let n_eq = (m - 1) + usize::from(altitude_m.is_some());
    if n_eq < 3 {
        return Err(MlatError::PoorGeometry(
            "3 receivers need an altitude constraint".into(),
        ));
    }

    // Reference receiver: smallest timing variance
    let ref_idx = inputs
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.variance.total_cmp(&b.variance))
        .map(|(i, _)| i)
        .expect("inputs non-empty");
    let p_ref = inputs[ref_idx].position;
    let t_ref = inputs[ref_idx].t;
    let var_ref = inputs[ref_idx].variance;

    check_collinearity(inputs, ref_idx, params)?;

    let others: Vec<&SolverInput> = inputs
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != ref_idx)
        .map(|(_, input)| input)
        .collect();
    let weights: Vec<f64> = others
        .iter()
        .map(|input| 1.0 / (input.variance + var_ref).max(VARIANCE_FLOOR))
        .collect();
    let w_alt = altitude_m.map(|_| 1.0 / params.altitude_var_m2);

    // Initial guess: tracker prediction, else receiver centroid on the
    // ellipsoid at the constrained altitude.
    let mut x = initial.unwrap_or_else(|| {
        let mut c = Ecef::default();
        for input in inputs {
            c = c + input.position;
        }
        let c = c.scaled(1.0 / m as f64);
        let mut g = ecef_to_geodetic(&c);
        g.alt_m = altitude_m.unwrap_or(0.0);
        geodetic_to_ecef(&g)
    });

    check_dop(&x, &others, p_ref, altitude_m.is_some(), params)?;

    // Levenberg-Marquardt on the TDOA (+ altitude) residuals
    let mut lambda = params.lambda0;
    let mut cost = weighted_cost(&x, &others, &weights, p_ref, t_ref, altitude_m, w_alt);
    let mut converged = false;
    let mut iterations = 0;

    for _ in 0..params.max_iterations {
        if started.elapsed() > params.wall_budget {
            return Err(MlatError::NotConverged { iterations });
        }
        iterations += 1;

        let (n_mat, g_vec) =
            normal_equations(&x, &others, &weights, p_ref, t_ref, altitude_m, w_alt);

        // Marquardt scaling of the diagonal
        let mut damped = n_mat;
        for i in 0..3 {
            damped[i][i] += lambda * n_mat[i][i].max(1e-30);
        }

        let Some(step) = mat3_solve(&damped, &g_vec) else {
            lambda *= 10.0;
            continue;
        };

        let x_new = x + Ecef::new(step[0], step[1], step[2]);
        let cost_new = weighted_cost(&x_new, &others, &weights, p_ref, t_ref, altitude_m, w_alt);

        if cost_new <= cost {
            x = x_new;
            cost = cost_new;
            lambda = (lambda / 10.0).max(1e-12);
            let step_norm = (step[0] * step[0] + step[1] * step[1] + step[2] * step[2]).sqrt();
            if step_norm < params.step_tolerance_m {
                converged = true;
                break;
            }
        } else {
            lambda *= 10.0;
        }
    }

    if !converged {
        return Err(MlatError::NotConverged { iterations });
    }

    let geodetic = ecef_to_geodetic(&x);
    if altitude_m.is_none()
        && (geodetic.alt_m > params.alt_max_m || geodetic.alt_m < params.alt_min_m)
    {
        return Err(MlatError::OutOfBounds {
            altitude_m: geodetic.alt_m,
        });
    }

    // Goodness of fit
    let chi2 = cost;
    let dof = n_eq.saturating_sub(3);
    let chi2_dof = if dof > 0 { chi2 / dof as f64 } else { chi2 };
    if chi2_dof >= params.chi2_dof_max {
        return Err(MlatError::HighResidual { chi2_dof });
    }

    // Covariance from the undamped normal matrix at the solution
    let (n_mat, _) = normal_equations(&x, &others, &weights, p_ref, t_ref, altitude_m, w_alt);
    let covariance = mat3_inv(&n_mat)
        .ok_or_else(|| MlatError::PoorGeometry("singular normal matrix".into()))?;

    // Horizontal uncertainty gate: project onto the local ENU plane
    let [east, north, _up] = enu_basis(&x);
    let ce = mat_vec_sym(&covariance, &east);
    let cn = mat_vec_sym(&covariance, &north);
    let h_ee = east.dot(&ce);
    let h_en = east.dot(&cn);
    let h_nn = north.dot(&cn);
    let semi_major = mat2_eigvals_sym(h_ee, h_en, h_nn)[0].max(0.0).sqrt();
    if semi_major > params.horizontal_axis_max_m {
        return Err(MlatError::PoorGeometry(format!(
            "horizontal uncertainty {semi_major:.0} m"
        )));
    }

    // Transmission time: variance-weighted mean over all receivers
    let mut t0_num = 0.0;
    let mut t0_den = 0.0;
    for input in inputs {
        let w = 1.0 / input.variance.max(VARIANCE_FLOOR);
        t0_num += w * (input.t - x.distance(&input.position) / SPEED_OF_LIGHT);
        t0_den += w;
    }
    let t0 = t0_num / t0_den;

    let receivers = inputs
        .iter()
        .map(|input| ReceiverResidual {
            receiver: input.receiver,
            tick: input.tick,
            residual_s: input.t - t0 - x.distance(&input.position) / SPEED_OF_LIGHT,
        })
        .collect();

    Ok(Fix {
        icao,
        ecef: x,
        geodetic,
        covariance,
        chi2_dof,
        t0,
        receivers,
        iterations,
    })
}

// ---------------------------------------------------------------------------
// Geometry pruning
// ---------------------------------------------------------------------------

/// Reject receiver sets whose baselines are (near-)collinear: the two
/// largest singular values of the baseline matrix must not be more than
/// the condition limit apart. Coplanar-but-spread layouts pass; ground
/// networks always are.
fn check_collinearity(
    inputs: &[SolverInput],
    ref_idx: usize,
    params: &SolverParams,
) -> Result<()> {
    let p_ref = inputs[ref_idx].position;
    let mut a = [[0.0; 3]; 3];
    for (idx, input) in inputs.iter().enumerate() {
        if idx == ref_idx {
            continue;
        }
        // Unit baselines keep the eigenvalue spread about rank, not span
        let b = (input.position - p_ref).unit();
        let bv = [b.x, b.y, b.z];
        for i in 0..3 {
            for j in 0..3 {
                a[i][j] += bv[i] * bv[j];
            }
        }
    }
    let eig = mat3_eigvals_sym(&a);
    let l1 = eig[0].max(0.0);
    let l2 = eig[1].max(0.0);
    let cond = (l1 / l2.max(1e-300)).sqrt();
    if cond > params.condition_limit {
        return Err(MlatError::PoorGeometry("collinear receivers".into()));
    }
    Ok(())
}

/// Dilution of precision from the unit-free Jacobian at the initial guess.
fn check_dop(
    x: &Ecef,
    others: &[&SolverInput],
    p_ref: Ecef,
    has_altitude: bool,
    params: &SolverParams,
) -> Result<()> {
    let u_ref = (*x - p_ref).unit();
    let mut g = [[0.0; 3]; 3];
    for input in others {
        let u = (*x - input.position).unit();
        let row = [u.x - u_ref.x, u.y - u_ref.y, u.z - u_ref.z];
        for i in 0..3 {
            for j in 0..3 {
                g[i][j] += row[i] * row[j];
            }
        }
    }
    if has_altitude {
        let up = enu_basis(x)[2];
        let row = [up.x, up.y, up.z];
        for i in 0..3 {
            for j in 0..3 {
                g[i][j] += row[i] * row[j];
            }
        }
    }
    let inv = mat3_inv(&g)
        .ok_or_else(|| MlatError::PoorGeometry("degenerate geometry at initial guess".into()))?;
    let dop = (inv[0][0] + inv[1][1] + inv[2][2]).max(0.0).sqrt();
    if dop > params.dop_cap {
        return Err(MlatError::PoorGeometry(format!("DOP {dop:.1}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Residuals and normal equations
// ---------------------------------------------------------------------------

fn tdoa_residual(x: &Ecef, input: &SolverInput, p_ref: Ecef, t_ref: f64) -> f64 {
    let d = x.distance(&input.position).max(1.0);
    let d_ref = x.distance(&p_ref).max(1.0);
    (input.t - t_ref) - (d - d_ref) / SPEED_OF_LIGHT
}

#[allow(clippy::too_many_arguments)]
fn weighted_cost(
    x: &Ecef,
    others: &[&SolverInput],
    weights: &[f64],
    p_ref: Ecef,
    t_ref: f64,
    altitude_m: Option<f64>,
    w_alt: Option<f64>,
) -> f64 {
    let mut cost = 0.0;
    for (input, &w) in others.iter().zip(weights) {
        let r = tdoa_residual(x, input, p_ref, t_ref);
        cost += w * r * r;
    }
    if let (Some(h), Some(w)) = (altitude_m, w_alt) {
        let r = h - ecef_to_geodetic(x).alt_m;
        cost += w * r * r;
    }
    cost
}

/// Build `J' W J` and `J' W r` for the current linearization point.
#[allow(clippy::too_many_arguments)]
fn normal_equations(
    x: &Ecef,
    others: &[&SolverInput],
    weights: &[f64],
    p_ref: Ecef,
    t_ref: f64,
    altitude_m: Option<f64>,
    w_alt: Option<f64>,
) -> (Mat3, Vec3) {
    let mut n = [[0.0; 3]; 3];
    let mut g = [0.0; 3];
    let u_ref = (*x - p_ref).unit();

    for (input, &w) in others.iter().zip(weights) {
        let u = (*x - input.position).unit();
        // d model / dx for model = (d - d_ref) / c
        let row = [
            (u.x - u_ref.x) / SPEED_OF_LIGHT,
            (u.y - u_ref.y) / SPEED_OF_LIGHT,
            (u.z - u_ref.z) / SPEED_OF_LIGHT,
        ];
        let r = tdoa_residual(x, input, p_ref, t_ref);
        accumulate(&mut n, &mut g, &row, r, w);
    }

    if let (Some(h), Some(w)) = (altitude_m, w_alt) {
        let up = enu_basis(x)[2];
        let row = [up.x, up.y, up.z];
        let r = h - ecef_to_geodetic(x).alt_m;
        accumulate(&mut n, &mut g, &row, r, w);
    }
    (n, g)
}

fn accumulate(n: &mut Mat3, g: &mut Vec3, row: &[f64; 3], r: f64, w: f64) {
    for i in 0..3 {
        for j in 0..3 {
            n[i][j] += w * row[i] * row[j];
        }
        g[i] += w * row[i] * r;
    }
}

fn mat_vec_sym(m: &Mat3, v: &Ecef) -> Ecef {
    Ecef::new(
        m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
        m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
        m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
