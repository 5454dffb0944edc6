//! Closed-form small-matrix helpers.
//!
//! The solver's normal-equations matrix is 3x3 and the smoother's
//! innovation covariance is 3x3; everything here is adjugate/characteristic-
//! polynomial arithmetic, no decomposition libraries.

pub type Mat3 = [[f64; 3]; 3];
pub type Vec3 = [f64; 3];

pub fn mat3_vec(m: &Mat3, v: &Vec3) -> Vec3 {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

pub fn mat3_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    out
}

pub fn mat3_det(m: &Mat3) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Inverse via the adjugate. Returns `None` when the determinant is
/// numerically zero relative to the matrix scale.
pub fn mat3_inv(m: &Mat3) -> Option<Mat3> {
    let det = mat3_det(m);
    let scale = m
        .iter()
        .flatten()
        .fold(0.0f64, |acc, &v| acc.max(v.abs()));
    if det.abs() <= 1e-300 || det.abs() < 1e-14 * scale * scale * scale {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            // Cofactor of (j, i) for the transpose
            let r0 = (j + 1) % 3;
            let r1 = (j + 2) % 3;
            let c0 = (i + 1) % 3;
            let c1 = (i + 2) % 3;
            out[i][j] = (m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0]) * inv_det;
        }
    }
    Some(out)
}

/// Solve `m x = b` for a 3x3 system.
pub fn mat3_solve(m: &Mat3, b: &Vec3) -> Option<Vec3> {
    mat3_inv(m).map(|inv| mat3_vec(&inv, b))
}

/// Eigenvalues of a symmetric 3x3 matrix, descending.
///
/// Trigonometric solution of the characteristic cubic (Smith's algorithm).
pub fn mat3_eigvals_sym(m: &Mat3) -> [f64; 3] {
    let p1 = m[0][1] * m[0][1] + m[0][2] * m[0][2] + m[1][2] * m[1][2];
    let q = (m[0][0] + m[1][1] + m[2][2]) / 3.0;

    if p1 == 0.0 {
        // Already diagonal
        let mut eig = [m[0][0], m[1][1], m[2][2]];
        eig.sort_by(|a, b| b.total_cmp(a));
        return eig;
    }

    let p2 = (m[0][0] - q).powi(2) + (m[1][1] - q).powi(2) + (m[2][2] - q).powi(2) + 2.0 * p1;
    let p = (p2 / 6.0).sqrt();

    let mut b = *m;
    for (i, row) in b.iter_mut().enumerate() {
        row[i] -= q;
        for cell in row.iter_mut() {
            *cell /= p;
        }
    }
    let r = (mat3_det(&b) / 2.0).clamp(-1.0, 1.0);
    let phi = r.acos() / 3.0;

    let e1 = q + 2.0 * p * phi.cos();
    let e3 = q + 2.0 * p * (phi + 2.0 * std::f64::consts::PI / 3.0).cos();
    let e2 = 3.0 * q - e1 - e3;
    [e1, e2, e3]
}

/// Eigenvalues of a symmetric 2x2 matrix, descending.
pub fn mat2_eigvals_sym(a: f64, b: f64, d: f64) -> [f64; 2] {
    let tr = a + d;
    let det = a * d - b * b;
    let disc = (tr * tr / 4.0 - det).max(0.0).sqrt();
    [tr / 2.0 + disc, tr / 2.0 - disc]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
