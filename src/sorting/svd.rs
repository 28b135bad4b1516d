//! Singular value decomposition after Golub & Reinsch, in the formulation of
//! Numerical Recipes `svdcmp`: Householder reduction to bidiagonal form, then
//! implicit-shift QR sweeps on the bidiagonal.
//!
//! `A (m x n) = U * diag(w) * V^T`. Singular values come back unsorted, in the
//! column order the sweeps leave them, and are non-negative.

use ndarray::Array2;

use crate::sorting::error::PcaError;

/// QR sweeps allowed per singular value.
pub const MAX_ITERATIONS: usize = 30;

#[derive(Clone, Debug)]
pub struct Svd {
    /// Left singular vectors, `m x n`.
    pub u: Array2<f64>,
    /// Singular values, length `n`.
    pub w: Vec<f64>,
    /// Right singular vectors as columns, `n x n` (V, not V transposed).
    pub v: Array2<f64>,
}

/// `sqrt(a^2 + b^2)` without destructive underflow or overflow.
fn pythag(a: f64, b: f64) -> f64 {
    let absa = a.abs();
    let absb = b.abs();
    if absa > absb {
        absa * (1.0 + (absb / absa).powi(2)).sqrt()
    } else if absb == 0.0 {
        0.0
    } else {
        absb * (1.0 + (absa / absb).powi(2)).sqrt()
    }
}

/// Magnitude of `a` with the sign of `b` (zero counts as negative).
fn sign(a: f64, b: f64) -> f64 {
    if b > 0.0 {
        a.abs()
    } else {
        -a.abs()
    }
}

/// Decomposes `a`, consuming it (its storage becomes `U`).
pub fn svdcmp(mut a: Array2<f64>) -> Result<Svd, PcaError> {
    let (m, n) = a.dim();
    let mut w = vec![0.0; n];
    let mut v = Array2::<f64>::zeros((n, n));
    if n == 0 {
        return Ok(Svd { u: a, w, v });
    }
    let mut rv1 = vec![0.0; n];

    // Householder reduction to bidiagonal form.
    let mut g = 0.0;
    let mut scale = 0.0;
    let mut anorm: f64 = 0.0;
    let mut l = 0;
    for i in 0..n {
        l = i + 1;
        rv1[i] = scale * g;
        g = 0.0;
        scale = 0.0;
        if i < m {
            for k in i..m {
                scale += a[[k, i]].abs();
            }
            if scale != 0.0 {
                let mut s = 0.0;
                for k in i..m {
                    a[[k, i]] /= scale;
                    s += a[[k, i]] * a[[k, i]];
                }
                let f = a[[i, i]];
                g = -sign(s.sqrt(), f);
                let h = f * g - s;
                a[[i, i]] = f - g;
                for j in l..n {
                    let mut s = 0.0;
                    for k in i..m {
                        s += a[[k, i]] * a[[k, j]];
                    }
                    let f = s / h;
                    for k in i..m {
                        a[[k, j]] += f * a[[k, i]];
                    }
                }
                for k in i..m {
                    a[[k, i]] *= scale;
                }
            }
        }
        w[i] = scale * g;
        g = 0.0;
        scale = 0.0;
        if i < m && i != n - 1 {
            for k in l..n {
                scale += a[[i, k]].abs();
            }
            if scale != 0.0 {
                let mut s = 0.0;
                for k in l..n {
                    a[[i, k]] /= scale;
                    s += a[[i, k]] * a[[i, k]];
                }
                let f = a[[i, l]];
                g = -sign(s.sqrt(), f);
                let h = f * g - s;
                a[[i, l]] = f - g;
                for k in l..n {
                    rv1[k] = a[[i, k]] / h;
                }
                for j in l..m {
                    let mut s = 0.0;
                    for k in l..n {
                        s += a[[j, k]] * a[[i, k]];
                    }
                    for k in l..n {
                        a[[j, k]] += s * rv1[k];
                    }
                }
                for k in l..n {
                    a[[i, k]] *= scale;
                }
            }
        }
        anorm = anorm.max(w[i].abs() + rv1[i].abs());
    }

    // Accumulate right-hand transformations.
    for i in (0..n).rev() {
        if i < n - 1 {
            if g != 0.0 {
                // Double division avoids possible underflow.
                for j in l..n {
                    v[[j, i]] = (a[[i, j]] / a[[i, l]]) / g;
                }
                for j in l..n {
                    let mut s = 0.0;
                    for k in l..n {
                        s += a[[i, k]] * v[[k, j]];
                    }
                    for k in l..n {
                        v[[k, j]] += s * v[[k, i]];
                    }
                }
            }
            for j in l..n {
                v[[i, j]] = 0.0;
                v[[j, i]] = 0.0;
            }
        }
        v[[i, i]] = 1.0;
        g = rv1[i];
        l = i;
    }

    // Accumulate left-hand transformations.
    for i in (0..m.min(n)).rev() {
        let l = i + 1;
        let mut g = w[i];
        for j in l..n {
            a[[i, j]] = 0.0;
        }
        if g != 0.0 {
            g = 1.0 / g;
            for j in l..n {
                let mut s = 0.0;
                for k in l..m {
                    s += a[[k, i]] * a[[k, j]];
                }
                let f = (s / a[[i, i]]) * g;
                for k in i..m {
                    a[[k, j]] += f * a[[k, i]];
                }
            }
            for j in i..m {
                a[[j, i]] *= g;
            }
        } else {
            for j in i..m {
                a[[j, i]] = 0.0;
            }
        }
        a[[i, i]] += 1.0;
    }

    // Diagonalize the bidiagonal form.
    for k in (0..n).rev() {
        let mut iterations = 0;
        loop {
            let (l, cancel) = split_point(k, &rv1, &w, anorm);
            if cancel {
                // w[l - 1] is negligible: cancel rv1[l].
                let nm = l - 1;
                let mut c = 0.0;
                let mut s = 1.0;
                for i in l..=k {
                    let f = s * rv1[i];
                    rv1[i] *= c;
                    if f.abs() + anorm == anorm {
                        break;
                    }
                    let g = w[i];
                    let h = pythag(f, g);
                    w[i] = h;
                    let h = 1.0 / h;
                    c = g * h;
                    s = -f * h;
                    for j in 0..m {
                        let y = a[[j, nm]];
                        let z = a[[j, i]];
                        a[[j, nm]] = y * c + z * s;
                        a[[j, i]] = z * c - y * s;
                    }
                }
            }

            let z = w[k];
            if l == k {
                // Converged; keep singular values non-negative.
                if z < 0.0 {
                    w[k] = -z;
                    for j in 0..n {
                        v[[j, k]] = -v[[j, k]];
                    }
                }
                break;
            }
            if iterations == MAX_ITERATIONS {
                return Err(PcaError::NoConvergence {
                    index: k,
                    iterations,
                });
            }
            iterations += 1;

            // Shift from the bottom 2x2 minor.
            let mut x = w[l];
            let nm = k - 1;
            let mut y = w[nm];
            let mut g = rv1[nm];
            let mut h = rv1[k];
            let mut f = ((y - z) * (y + z) + (g - h) * (g + h)) / (2.0 * h * y);
            g = pythag(f, 1.0);
            f = ((x - z) * (x + z) + h * ((y / (f + sign(g, f))) - h)) / x;

            // Next QR transformation.
            let mut c = 1.0;
            let mut s = 1.0;
            for j in l..=nm {
                let i = j + 1;
                g = rv1[i];
                y = w[i];
                h = s * g;
                g *= c;
                let mut z = pythag(f, h);
                rv1[j] = z;
                c = f / z;
                s = h / z;
                f = x * c + g * s;
                g = g * c - x * s;
                h = y * s;
                y *= c;
                for jj in 0..n {
                    let x = v[[jj, j]];
                    let z = v[[jj, i]];
                    v[[jj, j]] = x * c + z * s;
                    v[[jj, i]] = z * c - x * s;
                }
                z = pythag(f, h);
                w[j] = z;
                // Rotation can be arbitrary if z is zero.
                if z != 0.0 {
                    z = 1.0 / z;
                    c = f * z;
                    s = h * z;
                }
                f = c * g + s * y;
                x = c * y - s * g;
                for jj in 0..m {
                    let y = a[[jj, j]];
                    let z = a[[jj, i]];
                    a[[jj, j]] = y * c + z * s;
                    a[[jj, i]] = z * c - y * s;
                }
            }
            rv1[l] = 0.0;
            rv1[k] = f;
            w[k] = x;
        }
    }

    Ok(Svd { u: a, w, v })
}

/// Walks up from `k` looking for a negligible super-diagonal entry. Returns
/// the split index and whether `w[l - 1]` has to be cancelled first.
fn split_point(k: usize, rv1: &[f64], w: &[f64], anorm: f64) -> (usize, bool) {
    let mut l = k;
    loop {
        // rv1[0] is always zero.
        if l == 0 || rv1[l].abs() + anorm == anorm {
            return (l, false);
        }
        if w[l - 1].abs() + anorm == anorm {
            return (l, true);
        }
        l -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn reconstruct(svd: &Svd) -> Array2<f64> {
        let n = svd.w.len();
        let mut sigma = Array2::<f64>::zeros((n, n));
        for (i, w) in svd.w.iter().enumerate() {
            sigma[[i, i]] = *w;
        }
        svd.u.dot(&sigma).dot(&svd.v.t())
    }

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{x} != {y}");
        }
    }

    #[test]
    fn reconstructs_symmetric_matrix() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 1.0]];
        let svd = svdcmp(a.clone()).unwrap();
        assert_close(&reconstruct(&svd), &a, 1e-9);
        assert!(svd.w.iter().all(|w| *w >= 0.0));
    }

    #[test]
    fn reconstructs_rectangular_matrix() {
        let a = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [-1.0, 0.5]];
        let svd = svdcmp(a.clone()).unwrap();
        assert_eq!(svd.u.dim(), (4, 2));
        assert_close(&reconstruct(&svd), &a, 1e-9);
    }

    #[test]
    fn right_vectors_are_orthonormal() {
        let a = array![[2.0, 1.0, 0.0], [1.0, 2.0, 1.0], [0.0, 1.0, 2.0]];
        let svd = svdcmp(a).unwrap();
        let vtv = svd.v.t().dot(&svd.v);
        assert_close(&vtv, &Array2::eye(3), 1e-9);
    }

    #[test]
    fn eigenvalues_of_covariance_like_matrix() {
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let svd = svdcmp(a).unwrap();
        let mut w = svd.w.clone();
        w.sort_by(|x, y| y.total_cmp(x));
        assert!((w[0] - 3.0).abs() < 1e-12);
        assert!((w[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_matrix_gives_identity_vectors() {
        let svd = svdcmp(Array2::zeros((4, 4))).unwrap();
        assert!(svd.w.iter().all(|w| *w == 0.0));
        assert_close(&svd.v, &Array2::eye(4), 1e-15);
    }

    #[test]
    fn pythag_is_stable() {
        assert_eq!(pythag(3.0, 4.0), 5.0);
        assert_eq!(pythag(0.0, 0.0), 0.0);
        assert!((pythag(1e200, 1e200) - 1e200 * 2f64.sqrt()).abs() / 1e200 < 1e-12);
    }
}
