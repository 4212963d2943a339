//! Small dense linear systems
//!
//! Normal equations in this crate have at most a dozen unknowns, so plain
//! Gaussian elimination with partial pivoting is enough.

/// Solve A·x = b in place (A is n×n, row-major)
///
/// # Returns
/// The solution, or `None` if A is numerically singular
pub fn solve(a: &[f64], b: &[f64], n: usize) -> Option<Vec<f64>> {
    debug_assert_eq!(a.len(), n * n);
    debug_assert_eq!(b.len(), n);

    let mut m = a.to_vec();
    let mut x = b.to_vec();

    let scale = m.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if !scale.is_finite() || scale == 0.0 {
        return None;
    }
    let tiny = scale * 1e-14;

    for col in 0..n {
        // Partial pivot
        let mut pivot = col;
        for row in col + 1..n {
            if m[row * n + col].abs() > m[pivot * n + col].abs() {
                pivot = row;
            }
        }
        if m[pivot * n + col].abs() <= tiny {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                m.swap(col * n + k, pivot * n + k);
            }
            x.swap(col, pivot);
        }

        let diag = m[col * n + col];
        for row in col + 1..n {
            let factor = m[row * n + col] / diag;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                m[row * n + k] -= factor * m[col * n + k];
            }
            x[row] -= factor * x[col];
        }
    }

    // Back substitution
    for col in (0..n).rev() {
        let mut sum = x[col];
        for k in col + 1..n {
            sum -= m[col * n + k] * x[k];
        }
        x[col] = sum / m[col * n + col];
    }

    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_identity() {
        let a = [1.0, 0.0, 0.0, 1.0];
        let x = solve(&a, &[3.0, -2.0], 2).unwrap();
        assert_eq!(x, vec![3.0, -2.0]);
    }

    #[test]
    fn test_solve_needs_pivot() {
        // First pivot is zero
        let a = [0.0, 2.0, 1.0, 1.0, 0.0, 3.0, 2.0, 1.0, 0.0];
        let expected = [1.0, 2.0, 3.0];
        let b: Vec<f64> = (0..3)
            .map(|r| (0..3).map(|c| a[r * 3 + c] * expected[c]).sum())
            .collect();
        let x = solve(&a, &b, 3).unwrap();
        for i in 0..3 {
            assert!((x[i] - expected[i]).abs() < 1e-12, "x[{}] = {}", i, x[i]);
        }
    }

    #[test]
    fn test_solve_singular() {
        let a = [1.0, 2.0, 2.0, 4.0];
        assert!(solve(&a, &[1.0, 2.0], 2).is_none());
        assert!(solve(&[0.0; 4], &[1.0, 2.0], 2).is_none());
    }
}
