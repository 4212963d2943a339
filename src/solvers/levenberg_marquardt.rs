//! Box-projected Levenberg–Marquardt
//!
//! Minimizes a sum of squared residuals. Problems expose their normal equations
//! (JᵀJ, Jᵀr) rather than the Jacobian itself, so large residual vectors (one
//! per voxel during registration) never have to be materialized. Damping uses
//! Marquardt's diagonal scaling, which keeps parameters of very different
//! magnitude (S0 ~ 1e3, D ~ 1e-3) on an equal footing. After every step the
//! candidate is projected onto the feasible set and accepted only if it lowers
//! the cost, so the cost sequence is monotone.
//!
//! Reference:
//! Marquardt, D.W. (1963). "An algorithm for least-squares estimation of
//! nonlinear parameters." SIAM J. Appl. Math., 11(2):431-441.

use crate::solvers::dense;

/// Normal equations at a parameter vector
pub struct NormalEquations {
    /// JᵀJ, n×n row-major
    pub jtj: Vec<f64>,
    /// Jᵀr
    pub jtr: Vec<f64>,
    /// Σr²
    pub cost: f64,
}

/// A nonlinear least-squares problem
pub trait LeastSquaresProblem {
    fn n_params(&self) -> usize;

    /// Σr² at `x`
    fn cost(&self, x: &[f64]) -> f64;

    /// Normal equations at `x`; `None` if they cannot be formed
    fn normal_equations(&self, x: &[f64]) -> Option<NormalEquations>;

    /// Lower and upper bounds at `x`, if the problem is constrained
    ///
    /// Bounds may depend on `x` (e.g. one parameter bounding another).
    fn bounds(&self, _x: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
        None
    }

    /// Map `x` onto the feasible set
    fn project(&self, _x: &mut [f64]) {}
}

/// Parameters free to move: not pinned at a bound the gradient pushes against
fn free_parameters<P: LeastSquaresProblem>(problem: &P, x: &[f64], jtr: &[f64]) -> Vec<usize> {
    let n = x.len();
    match problem.bounds(x) {
        None => (0..n).collect(),
        Some((lower, upper)) => (0..n)
            .filter(|&i| {
                // Descent direction is -jtr
                let at_lower = x[i] <= lower[i] && jtr[i] > 0.0;
                let at_upper = x[i] >= upper[i] && jtr[i] < 0.0;
                !(at_lower || at_upper)
            })
            .collect(),
    }
}

/// Solver options
#[derive(Clone, Debug, PartialEq)]
pub struct LmOptions {
    /// Maximum number of outer (Jacobian) iterations
    pub max_iter: usize,
    /// Relative cost reduction below which the fit has converged
    pub ftol: f64,
    /// Relative step size below which the fit has converged
    pub xtol: f64,
    /// Absolute cost at or below which the fit has converged
    pub cost_floor: f64,
    /// Initial damping
    pub lambda_init: f64,
    /// Damping increases tried per iteration before giving up on a step
    pub max_damping_steps: usize,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iter: 10,
            ftol: 1e-10,
            xtol: 1e-8,
            cost_floor: 1e-24,
            lambda_init: 1e-3,
            max_damping_steps: 12,
        }
    }
}

/// Why the iteration stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LmStatus {
    Converged,
    /// Iteration budget exhausted before a convergence test was met
    MaxIterations,
    /// Damped normal equations could not be solved or produced non-finite values
    Singular,
}

#[derive(Clone, Debug)]
pub struct LmResult {
    pub x: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub status: LmStatus,
}

impl LmResult {
    pub fn converged(&self) -> bool {
        self.status == LmStatus::Converged
    }
}

/// Run Levenberg–Marquardt from `x0`
///
/// The starting point is projected first; the returned cost never exceeds the
/// cost of the projected starting point.
pub fn levenberg_marquardt<P: LeastSquaresProblem>(
    problem: &P,
    x0: &[f64],
    options: &LmOptions,
) -> LmResult {
    let n = problem.n_params();
    let mut x = x0.to_vec();
    problem.project(&mut x);
    let mut cost = problem.cost(&x);

    if !cost.is_finite() {
        return LmResult { x, cost, iterations: 0, status: LmStatus::Singular };
    }
    if cost <= options.cost_floor {
        return LmResult { x, cost, iterations: 0, status: LmStatus::Converged };
    }

    let mut lambda = options.lambda_init;

    for iter in 0..options.max_iter {
        let ne = match problem.normal_equations(&x) {
            Some(ne) => ne,
            None => return LmResult { x, cost, iterations: iter, status: LmStatus::Singular },
        };

        let free = free_parameters(problem, &x, &ne.jtr);
        if free.is_empty() {
            return LmResult { x, cost, iterations: iter, status: LmStatus::Converged };
        }
        let m = free.len();

        let diag_max = (0..n).fold(0.0f64, |acc, i| acc.max(ne.jtj[i * n + i]));
        let diag_floor = diag_max * 1e-12 + f64::MIN_POSITIVE;
        let rhs: Vec<f64> = free.iter().map(|&i| -ne.jtr[i]).collect();

        let mut accepted: Option<(Vec<f64>, f64)> = None;
        let mut solved_any = false;
        for _ in 0..options.max_damping_steps {
            // Reduced, damped system over the free parameters
            let mut a = vec![0.0; m * m];
            for (r, &i) in free.iter().enumerate() {
                for (c, &j) in free.iter().enumerate() {
                    a[r * m + c] = ne.jtj[i * n + j];
                }
                a[r * m + r] += lambda * ne.jtj[i * n + i].max(diag_floor);
            }

            if let Some(step) = dense::solve(&a, &rhs, m) {
                solved_any = true;
                let mut candidate = x.clone();
                for (r, &i) in free.iter().enumerate() {
                    candidate[i] += step[r];
                }
                problem.project(&mut candidate);
                let c = problem.cost(&candidate);
                if c.is_finite() && c < cost {
                    accepted = Some((candidate, c));
                    lambda = (lambda * 0.1).max(1e-15);
                    break;
                }
            }
            lambda *= 10.0;
        }

        let (candidate, new_cost) = match accepted {
            Some(a) => a,
            None if solved_any => {
                // No damping level lowers the cost: stationary within precision
                return LmResult { x, cost, iterations: iter + 1, status: LmStatus::Converged };
            }
            None => return LmResult { x, cost, iterations: iter + 1, status: LmStatus::Singular },
        };

        let step_norm = x.iter().zip(&candidate).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt();
        let x_norm = candidate.iter().map(|v| v * v).sum::<f64>().sqrt();
        let reduction = cost - new_cost;

        x = candidate;
        cost = new_cost;

        if cost <= options.cost_floor
            || reduction <= options.ftol * (cost + reduction)
            || step_norm <= options.xtol * (x_norm + options.xtol)
        {
            return LmResult { x, cost, iterations: iter + 1, status: LmStatus::Converged };
        }
    }

    LmResult { x, cost, iterations: options.max_iter, status: LmStatus::MaxIterations }
}
