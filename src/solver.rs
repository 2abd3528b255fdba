//! General bound- and equality-constrained minimization.
//!
//! Augmented Lagrangian outer loop over the equality constraints; each
//! subproblem keeps only the box bounds and is solved by projected gradient
//! descent with Barzilai–Borwein steps and Armijo back-tracking.

use crate::error::{PortfolioError, PortfolioResult};
use tracing::debug;

type ScalarFn<'a> = Box<dyn Fn(&[f64]) -> f64 + 'a>;
type GradientFn<'a> = Box<dyn Fn(&[f64], &mut [f64]) + 'a>;

const ARMIJO_C: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 60;

/// Iteration and tolerance limits for [`ConstrainedProblem::minimize`].
#[derive(Clone, Debug)]
pub struct SolverOptions {
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    /// Largest accepted |h(x)| over all equality constraints.
    pub constraint_tolerance: f64,
    /// Largest accepted projected-gradient component of the Lagrangian.
    pub optimality_tolerance: f64,
    pub initial_penalty: f64,
    pub penalty_growth: f64,
    pub max_penalty: f64,
    /// Relative step for central finite differences.
    pub finite_difference_step: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_outer_iterations: 60,
            max_inner_iterations: 5_000,
            constraint_tolerance: 1e-9,
            optimality_tolerance: 1e-6,
            initial_penalty: 10.0,
            penalty_growth: 10.0,
            max_penalty: 1e10,
            finite_difference_step: 1e-6,
        }
    }
}

/// An equality constraint `h(x) = 0`.
pub struct EqualityConstraint<'a> {
    value: ScalarFn<'a>,
    gradient: Option<GradientFn<'a>>,
}

impl<'a> EqualityConstraint<'a> {
    pub fn new(value: impl Fn(&[f64]) -> f64 + 'a) -> Self {
        Self {
            value: Box::new(value),
            gradient: None,
        }
    }

    pub fn with_gradient(mut self, gradient: impl Fn(&[f64], &mut [f64]) + 'a) -> Self {
        self.gradient = Some(Box::new(gradient));
        self
    }

    /// `a·x = b`, stored divided by `‖a‖` so every linear constraint is on the same scale.
    pub fn linear(coefficients: Vec<f64>, rhs: f64) -> Self {
        let norm = coefficients.iter().map(|c| c * c).sum::<f64>().sqrt().max(f64::MIN_POSITIVE);
        let unit: Vec<f64> = coefficients.iter().map(|c| c / norm).collect();
        let scaled_rhs = rhs / norm;
        let grad = unit.clone();
        Self::new(move |x: &[f64]| dot(&unit, x) - scaled_rhs).with_gradient(move |_x: &[f64], g: &mut [f64]| {
            g.copy_from_slice(&grad);
        })
    }
}

/// Minimize `f(x)` subject to `lower ≤ x ≤ upper` and `h_j(x) = 0`.
pub struct ConstrainedProblem<'a> {
    objective: ScalarFn<'a>,
    gradient: Option<GradientFn<'a>>,
    equalities: Vec<EqualityConstraint<'a>>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

/// Converged point of a [`ConstrainedProblem`].
#[derive(Clone, Debug)]
pub struct Solution {
    pub x: Vec<f64>,
    pub objective: f64,
    pub iterations: usize,
    pub violation: f64,
    pub stationarity: f64,
}

struct InnerOutcome {
    iterations: usize,
    stationarity: f64,
}

impl<'a> ConstrainedProblem<'a> {
    pub fn new(objective: impl Fn(&[f64]) -> f64 + 'a, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        Self {
            objective: Box::new(objective),
            gradient: None,
            equalities: Vec::new(),
            lower,
            upper,
        }
    }

    pub fn with_gradient(mut self, gradient: impl Fn(&[f64], &mut [f64]) + 'a) -> Self {
        self.gradient = Some(Box::new(gradient));
        self
    }

    pub fn subject_to(mut self, constraint: EqualityConstraint<'a>) -> Self {
        self.equalities.push(constraint);
        self
    }

    pub fn dimension(&self) -> usize {
        self.lower.len()
    }

    /// Runs the solver from `initial` (clamped into the box first).
    ///
    /// Returns `ConvergenceFailed` when the iteration budget runs out before
    /// both the constraint and optimality tolerances hold; the last iterate is
    /// not returned in that case.
    pub fn minimize(&self, initial: &[f64], options: &SolverOptions) -> PortfolioResult<Solution> {
        let n = self.dimension();
        if self.upper.len() != n {
            return Err(PortfolioError::DimensionMismatch { expected: n, actual: self.upper.len() });
        }
        if initial.len() != n {
            return Err(PortfolioError::DimensionMismatch { expected: n, actual: initial.len() });
        }
        if self
            .lower
            .iter()
            .zip(self.upper.iter())
            .any(|(l, u)| !l.is_finite() || !u.is_finite() || l > u)
        {
            return Err(PortfolioError::InvalidInput("bounds must be finite with lower <= upper".into()));
        }

        let mut x: Vec<f64> = initial.to_vec();
        self.project(&mut x);

        let m = self.equalities.len();
        let mut lambda = vec![0.0; m];
        let mut rho = options.initial_penalty;
        let mut iterations = 0;
        let mut prev_violation = f64::INFINITY;
        let mut violation = f64::INFINITY;
        let mut stationarity = f64::INFINITY;

        for outer in 0..options.max_outer_iterations {
            let inner = self.minimize_subproblem(&mut x, &lambda, rho, options);
            iterations += inner.iterations;
            stationarity = inner.stationarity;

            let h = self.constraint_values(&x);
            violation = h.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));

            let objective = (self.objective)(&x);
            if !objective.is_finite() || x.iter().any(|v| !v.is_finite()) {
                return Err(PortfolioError::ConvergenceFailed { iterations, violation, stationarity });
            }

            for (l, hj) in lambda.iter_mut().zip(h.iter()) {
                *l += rho * hj;
            }

            if violation <= options.constraint_tolerance && stationarity <= options.optimality_tolerance {
                debug!(
                    "Solver converged: outer={}, iterations={}, violation={:.2e}, stationarity={:.2e}",
                    outer + 1,
                    iterations,
                    violation,
                    stationarity
                );
                return Ok(Solution { x, objective, iterations, violation, stationarity });
            }

            // Once feasible, roundoff-level violations must not keep inflating the penalty.
            if violation > options.constraint_tolerance && violation > 0.25 * prev_violation {
                rho = (rho * options.penalty_growth).min(options.max_penalty);
            }
            prev_violation = violation;
        }

        Err(PortfolioError::ConvergenceFailed { iterations, violation, stationarity })
    }

    fn project(&self, x: &mut [f64]) {
        for ((v, l), u) in x.iter_mut().zip(self.lower.iter()).zip(self.upper.iter()) {
            *v = v.clamp(*l, *u);
        }
    }

    fn constraint_values(&self, x: &[f64]) -> Vec<f64> {
        self.equalities.iter().map(|c| (c.value)(x)).collect()
    }

    fn objective_gradient(&self, x: &[f64], out: &mut [f64], step: f64) {
        match &self.gradient {
            Some(g) => g(x, out),
            None => central_difference(&*self.objective, x, out, step),
        }
    }

    fn augmented_value(&self, x: &[f64], lambda: &[f64], rho: f64) -> f64 {
        let mut value = (self.objective)(x);
        for (c, l) in self.equalities.iter().zip(lambda.iter()) {
            let h = (c.value)(x);
            value += l * h + 0.5 * rho * h * h;
        }
        value
    }

    fn augmented_gradient(&self, x: &[f64], lambda: &[f64], rho: f64, step: f64, out: &mut [f64]) {
        self.objective_gradient(x, out, step);
        let mut cg = vec![0.0; x.len()];
        for (c, l) in self.equalities.iter().zip(lambda.iter()) {
            let h = (c.value)(x);
            match &c.gradient {
                Some(g) => g(x, &mut cg),
                None => central_difference(&*c.value, x, &mut cg, step),
            }
            let coef = l + rho * h;
            for (o, gi) in out.iter_mut().zip(cg.iter()) {
                *o += coef * gi;
            }
        }
    }

    /// ‖P(x − g) − x‖∞, zero exactly at a stationary point of the box problem.
    fn projected_gradient_norm(&self, x: &[f64], g: &[f64]) -> f64 {
        x.iter()
            .zip(g.iter())
            .zip(self.lower.iter().zip(self.upper.iter()))
            .map(|((xi, gi), (l, u))| ((xi - gi).clamp(*l, *u) - xi).abs())
            .fold(0.0, f64::max)
    }

    fn minimize_subproblem(&self, x: &mut Vec<f64>, lambda: &[f64], rho: f64, options: &SolverOptions) -> InnerOutcome {
        let n = x.len();
        let fd = options.finite_difference_step;
        let mut g = vec![0.0; n];
        let mut fx = self.augmented_value(x, lambda, rho);
        self.augmented_gradient(x, lambda, rho, fd, &mut g);
        let mut step = 1.0;

        let mut trial = vec![0.0; n];
        let mut g_trial = vec![0.0; n];

        for k in 0..options.max_inner_iterations {
            let pg = self.projected_gradient_norm(x, &g);
            if pg <= options.optimality_tolerance {
                return InnerOutcome { iterations: k, stationarity: pg };
            }

            let mut t = step;
            let mut accepted: Option<f64> = None;
            for _ in 0..MAX_BACKTRACKS {
                for i in 0..n {
                    trial[i] = x[i] - t * g[i];
                }
                self.project(&mut trial);
                let gd: f64 = (0..n).map(|i| g[i] * (trial[i] - x[i])).sum();
                if gd >= 0.0 {
                    break;
                }
                let f_trial = self.augmented_value(&trial, lambda, rho);
                if f_trial.is_finite() && f_trial <= fx + ARMIJO_C * gd {
                    accepted = Some(f_trial);
                    break;
                }
                t *= 0.5;
            }

            let Some(f_trial) = accepted else {
                return InnerOutcome { iterations: k, stationarity: pg };
            };

            self.augmented_gradient(&trial, lambda, rho, fd, &mut g_trial);

            let mut ss = 0.0;
            let mut sy = 0.0;
            for i in 0..n {
                let s = trial[i] - x[i];
                let y = g_trial[i] - g[i];
                ss += s * s;
                sy += s * y;
            }
            step = if sy > 0.0 { (ss / sy).clamp(1e-12, 1e12) } else { (2.0 * t).min(1e12) };

            std::mem::swap(x, &mut trial);
            std::mem::swap(&mut g, &mut g_trial);
            fx = f_trial;
        }

        InnerOutcome {
            iterations: options.max_inner_iterations,
            stationarity: self.projected_gradient_norm(x, &g),
        }
    }
}

fn central_difference(f: &dyn Fn(&[f64]) -> f64, x: &[f64], out: &mut [f64], step: f64) {
    let mut probe = x.to_vec();
    for i in 0..x.len() {
        let h = step * x[i].abs().max(1.0);
        probe[i] = x[i] + h;
        let up = f(&probe);
        probe[i] = x[i] - h;
        let down = f(&probe);
        probe[i] = x[i];
        out[i] = (up - down) / (2.0 * h);
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_projection_onto_active_bound() {
        // min (x-1)^2 + (y-2)^2  s.t. x + y = 1, 0 <= x,y <= 1  →  (0, 1)
        let problem = ConstrainedProblem::new(
            |x: &[f64]| (x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2),
            vec![0.0, 0.0],
            vec![1.0, 1.0],
        )
        .with_gradient(|x: &[f64], g: &mut [f64]| {
            g[0] = 2.0 * (x[0] - 1.0);
            g[1] = 2.0 * (x[1] - 2.0);
        })
        .subject_to(EqualityConstraint::linear(vec![1.0, 1.0], 1.0));

        let sol = problem.minimize(&[0.5, 0.5], &SolverOptions::default()).unwrap();
        assert_abs_diff_eq!(sol.x[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sol.x[1], 1.0, epsilon = 1e-6);
        assert!(sol.violation <= 1e-9);
    }

    #[test]
    fn test_interior_solution_with_finite_differences() {
        // min x^2 + 2y^2 + 3z^2  s.t. x + y + z = 1  →  w ∝ (1, 1/2, 1/3)
        let problem = ConstrainedProblem::new(
            |x: &[f64]| x[0] * x[0] + 2.0 * x[1] * x[1] + 3.0 * x[2] * x[2],
            vec![0.0; 3],
            vec![1.0; 3],
        )
        .subject_to(EqualityConstraint::new(|x: &[f64]| x.iter().sum::<f64>() - 1.0));

        let sol = problem.minimize(&[1.0 / 3.0; 3], &SolverOptions::default()).unwrap();
        let total = 1.0 + 0.5 + 1.0 / 3.0;
        assert_abs_diff_eq!(sol.x[0], 1.0 / total, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.x[1], 0.5 / total, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.x[2], (1.0 / 3.0) / total, epsilon = 1e-5);
    }

    #[test]
    fn test_bounds_only() {
        let problem = ConstrainedProblem::new(
            |x: &[f64]| (x[0] + 3.0).powi(2) + (x[1] - 0.25).powi(2),
            vec![0.0, 0.0],
            vec![1.0, 1.0],
        );
        let sol = problem.minimize(&[0.9, 0.9], &SolverOptions::default()).unwrap();
        assert_abs_diff_eq!(sol.x[0], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(sol.x[1], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_infeasible_constraint_fails() {
        let problem = ConstrainedProblem::new(|x: &[f64]| x[0] * x[0] + x[1] * x[1], vec![0.0, 0.0], vec![1.0, 1.0])
            .subject_to(EqualityConstraint::linear(vec![1.0, 1.0], 3.0));
        let options = SolverOptions {
            max_outer_iterations: 15,
            ..SolverOptions::default()
        };
        assert!(matches!(
            problem.minimize(&[0.5, 0.5], &options),
            Err(PortfolioError::ConvergenceFailed { .. })
        ));
    }

    #[test]
    fn test_penalty_stops_growing_once_feasible() {
        // Feasible start with a long outer budget: after the constraints hold,
        // extra outer rounds must not inflate the penalty and stall the solve.
        let problem = ConstrainedProblem::new(
            |x: &[f64]| 0.04 * x[0] * x[0] + 0.09 * x[1] * x[1] + 0.01 * x[2] * x[2],
            vec![0.0; 3],
            vec![1.0; 3],
        )
        .with_gradient(|x: &[f64], g: &mut [f64]| {
            g[0] = 0.08 * x[0];
            g[1] = 0.18 * x[1];
            g[2] = 0.02 * x[2];
        })
        .subject_to(EqualityConstraint::linear(vec![1.0; 3], 1.0))
        .subject_to(EqualityConstraint::linear(vec![0.05, 0.10, 0.15], 0.11));

        let options = SolverOptions {
            max_outer_iterations: 200,
            ..SolverOptions::default()
        };
        let sol = problem.minimize(&[0.2, 0.4, 0.4], &options).unwrap();
        assert!(sol.violation <= options.constraint_tolerance);
        assert!(sol.stationarity <= options.optimality_tolerance);
        assert_abs_diff_eq!(sol.x.iter().sum::<f64>(), 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(0.05 * sol.x[0] + 0.10 * sol.x[1] + 0.15 * sol.x[2], 0.11, epsilon = 1e-8);
    }

    #[test]
    fn test_dimension_mismatch() {
        let problem = ConstrainedProblem::new(|x: &[f64]| x[0], vec![0.0, 0.0], vec![1.0, 1.0]);
        assert!(matches!(
            problem.minimize(&[0.5], &SolverOptions::default()),
            Err(PortfolioError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_linear_constraint_is_scaled() {
        let c = EqualityConstraint::linear(vec![3.0, 4.0], 5.0);
        assert_abs_diff_eq!((c.value)(&[1.0, 0.5]), (3.0 + 2.0 - 5.0) / 5.0, epsilon = 1e-15);
        let mut g = vec![0.0; 2];
        (c.gradient.as_ref().unwrap())(&[0.0, 0.0], &mut g);
        assert_abs_diff_eq!(g[0], 0.6, epsilon = 1e-15);
        assert_abs_diff_eq!(g[1], 0.8, epsilon = 1e-15);
    }
}
