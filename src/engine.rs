//! Ground-truth RG integrators.
//!
//! The surrogate only consumes integrators through [`GroundTruth`]. Two
//! reference implementations are provided: [`ResonanceEngine`], a numerical
//! Euler/RK4 integrator over pluggable beta functions, and [`LinearFlow`], a
//! linear flow with a closed-form solution used as a toy problem.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::ConvergenceFailure;
use crate::state::{CouplingState, HolographicState};

/// Step used for central-difference Jacobians.
const JACOBIAN_STEP: f64 = 1e-6;

/// Output of one ground-truth integration.
#[derive(Debug, Clone, PartialEq)]
pub struct Integration {
    /// Visited states with their beta vectors
    pub trajectory: HolographicState,
    /// Whether the flow settled at a fixed point
    pub fixed_point_reached: bool,
    /// Effective action of the trajectory
    pub action: f64,
}

/// A deterministic (given its seed) RG integrator.
pub trait GroundTruth: Send + Sync {
    /// Integrate `n_steps` of size `step_size` in ln k from `initial`.
    fn integrate(
        &self,
        initial: [f64; 3],
        n_steps: usize,
        step_size: f64,
        seed: u64,
    ) -> Result<Integration, ConvergenceFailure>;
}

/// Beta functions dc/d(ln k) of the three couplings.
pub trait BetaFunctions: Send + Sync {
    /// Evaluate β(c, k).
    fn beta(&self, couplings: [f64; 3], scale: f64) -> [f64; 3];
}

/// Weakly coupled placeholder flow: every coupling decays with mild mixing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerturbativeBetas;

impl BetaFunctions for PerturbativeBetas {
    fn beta(&self, c: [f64; 3], _scale: f64) -> [f64; 3] {
        let [lambda, gamma, mu] = c;
        [
            -0.1 * lambda * (1.0 + 0.01 * gamma),
            -0.1 * gamma * (1.0 + 0.01 * lambda),
            -0.1 * mu * (1.0 + 0.01 * lambda),
        ]
    }
}

/// Linear flow β = r ⊙ (c − c*), attractive toward the IR when r > 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearBetas {
    /// Per-coupling relaxation rates
    pub rates: [f64; 3],
    /// Fixed point c*
    pub fixed_point: [f64; 3],
}

impl BetaFunctions for LinearBetas {
    fn beta(&self, c: [f64; 3], _scale: f64) -> [f64; 3] {
        std::array::from_fn(|i| self.rates[i] * (c[i] - self.fixed_point[i]))
    }
}

/// Numerical integration scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationMethod {
    /// Forward Euler
    Euler,
    /// Classical fourth-order Runge-Kutta
    Rk4,
}

/// Settings for [`ResonanceEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scale k at the first state
    pub initial_scale: f64,
    /// Integration scheme
    pub method: IntegrationMethod,
    /// Fixed-point tolerance on per-step coupling change
    pub tolerance: f64,
    /// Magnitude beyond which a coupling counts as diverged
    pub divergence_bound: f64,
    /// Stop integrating as soon as a fixed point is detected
    pub stop_at_fixed_point: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_scale: 1.0,
            method: IntegrationMethod::Rk4,
            tolerance: 1e-6,
            divergence_bound: 1e6,
            stop_at_fixed_point: true,
        }
    }
}

/// Numerical RG integrator flowing toward the IR.
#[derive(Debug, Clone)]
pub struct ResonanceEngine<B> {
    betas: B,
    config: EngineConfig,
}

impl<B: BetaFunctions> ResonanceEngine<B> {
    /// Create an engine with default settings.
    pub fn new(betas: B) -> Self {
        Self::with_config(betas, EngineConfig::default())
    }

    /// Create an engine with explicit settings.
    pub fn with_config(betas: B, config: EngineConfig) -> Self {
        Self { betas, config }
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance the couplings by `dlnk` in ln k.
    fn advance(&self, c: [f64; 3], scale: f64, dlnk: f64) -> [f64; 3] {
        let axpy = |x: [f64; 3], a: f64, y: [f64; 3]| -> [f64; 3] {
            std::array::from_fn(|i| x[i] + a * y[i])
        };
        match self.config.method {
            IntegrationMethod::Euler => axpy(c, dlnk, self.betas.beta(c, scale)),
            IntegrationMethod::Rk4 => {
                let half_scale = scale * (0.5 * dlnk).exp();
                let k1 = self.betas.beta(c, scale);
                let k2 = self.betas.beta(axpy(c, 0.5 * dlnk, k1), half_scale);
                let k3 = self.betas.beta(axpy(c, 0.5 * dlnk, k2), half_scale);
                let k4 = self.betas.beta(axpy(c, dlnk, k3), scale * dlnk.exp());
                std::array::from_fn(|i| {
                    c[i] + dlnk / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i])
                })
            }
        }
    }

    /// Central-difference Jacobian ∂β_i/∂c_j at a state.
    pub fn flow_jacobian(&self, state: &CouplingState) -> [[f64; 3]; 3] {
        let c = state.couplings();
        let mut jacobian = [[0.0; 3]; 3];
        for j in 0..3 {
            let mut plus = c;
            let mut minus = c;
            plus[j] += JACOBIAN_STEP;
            minus[j] -= JACOBIAN_STEP;
            let bp = self.betas.beta(plus, state.scale);
            let bm = self.betas.beta(minus, state.scale);
            for i in 0..3 {
                jacobian[i][j] = (bp[i] - bm[i]) / (2.0 * JACOBIAN_STEP);
            }
        }
        jacobian
    }

    /// Whether a fixed point attracts the flow toward the IR.
    ///
    /// Linearizes dc/dt = −β with t = −ln k and applies the Routh–Hurwitz
    /// criterion to the cubic characteristic polynomial.
    pub fn is_stable(&self, fixed_point: &CouplingState) -> bool {
        let j = self.flow_jacobian(fixed_point);
        let a: [[f64; 3]; 3] = std::array::from_fn(|r| std::array::from_fn(|c| -j[r][c]));

        let trace = a[0][0] + a[1][1] + a[2][2];
        let minors = a[0][0] * a[1][1] - a[0][1] * a[1][0] + a[0][0] * a[2][2]
            - a[0][2] * a[2][0]
            + a[1][1] * a[2][2]
            - a[1][2] * a[2][1];
        let det = a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
            - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
            + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]);

        // p(s) = s^3 + c2 s^2 + c1 s + c0
        let (c2, c1, c0) = (-trace, minors, -det);
        c2 > 0.0 && c0 > 0.0 && c2 * c1 > c0
    }

    /// Integrate until a fixed point is found, if one is reached in `max_steps`.
    pub fn find_fixed_point(
        &self,
        initial: [f64; 3],
        max_steps: usize,
        step_size: f64,
    ) -> Option<CouplingState> {
        let integration = self.integrate(initial, max_steps, step_size, 0).ok()?;
        integration
            .fixed_point_reached
            .then(|| *integration.trajectory.current())
    }
}

impl<B: BetaFunctions> GroundTruth for ResonanceEngine<B> {
    fn integrate(
        &self,
        initial: [f64; 3],
        n_steps: usize,
        step_size: f64,
        _seed: u64,
    ) -> Result<Integration, ConvergenceFailure> {
        if !(step_size > 0.0) || !step_size.is_finite() {
            return Err(ConvergenceFailure::new(0, format!("invalid step size {step_size}")));
        }
        check_couplings(initial, self.config.divergence_bound, 0)?;

        let mut couplings = initial;
        let mut scale = self.config.initial_scale;
        let mut trajectory =
            HolographicState::single(CouplingState::from_couplings(couplings, scale));
        let mut fixed_point_reached = false;

        for step in 1..=n_steps {
            let beta = self.betas.beta(couplings, scale);
            let next = self.advance(couplings, scale, -step_size);
            check_couplings(next, self.config.divergence_bound, step)?;

            scale *= (-step_size).exp();
            couplings = next;
            trajectory
                .push(CouplingState::from_couplings(couplings, scale), beta)
                .map_err(|e| ConvergenceFailure::new(step, e.to_string()))?;

            if trajectory.check_fixed_point(self.config.tolerance) {
                fixed_point_reached = true;
                if self.config.stop_at_fixed_point {
                    break;
                }
            }
        }

        let action = trajectory.compute_action(self.config.tolerance);
        Ok(Integration {
            trajectory,
            fixed_point_reached,
            action,
        })
    }
}

/// Linear flow toward a fixed point, solved in closed form.
///
/// c(t) = c* + (c0 − c*)·exp(−r t) with t = −ln(k / k0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearFlow {
    /// Flow parameters
    pub betas: LinearBetas,
    /// Scale k at the first state
    pub initial_scale: f64,
    /// Distance to c* that counts as reaching the fixed point
    pub tolerance: f64,
    /// Magnitude beyond which a coupling counts as diverged
    pub divergence_bound: f64,
    /// Standard deviation of seeded observation noise (0 disables it)
    pub noise_std: f64,
}

impl LinearFlow {
    /// Noise-free flow with the given rates and fixed point.
    pub fn new(rates: [f64; 3], fixed_point: [f64; 3]) -> Self {
        Self {
            betas: LinearBetas { rates, fixed_point },
            initial_scale: 1.0,
            tolerance: 1e-3,
            divergence_bound: 1e6,
            noise_std: 0.0,
        }
    }

    /// Set the fixed-point tolerance.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Add seeded Gaussian observation noise.
    #[must_use]
    pub fn with_noise(mut self, noise_std: f64) -> Self {
        self.noise_std = noise_std;
        self
    }

    /// Exact couplings after flowing for `t` in −ln k.
    pub fn solution(&self, initial: [f64; 3], t: f64) -> [f64; 3] {
        let LinearBetas { rates, fixed_point } = self.betas;
        std::array::from_fn(|i| fixed_point[i] + (initial[i] - fixed_point[i]) * (-rates[i] * t).exp())
    }
}

impl GroundTruth for LinearFlow {
    fn integrate(
        &self,
        initial: [f64; 3],
        n_steps: usize,
        step_size: f64,
        seed: u64,
    ) -> Result<Integration, ConvergenceFailure> {
        if !(step_size > 0.0) || !step_size.is_finite() {
            return Err(ConvergenceFailure::new(0, format!("invalid step size {step_size}")));
        }
        check_couplings(initial, self.divergence_bound, 0)?;

        let mut noise = if self.noise_std > 0.0 {
            let normal = Normal::new(0.0, self.noise_std)
                .map_err(|e| ConvergenceFailure::new(0, e.to_string()))?;
            Some((normal, ChaCha8Rng::seed_from_u64(seed)))
        } else {
            None
        };

        let mut nodes = Vec::with_capacity(n_steps + 1);
        let mut edges = Vec::with_capacity(n_steps);
        for step in 0..=n_steps {
            let t = step as f64 * step_size;
            let mut couplings = self.solution(initial, t);
            if step > 0 {
                if let Some((normal, rng)) = noise.as_mut() {
                    for c in &mut couplings {
                        *c += normal.sample(rng);
                    }
                }
            }
            check_couplings(couplings, self.divergence_bound, step)?;
            let state = CouplingState::from_couplings(couplings, self.initial_scale * (-t).exp());
            if step > 0 {
                let previous: &CouplingState = &nodes[step - 1];
                edges.push(self.betas.beta(previous.couplings(), previous.scale));
            }
            nodes.push(state);
        }

        let trajectory = HolographicState::with_edges(nodes, edges)
            .map_err(|e| ConvergenceFailure::new(n_steps, e.to_string()))?;
        let fixed_point = CouplingState::from_couplings(self.betas.fixed_point, 0.0);
        let fixed_point_reached = trajectory.current().distance_to(&fixed_point) < self.tolerance;
        let action = trajectory.compute_action(self.tolerance);

        Ok(Integration {
            trajectory,
            fixed_point_reached,
            action,
        })
    }
}

fn check_couplings(c: [f64; 3], bound: f64, step: usize) -> Result<(), ConvergenceFailure> {
    if c.iter().any(|v| !v.is_finite()) {
        return Err(ConvergenceFailure::new(step, "non-finite coupling"));
    }
    if let Some(v) = c.iter().find(|v| v.abs() > bound) {
        return Err(ConvergenceFailure::new(
            step,
            format!("coupling {v} exceeds divergence bound {bound}"),
        ));
    }
    Ok(())
}
