//! Coupling states and the trajectory graph fed to the encoder.
//!
//! A [`HolographicState`] is stored as contiguous node and edge arrays; the
//! "graph" is the ordered sequence of coupling states with one beta vector per
//! adjacent pair.

use serde::{Deserialize, Serialize};

use crate::error::{SurrogateError, SurrogateResult};

/// Separation in ln k below which a finite-difference edge is set to zero.
const MIN_SCALE_SEPARATION: f64 = 1e-12;

/// Number of features per node: λ, γ, μ, k.
pub const NODE_FEATURES: usize = 4;

/// Number of features per edge: β_λ, β_γ, β_μ.
pub const EDGE_FEATURES: usize = 3;

/// A point on an RG trajectory: three couplings at an energy scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CouplingState {
    /// Quartic-like coupling λ
    pub lambda: f64,
    /// Gauge-like coupling γ
    pub gamma: f64,
    /// Mass-like coupling μ
    pub mu: f64,
    /// Energy scale k
    pub scale: f64,
}

impl CouplingState {
    /// Create a coupling state.
    pub const fn new(lambda: f64, gamma: f64, mu: f64, scale: f64) -> Self {
        Self {
            lambda,
            gamma,
            mu,
            scale,
        }
    }

    /// Create a coupling state from a coupling triple.
    pub const fn from_couplings(couplings: [f64; 3], scale: f64) -> Self {
        Self::new(couplings[0], couplings[1], couplings[2], scale)
    }

    /// The (λ, γ, μ) triple.
    pub const fn couplings(&self) -> [f64; 3] {
        [self.lambda, self.gamma, self.mu]
    }

    /// Euclidean distance to another state in coupling space.
    pub fn distance_to(&self, other: &Self) -> f64 {
        let a = self.couplings();
        let b = other.couplings();
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Squared norm of the couplings.
    pub fn norm_squared(&self) -> f64 {
        self.couplings().iter().map(|c| c * c).sum()
    }

    /// Network input features (λ, γ, μ, k).
    pub fn features(&self) -> [f32; NODE_FEATURES] {
        [
            self.lambda as f32,
            self.gamma as f32,
            self.mu as f32,
            self.scale as f32,
        ]
    }

    /// Whether every component is finite.
    pub fn is_finite(&self) -> bool {
        self.couplings().iter().all(|c| c.is_finite()) && self.scale.is_finite()
    }
}

/// Ordered coupling states plus beta-derivative edges.
///
/// Deserialization runs the same checks as [`HolographicState::with_edges`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHolographicState")]
pub struct HolographicState {
    nodes: Vec<CouplingState>,
    edges: Vec<[f64; 3]>,
}

/// Unchecked wire form of a [`HolographicState`].
#[derive(Deserialize)]
struct RawHolographicState {
    nodes: Vec<CouplingState>,
    edges: Vec<[f64; 3]>,
}

impl TryFrom<RawHolographicState> for HolographicState {
    type Error = SurrogateError;

    fn try_from(raw: RawHolographicState) -> SurrogateResult<Self> {
        Self::with_edges(raw.nodes, raw.edges)
    }
}

impl HolographicState {
    /// Trajectory holding a single state.
    pub fn single(state: CouplingState) -> Self {
        Self {
            nodes: vec![state],
            edges: Vec::new(),
        }
    }

    /// Build from states, deriving edges by finite differences in ln k.
    pub fn from_states(nodes: Vec<CouplingState>) -> SurrogateResult<Self> {
        validate_nodes(&nodes)?;
        let edges = nodes
            .windows(2)
            .map(|pair| finite_difference_beta(&pair[0], &pair[1]))
            .collect();
        Ok(Self { nodes, edges })
    }

    /// Build from states and explicit beta vectors.
    pub fn with_edges(nodes: Vec<CouplingState>, edges: Vec<[f64; 3]>) -> SurrogateResult<Self> {
        validate_nodes(&nodes)?;
        if edges.len() + 1 != nodes.len() {
            return Err(SurrogateError::data(format!(
                "{} nodes need {} edges, got {}",
                nodes.len(),
                nodes.len() - 1,
                edges.len()
            )));
        }
        Ok(Self { nodes, edges })
    }

    /// Append an RG step together with the beta vector that produced it.
    pub fn push(&mut self, state: CouplingState, beta: [f64; 3]) -> SurrogateResult<()> {
        let last = self.current();
        let direction = (last.scale - self.nodes[0].scale).signum();
        let step = state.scale - last.scale;
        let ordered = if self.nodes.len() == 1 {
            step != 0.0
        } else {
            step.signum() == direction && step != 0.0
        };
        if !ordered || !state.scale.is_finite() {
            return Err(SurrogateError::data(format!(
                "scale {} breaks the ordering after {}",
                state.scale, last.scale
            )));
        }
        self.nodes.push(state);
        self.edges.push(beta);
        Ok(())
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a trajectory holds at least one node.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The nodes in flow order.
    pub fn nodes(&self) -> &[CouplingState] {
        &self.nodes
    }

    /// The edges; `edges()[i]` joins node i and node i + 1.
    pub fn edges(&self) -> &[[f64; 3]] {
        &self.edges
    }

    /// The first state.
    pub fn initial(&self) -> &CouplingState {
        &self.nodes[0]
    }

    /// The most recent state.
    pub fn current(&self) -> &CouplingState {
        &self.nodes[self.nodes.len() - 1]
    }

    /// The first `n` nodes (at least one) with their edges.
    pub fn prefix(&self, n: usize) -> Self {
        let n = n.clamp(1, self.nodes.len());
        Self {
            nodes: self.nodes[..n].to_vec(),
            edges: self.edges[..n - 1].to_vec(),
        }
    }

    /// Whether the last step moved every coupling by less than `tolerance`.
    pub fn check_fixed_point(&self, tolerance: f64) -> bool {
        if self.nodes.len() < 2 {
            return false;
        }
        let last = self.nodes[self.nodes.len() - 1].couplings();
        let prev = self.nodes[self.nodes.len() - 2].couplings();
        last.iter()
            .zip(prev.iter())
            .all(|(a, b)| (a - b).abs() < tolerance)
    }

    /// Effective action of the trajectory.
    ///
    /// At a fixed point this is the squared coupling norm of the terminal
    /// state, otherwise the mean squared norm along the trajectory.
    pub fn compute_action(&self, tolerance: f64) -> f64 {
        if self.check_fixed_point(tolerance) {
            return self.current().norm_squared();
        }
        self.nodes.iter().map(CouplingState::norm_squared).sum::<f64>() / self.nodes.len() as f64
    }

    /// Node features as a flat row-major (N, 4) array.
    pub fn node_features(&self) -> Vec<f32> {
        self.nodes.iter().flat_map(|n| n.features()).collect()
    }

    /// Edge features aligned to nodes as a flat (N, 3) array.
    ///
    /// Node i carries the edge arriving from node i - 1; node 0 gets zeros.
    pub fn edge_features(&self) -> Vec<f32> {
        std::iter::once([0.0f32; EDGE_FEATURES])
            .chain(
                self.edges
                    .iter()
                    .map(|e| [e[0] as f32, e[1] as f32, e[2] as f32]),
            )
            .flatten()
            .collect()
    }
}

fn validate_nodes(nodes: &[CouplingState]) -> SurrogateResult<()> {
    if nodes.is_empty() {
        return Err(SurrogateError::data("trajectory needs at least one state"));
    }
    if let Some(bad) = nodes.iter().position(|n| !n.is_finite()) {
        return Err(SurrogateError::data(format!("state {bad} is not finite")));
    }
    if nodes.len() > 1 {
        let increasing = nodes.windows(2).all(|w| w[1].scale > w[0].scale);
        let decreasing = nodes.windows(2).all(|w| w[1].scale < w[0].scale);
        if !increasing && !decreasing {
            return Err(SurrogateError::data(
                "scales within a trajectory must be strictly ordered",
            ));
        }
    }
    Ok(())
}

fn finite_difference_beta(from: &CouplingState, to: &CouplingState) -> [f64; 3] {
    if from.scale <= 0.0 || to.scale <= 0.0 {
        return [0.0; 3];
    }
    let dt = to.scale.ln() - from.scale.ln();
    if dt.abs() < MIN_SCALE_SEPARATION {
        return [0.0; 3];
    }
    let a = from.couplings();
    let b = to.couplings();
    [(b[0] - a[0]) / dt, (b[1] - a[1]) / dt, (b[2] - a[2]) / dt]
}
