//! Core types for the implicit crowd simulator.
//!
//! Each step, every enabled agent's next velocity is obtained jointly by
//! minimizing a single differentiable energy over all active agents. The
//! energy couples an inertial term and a goal-velocity term with pairwise
//! anticipatory potentials written in a time-to-collision formulation; the
//! minimizer is a limited-memory quasi-Newton solver with an Armijo
//! backtracking line search. Neighbor pairs are discovered through the
//! bin lattice in `crowdsim-index`.

use std::ops::{Add, AddAssign, Mul, Neg, Sub};
use std::sync::atomic::{AtomicBool, Ordering};

use crowdsim_index::{BinLattice, IndexError, ProxyId};
use rand::{SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel returned by the energy when a candidate step is infeasible.
/// Kept finite so the backtracking arithmetic stays well behaved.
pub const INFEASIBLE_ENERGY: f64 = 9e9;

/// Seed used when the configuration does not override it.
pub const DEFAULT_RNG_SEED: u64 = 23;

/// Regularizer keeping the closest-approach time differentiable as the
/// relative velocity vanishes.
const SPEED_REGULARIZER: f64 = 1e-4;

/// Exponential filter coefficient for orientation smoothing.
const ORIENTATION_SMOOTHING: f64 = 0.4;

/// Below this directional derivative the quasi-Newton direction is treated
/// as a loss of descent and the solver restarts from steepest descent.
const DESCENT_TOLERANCE: f64 = 1e-4;

/// Armijo sufficient-decrease parameter.
const SUFFICIENT_DECREASE: f64 = 1e-4;

/// Scale of the smallest admissible line-search step.
const MIN_STEP_SCALE: f64 = 1e-3;

/// Errors produced while configuring or building a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Indicates a configuration or agent parameter outside its domain.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Spatial index construction failure.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Plain 2D vector used throughout the simulation core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y
    }

    #[must_use]
    pub fn norm_sq(self) -> f64 {
        self.dot(self)
    }

    #[must_use]
    pub fn norm(self) -> f64 {
        self.norm_sq().sqrt()
    }

    /// Unit vector in the same direction, or zero for a (near-)zero input.
    #[must_use]
    pub fn normalized(self) -> Self {
        let norm_sq = self.norm_sq();
        if norm_sq > f64::EPSILON * f64::EPSILON {
            self * (1.0 / norm_sq.sqrt())
        } else {
            Self::ZERO
        }
    }
}

impl Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Vec2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

impl Mul<f64> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

/// Static configuration for a crowd simulation.
///
/// The energy weights follow the anticipatory power-law model; the solver
/// knobs bound the per-step minimization. All fields can be overridden via
/// the key=value parameter file handled by the application shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Scale of the inverse time-to-collision potential.
    pub k: f64,
    /// Exponent of the inverse time-to-collision potential.
    pub p: f64,
    /// Time horizon of the exponential cutoff, in seconds.
    pub t0: f64,
    /// Relaxation weight pulling velocities toward the goal velocity.
    pub ksi: f64,
    /// Margin beyond which exact time-to-collision is replaced by a linear
    /// extrapolation in the tangential speed.
    pub eps: f64,
    /// Scale of the short-range swept-distance repulsion.
    pub eta: f64,
    /// Radius of the neighborhood queried around each active agent.
    pub neighbor_dist: f64,
    /// Outer iteration budget of the per-step minimization.
    pub newton_iter: usize,
    /// Number of curvature pairs retained by the quasi-Newton solver.
    pub lbfgs_window: usize,
    /// Stagnation threshold on the infinity norm of the solution update.
    pub eps_x: f64,
    /// Simulation time step, in seconds.
    pub dt: f64,
    /// Maximum number of simulated steps.
    pub max_steps: u64,
    /// Seed for the engine-owned generator.
    pub rng_seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            k: 1.5,
            p: 2.0,
            t0: 3.0,
            ksi: 2.0,
            eps: 0.2,
            eta: 0.01,
            neighbor_dist: 10.0,
            newton_iter: 100,
            lbfgs_window: 5,
            eps_x: 1e-5,
            dt: 0.2,
            max_steps: 1000,
            rng_seed: DEFAULT_RNG_SEED,
        }
    }
}

impl SimulationConfig {
    /// Checks the domain constraints that would otherwise poison the solve.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if !(self.dt > 0.0) {
            return Err(SimulationError::InvalidConfig("dt must be positive"));
        }
        if !(self.neighbor_dist > 0.0) {
            return Err(SimulationError::InvalidConfig(
                "neighbor_dist must be positive",
            ));
        }
        if self.newton_iter == 0 {
            return Err(SimulationError::InvalidConfig(
                "newton_iter must be positive",
            ));
        }
        if self.lbfgs_window == 0 {
            return Err(SimulationError::InvalidConfig(
                "lbfgs_window must be positive",
            ));
        }
        if !(self.eps_x > 0.0) {
            return Err(SimulationError::InvalidConfig("eps_x must be positive"));
        }
        Ok(())
    }
}

/// Initial parameters for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentParams {
    /// Opaque group label, echoed into trajectory exports.
    pub group: u32,
    pub position: Vec2,
    pub goal: Vec2,
    pub velocity: Vec2,
    /// Speed the agent prefers to travel at toward its goal.
    pub pref_speed: f64,
    /// Disc radius of the agent.
    pub radius: f64,
    /// Entering this disc around the goal disables the agent.
    pub goal_radius: f64,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            group: 0,
            position: Vec2::ZERO,
            goal: Vec2::ZERO,
            velocity: Vec2::ZERO,
            pref_speed: 1.3,
            radius: 0.5,
            goal_radius: 1.0,
        }
    }
}

/// A simulated agent: kinematic state, goal, and its trajectory log.
#[derive(Debug)]
pub struct Agent {
    id: usize,
    group: u32,
    position: Vec2,
    velocity: Vec2,
    goal: Vec2,
    v_pref: Vec2,
    orientation: Vec2,
    radius: f64,
    pref_speed: f64,
    goal_radius_sq: f64,
    active_id: Option<usize>,
    enabled: bool,
    proxy: Option<ProxyId>,
    path: Vec<Vec2>,
    orientations: Vec<Vec2>,
}

impl Agent {
    fn new(id: usize, params: AgentParams, index: &mut BinLattice) -> Self {
        let orientation = (params.goal - params.position).normalized();
        let proxy = index.insert(id);
        index.update(proxy, params.position.x, params.position.y);
        Self {
            id,
            group: params.group,
            position: params.position,
            velocity: params.velocity,
            goal: params.goal,
            v_pref: Vec2::ZERO,
            orientation,
            radius: params.radius,
            pref_speed: params.pref_speed,
            goal_radius_sq: params.goal_radius * params.goal_radius,
            active_id: None,
            enabled: true,
            proxy: Some(proxy),
            path: vec![params.position],
            orientations: vec![orientation],
        }
    }

    /// Computes the preferred velocity for this step, or disables the agent
    /// if it has entered its goal disc. A disabled agent releases its proxy
    /// and logs no further trajectory points.
    fn plan(&mut self, dt: f64, index: &mut BinLattice) {
        let to_goal = self.goal - self.position;
        let dist_sq = to_goal.norm_sq();
        if dist_sq < self.goal_radius_sq {
            if let Some(proxy) = self.proxy.take() {
                index.remove(proxy);
            }
            self.enabled = false;
            return;
        }
        // Slow down to land exactly on the goal when a full-speed step
        // would overshoot it.
        self.v_pref = if self.pref_speed * dt * self.pref_speed * dt > dist_sq {
            to_goal * (1.0 / dt)
        } else {
            to_goal * (self.pref_speed / dist_sq.sqrt())
        };
    }

    /// Advances the position by the solved velocity, smooths the orientation,
    /// rebins the proxy, and appends to the trajectory log.
    fn advect(&mut self, dt: f64, index: &mut BinLattice) {
        self.position += self.velocity * dt;
        if self.velocity != Vec2::ZERO {
            self.orientation +=
                (self.velocity.normalized() - self.orientation) * ORIENTATION_SMOOTHING;
        }
        if let Some(proxy) = self.proxy {
            index.update(proxy, self.position.x, self.position.y);
        }
        self.path.push(self.position);
        self.orientations.push(self.orientation);
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn group(&self) -> u32 {
        self.group
    }

    #[must_use]
    pub fn position(&self) -> Vec2 {
        self.position
    }

    #[must_use]
    pub fn velocity(&self) -> Vec2 {
        self.velocity
    }

    #[must_use]
    pub fn goal(&self) -> Vec2 {
        self.goal
    }

    #[must_use]
    pub fn preferred_velocity(&self) -> Vec2 {
        self.v_pref
    }

    #[must_use]
    pub fn orientation(&self) -> Vec2 {
        self.orientation
    }

    #[must_use]
    pub fn radius(&self) -> f64 {
        self.radius
    }

    #[must_use]
    pub fn pref_speed(&self) -> f64 {
        self.pref_speed
    }

    /// Dense rank among the currently active agents, if enabled.
    #[must_use]
    pub fn active_id(&self) -> Option<usize> {
        self.active_id
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Positions logged once per step, starting from the initial state.
    #[must_use]
    pub fn path(&self) -> &[Vec2] {
        &self.path
    }

    /// Orientations logged in lockstep with [`path`](Self::path).
    #[must_use]
    pub fn orientations(&self) -> &[Vec2] {
        &self.orientations
    }
}

/// Weights of the pairwise potentials and quadratic terms.
#[derive(Debug, Clone, Copy)]
pub struct EnergyModel {
    pub k: f64,
    pub p: f64,
    pub t0: f64,
    pub eps: f64,
    pub eta: f64,
    pub ksi: f64,
    pub dt: f64,
}

impl EnergyModel {
    #[must_use]
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            k: config.k,
            p: config.p,
            t0: config.t0,
            eps: config.eps,
            eta: config.eta,
            ksi: config.ksi,
            dt: config.dt,
        }
    }

    /// Swept minimum-distance penalty for one pair over the coming step.
    ///
    /// Positions are current, velocities are candidates, `radius` is the sum
    /// of the two disc radii. Returns `None` when the swept discs overlap at
    /// or before the end of the step (tunneling), which the caller must treat
    /// as an infeasible candidate. When `grad` is given, the derivative with
    /// respect to the first agent's velocity is accumulated into it, but only
    /// while the pair is approaching.
    pub fn min_distance_energy(
        &self,
        pa: Vec2,
        pb: Vec2,
        va: Vec2,
        vb: Vec2,
        radius: f64,
        grad: Option<&mut Vec2>,
    ) -> Option<f64> {
        let x = pb - pa;
        let v = va - vb;
        let speed = v.norm_sq();
        let rate = x.dot(v);
        let tti = (rate / (speed + SPEED_REGULARIZER)).clamp(0.0, self.dt);

        let dx = v.x * tti - x.x;
        let dy = v.y * tti - x.y;
        let dist_sq = dx * dx + dy * dy;
        if dist_sq <= radius * radius {
            return None;
        }

        let d = dist_sq.sqrt();
        let clearance = d - radius;
        let energy = (self.eta / clearance).min(INFEASIBLE_ENERGY);

        if let Some(grad) = grad {
            if rate > 0.0 {
                let (tti_prime_x, tti_prime_y) = if cfg!(feature = "fixed-approach-time-gradient")
                    || tti <= 0.0
                    || tti >= self.dt
                {
                    (0.0, 0.0)
                } else {
                    (
                        (x.x - 2.0 * tti * v.x) / speed,
                        (x.y - 2.0 * tti * v.y) / speed,
                    )
                };
                let scale = -self.eta / (d * clearance * clearance);
                let clearance_prime_x = dx * (tti + v.x * tti_prime_x) + dy * (v.y * tti_prime_x);
                let clearance_prime_y = dy * (tti + v.y * tti_prime_y) + dx * (v.x * tti_prime_y);
                grad.x += scale * clearance_prime_x;
                grad.y += scale * clearance_prime_y;
            }
        }

        Some(energy)
    }

    /// Anticipatory inverse time-to-collision potential for one pair.
    ///
    /// Positions must already be advanced to the predicted end of the step.
    /// Below the tangential-speed cap the exact inverse TTC of two closing
    /// discs is used; above it, a linear extrapolation keeps the potential
    /// finite for near misses. The closed-form derivative with respect to the
    /// first agent's velocity is accumulated into `grad` when given.
    pub fn inverse_ttc_energy(
        &self,
        pa: Vec2,
        pb: Vec2,
        va: Vec2,
        vb: Vec2,
        radius: f64,
        grad: Option<&mut Vec2>,
    ) -> f64 {
        let v = va - vb;
        let x_vec = pb - pa;
        let x = x_vec.norm();
        let mut xhat = x_vec;
        if x > 0.0 {
            xhat = xhat * (1.0 / x);
        }

        // Approach speed along the separation direction; diverging pairs
        // contribute nothing.
        let vp = xhat.dot(v);
        if vp <= 0.0 {
            return 0.0;
        }

        let vt_vec = v - xhat * vp;
        let vt = vt_vec.norm();

        let r_sq = radius * radius;
        let x_min_r = x * x - r_sq;
        let x_min_r_sqrt = x_min_r.sqrt();
        let margin = (1.0 - self.eps * self.eps).sqrt();
        let vt_star = margin * radius * vp / x_min_r_sqrt;

        if vt < vt_star {
            // On a collision course: exact inverse TTC.
            let discr = (r_sq * vp * vp - x_min_r * vt * vt).sqrt();
            let inv_ttc = (x * vp + discr) / x_min_r;
            if inv_ttc <= 0.0 {
                return 0.0;
            }
            let mult = self.k * inv_ttc.powf(self.p - 1.0) * (-(1.0 / inv_ttc) / self.t0).exp();
            let energy = mult * inv_ttc;
            if let Some(grad) = grad {
                let vp_vec = xhat * vp;
                let a = -x_vec + v * self.dt - xhat * (vp * self.dt);
                let b_x = (((self.dt * vp + x) * vt_vec.x) * x_min_r / x
                    - x_vec.x * self.dt * vt * vt
                    + r_sq * vp * a.x / x)
                    / discr
                    + self.dt * vp_vec.x;
                let b_y = (((self.dt * vp + x) * vt_vec.y) * x_min_r / x
                    - x_vec.y * self.dt * vt * vt
                    + r_sq * vp * a.y / x)
                    / discr
                    + self.dt * vp_vec.y;
                let falloff = self.p + 1.0 / (self.t0 * inv_ttc);
                let drive = 2.0 * self.dt * (1.0 / self.t0 + self.p * inv_ttc);
                grad.x += -mult / x_min_r * ((a.x + b_x) * falloff - drive * x_vec.x);
                grad.y += -mult / x_min_r * ((a.y + b_y) * falloff - drive * x_vec.y);
            }
            energy
        } else {
            // Near miss: linear extrapolation beyond the tangential cap.
            let inv_ttc = (x + self.eps * radius) * vp / x_min_r
                - margin / self.eps * (vt - vt_star) / x_min_r_sqrt;
            if inv_ttc <= 0.0 {
                return 0.0;
            }
            let mut mult = self.k * (-(1.0 / inv_ttc) / self.t0).exp();
            let energy = mult * inv_ttc.powf(self.p);
            if let Some(grad) = grad {
                let inv_x = 1.0 / x;
                let a = (-x_vec + v * self.dt - xhat * (vp * self.dt)) * inv_x;
                let b_x = ((self.eps * radius + x) * a.x) / x_min_r
                    + (margin
                        * ((vt_vec.x * self.dt * vp / x + vt_vec.x) / vt
                            + radius * margin / x_min_r_sqrt
                                * (a.x - self.dt * vp * x_vec.x / x_min_r)))
                        / (self.eps * x_min_r_sqrt)
                    - self.dt * x_vec.x / x_min_r
                        * (vp * (self.eps * radius + x) / x_min_r - vp / x + inv_ttc);
                let b_y = ((self.eps * radius + x) * a.y) / x_min_r
                    + (margin
                        * ((vt_vec.y * self.dt * vp / x + vt_vec.y) / vt
                            + radius * margin / x_min_r_sqrt
                                * (a.y - self.dt * vp * x_vec.y / x_min_r)))
                        / (self.eps * x_min_r_sqrt)
                    - self.dt * x_vec.y / x_min_r
                        * (vp * (self.eps * radius + x) / x_min_r - vp / x + inv_ttc);
                mult *= -inv_ttc.powf(self.p - 1.0) * (self.p + 1.0 / (self.t0 * inv_ttc));
                grad.x += mult * b_x;
                grad.y += mult * b_y;
            }
            energy
        }
    }
}

/// Energy evaluated for one candidate velocity vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub value: f64,
    /// False when some pair tunnels; `value` is then [`INFEASIBLE_ENERGY`].
    pub feasible: bool,
}

/// Objective evaluated by the quasi-Newton solver.
pub trait Objective: Sync {
    /// Number of optimization variables.
    fn dimension(&self) -> usize;

    /// Objective value at `x`; used by the line search.
    fn value(&self, x: &[f64]) -> f64;

    /// Objective value at `x`, filling `grad` with the gradient.
    fn value_and_grad(&self, x: &[f64], grad: &mut [f64]) -> f64;
}

/// One step's packed optimization state over the `N` active agents.
///
/// Coordinate-major layout: `pos`, `vel`, and `v_goal` store all x lanes
/// first and then all y lanes, so agent `i` occupies indices `(i, i + N)`.
/// `nn[i]` lists neighbor active ids with `i` itself excluded.
#[derive(Debug, Clone)]
pub struct ActiveProblem {
    model: EnergyModel,
    pos: Vec<f64>,
    vel: Vec<f64>,
    v_goal: Vec<f64>,
    radius: Vec<f64>,
    nn: Vec<Vec<usize>>,
}

impl ActiveProblem {
    #[must_use]
    pub fn new(
        model: EnergyModel,
        pos: Vec<f64>,
        vel: Vec<f64>,
        v_goal: Vec<f64>,
        radius: Vec<f64>,
        nn: Vec<Vec<usize>>,
    ) -> Self {
        let n = radius.len();
        debug_assert_eq!(pos.len(), 2 * n);
        debug_assert_eq!(vel.len(), 2 * n);
        debug_assert_eq!(v_goal.len(), 2 * n);
        debug_assert_eq!(nn.len(), n);
        debug_assert!(nn.iter().flatten().all(|&j| j < n));
        Self {
            model,
            pos,
            vel,
            v_goal,
            radius,
            nn,
        }
    }

    /// Number of active agents in the problem.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.radius.len()
    }

    /// Solution of the quadratic part alone, i.e. the minimizer when no
    /// pairwise term is active.
    #[must_use]
    pub fn unconstrained_minimizer(&self) -> Vec<f64> {
        let dt = self.model.dt;
        let ksi = self.model.ksi;
        self.vel
            .iter()
            .zip(&self.v_goal)
            .map(|(&vel, &v_goal)| (dt * vel + ksi * v_goal) / (dt + ksi))
            .collect()
    }

    /// Scalar energy of candidate velocities `v`.
    pub fn evaluate(&self, v: &[f64]) -> Evaluation {
        let n = self.active_count();
        debug_assert_eq!(v.len(), 2 * n);
        let model = self.model;

        let mut f = 0.0;
        for c in 0..2 * n {
            let dv = v[c] - self.vel[c];
            let dg = v[c] - self.v_goal[c];
            f += 0.5 * model.dt * dv * dv + 0.5 * model.ksi * dg * dg;
        }

        let tunneled = AtomicBool::new(false);
        // Each outer index owns one partial sum; the reduction below runs in
        // index order so results do not depend on worker scheduling.
        let pair_terms: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| {
                if tunneled.load(Ordering::Relaxed) {
                    return 0.0;
                }
                let pa = Vec2::new(self.pos[i], self.pos[i + n]);
                let va = Vec2::new(v[i], v[i + n]);
                let pa_new = pa + va * model.dt;
                let mut sum = 0.0;
                for &j in &self.nn[i] {
                    // Unordered pairs once.
                    if j <= i {
                        continue;
                    }
                    let pb = Vec2::new(self.pos[j], self.pos[j + n]);
                    let vb = Vec2::new(v[j], v[j + n]);
                    let radius = self.radius[i] + self.radius[j];
                    let Some(distance_energy) =
                        model.min_distance_energy(pa, pb, va, vb, radius, None)
                    else {
                        tunneled.store(true, Ordering::Relaxed);
                        return 0.0;
                    };
                    let pb_new = pb + vb * model.dt;
                    sum += distance_energy
                        + model.inverse_ttc_energy(pa_new, pb_new, va, vb, radius, None);
                }
                sum
            })
            .collect();

        if tunneled.load(Ordering::Relaxed) {
            return Evaluation {
                value: INFEASIBLE_ENERGY,
                feasible: false,
            };
        }
        f += pair_terms.iter().sum::<f64>();
        Evaluation {
            value: f,
            feasible: true,
        }
    }

    /// Scalar energy and gradient of candidate velocities `v`.
    ///
    /// Every parallel task writes only its own gradient lanes `(i, i + N)`;
    /// the contribution a pair makes to the other agent is recomputed when
    /// that agent's task runs, trading flops for lock-free accumulation.
    pub fn evaluate_with_grad(&self, v: &[f64], grad: &mut [f64]) -> Evaluation {
        let n = self.active_count();
        debug_assert_eq!(v.len(), 2 * n);
        debug_assert_eq!(grad.len(), 2 * n);
        let model = self.model;

        let mut f = 0.0;
        for c in 0..2 * n {
            let dv = v[c] - self.vel[c];
            let dg = v[c] - self.v_goal[c];
            f += 0.5 * model.dt * dv * dv + 0.5 * model.ksi * dg * dg;
            grad[c] = model.dt * dv + model.ksi * dg;
        }

        let tunneled = AtomicBool::new(false);
        let contributions: Vec<(f64, Vec2)> = (0..n)
            .into_par_iter()
            .map(|i| {
                if tunneled.load(Ordering::Relaxed) {
                    return (0.0, Vec2::ZERO);
                }
                let pa = Vec2::new(self.pos[i], self.pos[i + n]);
                let va = Vec2::new(v[i], v[i + n]);
                let pa_new = pa + va * model.dt;
                let mut sum = 0.0;
                let mut lane = Vec2::ZERO;
                for &j in &self.nn[i] {
                    let pb = Vec2::new(self.pos[j], self.pos[j + n]);
                    let vb = Vec2::new(v[j], v[j + n]);
                    let radius = self.radius[i] + self.radius[j];
                    let Some(distance_energy) =
                        model.min_distance_energy(pa, pb, va, vb, radius, Some(&mut lane))
                    else {
                        tunneled.store(true, Ordering::Relaxed);
                        return (0.0, Vec2::ZERO);
                    };
                    let pb_new = pb + vb * model.dt;
                    let ttc_energy =
                        model.inverse_ttc_energy(pa_new, pb_new, va, vb, radius, Some(&mut lane));
                    // The energy of each unordered pair is counted once even
                    // though both endpoints differentiate it.
                    if j > i {
                        sum += distance_energy + ttc_energy;
                    }
                }
                (sum, lane)
            })
            .collect();

        if tunneled.load(Ordering::Relaxed) {
            return Evaluation {
                value: INFEASIBLE_ENERGY,
                feasible: false,
            };
        }
        for (i, (sum, lane)) in contributions.iter().enumerate() {
            f += sum;
            grad[i] += lane.x;
            grad[i + n] += lane.y;
        }
        Evaluation {
            value: f,
            feasible: true,
        }
    }
}

impl Objective for ActiveProblem {
    fn dimension(&self) -> usize {
        2 * self.active_count()
    }

    fn value(&self, x: &[f64]) -> f64 {
        self.evaluate(x).value
    }

    fn value_and_grad(&self, x: &[f64], grad: &mut [f64]) -> f64 {
        self.evaluate_with_grad(x, grad).value
    }
}

/// Result of one inner minimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveOutcome {
    /// Outer iterations consumed, restarts included.
    pub iterations: usize,
    /// Objective at the starting point.
    pub initial_value: f64,
    /// Objective at the last gradient evaluation.
    pub value: f64,
}

/// Limited-memory quasi-Newton minimizer with Armijo backtracking.
#[derive(Debug, Clone, Copy)]
pub struct Lbfgs {
    /// History depth: number of retained `(s, y)` pairs.
    pub window: usize,
    /// Outer iteration budget.
    pub max_iters: usize,
    /// Stagnation threshold on the infinity norm of the solution update.
    pub eps_x: f64,
}

impl Lbfgs {
    #[must_use]
    pub fn new(window: usize, max_iters: usize, eps_x: f64) -> Self {
        Self {
            window: window.max(1),
            max_iters,
            eps_x,
        }
    }

    #[must_use]
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.lbfgs_window, config.newton_iter, config.eps_x)
    }

    /// Minimizes `objective` starting from `x`, which is updated in place.
    pub fn minimize<O: Objective + ?Sized>(&self, objective: &O, x: &mut [f64]) -> SolveOutcome {
        let dim = x.len();
        debug_assert_eq!(dim, objective.dimension());
        let window = self.window;

        let mut s = vec![vec![0.0; dim]; window];
        let mut y = vec![vec![0.0; dim]; window];
        let mut alpha = vec![0.0; window];
        let mut rho = vec![0.0; window];
        let mut grad = vec![0.0; dim];
        let mut grad_old = vec![0.0; dim];
        let mut x_old = vec![0.0; dim];
        let mut q = vec![0.0; dim];

        let mut f = objective.value_and_grad(x, &mut grad);
        let initial_value = f;
        let mut gamma = 1.0;
        let mut alpha_init = initial_step(&grad);
        let mut end = 0usize;
        let mut iterations = 0usize;
        let mut k = 0usize;
        let mut max_iter = self.max_iters;

        while k < max_iter {
            iterations += 1;
            x_old.copy_from_slice(x);
            grad_old.copy_from_slice(&grad);
            q.copy_from_slice(&grad);

            // Two-loop recursion over the stored pairs, newest to oldest and
            // back.
            let pairs = k.min(window);
            let mut j = end;
            for _ in 0..pairs {
                j = if j == 0 { window - 1 } else { j - 1 };
                rho[j] = 1.0 / dot(&s[j], &y[j]);
                alpha[j] = rho[j] * dot(&s[j], &q);
                axpy(&mut q, -alpha[j], &y[j]);
            }
            for value in q.iter_mut() {
                *value *= gamma;
            }
            for _ in 0..pairs {
                let beta = rho[j] * dot(&y[j], &q);
                axpy(&mut q, alpha[j] - beta, &s[j]);
                j = if j + 1 == window { 0 } else { j + 1 };
            }

            // A bad curvature estimate can leave q pointing uphill; fall back
            // to steepest descent and forget the history, carrying over the
            // unused iteration budget.
            if dot(&q, &grad) < DESCENT_TOLERANCE {
                q.copy_from_slice(&grad);
                max_iter -= k;
                k = 0;
                alpha_init = initial_step(&grad);
            }

            let rate = self.line_search(objective, &x_old, &q, f, &grad, alpha_init);
            for (value, direction) in x.iter_mut().zip(&q) {
                *value -= rate * direction;
            }

            let mut step_norm = 0.0f64;
            for c in 0..dim {
                let delta = x[c] - x_old[c];
                s[end][c] = delta;
                step_norm = step_norm.max(delta.abs());
            }
            if step_norm < self.eps_x {
                break;
            }

            f = objective.value_and_grad(x, &mut grad);
            for c in 0..dim {
                y[end][c] = grad[c] - grad_old[c];
            }
            gamma = dot(&s[end], &y[end]) / dot(&y[end], &y[end]);
            alpha_init = 1.0;
            end = if end + 1 == window { 0 } else { end + 1 };
            k += 1;
        }

        SolveOutcome {
            iterations,
            initial_value,
            value: f,
        }
    }

    /// Armijo backtracking along `-q` with quadratic-then-cubic interpolation.
    ///
    /// Accepts unconditionally once the step falls below the minimum
    /// admissible length, which also bounds the loop when the objective
    /// returns the infeasibility sentinel.
    fn line_search<O: Objective + ?Sized>(
        &self,
        objective: &O,
        x0: &[f64],
        q: &[f64],
        phi0: f64,
        grad: &[f64],
        alpha_init: f64,
    ) -> f64 {
        let dim = x0.len();
        let mut phi_prime = 0.0;
        for c in 0..dim {
            phi_prime -= q[c] * grad[c];
        }

        let mut largest = 0.0f64;
        for c in 0..dim {
            largest = largest.max(q[c].abs() / x0[c].abs().max(1.0));
        }
        let alpha_min = if largest > 0.0 {
            MIN_STEP_SCALE / largest
        } else {
            f64::INFINITY
        };

        let mut x = vec![0.0; dim];
        let mut alpha = alpha_init;
        let mut alpha_prev = 0.0;
        let mut phi_prev = phi0;

        loop {
            if alpha < alpha_min {
                return alpha;
            }
            for c in 0..dim {
                x[c] = x0[c] - alpha * q[c];
            }
            let phi = objective.value(&x);
            if phi < phi0 + SUFFICIENT_DECREASE * alpha * phi_prime {
                return alpha;
            }

            let alpha_next = if alpha_prev == 0.0 {
                // First failure: minimize the quadratic through
                // (phi0, phi_prime, phi(alpha)).
                -(phi_prime * alpha * alpha) / (2.0 * (phi - phi0 - phi_prime * alpha))
            } else {
                // Later failures: cubic through the last two trial points.
                let rhs1 = phi - phi0 - alpha * phi_prime;
                let rhs2 = phi_prev - phi0 - alpha_prev * phi_prime;
                let alpha_sq = alpha * alpha;
                let alpha_prev_sq = alpha_prev * alpha_prev;
                let denom = alpha - alpha_prev;
                let a = (rhs1 / alpha_sq - rhs2 / alpha_prev_sq) / denom;
                let b = (-alpha_prev * rhs1 / alpha_sq + alpha * rhs2 / alpha_prev_sq) / denom;
                let mut next = if a == 0.0 {
                    -phi_prime / (2.0 * b)
                } else {
                    let disc = b * b - 3.0 * a * phi_prime;
                    if disc < 0.0 {
                        0.5 * alpha
                    } else if b <= 0.0 {
                        (-b + disc.sqrt()) / (3.0 * a)
                    } else {
                        -phi_prime / (b + disc.sqrt())
                    }
                };
                if next > 0.5 * alpha {
                    next = 0.5 * alpha;
                }
                next
            };

            alpha_prev = alpha;
            phi_prev = phi;
            // f64::max ignores a NaN fit and keeps the floor contraction.
            alpha = alpha_next.max(0.1 * alpha);
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn axpy(out: &mut [f64], scale: f64, rhs: &[f64]) {
    for (value, r) in out.iter_mut().zip(rhs) {
        *value += scale * r;
    }
}

fn initial_step(grad: &[f64]) -> f64 {
    let norm = grad.iter().fold(0.0f64, |acc, g| acc.max(g.abs()));
    if norm > 0.0 { (1.0 / norm).min(1.0) } else { 1.0 }
}

/// Summary of one simulation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Step counter after this call.
    pub step: u64,
    /// Agents that took part in the optimization.
    pub active_agents: usize,
    /// True when every agent had already reached its goal.
    pub all_reached: bool,
    /// Inner solve summary; absent when nothing was optimized.
    pub solve: Option<SolveOutcome>,
}

/// The implicit crowd engine: owns the agents, the spatial index, and the
/// per-step optimization.
pub struct CrowdSimulation {
    config: SimulationConfig,
    model: EnergyModel,
    index: BinLattice,
    agents: Vec<Agent>,
    rng: SmallRng,
    iteration: u64,
    global_time: f64,
    reached_goals: bool,
}

impl std::fmt::Debug for CrowdSimulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrowdSimulation")
            .field("config", &self.config)
            .field("agent_count", &self.agents.len())
            .field("iteration", &self.iteration)
            .field("global_time", &self.global_time)
            .finish()
    }
}

impl CrowdSimulation {
    /// Builds an engine over the given super-region, partitioned into
    /// `div_x * div_y` bins for neighbor queries.
    pub fn new(
        config: SimulationConfig,
        origin: (f64, f64),
        size: (f64, f64),
        div_x: usize,
        div_y: usize,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let index = BinLattice::new(origin, size, div_x, div_y)?;
        let rng = SmallRng::seed_from_u64(config.rng_seed);
        let model = EnergyModel::from_config(&config);
        Ok(Self {
            config,
            model,
            index,
            agents: Vec::new(),
            rng,
            iteration: 0,
            global_time: 0.0,
            reached_goals: false,
        })
    }

    /// Inserts an agent; its id equals the insertion order.
    pub fn add_agent(&mut self, params: AgentParams) -> Result<usize, SimulationError> {
        if !(params.radius > 0.0) {
            return Err(SimulationError::InvalidConfig(
                "agent radius must be positive",
            ));
        }
        if params.pref_speed < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "agent preferred speed must be non-negative",
            ));
        }
        if params.goal_radius < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "agent goal radius must be non-negative",
            ));
        }
        let id = self.agents.len();
        self.agents.push(Agent::new(id, params, &mut self.index));
        Ok(id)
    }

    /// Advances the simulation by one step.
    ///
    /// Preferred velocities are recomputed first, disabling agents inside
    /// their goal discs. The remaining agents are packed into a dense
    /// problem, minimized from the zero candidate, written back, and
    /// advected. When every agent has reached its goal the call is a no-op
    /// that only reports convergence.
    pub fn step(&mut self) -> StepReport {
        let dt = self.config.dt;

        self.reached_goals = true;
        let mut active = 0usize;
        for agent in &mut self.agents {
            if !agent.enabled {
                continue;
            }
            agent.plan(dt, &mut self.index);
            if agent.enabled {
                self.reached_goals = false;
                active += 1;
            }
        }

        if self.reached_goals {
            return StepReport {
                step: self.iteration,
                active_agents: 0,
                all_reached: true,
                solve: None,
            };
        }

        let problem = self.pack(active);
        // The zero candidate is trivially collision-free.
        let mut v_new = vec![0.0; 2 * active];
        let solver = Lbfgs::from_config(&self.config);
        let outcome = solver.minimize(&problem, &mut v_new);

        for agent in &mut self.agents {
            if let Some(rank) = agent.active_id {
                agent.velocity = Vec2::new(v_new[rank], v_new[rank + active]);
            }
        }
        for agent in &mut self.agents {
            if agent.enabled {
                agent.advect(dt, &mut self.index);
            }
        }

        self.global_time += dt;
        self.iteration += 1;
        StepReport {
            step: self.iteration,
            active_agents: active,
            all_reached: false,
            solve: Some(outcome),
        }
    }

    /// Steps until every agent reached its goal or the step budget ran out.
    pub fn run(&mut self) {
        while !self.finished() {
            self.step();
        }
    }

    /// True when all agents reached their goals or the budget was exhausted.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.reached_goals || self.iteration >= self.config.max_steps
    }

    /// Packs the enabled agents into a dense problem, assigning each its
    /// active id and gathering its neighbor list from the index.
    fn pack(&mut self, active: usize) -> ActiveProblem {
        let n = active;
        let mut pos = vec![0.0; 2 * n];
        let mut vel = vec![0.0; 2 * n];
        let mut v_goal = vec![0.0; 2 * n];
        let mut radius = vec![0.0; n];

        let mut rank = 0usize;
        for agent in &mut self.agents {
            if agent.enabled {
                pos[rank] = agent.position.x;
                pos[rank + n] = agent.position.y;
                vel[rank] = agent.velocity.x;
                vel[rank + n] = agent.velocity.y;
                v_goal[rank] = agent.v_pref.x;
                v_goal[rank + n] = agent.v_pref.y;
                radius[rank] = agent.radius;
                agent.active_id = Some(rank);
                rank += 1;
            } else {
                agent.active_id = None;
            }
        }
        debug_assert_eq!(rank, n);

        // Active ids for every agent are assigned above before any list is
        // translated.
        let mut nn = vec![Vec::new(); n];
        let mut scratch = Vec::new();
        for agent in &self.agents {
            let Some(rank) = agent.active_id else {
                continue;
            };
            scratch.clear();
            self.index.query(
                (agent.position.x, agent.position.y),
                self.config.neighbor_dist,
                &mut scratch,
            );
            for &other in &scratch {
                if other == agent.id {
                    continue;
                }
                if let Some(other_rank) = self.agents[other].active_id {
                    nn[rank].push(other_rank);
                }
            }
        }

        ActiveProblem::new(self.model, pos, vel, v_goal, radius, nn)
    }

    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Step counter, starting at zero.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Simulated time in seconds.
    #[must_use]
    pub fn global_time(&self) -> f64 {
        self.global_time
    }

    /// True once every agent has entered its goal disc.
    #[must_use]
    pub fn all_reached(&self) -> bool {
        self.reached_goals
    }

    /// Engine-owned generator, seeded from the configuration.
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}
