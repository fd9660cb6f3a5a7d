//! Terminal settling velocity of a sphere in a viscous fluid.
//!
//! Two regimes are handled:
//! - Stokes (linear drag) for low Reynolds numbers, closed form
//! - Schiller-Naumann drag with a Newton plateau, solved by fixed-point iteration
//!
//! The free functions keep plain floating-point semantics: nothing is
//! validated and a non-converged iteration silently returns its last value.
//! [`SettlingProblem::solve`] is the checked entry point.
//!
//! Known limitations of the model:
//! - [`reynolds_number`] reports 0 for any non-positive velocity, so a buoyant
//!   particle (negative Stokes velocity) always takes the Stokes branch.
//! - [`terminal_velocity_iterative`] does not signal when `max_iter` is
//!   exhausted.

use log::{debug, warn};
use thiserror::Error;

use crate::config::SettlingConfig;

/// Gravitational acceleration in m/s^2.
pub const GRAVITY: f64 = 9.81;

/// Default convergence tolerance for the iterative solver.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Default iteration cap for the iterative solver.
pub const DEFAULT_MAX_ITER: usize = 200;

/// Default Stokes Reynolds number at or below which the closed form is used.
pub const DEFAULT_RE_THRESHOLD: f64 = 0.5;

/// Floor applied to the seed velocity of the iteration.
pub const VELOCITY_FLOOR: f64 = 1e-12;

/// Drag coefficient returned for a non-positive Reynolds number.
pub const ZERO_RE_DRAG: f64 = 1e9;

/// Reynolds number where the Newton plateau starts.
pub const NEWTON_RE: f64 = 1000.0;

/// Drag coefficient in the Newton regime.
pub const NEWTON_DRAG: f64 = 0.44;

/// Largest number of times a settling profile may hold.
pub const MAX_PROFILE_POINTS: usize = 10_000_000;

/// Errors from the validated settling API.
#[derive(Debug, Error, PartialEq)]
pub enum SettlingError {
    #[error("invalid input: {parameter} = {value}")]
    InvalidInput { parameter: &'static str, value: f64 },

    #[error("drag iteration did not converge after {iterations} iterations (last velocity {velocity})")]
    NonConvergence { iterations: usize, velocity: f64 },

    #[error("settling profile would need {requested} samples (max {max})")]
    TooManySamples { requested: f64, max: usize },
}

/// Result type for settling operations.
pub type Result<T> = std::result::Result<T, SettlingError>;

/// Stokes-law settling velocity `(rho_p - rho_f) * g * d^2 / (18 * mu)`.
///
/// Negative for a particle lighter than the fluid.
pub fn stokes_velocity(d: f64, rho_p: f64, rho_f: f64, mu: f64) -> f64 {
    ((rho_p - rho_f) * GRAVITY * d * d) / (18.0 * mu)
}

/// Particle Reynolds number `rho_f * v * d / mu`, or 0 when `v <= 0`.
pub fn reynolds_number(v: f64, d: f64, rho_f: f64, mu: f64) -> f64 {
    if v <= 0.0 {
        return 0.0;
    }
    rho_f * v * d / mu
}

/// Schiller-Naumann drag coefficient with a Newton plateau above Re = 1000.
///
/// # Examples
///
/// ```
/// use plankton_pipeline::settling::drag_coefficient;
///
/// assert_eq!(drag_coefficient(1000.0), 0.44);
/// assert!((drag_coefficient(1.0) - 27.6).abs() < 1e-9);
/// ```
pub fn drag_coefficient(re: f64) -> f64 {
    if re <= 0.0 {
        return ZERO_RE_DRAG;
    }
    if re < NEWTON_RE {
        return 24.0 / re * (1.0 + 0.15 * re.powf(0.687));
    }
    NEWTON_DRAG
}

/// One force-balance update: the velocity at which drag with coefficient
/// `Cd(Re(v))` balances the submerged weight.
pub fn velocity_update(v: f64, d: f64, rho_p: f64, rho_f: f64, mu: f64) -> f64 {
    let re = reynolds_number(v, d, rho_f, mu);
    let cd = drag_coefficient(re);
    ((4.0 / 3.0) * ((rho_p - rho_f) * GRAVITY * d) / (rho_f * cd)).sqrt()
}

/// Outcome of the fixed-point drag iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Iteration {
    pub velocity: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Run the drag iteration and report how it ended.
///
/// Seeds from the Stokes velocity floored at [`VELOCITY_FLOOR`] and stops when
/// `|v_new - v| <= tol * max(1, v_new)`.
pub fn iterate_drag(
    d: f64,
    rho_p: f64,
    rho_f: f64,
    mu: f64,
    tol: f64,
    max_iter: usize,
) -> Iteration {
    let mut v = stokes_velocity(d, rho_p, rho_f, mu).max(VELOCITY_FLOOR);

    for i in 0..max_iter {
        let v_new = velocity_update(v, d, rho_p, rho_f, mu);
        if (v_new - v).abs() <= tol * v_new.max(1.0) {
            return Iteration {
                velocity: v_new,
                iterations: i + 1,
                converged: true,
            };
        }
        v = v_new;
    }

    Iteration {
        velocity: v,
        iterations: max_iter,
        converged: false,
    }
}

/// Terminal velocity by fixed-point iteration on the drag coefficient.
///
/// Returns the last iterate if `max_iter` is reached without convergence.
pub fn terminal_velocity_iterative(
    d: f64,
    rho_p: f64,
    rho_f: f64,
    mu: f64,
    tol: f64,
    max_iter: usize,
) -> f64 {
    iterate_drag(d, rho_p, rho_f, mu, tol, max_iter).velocity
}

/// Terminal velocity with regime dispatch.
///
/// Returns the Stokes velocity when its Reynolds number is at most
/// `re_threshold`, otherwise iterates with the default tolerance and cap.
///
/// # Examples
///
/// ```
/// use plankton_pipeline::settling::{stokes_velocity, terminal_velocity};
///
/// // 20 um particle in seawater stays in the Stokes regime
/// let v = terminal_velocity(20e-6, 1050.0, 1025.0, 0.001, 0.5);
/// assert_eq!(v, stokes_velocity(20e-6, 1050.0, 1025.0, 0.001));
/// ```
pub fn terminal_velocity(d: f64, rho_p: f64, rho_f: f64, mu: f64, re_threshold: f64) -> f64 {
    let v_stokes = stokes_velocity(d, rho_p, rho_f, mu);
    let re_stokes = reynolds_number(v_stokes, d, rho_f, mu);
    if re_stokes <= re_threshold {
        return v_stokes;
    }
    terminal_velocity_iterative(d, rho_p, rho_f, mu, DEFAULT_TOLERANCE, DEFAULT_MAX_ITER)
}

/// Settling distance at each elapsed time, clipped to `[0, bottom - start]`.
///
/// # Examples
///
/// ```
/// use plankton_pipeline::settling::distance_over_time;
///
/// let d = distance_over_time(1.0, &[0.0, 1.0, 2.0, 10.0], 0.0, 5.0);
/// assert_eq!(d, vec![0.0, 1.0, 2.0, 5.0]);
/// ```
pub fn distance_over_time(v_term: f64, times: &[f64], start_depth: f64, bottom_depth: f64) -> Vec<f64> {
    let max_distance = (bottom_depth - start_depth).max(0.0);
    times
        .iter()
        .map(|&t| (v_term * t).clamp(0.0, max_distance))
        .collect()
}

/// Evenly spaced times `0, step, 2*step, ...` up to and including `duration`.
///
/// # Errors
///
/// Returns [`SettlingError::TooManySamples`] if the profile would hold more
/// than [`MAX_PROFILE_POINTS`] times.
pub fn elapsed_times(duration: f64, step: f64) -> Result<Vec<f64>> {
    if step <= 0.0 || duration <= 0.0 || !step.is_finite() || !duration.is_finite() {
        return Ok(vec![0.0]);
    }
    // Small slack so that a duration that is an exact multiple of step is kept.
    let intervals = (duration / step + 1e-9).floor();
    if intervals >= MAX_PROFILE_POINTS as f64 {
        return Err(SettlingError::TooManySamples {
            requested: intervals + 1.0,
            max: MAX_PROFILE_POINTS,
        });
    }
    let count = intervals as usize;
    Ok((0..=count).map(|i| i as f64 * step).collect())
}

/// Which branch of the model produced a velocity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Stokes,
    Iterative,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Regime::Stokes => write!(f, "stokes"),
            Regime::Iterative => write!(f, "iterative"),
        }
    }
}

/// A solved settling problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlingSolution {
    /// Terminal velocity in m/s (negative when rising).
    pub velocity: f64,
    pub regime: Regime,
    /// Reynolds number of the Stokes velocity, used for regime selection.
    pub stokes_reynolds: f64,
    /// Drag iterations performed (0 on the Stokes branch).
    pub iterations: usize,
    pub converged: bool,
}

/// A sphere settling through a fluid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlingProblem {
    /// Particle diameter in m.
    pub diameter: f64,
    /// Particle density in kg/m^3.
    pub particle_density: f64,
    /// Fluid density in kg/m^3.
    pub fluid_density: f64,
    /// Dynamic viscosity in Pa*s.
    pub viscosity: f64,
}

impl SettlingProblem {
    pub fn new(diameter: f64, particle_density: f64, fluid_density: f64, viscosity: f64) -> Self {
        Self {
            diameter,
            particle_density,
            fluid_density,
            viscosity,
        }
    }

    /// Reject inputs that would otherwise surface as infinities or NaN.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&'static str, f64, bool); 4] = [
            ("diameter", self.diameter, self.diameter > 0.0),
            ("viscosity", self.viscosity, self.viscosity > 0.0),
            ("fluid_density", self.fluid_density, self.fluid_density > 0.0),
            ("particle_density", self.particle_density, self.particle_density >= 0.0),
        ];

        for (parameter, value, ok) in checks {
            if !value.is_finite() || !ok {
                return Err(SettlingError::InvalidInput { parameter, value });
            }
        }
        Ok(())
    }

    /// Stokes velocity for this problem.
    pub fn stokes_velocity(&self) -> f64 {
        stokes_velocity(
            self.diameter,
            self.particle_density,
            self.fluid_density,
            self.viscosity,
        )
    }

    /// Validate and solve with the given solver settings.
    ///
    /// A non-converged iteration is logged and returned with
    /// `converged == false`, unless `config.require_convergence` is set.
    ///
    /// # Errors
    ///
    /// Returns [`SettlingError::InvalidInput`] for non-physical inputs and
    /// [`SettlingError::NonConvergence`] when convergence is required but not reached.
    pub fn solve(&self, config: &SettlingConfig) -> Result<SettlingSolution> {
        self.validate()?;

        let v_stokes = self.stokes_velocity();
        let re_stokes = reynolds_number(v_stokes, self.diameter, self.fluid_density, self.viscosity);

        if re_stokes <= config.re_threshold {
            debug!(
                "Stokes regime: Re = {:.3e} <= {}, v = {:.6e} m/s",
                re_stokes, config.re_threshold, v_stokes
            );
            return Ok(SettlingSolution {
                velocity: v_stokes,
                regime: Regime::Stokes,
                stokes_reynolds: re_stokes,
                iterations: 0,
                converged: true,
            });
        }

        let outcome = iterate_drag(
            self.diameter,
            self.particle_density,
            self.fluid_density,
            self.viscosity,
            config.tolerance,
            config.max_iter,
        );

        if !outcome.converged {
            if config.require_convergence {
                return Err(SettlingError::NonConvergence {
                    iterations: outcome.iterations,
                    velocity: outcome.velocity,
                });
            }
            warn!(
                "Drag iteration hit the cap of {} iterations; returning best-effort v = {:.6e} m/s",
                outcome.iterations, outcome.velocity
            );
        } else {
            debug!(
                "Drag iteration converged in {} iterations, v = {:.6e} m/s",
                outcome.iterations, outcome.velocity
            );
        }

        Ok(SettlingSolution {
            velocity: outcome.velocity,
            regime: Regime::Iterative,
            stokes_reynolds: re_stokes,
            iterations: outcome.iterations,
            converged: outcome.converged,
        })
    }
}
