//! Solver loops driving the subsystems of a group.
//!
//! Nonlinear solvers converge the outputs of a group, linear solvers solve with the output block
//! of its jacobian. Both only rely on the transfers of the group and on the evaluation methods of
//! its subsystems. On several processes, every process of the group runs the same loop: transfers
//! and norms are collective, subsystem evaluations only happen where a subsystem is resident.
use crate::system::{System, TransferSelection};
use crate::transfer::Mode;
use crate::vector::SystemVectors;
use eyre::eyre;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub trait NonlinearSolver: Debug {
    /// Converges the outputs of `system` given its inputs.
    fn solve(&self, system: &mut System, vectors: &mut SystemVectors) -> eyre::Result<()>;
}

pub trait LinearSolver: Debug {
    /// Solves `J d_outputs = d_residuals` (forward) or `J^T d_residuals = d_outputs` (reverse),
    /// where `J` is the jacobian of the residuals of `system` with respect to its outputs.
    fn solve(
        &self,
        system: &mut System,
        nonlinear: &mut SystemVectors,
        linear: &mut SystemVectors,
        mode: Mode,
    ) -> eyre::Result<()>;
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonlinearBlockGsSettings {
    pub max_iterations: usize,
    /// Absolute tolerance on the residual norm.
    pub atol: f64,
    /// Tolerance on the residual norm relative to the first iteration.
    pub rtol: f64,
    /// Whether reaching `max_iterations` is an error rather than a warning.
    pub err_on_non_convergence: bool,
}

impl Default for NonlinearBlockGsSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            atol: 1e-10,
            rtol: 1e-10,
            err_on_non_convergence: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearBlockGsSettings {
    pub max_iterations: usize,
    pub atol: f64,
    pub rtol: f64,
    pub err_on_non_convergence: bool,
}

impl Default for LinearBlockGsSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            atol: 1e-10,
            rtol: 1e-10,
            err_on_non_convergence: false,
        }
    }
}

/// Runs every subsystem once, in order, refreshing its inputs before it executes.
///
/// The default nonlinear solver of a group. Exact for feed-forward groups.
#[derive(Debug, Copy, Clone, Default)]
pub struct NonlinearRunOnce;

impl NonlinearSolver for NonlinearRunOnce {
    fn solve(&self, system: &mut System, vectors: &mut SystemVectors) -> eyre::Result<()> {
        system.apply_transfer(TransferSelection::Full, vectors, Mode::Forward)?;
        nonlinear_sweep(system, vectors)
    }
}

/// Nonlinear block Gauss-Seidel.
#[derive(Debug, Copy, Clone, Default)]
pub struct NonlinearBlockGs {
    pub settings: NonlinearBlockGsSettings,
}

impl NonlinearBlockGs {
    pub fn new(settings: NonlinearBlockGsSettings) -> Self {
        Self { settings }
    }
}

impl NonlinearSolver for NonlinearBlockGs {
    fn solve(&self, system: &mut System, vectors: &mut SystemVectors) -> eyre::Result<()> {
        let settings = &self.settings;
        let mut initial_norm = None;
        for iteration in 1..=settings.max_iterations {
            system.apply_transfer(TransferSelection::Full, vectors, Mode::Forward)?;
            nonlinear_sweep(system, vectors)?;

            system.apply_nonlinear(vectors)?;
            let norm = vectors.residuals.norm();
            let initial = *initial_norm.get_or_insert(norm);
            if system.solver_print() {
                info!(
                    "{} NLBGS iteration {}: |r| = {:e} (|r|/|r0| = {:e})",
                    system.path_name(),
                    iteration,
                    norm,
                    relative(norm, initial)
                );
            }
            if norm <= settings.atol || relative(norm, initial) <= settings.rtol {
                return Ok(());
            }
        }
        not_converged("NLBGS", system, settings.max_iterations, settings.err_on_non_convergence)
    }
}

fn relative(norm: f64, initial: f64) -> f64 {
    if initial == 0.0 {
        0.0
    } else {
        norm / initial
    }
}

fn not_converged(name: &str, system: &System, max_iterations: usize, error: bool) -> eyre::Result<()> {
    let message = format!(
        "{} in '{}' did not converge in {} iterations",
        name,
        system.path_name(),
        max_iterations
    );
    if error {
        Err(eyre!(message))
    } else {
        warn!("{}", message);
        Ok(())
    }
}

/// Refreshes the inputs of every subsystem from the subsystems before it, then solves it.
fn nonlinear_sweep(system: &mut System, vectors: &mut SystemVectors) -> eyre::Result<()> {
    for index in 0..system.num_subsystems() {
        system.apply_transfer(TransferSelection::Forward(index), vectors, Mode::Forward)?;
        if let Some(child) = system.subsystem_mut(index) {
            let mut sub = vectors.restrict(child.layouts(), child.comm());
            child.solve_nonlinear(&mut sub)?;
        }
    }
    Ok(())
}

/// A single block Gauss-Seidel sweep.
///
/// The default linear solver of a group. Exact when the subsystems are coupled in one direction
/// only.
#[derive(Debug, Copy, Clone, Default)]
pub struct LinearRunOnce;

impl LinearSolver for LinearRunOnce {
    fn solve(
        &self,
        system: &mut System,
        nonlinear: &mut SystemVectors,
        linear: &mut SystemVectors,
        mode: Mode,
    ) -> eyre::Result<()> {
        let mut state = SweepState::start(system, linear, mode);
        state.sweep(system, nonlinear, linear)?;
        state.finish(linear)
    }
}

/// Linear block Gauss-Seidel.
///
/// Forward mode sweeps the subsystems in order (block lower-triangular), reverse mode in
/// reverse order (block upper-triangular), until the residual of the group system converges.
#[derive(Debug, Copy, Clone, Default)]
pub struct LinearBlockGs {
    pub settings: LinearBlockGsSettings,
}

impl LinearBlockGs {
    pub fn new(settings: LinearBlockGsSettings) -> Self {
        Self { settings }
    }
}

impl LinearSolver for LinearBlockGs {
    fn solve(
        &self,
        system: &mut System,
        nonlinear: &mut SystemVectors,
        linear: &mut SystemVectors,
        mode: Mode,
    ) -> eyre::Result<()> {
        let settings = &self.settings;
        let mut state = SweepState::start(system, linear, mode);
        let mut initial_norm = None;
        for iteration in 1..=settings.max_iterations {
            state.sweep(system, nonlinear, linear)?;
            let norm = state.residual_norm(system, nonlinear, linear)?;
            let initial = *initial_norm.get_or_insert(norm);
            if system.solver_print() {
                info!(
                    "{} LNBGS ({:?}) iteration {}: |r| = {:e}",
                    system.path_name(),
                    mode,
                    iteration,
                    norm
                );
            }
            if norm <= settings.atol || relative(norm, initial) <= settings.rtol {
                return state.finish(linear);
            }
        }
        state.finish(linear)?;
        not_converged("LNBGS", system, settings.max_iterations, settings.err_on_non_convergence)
    }
}

/// Bookkeeping of a block Gauss-Seidel solve on the linear vectors of one group.
struct SweepState {
    mode: Mode,
    /// The right-hand side: `d_residuals` in forward mode, `d_outputs` in reverse mode.
    rhs: Vec<f64>,
    /// Reverse mode: per subsystem, the input adjoints already pushed to the other subsystems.
    pushed: Vec<Option<Vec<f64>>>,
}

impl SweepState {
    fn start(system: &System, linear: &mut SystemVectors, mode: Mode) -> Self {
        let rhs = match mode {
            Mode::Forward => {
                linear.outputs.set_const(0.0);
                linear.residuals.get_flat()
            }
            Mode::Reverse => {
                linear.residuals.set_const(0.0);
                linear.outputs.get_flat()
            }
        };
        linear.inputs.set_const(0.0);
        Self {
            mode,
            rhs,
            pushed: vec![None; system.num_subsystems()],
        }
    }

    fn sweep(
        &mut self,
        system: &mut System,
        nonlinear: &mut SystemVectors,
        linear: &mut SystemVectors,
    ) -> eyre::Result<()> {
        match self.mode {
            Mode::Forward => {
                for index in 0..system.num_subsystems() {
                    forward_block(system, index, nonlinear, linear)?;
                }
            }
            Mode::Reverse => {
                for index in (0..system.num_subsystems()).rev() {
                    self.reverse_block(system, index, nonlinear, linear)?;
                }
            }
        }
        Ok(())
    }

    /// Solves the diagonal block of one subsystem in reverse mode and pushes the change of its
    /// input adjoints to the subsystems producing those inputs.
    ///
    /// `d_outputs` holds the right-hand side minus the contributions pushed so far.
    fn reverse_block(
        &mut self,
        system: &mut System,
        index: usize,
        nonlinear: &mut SystemVectors,
        linear: &mut SystemVectors,
    ) -> eyre::Result<()> {
        let adjoints = match system.subsystem_mut(index) {
            Some(child) => {
                let mut sub_nonlinear = nonlinear.restrict(child.layouts(), child.comm());
                let mut sub_linear = linear.restrict(child.layouts(), child.comm());
                child.solve_linear(&mut sub_nonlinear, &mut sub_linear, Mode::Reverse)?;

                let rhs = sub_linear.outputs.get_flat();
                sub_linear.outputs.set_const(0.0);
                sub_linear.inputs.set_const(0.0);
                child.apply_linear(&mut sub_nonlinear, &mut sub_linear, Mode::Reverse, true)?;
                sub_linear.outputs.set_flat(&rhs)?;

                let adjoints = sub_linear.inputs.get_flat();
                let previous = self.pushed[index].as_deref();
                let change: Vec<f64> = adjoints
                    .iter()
                    .enumerate()
                    .map(|(k, &a)| -(a - previous.map(|p| p[k]).unwrap_or(0.0)))
                    .collect();
                sub_linear.inputs.set_flat(&change)?;
                Some(adjoints)
            }
            None => None,
        };

        system.apply_transfer(TransferSelection::Forward(index), linear, Mode::Reverse)?;
        system.apply_transfer(TransferSelection::Reverse(index), linear, Mode::Reverse)?;

        if let Some(adjoints) = adjoints {
            if let Some(child) = system.subsystem_mut(index) {
                let mut sub_linear = linear.restrict(child.layouts(), child.comm());
                sub_linear.inputs.set_flat(&adjoints)?;
            }
            self.pushed[index] = Some(adjoints);
        }
        Ok(())
    }

    /// The norm of the residual of the group's linear system at the current iterate.
    fn residual_norm(
        &self,
        system: &mut System,
        nonlinear: &mut SystemVectors,
        linear: &mut SystemVectors,
    ) -> eyre::Result<f64> {
        let saved_inputs = linear.inputs.get_flat();
        let norm = match self.mode {
            Mode::Forward => {
                let residuals = linear.residuals.get_flat();
                linear.residuals.set_const(0.0);
                system.apply_linear(nonlinear, linear, Mode::Forward, true)?;
                let product = linear.residuals.get_flat();
                linear.residuals.set_flat(&difference(&self.rhs, &product))?;
                let norm = linear.residuals.norm();
                linear.residuals.set_flat(&residuals)?;
                norm
            }
            Mode::Reverse => {
                let outputs = linear.outputs.get_flat();
                linear.outputs.set_const(0.0);
                linear.inputs.set_const(0.0);
                system.apply_linear(nonlinear, linear, Mode::Reverse, true)?;
                let product = linear.outputs.get_flat();
                linear.outputs.set_flat(&difference(&self.rhs, &product))?;
                let norm = linear.outputs.norm();
                linear.outputs.set_flat(&outputs)?;
                norm
            }
        };
        linear.inputs.set_flat(&saved_inputs)?;
        Ok(norm)
    }

    /// Restores the right-hand side.
    fn finish(self, linear: &mut SystemVectors) -> eyre::Result<()> {
        match self.mode {
            Mode::Forward => linear.residuals.set_flat(&self.rhs)?,
            Mode::Reverse => linear.outputs.set_flat(&self.rhs)?,
        }
        Ok(())
    }
}

/// Solves the diagonal block of one subsystem in forward mode, moving the coupling with the other
/// subsystems to the right-hand side.
fn forward_block(
    system: &mut System,
    index: usize,
    nonlinear: &mut SystemVectors,
    linear: &mut SystemVectors,
) -> eyre::Result<()> {
    system.apply_transfer(TransferSelection::Forward(index), linear, Mode::Forward)?;
    system.apply_transfer(TransferSelection::Reverse(index), linear, Mode::Forward)?;
    let Some(child) = system.subsystem_mut(index) else {
        return Ok(());
    };
    let mut sub_nonlinear = nonlinear.restrict(child.layouts(), child.comm());
    let mut sub_linear = linear.restrict(child.layouts(), child.comm());

    let rhs = sub_linear.residuals.get_flat();
    let guess = sub_linear.outputs.get_flat();
    sub_linear.outputs.set_const(0.0);
    sub_linear.residuals.set_const(0.0);
    child.apply_linear(&mut sub_nonlinear, &mut sub_linear, Mode::Forward, true)?;
    let coupling = sub_linear.residuals.get_flat();
    sub_linear.residuals.set_flat(&difference(&rhs, &coupling))?;
    sub_linear.outputs.set_flat(&guess)?;

    child.solve_linear(&mut sub_nonlinear, &mut sub_linear, Mode::Forward)?;
    sub_linear.residuals.set_flat(&rhs)?;
    Ok(())
}

fn difference(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}
