//! Leaf analysis units.
//!
//! A [`Component`] is implicit: it defines residuals `R(inputs, outputs)` and, optionally, how
//! to drive them to zero. Components that compute their outputs directly implement
//! [`ExplicitComponent`] and are adapted through [`Explicit`].
use crate::error::Error;
use crate::jacobian::Partials;
use crate::transfer::Mode;
use crate::variables::{Variable, VariableDeclarations};
use crate::vector::Vector;
use eyre::eyre;
use mdao_comm::Comm;
use nalgebra::DMatrix;
use std::ops::Range;

/// What a component knows about the processes it runs on.
#[derive(Debug, Clone)]
pub struct ProcessorInfo<'a> {
    pub path_name: &'a str,
    pub comm: &'a Comm,
    /// World ranks assigned to the component.
    pub procs: Range<usize>,
}

/// The hooks of a leaf of the model hierarchy.
///
/// Only [`declare_variables`](Component::declare_variables) and
/// [`apply_nonlinear`](Component::apply_nonlinear) are mandatory. Setup hooks report
/// [`Error`]s; evaluation hooks return [`eyre::Result`] so that implementors can attach context.
pub trait Component {
    fn initialize_processors(&mut self, _info: &ProcessorInfo) -> Result<(), Error> {
        Ok(())
    }

    fn declare_variables(&mut self, variables: &mut VariableDeclarations) -> Result<(), Error>;

    fn declare_partials(&mut self, _partials: &mut Partials) -> Result<(), Error> {
        Ok(())
    }

    /// Evaluates the residuals at the current inputs and outputs.
    fn apply_nonlinear(&mut self, inputs: &Vector, outputs: &Vector, residuals: &mut Vector) -> eyre::Result<()>;

    /// Drives the residuals to zero by updating the outputs. Does nothing by default.
    fn solve_nonlinear(&mut self, _inputs: &Vector, _outputs: &mut Vector) -> eyre::Result<()> {
        Ok(())
    }

    /// Updates the declared partial derivatives at the current point.
    fn linearize(&mut self, _inputs: &Vector, _outputs: &Vector, _partials: &mut Partials) -> eyre::Result<()> {
        Ok(())
    }

    /// Whether [`apply_linear`](Component::apply_linear) replaces the declared partials.
    fn is_matrix_free(&self) -> bool {
        false
    }

    /// Jacobian-vector product for matrix-free components.
    ///
    /// In forward mode, `d_residuals += J [d_inputs; d_outputs]`; in reverse mode,
    /// `[d_inputs; d_outputs] += J^T d_residuals`. Only variables contained in the linear vectors
    /// take part.
    fn apply_linear(
        &mut self,
        _inputs: &Vector,
        _outputs: &Vector,
        _d_inputs: &mut Vector,
        _d_outputs: &mut Vector,
        _d_residuals: &mut Vector,
        _mode: Mode,
    ) -> eyre::Result<()> {
        Err(eyre!("component does not provide a matrix-free linear operator"))
    }

    /// Solves with the output block of the jacobian.
    ///
    /// Forward mode maps `d_residuals` to `d_outputs`, reverse mode maps `d_outputs` to
    /// `d_residuals`. The default treats the block as the identity.
    fn solve_linear(&mut self, d_outputs: &mut Vector, d_residuals: &mut Vector, mode: Mode) -> eyre::Result<()> {
        match mode {
            Mode::Forward => d_outputs.copy_from(d_residuals),
            Mode::Reverse => d_residuals.copy_from(d_outputs),
        }
        Ok(())
    }
}

impl<C: Component + ?Sized> Component for Box<C> {
    fn initialize_processors(&mut self, info: &ProcessorInfo) -> Result<(), Error> {
        (**self).initialize_processors(info)
    }

    fn declare_variables(&mut self, variables: &mut VariableDeclarations) -> Result<(), Error> {
        (**self).declare_variables(variables)
    }

    fn declare_partials(&mut self, partials: &mut Partials) -> Result<(), Error> {
        (**self).declare_partials(partials)
    }

    fn apply_nonlinear(&mut self, inputs: &Vector, outputs: &Vector, residuals: &mut Vector) -> eyre::Result<()> {
        (**self).apply_nonlinear(inputs, outputs, residuals)
    }

    fn solve_nonlinear(&mut self, inputs: &Vector, outputs: &mut Vector) -> eyre::Result<()> {
        (**self).solve_nonlinear(inputs, outputs)
    }

    fn linearize(&mut self, inputs: &Vector, outputs: &Vector, partials: &mut Partials) -> eyre::Result<()> {
        (**self).linearize(inputs, outputs, partials)
    }

    fn is_matrix_free(&self) -> bool {
        (**self).is_matrix_free()
    }

    fn apply_linear(
        &mut self,
        inputs: &Vector,
        outputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        d_residuals: &mut Vector,
        mode: Mode,
    ) -> eyre::Result<()> {
        (**self).apply_linear(inputs, outputs, d_inputs, d_outputs, d_residuals, mode)
    }

    fn solve_linear(&mut self, d_outputs: &mut Vector, d_residuals: &mut Vector, mode: Mode) -> eyre::Result<()> {
        (**self).solve_linear(d_outputs, d_residuals, mode)
    }
}

/// A component computing its outputs as an explicit function of its inputs.
pub trait ExplicitComponent {
    fn declare_variables(&mut self, variables: &mut VariableDeclarations) -> Result<(), Error>;

    /// Declares the partial derivatives `d output / d input` of the computed function.
    fn declare_partials(&mut self, _partials: &mut Partials) -> Result<(), Error> {
        Ok(())
    }

    fn compute(&mut self, inputs: &Vector, outputs: &mut Vector) -> eyre::Result<()>;

    fn compute_partials(&mut self, _inputs: &Vector, _partials: &mut Partials) -> eyre::Result<()> {
        Ok(())
    }
}

/// Adapts an [`ExplicitComponent`] `outputs = f(inputs)` to the residual form
/// `R = outputs - f(inputs)`.
#[derive(Debug, Clone, Default)]
pub struct Explicit<C>(pub C);

impl<C: ExplicitComponent> Component for Explicit<C> {
    fn declare_variables(&mut self, variables: &mut VariableDeclarations) -> Result<(), Error> {
        self.0.declare_variables(variables)
    }

    fn declare_partials(&mut self, partials: &mut Partials) -> Result<(), Error> {
        self.0.declare_partials(partials)?;
        // dR/dinputs = -df/dinputs, dR/doutputs = I
        partials.scale_input_blocks(-1.0);
        let outputs: Vec<String> = partials.output_names().map(str::to_string).collect();
        for output in outputs {
            if !partials.contains(&output, &output) {
                let size = partials.output_size(&output)?;
                partials.declare_dense_value(&output, &output, DMatrix::identity(size, size))?;
            }
        }
        Ok(())
    }

    fn apply_nonlinear(&mut self, inputs: &Vector, outputs: &Vector, residuals: &mut Vector) -> eyre::Result<()> {
        // Evaluate f into the residual vector, which shares the output layout
        residuals.set_const(0.0);
        self.0.compute(inputs, residuals)?;
        residuals.scale(-1.0);
        residuals.add(outputs);
        Ok(())
    }

    fn solve_nonlinear(&mut self, inputs: &Vector, outputs: &mut Vector) -> eyre::Result<()> {
        self.0.compute(inputs, outputs)
    }

    fn linearize(&mut self, inputs: &Vector, _outputs: &Vector, partials: &mut Partials) -> eyre::Result<()> {
        self.0.compute_partials(inputs, partials)
    }
}

/// A component holding independent variables: outputs with zero residuals.
#[derive(Debug, Clone, Default)]
pub struct IndepVarComp {
    outputs: Vec<(String, Variable)>,
}

impl IndepVarComp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, name: &str, variable: Variable) -> Self {
        self.outputs.push((name.to_string(), variable));
        self
    }
}

impl Component for IndepVarComp {
    fn declare_variables(&mut self, variables: &mut VariableDeclarations) -> Result<(), Error> {
        for (name, variable) in &self.outputs {
            variables.add_output(name, variable.clone())?;
        }
        Ok(())
    }

    fn declare_partials(&mut self, partials: &mut Partials) -> Result<(), Error> {
        for (name, variable) in &self.outputs {
            partials.declare_dense_value(name, name, DMatrix::identity(variable.size(), variable.size()))?;
        }
        Ok(())
    }

    fn apply_nonlinear(&mut self, _inputs: &Vector, _outputs: &Vector, residuals: &mut Vector) -> eyre::Result<()> {
        residuals.set_const(0.0);
        Ok(())
    }
}
