use crate::component::Component;
use crate::error::Error;
use crate::jacobian::Partials;
use crate::transfer::Mode;
use crate::variables::{Variable, VariableDeclarations};
use crate::vector::Vector;
use eyre::eyre;
use log::debug;
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};

/// Ratio of the largest to the smallest pivot beyond which a factorization is rejected.
const MAX_PIVOT_RATIO: f64 = 1e14;

/// How the partial derivatives of a [`LinearSystemComp`] are provided.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialType {
    #[default]
    Dense,
    Sparse,
    MatrixFree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearSystemOptions {
    /// The dimension of the system.
    pub size: usize,
    pub partial_type: PartialType,
}

impl Default for LinearSystemOptions {
    fn default() -> Self {
        Self {
            size: 1,
            partial_type: PartialType::default(),
        }
    }
}

/// An implicit component solving the dense linear system `A x = b`.
///
/// Inputs are the matrix `A` (shape `[n, n]`, row-major, identity by default) and the right-hand
/// side `b` (ones by default); the output is `x`. The residual is `A x - b`. The LU factorization
/// of `A` computed by the nonlinear solve is cached and reused for derivative solves.
#[derive(Debug, Clone)]
pub struct LinearSystemComp {
    options: LinearSystemOptions,
    factorization: Option<LU<f64, Dyn, Dyn>>,
}

impl LinearSystemComp {
    pub fn new(options: LinearSystemOptions) -> Result<Self, Error> {
        if options.size == 0 {
            return Err(Error::configuration("the size of a linear system must be positive"));
        }
        Ok(Self {
            options,
            factorization: None,
        })
    }

    pub fn with_size(size: usize) -> Result<Self, Error> {
        Self::new(LinearSystemOptions {
            size,
            ..Default::default()
        })
    }

    pub fn options(&self) -> &LinearSystemOptions {
        &self.options
    }

    fn factorize(&mut self, a: DMatrix<f64>) -> Result<&LU<f64, Dyn, Dyn>, Error> {
        let lu = a.lu();
        let pivots = lu.u().diagonal().map(f64::abs);
        let (min, max) = (pivots.min(), pivots.max());
        if min == 0.0 || !min.is_finite() || !max.is_finite() || max / min > MAX_PIVOT_RATIO {
            self.factorization = None;
            return Err(Error::NumericFailure(format!(
                "matrix A of size {} is singular or ill-conditioned (pivot magnitudes in [{:e}, {:e}])",
                self.options.size, min, max
            )));
        }
        debug!("factorized linear system of size {}", self.options.size);
        Ok(self.factorization.insert(lu))
    }

    fn cached(&self) -> Result<&LU<f64, Dyn, Dyn>, Error> {
        self.factorization.as_ref().ok_or_else(|| {
            Error::NumericFailure("linear system has not been factorized; solve or linearize it first".to_string())
        })
    }
}

/// Solves `A^T y = c` given `P A = L U`, so that `A^T = U^T L^T P`.
fn solve_transposed(lu: &LU<f64, Dyn, Dyn>, c: &DVector<f64>) -> Option<DVector<f64>> {
    let z = lu.u().tr_solve_upper_triangular(c)?;
    let mut y = lu.l().tr_solve_lower_triangular(&z)?;
    lu.p().inv_permute_rows(&mut y);
    Some(y)
}

impl Component for LinearSystemComp {
    fn declare_variables(&mut self, variables: &mut VariableDeclarations) -> Result<(), Error> {
        let n = self.options.size;
        let identity = DMatrix::<f64>::identity(n, n);
        variables
            .add_input("A", Variable::array(&[n, n], identity.as_slice().to_vec()))?
            .add_input("b", Variable::filled(&[n], 1.0))?
            .add_output("x", Variable::filled(&[n], 2.0))?;
        Ok(())
    }

    fn declare_partials(&mut self, partials: &mut Partials) -> Result<(), Error> {
        let n = self.options.size;
        match self.options.partial_type {
            PartialType::Dense => {
                partials.declare_dense_value("x", "b", -DMatrix::identity(n, n))?;
                partials.declare_dense("x", "A")?;
                partials.declare_dense("x", "x")?;
            }
            PartialType::Sparse => {
                let diagonal: Vec<usize> = (0..n).collect();
                partials.declare_sparse("x", "b", diagonal.clone(), diagonal, vec![-1.0; n])?;
                let rows = (0..n).flat_map(|i| std::iter::repeat(i).take(n)).collect();
                let cols = (0..n * n).collect();
                partials.declare_sparse("x", "A", rows, cols, vec![1.0; n * n])?;
                partials.declare_dense("x", "x")?;
            }
            PartialType::MatrixFree => {}
        }
        Ok(())
    }

    fn apply_nonlinear(&mut self, inputs: &Vector, outputs: &Vector, residuals: &mut Vector) -> eyre::Result<()> {
        let a = inputs.matrix("A")?;
        let r = a * outputs.dvector("x")? - inputs.dvector("b")?;
        residuals.set("x", r.as_slice())?;
        Ok(())
    }

    fn solve_nonlinear(&mut self, inputs: &Vector, outputs: &mut Vector) -> eyre::Result<()> {
        let b = inputs.dvector("b")?.clone_owned();
        let lu = self.factorize(inputs.matrix("A")?)?;
        let x = lu
            .solve(&b)
            .ok_or_else(|| Error::NumericFailure("LU solve failed".to_string()))?;
        outputs.set("x", x.as_slice())?;
        Ok(())
    }

    /// Refreshes the factorization and the partials. A matrix-free system keeps the
    /// factorization of its last nonlinear solve.
    fn linearize(&mut self, inputs: &Vector, outputs: &Vector, partials: &mut Partials) -> eyre::Result<()> {
        if self.is_matrix_free() {
            return Ok(());
        }
        let n = self.options.size;
        let a = inputs.matrix("A")?;
        let x = outputs.dvector("x")?.clone_owned();
        self.factorize(a.clone())?;

        match self.options.partial_type {
            PartialType::Dense => {
                // dR_i/dA_ij = x_j, with A flattened row by row
                let mut dr_da = DMatrix::zeros(n, n * n);
                for i in 0..n {
                    dr_da
                        .view_mut((i, i * n), (1, n))
                        .copy_from(&x.transpose());
                }
                partials.set_dense("x", "A", dr_da)?;
                partials.set_dense("x", "x", a)?;
            }
            PartialType::Sparse => {
                let values: Vec<f64> = (0..n).flat_map(|_| x.iter().copied()).collect();
                partials.set_sparse_values("x", "A", &values)?;
                partials.set_dense("x", "x", a)?;
            }
            PartialType::MatrixFree => unreachable!("matrix-free systems return early"),
        }
        Ok(())
    }

    fn is_matrix_free(&self) -> bool {
        self.options.partial_type == PartialType::MatrixFree
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
        if !self.is_matrix_free() {
            return Err(eyre!("linear system component uses {:?} partials", self.options.partial_type));
        }
        if !d_residuals.contains("x") {
            return Ok(());
        }
        let a = inputs.matrix("A")?;
        let x = outputs.dvector("x")?.clone_owned();
        let n = self.options.size;

        match mode {
            Mode::Forward => {
                let mut r = d_residuals.dvector("x")?.clone_owned();
                if d_outputs.contains("x") {
                    r += &a * d_outputs.dvector("x")?;
                }
                if d_inputs.contains("A") {
                    r += d_inputs.matrix("A")? * &x;
                }
                if d_inputs.contains("b") {
                    r -= d_inputs.dvector("b")?;
                }
                d_residuals.set("x", r.as_slice())?;
            }
            Mode::Reverse => {
                let r = d_residuals.dvector("x")?.clone_owned();
                if d_outputs.contains("x") {
                    let mut dx = d_outputs.dvector_mut("x")?;
                    dx.gemv_tr(1.0, &a, &r, 1.0);
                }
                if d_inputs.contains("A") {
                    // Contributions accumulate across calls
                    let mut da = d_inputs.matrix("A")?;
                    da.ger(1.0, &r, &x, 1.0);
                    debug_assert_eq!(da.shape(), (n, n));
                    d_inputs.set_matrix("A", &da)?;
                }
                if d_inputs.contains("b") {
                    let mut db = d_inputs.dvector_mut("b")?;
                    db -= &r;
                }
            }
        }
        Ok(())
    }

    fn solve_linear(&mut self, d_outputs: &mut Vector, d_residuals: &mut Vector, mode: Mode) -> eyre::Result<()> {
        let lu = self.cached()?;
        match mode {
            Mode::Forward => {
                let rhs = d_residuals.dvector("x")?.clone_owned();
                let solution = lu
                    .solve(&rhs)
                    .ok_or_else(|| Error::NumericFailure("LU solve failed".to_string()))?;
                d_outputs.set("x", solution.as_slice())?;
            }
            Mode::Reverse => {
                let rhs = d_outputs.dvector("x")?.clone_owned();
                let solution = solve_transposed(lu, &rhs)
                    .ok_or_else(|| Error::NumericFailure("transposed LU solve failed".to_string()))?;
                d_residuals.set("x", solution.as_slice())?;
            }
        }
        Ok(())
    }
}
