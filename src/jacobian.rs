//! Partial derivatives of component residuals and their assembly into global matrices.
use crate::error::Error;
use crate::transfer::Mode;
use crate::variables::{VariableKind, VariableMetadata};
use crate::vector::Vector;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// The value of one partial-derivative block.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialValue {
    Dense(DMatrix<f64>),
    /// A fixed coordinate pattern. Duplicate coordinates are summed.
    Sparse {
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<f64>,
        matrix: CsrMatrix<f64>,
    },
}

impl PartialValue {
    fn sparse(nrows: usize, ncols: usize, rows: Vec<usize>, cols: Vec<usize>, values: Vec<f64>) -> Result<Self, Error> {
        let coo = CooMatrix::try_from_triplets(nrows, ncols, rows.clone(), cols.clone(), values.clone())
            .map_err(|err| Error::configuration(format!("invalid sparsity pattern: {}", err)))?;
        Ok(PartialValue::Sparse {
            rows,
            cols,
            values,
            matrix: CsrMatrix::from(&coo),
        })
    }

    pub fn nrows(&self) -> usize {
        match self {
            PartialValue::Dense(matrix) => matrix.nrows(),
            PartialValue::Sparse { matrix, .. } => matrix.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            PartialValue::Dense(matrix) => matrix.ncols(),
            PartialValue::Sparse { matrix, .. } => matrix.ncols(),
        }
    }

    /// `y += alpha * J x` in forward mode, `y += alpha * J^T x` in reverse mode.
    fn gemv(&self, y: &mut DVector<f64>, alpha: f64, x: &DVector<f64>, mode: Mode) {
        match (self, mode) {
            (PartialValue::Dense(matrix), Mode::Forward) => y.gemv(alpha, matrix, x, 1.0),
            (PartialValue::Dense(matrix), Mode::Reverse) => y.gemv_tr(alpha, matrix, x, 1.0),
            (PartialValue::Sparse { matrix, .. }, Mode::Forward) => {
                spmm_csr_dense(1.0, y, alpha, Op::NoOp(matrix), Op::NoOp(x))
            }
            (PartialValue::Sparse { matrix, .. }, Mode::Reverse) => {
                spmm_csr_dense(1.0, y, alpha, Op::Transpose(matrix), Op::NoOp(x))
            }
        }
    }

    /// Calls `f(row, col, value)` for every stored entry.
    fn for_each_entry(&self, mut f: impl FnMut(usize, usize, f64)) {
        match self {
            PartialValue::Dense(matrix) => {
                for j in 0..matrix.ncols() {
                    for i in 0..matrix.nrows() {
                        f(i, j, matrix[(i, j)]);
                    }
                }
            }
            PartialValue::Sparse { rows, cols, values, .. } => {
                for ((&i, &j), &v) in rows.iter().zip(cols).zip(values) {
                    f(i, j, v);
                }
            }
        }
    }
}

/// The derivative of the residual of output `of` with respect to variable `wrt`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialBlock {
    pub of: String,
    pub wrt: String,
    pub wrt_kind: VariableKind,
    /// Factor applied to the stored value when the block is used.
    pub scale: f64,
    pub value: PartialValue,
}

/// Partial derivatives declared by a single component.
#[derive(Debug, Clone, Default)]
pub struct Partials {
    inputs: Vec<(String, usize)>,
    outputs: Vec<(String, usize)>,
    blocks: Vec<PartialBlock>,
    index: FxHashMap<(String, String), usize>,
}

impl Partials {
    pub(crate) fn new(inputs: &[VariableMetadata], outputs: &[VariableMetadata]) -> Self {
        let sizes = |vars: &[VariableMetadata]| vars.iter().map(|v| (v.name.clone(), v.size())).collect();
        Self {
            inputs: sizes(inputs),
            outputs: sizes(outputs),
            ..Default::default()
        }
    }

    pub(crate) fn output_size(&self, name: &str) -> Result<usize, Error> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, size)| size)
            .ok_or_else(|| Error::VariableNotFound(name.to_string()))
    }

    fn wrt(&self, name: &str) -> Result<(VariableKind, usize), Error> {
        let find = |vars: &[(String, usize)]| vars.iter().find(|(n, _)| n == name).map(|&(_, size)| size);
        find(&self.outputs)
            .map(|size| (VariableKind::Output, size))
            .or_else(|| find(&self.inputs).map(|size| (VariableKind::Input, size)))
            .ok_or_else(|| Error::VariableNotFound(name.to_string()))
    }

    fn insert(&mut self, of: &str, wrt: &str, value: PartialValue) -> Result<(), Error> {
        let (wrt_kind, _) = self.wrt(wrt)?;
        let key = (of.to_string(), wrt.to_string());
        if self.index.contains_key(&key) {
            return Err(Error::configuration(format!(
                "partial derivative of '{}' with respect to '{}' is declared twice",
                of, wrt
            )));
        }
        self.index.insert(key, self.blocks.len());
        self.blocks.push(PartialBlock {
            of: of.to_string(),
            wrt: wrt.to_string(),
            wrt_kind,
            scale: 1.0,
            value,
        });
        Ok(())
    }

    fn block_shape(&self, of: &str, wrt: &str) -> Result<(usize, usize), Error> {
        Ok((self.output_size(of)?, self.wrt(wrt)?.1))
    }

    /// Declares a dense block, initially zero.
    pub fn declare_dense(&mut self, of: &str, wrt: &str) -> Result<(), Error> {
        let (nrows, ncols) = self.block_shape(of, wrt)?;
        self.insert(of, wrt, PartialValue::Dense(DMatrix::zeros(nrows, ncols)))
    }

    /// Declares a dense block with an initial (possibly constant) value.
    pub fn declare_dense_value(&mut self, of: &str, wrt: &str, value: DMatrix<f64>) -> Result<(), Error> {
        let (nrows, ncols) = self.block_shape(of, wrt)?;
        check_shape(of, wrt, (nrows, ncols), value.shape())?;
        self.insert(of, wrt, PartialValue::Dense(value))
    }

    /// Declares a sparse block with the given coordinate pattern and initial values.
    pub fn declare_sparse(
        &mut self,
        of: &str,
        wrt: &str,
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<(), Error> {
        let (nrows, ncols) = self.block_shape(of, wrt)?;
        let value = PartialValue::sparse(nrows, ncols, rows, cols, values)?;
        self.insert(of, wrt, value)
    }

    fn block_mut(&mut self, of: &str, wrt: &str) -> Result<&mut PartialBlock, Error> {
        let index = *self
            .index
            .get(&(of.to_string(), wrt.to_string()))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "partial derivative of '{}' with respect to '{}' was not declared",
                    of, wrt
                ))
            })?;
        Ok(&mut self.blocks[index])
    }

    pub fn set_dense(&mut self, of: &str, wrt: &str, value: DMatrix<f64>) -> Result<(), Error> {
        let block = self.block_mut(of, wrt)?;
        match &mut block.value {
            PartialValue::Dense(matrix) => {
                check_shape(of, wrt, matrix.shape(), value.shape())?;
                *matrix = value;
                Ok(())
            }
            PartialValue::Sparse { .. } => Err(Error::configuration(format!(
                "partial derivative of '{}' with respect to '{}' was declared sparse",
                of, wrt
            ))),
        }
    }

    /// Replaces the values of a sparse block, keeping its coordinate pattern.
    pub fn set_sparse_values(&mut self, of: &str, wrt: &str, new_values: &[f64]) -> Result<(), Error> {
        let block = self.block_mut(of, wrt)?;
        let (nrows, ncols, rows, cols, nnz) = match &block.value {
            PartialValue::Sparse { rows, cols, values, matrix } => {
                (matrix.nrows(), matrix.ncols(), rows.clone(), cols.clone(), values.len())
            }
            PartialValue::Dense(_) => {
                return Err(Error::configuration(format!(
                    "partial derivative of '{}' with respect to '{}' was declared dense",
                    of, wrt
                )))
            }
        };
        if new_values.len() != nnz {
            return Err(Error::dimension(format!("d{}/d{}", of, wrt), nnz, new_values.len()));
        }
        block.value = PartialValue::sparse(nrows, ncols, rows, cols, new_values.to_vec())?;
        Ok(())
    }

    pub fn get(&self, of: &str, wrt: &str) -> Option<&PartialBlock> {
        self.index
            .get(&(of.to_string(), wrt.to_string()))
            .map(|&i| &self.blocks[i])
    }

    pub fn contains(&self, of: &str, wrt: &str) -> bool {
        self.index.contains_key(&(of.to_string(), wrt.to_string()))
    }

    pub fn blocks(&self) -> &[PartialBlock] {
        &self.blocks
    }

    pub(crate) fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, _)| name.as_str())
    }

    /// Multiplies all blocks taken with respect to inputs by `factor`.
    pub(crate) fn scale_input_blocks(&mut self, factor: f64) {
        for block in &mut self.blocks {
            if block.wrt_kind == VariableKind::Input {
                block.scale *= factor;
            }
        }
    }

    /// Applies the partial-derivative operator to the linear vectors of the owning component.
    ///
    /// Blocks involving variables that are not visible through the vectors are skipped.
    pub fn apply<'v>(
        &self,
        d_inputs: &mut Vector<'v>,
        d_outputs: &mut Vector<'v>,
        d_residuals: &mut Vector,
        mode: Mode,
    ) -> Result<(), Error> {
        for block in &self.blocks {
            if !d_residuals.contains(&block.of) {
                continue;
            }
            let d_wrt = match block.wrt_kind {
                VariableKind::Input => &mut *d_inputs,
                VariableKind::Output => &mut *d_outputs,
            };
            if !d_wrt.contains(&block.wrt) {
                continue;
            }
            match mode {
                Mode::Forward => {
                    let x = DVector::from_column_slice(d_wrt.slice(&block.wrt)?);
                    let mut y = DVector::from_column_slice(d_residuals.slice(&block.of)?);
                    block.value.gemv(&mut y, block.scale, &x, mode);
                    d_residuals.set(&block.of, y.as_slice())?;
                }
                Mode::Reverse => {
                    let x = DVector::from_column_slice(d_residuals.slice(&block.of)?);
                    let mut y = DVector::from_column_slice(d_wrt.slice(&block.wrt)?);
                    block.value.gemv(&mut y, block.scale, &x, mode);
                    d_wrt.set(&block.wrt, y.as_slice())?;
                }
            }
        }
        Ok(())
    }
}

fn check_shape(of: &str, wrt: &str, expected: (usize, usize), actual: (usize, usize)) -> Result<(), Error> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::dimension(
            format!("d{}/d{}", of, wrt),
            expected.0 * expected.1,
            actual.0 * actual.1,
        ))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixFormat {
    Dense,
    Csr,
}

/// How the linear operator of a subtree is represented.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JacobianKind {
    /// Every component applies its own partial derivatives.
    #[default]
    Default,
    /// Partial derivatives of the whole subtree are assembled into one matrix at the system the
    /// jacobian is attached to.
    Global(MatrixFormat),
}

/// The jacobian setting of one system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct JacobianAttachment {
    pub kind: JacobianKind,
    /// Whether this system is the one the jacobian was attached to.
    pub is_top: bool,
}

#[derive(Debug, Clone)]
enum AssembledMatrix {
    Dense(DMatrix<f64>),
    Csr(CsrMatrix<f64>),
}

impl AssembledMatrix {
    fn gemv(&self, y: &mut DVector<f64>, x: &DVector<f64>, mode: Mode) {
        match (self, mode) {
            (AssembledMatrix::Dense(matrix), Mode::Forward) => y.gemv(1.0, matrix, x, 1.0),
            (AssembledMatrix::Dense(matrix), Mode::Reverse) => y.gemv_tr(1.0, matrix, x, 1.0),
            (AssembledMatrix::Csr(matrix), Mode::Forward) => spmm_csr_dense(1.0, y, 1.0, Op::NoOp(matrix), Op::NoOp(x)),
            (AssembledMatrix::Csr(matrix), Mode::Reverse) => {
                spmm_csr_dense(1.0, y, 1.0, Op::Transpose(matrix), Op::NoOp(x))
            }
        }
    }
}

/// One entry of a block, placed in the flat local vectors of the assembling system.
#[derive(Debug, Copy, Clone)]
pub(crate) struct BlockPlacement<'b> {
    pub block: &'b PartialBlock,
    /// Flat offset of the `of` output.
    pub row_offset: usize,
    /// Flat offset of the `wrt` variable in the vector of its kind.
    pub col_offset: usize,
}

/// The partial derivatives of a subtree assembled into one matrix per variable kind.
///
/// Rows and columns follow the flat (varset-concatenated) local vectors of the system the
/// jacobian is attached to.
#[derive(Debug, Clone)]
pub struct AssembledJacobian {
    format: MatrixFormat,
    num_outputs: usize,
    num_inputs: usize,
    wrt_outputs: AssembledMatrix,
    wrt_inputs: AssembledMatrix,
}

impl AssembledJacobian {
    pub(crate) fn new(format: MatrixFormat, num_outputs: usize, num_inputs: usize) -> Self {
        let mut jacobian = Self {
            format,
            num_outputs,
            num_inputs,
            wrt_outputs: AssembledMatrix::Dense(DMatrix::zeros(0, 0)),
            wrt_inputs: AssembledMatrix::Dense(DMatrix::zeros(0, 0)),
        };
        jacobian.assemble(std::iter::empty());
        jacobian
    }

    pub fn format(&self) -> MatrixFormat {
        self.format
    }

    /// Rebuilds both matrices from the current values of the given blocks.
    pub(crate) fn assemble<'b>(&mut self, placements: impl IntoIterator<Item = BlockPlacement<'b>>) {
        let mut entries: [Vec<(usize, usize, f64)>; 2] = [Vec::new(), Vec::new()];
        for placement in placements {
            let target = match placement.block.wrt_kind {
                VariableKind::Output => &mut entries[0],
                VariableKind::Input => &mut entries[1],
            };
            let scale = placement.block.scale;
            placement.block.value.for_each_entry(|i, j, v| {
                target.push((placement.row_offset + i, placement.col_offset + j, scale * v))
            });
        }
        let [outputs, inputs] = entries;
        self.wrt_outputs = self.build(self.num_outputs, &outputs);
        self.wrt_inputs = self.build(self.num_inputs, &inputs);
    }

    fn build(&self, ncols: usize, entries: &[(usize, usize, f64)]) -> AssembledMatrix {
        match self.format {
            MatrixFormat::Dense => {
                let mut matrix = DMatrix::zeros(self.num_outputs, ncols);
                for &(i, j, v) in entries {
                    matrix[(i, j)] += v;
                }
                AssembledMatrix::Dense(matrix)
            }
            MatrixFormat::Csr => {
                let mut coo = CooMatrix::new(self.num_outputs, ncols);
                for &(i, j, v) in entries {
                    coo.push(i, j, v);
                }
                AssembledMatrix::Csr(CsrMatrix::from(&coo))
            }
        }
    }

    /// Applies the assembled operator to flat local vectors.
    ///
    /// Entries whose mask is false are treated as absent, both as operands and as results.
    pub(crate) fn apply(
        &self,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        d_residuals: &mut Vector,
        mode: Mode,
    ) -> Result<(), Error> {
        let masked = |vector: &Vector| {
            let mask = vector.visibility_mask();
            let values = vector
                .get_flat()
                .into_iter()
                .zip(&mask)
                .map(|(v, &visible)| if visible { v } else { 0.0 })
                .collect::<Vec<_>>();
            (DVector::from_vec(values), mask)
        };
        let restrict = |y: DVector<f64>, mask: &[bool]| {
            y.iter()
                .zip(mask)
                .map(|(&v, &visible)| if visible { v } else { 0.0 })
                .collect::<Vec<_>>()
        };

        match mode {
            Mode::Forward => {
                let (x_out, _) = masked(&*d_outputs);
                let (x_in, _) = masked(&*d_inputs);
                let residual_mask = d_residuals.visibility_mask();
                let mut y = DVector::zeros(self.num_outputs);
                self.wrt_outputs.gemv(&mut y, &x_out, mode);
                self.wrt_inputs.gemv(&mut y, &x_in, mode);
                d_residuals.iadd_flat(&restrict(y, &residual_mask))?;
            }
            Mode::Reverse => {
                let (r, _) = masked(&*d_residuals);
                let output_mask = d_outputs.visibility_mask();
                let input_mask = d_inputs.visibility_mask();
                let mut y_out = DVector::zeros(self.num_outputs);
                let mut y_in = DVector::zeros(self.num_inputs);
                self.wrt_outputs.gemv(&mut y_out, &r, mode);
                self.wrt_inputs.gemv(&mut y_in, &r, mode);
                d_outputs.iadd_flat(&restrict(y_out, &output_mask))?;
                d_inputs.iadd_flat(&restrict(y_in, &input_mask))?;
            }
        }
        Ok(())
    }

    /// The assembled matrix with respect to outputs, in dense form.
    pub fn wrt_outputs_dense(&self) -> DMatrix<f64> {
        to_dense(&self.wrt_outputs)
    }

    /// The assembled matrix with respect to inputs, in dense form.
    pub fn wrt_inputs_dense(&self) -> DMatrix<f64> {
        to_dense(&self.wrt_inputs)
    }
}

fn to_dense(matrix: &AssembledMatrix) -> DMatrix<f64> {
    match matrix {
        AssembledMatrix::Dense(matrix) => matrix.clone(),
        AssembledMatrix::Csr(matrix) => DMatrix::from(matrix),
    }
}
