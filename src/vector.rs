//! Distributed vectors partitioned into varset buffers.
//!
//! Storage for one (kind, vector name) pair is allocated once per process, as one flat buffer per
//! varset. The vector of every node of the hierarchy is a view into those buffers: the variables
//! of a node are placed depth-first, so each node covers one contiguous range of every varset
//! buffer, and each variable one contiguous range inside it. Offsets are prefix sums of the
//! variable sizes in global index order, which makes the views of distinct variables disjoint.
use crate::error::Error;
use crate::variables::{PerKind, VariableKind};
use mdao_comm::Comm;
use nalgebra::{DMatrix, DVectorView, DVectorViewMut};
use rustc_hash::{FxHashMap, FxHashSet};
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VectorKind {
    Input,
    Output,
    Residual,
}

impl VectorKind {
    /// The kind of variable the vector is laid out for. Residuals share the output layout.
    pub fn variable_kind(&self) -> VariableKind {
        match self {
            VectorKind::Input => VariableKind::Input,
            VectorKind::Output | VectorKind::Residual => VariableKind::Output,
        }
    }
}

/// Identifies a set of input, output and residual vectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VectorName {
    /// The primary (nonlinear) vectors.
    Nonlinear,
    /// A linear (derivative) vector set.
    Linear(String),
}

impl VectorName {
    pub fn linear(name: impl Into<String>) -> Self {
        VectorName::Linear(name.into())
    }
}

/// The placement of one variable in its varset buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSpec {
    /// The name in the namespace of the node owning the layout.
    pub name: String,
    pub global_index: usize,
    pub varset: usize,
    /// Offset into the process-wide varset buffer.
    pub offset: usize,
    pub len: usize,
    pub shape: Vec<usize>,
    /// Size-1 variables are read and written as bare scalars.
    pub scalar: bool,
    /// Whether this process is the one accounting for the variable in reductions.
    pub owned: bool,
}

/// The views of one node for one variable kind.
#[derive(Debug, Clone)]
pub struct VectorLayout {
    kind: VariableKind,
    base: Vec<usize>,
    lens: Vec<usize>,
    views: Vec<ViewSpec>,
    by_name: FxHashMap<String, usize>,
    by_global: FxHashMap<usize, usize>,
}

impl VectorLayout {
    /// Creates a layout covering `[base[v], base[v] + lens[v])` of every varset buffer `v`.
    ///
    /// # Panics
    ///
    /// Panics if a view does not lie inside the range of its varset, or if views are not
    /// consecutive within their varset.
    pub(crate) fn new(kind: VariableKind, base: Vec<usize>, lens: Vec<usize>, views: Vec<ViewSpec>) -> Self {
        assert_eq!(base.len(), lens.len());
        let mut cursor = base.clone();
        let mut by_name = FxHashMap::default();
        let mut by_global = FxHashMap::default();
        for (i, view) in views.iter().enumerate() {
            assert_eq!(
                view.offset, cursor[view.varset],
                "views must be packed in global index order within each varset"
            );
            cursor[view.varset] += view.len;
            // With several inputs promoted to the same name, the first one is addressed by name
            by_name.entry(view.name.clone()).or_insert(i);
            by_global.insert(view.global_index, i);
        }
        for v in 0..base.len() {
            assert_eq!(cursor[v], base[v] + lens[v], "views must exactly cover the varset range");
        }
        Self {
            kind,
            base,
            lens,
            views,
            by_name,
            by_global,
        }
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn views(&self) -> &[ViewSpec] {
        &self.views
    }

    pub fn view(&self, name: &str) -> Option<&ViewSpec> {
        self.by_name.get(name).map(|&i| &self.views[i])
    }

    pub fn view_by_global(&self, global_index: usize) -> Option<&ViewSpec> {
        self.by_global.get(&global_index).map(|&i| &self.views[i])
    }

    pub fn base(&self) -> &[usize] {
        &self.base
    }

    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    pub fn num_varsets(&self) -> usize {
        self.lens.len()
    }

    /// The total number of entries held by this process.
    pub fn len(&self) -> usize {
        self.lens.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The range of a view relative to the start of this layout's varset range.
    pub fn local_range(&self, view: &ViewSpec) -> Range<usize> {
        let start = view.offset - self.base[view.varset];
        start..start + view.len
    }

    /// The range of a view within the concatenation of all varset ranges, in varset order.
    pub fn flat_range(&self, view: &ViewSpec) -> Range<usize> {
        let varset_start: usize = self.lens[..view.varset].iter().sum();
        let local = self.local_range(view);
        varset_start + local.start..varset_start + local.end
    }
}

/// Global indices visible through a restricted vector set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relevance {
    pub(crate) inputs: FxHashSet<usize>,
    pub(crate) outputs: FxHashSet<usize>,
}

impl Relevance {
    pub fn contains(&self, kind: VariableKind, global_index: usize) -> bool {
        match kind {
            VariableKind::Input => self.inputs.contains(&global_index),
            VariableKind::Output => self.outputs.contains(&global_index),
        }
    }
}

/// The value of a variable, as a bare scalar for size-1 variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Array { shape: Vec<usize>, values: Vec<f64> },
}

impl Value {
    pub fn as_slice(&self) -> &[f64] {
        match self {
            Value::Scalar(value) => std::slice::from_ref(value),
            Value::Array { values, .. } => values,
        }
    }
}

/// A vector of one node: borrowed slices of the process-wide varset buffers.
#[derive(Debug)]
pub struct Vector<'a> {
    kind: VectorKind,
    layout: Arc<VectorLayout>,
    data: Vec<&'a mut [f64]>,
    relevance: Option<Arc<Relevance>>,
    comm: Comm,
}

impl<'a> Vector<'a> {
    pub(crate) fn new(
        kind: VectorKind,
        layout: Arc<VectorLayout>,
        data: Vec<&'a mut [f64]>,
        relevance: Option<Arc<Relevance>>,
        comm: Comm,
    ) -> Self {
        assert_eq!(kind.variable_kind(), layout.kind());
        assert!(data.iter().zip(layout.lens()).all(|(d, &len)| d.len() == len));
        Self {
            kind,
            layout,
            data,
            relevance,
            comm,
        }
    }

    pub fn kind(&self) -> VectorKind {
        self.kind
    }

    pub fn layout(&self) -> &Arc<VectorLayout> {
        &self.layout
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    fn is_visible(&self, view: &ViewSpec) -> bool {
        self.relevance
            .as_ref()
            .map(|relevance| relevance.contains(self.kind.variable_kind(), view.global_index))
            .unwrap_or(true)
    }

    fn visible_view(&self, name: &str) -> Result<ViewSpec, Error> {
        match self.layout.view(name) {
            Some(view) if self.is_visible(view) => Ok(view.clone()),
            _ => Err(Error::VariableNotFound(name.to_string())),
        }
    }

    /// Whether `name` is held locally and visible through this vector.
    pub fn contains(&self, name: &str) -> bool {
        self.layout
            .view(name)
            .map(|view| self.is_visible(view))
            .unwrap_or(false)
    }

    /// Names of the locally held, visible variables in global index order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layout
            .views()
            .iter()
            .filter(move |view| self.is_visible(view))
            .map(|view| view.name.as_str())
    }

    pub fn slice(&self, name: &str) -> Result<&[f64], Error> {
        let view = self.visible_view(name)?;
        let range = self.layout.local_range(&view);
        Ok(&self.data[view.varset][range])
    }

    pub fn slice_mut(&mut self, name: &str) -> Result<&mut [f64], Error> {
        let view = self.visible_view(name)?;
        let range = self.layout.local_range(&view);
        Ok(&mut self.data[view.varset][range])
    }

    pub fn get(&self, name: &str) -> Result<Value, Error> {
        let view = self.visible_view(name)?;
        let values = self.slice(name)?;
        if view.scalar {
            Ok(Value::Scalar(values[0]))
        } else {
            Ok(Value::Array {
                shape: view.shape.clone(),
                values: values.to_vec(),
            })
        }
    }

    /// Reads a size-1 variable.
    pub fn scalar(&self, name: &str) -> Result<f64, Error> {
        let values = self.slice(name)?;
        if values.len() == 1 {
            Ok(values[0])
        } else {
            Err(Error::dimension(name, 1, values.len()))
        }
    }

    pub fn dvector(&self, name: &str) -> Result<DVectorView<'_, f64>, Error> {
        let values = self.slice(name)?;
        Ok(DVectorView::from_slice(values, values.len()))
    }

    pub fn dvector_mut(&mut self, name: &str) -> Result<DVectorViewMut<'_, f64>, Error> {
        let values = self.slice_mut(name)?;
        let len = values.len();
        Ok(DVectorViewMut::from_slice(values, len))
    }

    /// Reads a variable as a matrix, interpreting two-dimensional shapes in row-major order.
    ///
    /// Any other shape is returned as a single column.
    pub fn matrix(&self, name: &str) -> Result<DMatrix<f64>, Error> {
        let view = self.visible_view(name)?;
        let values = self.slice(name)?;
        match view.shape.as_slice() {
            &[rows, cols] => Ok(DMatrix::from_row_slice(rows, cols, values)),
            _ => Ok(DMatrix::from_column_slice(values.len(), 1, values)),
        }
    }

    pub fn set(&mut self, name: &str, values: &[f64]) -> Result<(), Error> {
        let target = self.slice_mut(name)?;
        if target.len() != values.len() {
            return Err(Error::dimension(name, target.len(), values.len()));
        }
        target.copy_from_slice(values);
        Ok(())
    }

    /// Sets every entry of a variable to `value`.
    pub fn set_scalar(&mut self, name: &str, value: f64) -> Result<(), Error> {
        self.slice_mut(name)?.fill(value);
        Ok(())
    }

    /// Writes a matrix in row-major order into a variable of the same number of entries.
    pub fn set_matrix(&mut self, name: &str, matrix: &DMatrix<f64>) -> Result<(), Error> {
        let target = self.slice_mut(name)?;
        if target.len() != matrix.len() {
            return Err(Error::dimension(name, target.len(), matrix.len()));
        }
        let ncols = matrix.ncols();
        for ((i, j), value) in (0..matrix.nrows())
            .flat_map(|i| (0..ncols).map(move |j| (i, j)))
            .zip(target.iter_mut())
        {
            *value = matrix[(i, j)];
        }
        Ok(())
    }

    /// The number of locally held entries.
    pub fn len(&self) -> usize {
        self.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All locally held entries, concatenated in varset order.
    pub fn get_flat(&self) -> Vec<f64> {
        self.data.iter().flat_map(|d| d.iter().copied()).collect()
    }

    pub fn set_flat(&mut self, values: &[f64]) -> Result<(), Error> {
        if values.len() != self.len() {
            return Err(Error::dimension("<flat>", self.len(), values.len()));
        }
        let mut rest = values;
        for d in &mut self.data {
            let (head, tail) = rest.split_at(d.len());
            d.copy_from_slice(head);
            rest = tail;
        }
        Ok(())
    }

    pub fn iadd_flat(&mut self, values: &[f64]) -> Result<(), Error> {
        if values.len() != self.len() {
            return Err(Error::dimension("<flat>", self.len(), values.len()));
        }
        for (target, value) in self.data.iter_mut().flat_map(|d| d.iter_mut()).zip(values) {
            *target += value;
        }
        Ok(())
    }

    fn zip_apply(&mut self, other: &Vector, mut f: impl FnMut(&mut f64, f64)) {
        assert_eq!(self.layout.lens(), other.layout.lens(), "vectors must share a layout");
        for (d, o) in self.data.iter_mut().zip(&other.data) {
            for (x, &y) in d.iter_mut().zip(o.iter()) {
                f(x, y);
            }
        }
    }

    pub fn add(&mut self, other: &Vector) {
        self.zip_apply(other, |x, y| *x += y);
    }

    pub fn sub(&mut self, other: &Vector) {
        self.zip_apply(other, |x, y| *x -= y);
    }

    /// `self += alpha * other`
    pub fn axpy(&mut self, alpha: f64, other: &Vector) {
        self.zip_apply(other, |x, y| *x += alpha * y);
    }

    pub fn copy_from(&mut self, other: &Vector) {
        self.zip_apply(other, |x, y| *x = y);
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().flat_map(|d| d.iter_mut()).for_each(|x| *x *= factor);
    }

    pub fn set_const(&mut self, value: f64) {
        self.data.iter_mut().for_each(|d| d.fill(value));
    }

    /// Inner product over all processes of the communicator.
    ///
    /// Every variable contributes once, on the process owning it.
    pub fn dot(&self, other: &Vector) -> f64 {
        assert_eq!(self.layout.lens(), other.layout.lens(), "vectors must share a layout");
        let local: f64 = self
            .layout
            .views()
            .iter()
            .filter(|view| view.owned)
            .map(|view| {
                let range = self.layout.local_range(view);
                self.data[view.varset][range.clone()]
                    .iter()
                    .zip(&other.data[view.varset][range])
                    .map(|(x, y)| x * y)
                    .sum::<f64>()
            })
            .sum();
        if self.comm.size() > 1 {
            self.comm.all_reduce_scalar(local)
        } else {
            local
        }
    }

    /// Euclidean norm over all processes of the communicator.
    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// The vector of a descendant node, sharing this vector's storage.
    pub fn subvector(&mut self, layout: &Arc<VectorLayout>, comm: &Comm) -> Vector<'_> {
        let data = self
            .data
            .iter_mut()
            .enumerate()
            .map(|(v, d)| {
                let start = layout.base()[v] - self.layout.base()[v];
                &mut d[start..start + layout.lens()[v]]
            })
            .collect();
        Vector::new(
            self.kind,
            Arc::clone(layout),
            data,
            self.relevance.clone(),
            comm.clone(),
        )
    }

    pub(crate) fn entry(&self, varset: usize, offset: usize) -> f64 {
        self.data[varset][offset]
    }

    pub(crate) fn entry_mut(&mut self, varset: usize, offset: usize) -> &mut f64 {
        &mut self.data[varset][offset]
    }

    /// Per flat entry, whether it belongs to a variable visible through this vector.
    pub(crate) fn visibility_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.len()];
        for view in self.layout.views() {
            if self.is_visible(view) {
                mask[self.layout.flat_range(view)].fill(true);
            }
        }
        mask
    }
}

/// The input, output and residual vectors of one node for one vector name.
#[derive(Debug)]
pub struct SystemVectors<'a> {
    pub inputs: Vector<'a>,
    pub outputs: Vector<'a>,
    pub residuals: Vector<'a>,
}

impl<'a> SystemVectors<'a> {
    /// The vectors of a descendant node with the given layouts.
    pub fn restrict(&mut self, layouts: &PerKind<Arc<VectorLayout>>, comm: &Comm) -> SystemVectors<'_> {
        SystemVectors {
            inputs: self.inputs.subvector(&layouts.input, comm),
            outputs: self.outputs.subvector(&layouts.output, comm),
            residuals: self.residuals.subvector(&layouts.output, comm),
        }
    }
}

/// The process-wide storage of one vector name.
#[derive(Debug, Clone)]
pub struct RootVectors {
    inputs: Vec<Vec<f64>>,
    outputs: Vec<Vec<f64>>,
    residuals: Vec<Vec<f64>>,
    relevance: Option<Arc<Relevance>>,
}

impl RootVectors {
    pub(crate) fn allocate(root: &PerKind<Arc<VectorLayout>>, relevance: Option<Arc<Relevance>>) -> Self {
        let zeros = |layout: &VectorLayout| layout.lens().iter().map(|&len| vec![0.0; len]).collect();
        Self {
            inputs: zeros(&root.input),
            outputs: zeros(&root.output),
            residuals: zeros(&root.output),
            relevance,
        }
    }

    pub fn relevance(&self) -> Option<&Arc<Relevance>> {
        self.relevance.as_ref()
    }

    /// The vectors of the node with the given layouts.
    pub(crate) fn views(&mut self, layouts: &PerKind<Arc<VectorLayout>>, comm: &Comm) -> SystemVectors<'_> {
        let relevance = &self.relevance;
        SystemVectors {
            inputs: Vector::new(
                VectorKind::Input,
                Arc::clone(&layouts.input),
                slice_buffers(&mut self.inputs, &layouts.input),
                relevance.clone(),
                comm.clone(),
            ),
            outputs: Vector::new(
                VectorKind::Output,
                Arc::clone(&layouts.output),
                slice_buffers(&mut self.outputs, &layouts.output),
                relevance.clone(),
                comm.clone(),
            ),
            residuals: Vector::new(
                VectorKind::Residual,
                Arc::clone(&layouts.output),
                slice_buffers(&mut self.residuals, &layouts.output),
                relevance.clone(),
                comm.clone(),
            ),
        }
    }
}

fn slice_buffers<'b>(buffers: &'b mut [Vec<f64>], layout: &VectorLayout) -> Vec<&'b mut [f64]> {
    buffers
        .iter_mut()
        .enumerate()
        .map(|(v, buffer)| &mut buffer[layout.base()[v]..layout.base()[v] + layout.lens()[v]])
        .collect()
}
