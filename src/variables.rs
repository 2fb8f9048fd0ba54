//! Variable declarations, promotion and the global variable index space.
//!
//! Every variable is either an input or an output. Within each kind, variables are numbered
//! depth-first over the whole model, so that every node of the hierarchy owns a contiguous range
//! of global indices and the same index names the same variable on every process.
use crate::connections::ConnectionIndex;
use crate::error::Error;
use itertools::Itertools;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut, Range};

/// The varset used for variables that do not request one explicitly.
pub const DEFAULT_VARSET: &str = "default";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    Input,
    Output,
}

impl VariableKind {
    pub const ALL: [VariableKind; 2] = [VariableKind::Input, VariableKind::Output];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariableKind::Input => "input",
            VariableKind::Output => "output",
        }
    }
}

/// A pair of values, one per variable kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerKind<T> {
    pub input: T,
    pub output: T,
}

impl<T> PerKind<T> {
    pub fn new(input: T, output: T) -> Self {
        Self { input, output }
    }

    pub fn from_fn(mut f: impl FnMut(VariableKind) -> T) -> Self {
        Self {
            input: f(VariableKind::Input),
            output: f(VariableKind::Output),
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(VariableKind, &T) -> U) -> PerKind<U> {
        PerKind {
            input: f(VariableKind::Input, &self.input),
            output: f(VariableKind::Output, &self.output),
        }
    }

    pub fn map_owned<U>(self, mut f: impl FnMut(VariableKind, T) -> U) -> PerKind<U> {
        PerKind {
            input: f(VariableKind::Input, self.input),
            output: f(VariableKind::Output, self.output),
        }
    }
}

impl<T> Index<VariableKind> for PerKind<T> {
    type Output = T;

    fn index(&self, kind: VariableKind) -> &T {
        match kind {
            VariableKind::Input => &self.input,
            VariableKind::Output => &self.output,
        }
    }
}

impl<T> IndexMut<VariableKind> for PerKind<T> {
    fn index_mut(&mut self, kind: VariableKind) -> &mut T {
        match kind {
            VariableKind::Input => &mut self.input,
            VariableKind::Output => &mut self.output,
        }
    }
}

/// Declaration of a single variable: shape, default value and varset.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    shape: Vec<usize>,
    value: Vec<f64>,
    varset: String,
}

impl Variable {
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: vec![1],
            value: vec![value],
            varset: DEFAULT_VARSET.to_string(),
        }
    }

    /// A variable with the given shape and row-major values.
    pub fn array(shape: &[usize], values: Vec<f64>) -> Self {
        Self {
            shape: shape.to_vec(),
            value: values,
            varset: DEFAULT_VARSET.to_string(),
        }
    }

    pub fn filled(shape: &[usize], value: f64) -> Self {
        let size = shape.iter().product();
        Self::array(shape, vec![value; size])
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn in_varset(mut self, varset: impl Into<String>) -> Self {
        self.varset = varset.into();
        self
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Metadata of a variable held by the leaf that declared it.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableMetadata {
    pub name: String,
    pub shape: Vec<usize>,
    pub value: Vec<f64>,
    pub varset: String,
    /// Entries of the connected output this input reads, if not all of them in order.
    pub src_indices: Option<Vec<usize>>,
}

impl VariableMetadata {
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_scalar(&self) -> bool {
        self.size() == 1
    }

    /// Applies a source-index selection to an input.
    ///
    /// A scalar input takes the shape of the selection, with its default value broadcast.
    /// Any other input must already have exactly as many entries as there are indices.
    pub(crate) fn apply_src_indices(&mut self, indices: &[usize]) -> Result<(), Error> {
        if indices.len() != self.size() {
            if !self.is_scalar() {
                return Err(Error::dimension(&self.name, self.size(), indices.len()));
            }
            let fill = self.value.first().copied().unwrap_or(0.0);
            self.shape = vec![indices.len()];
            self.value = vec![fill; indices.len()];
        }
        self.src_indices = Some(indices.to_vec());
        Ok(())
    }

    fn info(&self) -> VariableInfo {
        VariableInfo {
            name: self.name.clone(),
            size: self.size(),
            varset: self.varset.clone(),
        }
    }
}

/// Collects the variables a component declares.
#[derive(Debug, Clone, Default)]
pub struct VariableDeclarations {
    variables: PerKind<Vec<VariableMetadata>>,
}

impl VariableDeclarations {
    pub fn add_input(&mut self, name: &str, variable: Variable) -> Result<&mut Self, Error> {
        self.add(VariableKind::Input, name, variable)
    }

    pub fn add_output(&mut self, name: &str, variable: Variable) -> Result<&mut Self, Error> {
        self.add(VariableKind::Output, name, variable)
    }

    fn add(&mut self, kind: VariableKind, name: &str, variable: Variable) -> Result<&mut Self, Error> {
        validate_name(name)?;
        if self.variables[kind].iter().any(|v| v.name == name) {
            return Err(Error::configuration(format!(
                "{} '{}' is declared more than once",
                kind.as_str(),
                name
            )));
        }
        if variable.value.len() != variable.size() {
            return Err(Error::dimension(name, variable.size(), variable.value.len()));
        }
        if variable.size() == 0 {
            return Err(Error::configuration(format!("{} '{}' has no entries", kind.as_str(), name)));
        }
        self.variables[kind].push(VariableMetadata {
            name: name.to_string(),
            shape: variable.shape,
            value: variable.value,
            varset: variable.varset,
            src_indices: None,
        });
        Ok(self)
    }

    pub(crate) fn into_metadata(self) -> PerKind<Vec<VariableMetadata>> {
        self.variables
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.contains('.') {
        Err(Error::configuration(format!(
            "'{}' is not a valid local name: names must be non-empty and must not contain '.'",
            name
        )))
    } else {
        Ok(())
    }
}

/// What every process knows about a variable, whether or not it holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    /// The name in the namespace of the node holding this record.
    pub name: String,
    /// The declared number of entries.
    pub size: usize,
    pub varset: String,
}

pub(crate) fn leaf_infos(metadata: &PerKind<Vec<VariableMetadata>>) -> PerKind<Vec<VariableInfo>> {
    metadata.map(|_, vars| vars.iter().map(VariableMetadata::info).collect())
}

/// How the variables of a subsystem are named in its parent's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Promotions {
    pub any: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub renames: PerKind<Vec<(String, String)>>,
}

impl Promotions {
    /// Maps `name`, a variable of the subsystem `subsystem`, into the parent's namespace.
    ///
    /// Exact promotion takes precedence over wildcard promotion, which takes precedence over
    /// renaming. Anything else is prefixed with the subsystem name.
    pub fn map_name(&self, subsystem: &str, kind: VariableKind, name: &str) -> String {
        let patterns = if !self.any.is_empty() {
            &self.any
        } else {
            match kind {
                VariableKind::Input => &self.inputs,
                VariableKind::Output => &self.outputs,
            }
        };

        if patterns.iter().any(|p| p == name) {
            name.to_string()
        } else if patterns.iter().any(|p| wildcard_match(p, name)) {
            name.to_string()
        } else if let Some((_, new)) = self.renames[kind].iter().find(|(old, _)| old == name) {
            new.clone()
        } else {
            format!("{}.{}", subsystem, name)
        }
    }
}

/// Shell-style matching with `*` (any run of characters) and `?` (one character).
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            n = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// The variables of one node of the hierarchy, named in that node's namespace.
#[derive(Debug, Clone, Default)]
pub struct NodeVariables {
    /// Every variable of the subtree on every process, in global index order.
    pub(crate) allprocs: PerKind<Vec<VariableInfo>>,
    pub(crate) range: PerKind<Range<usize>>,
    by_name: PerKind<FxHashMap<String, Vec<usize>>>,
}

impl NodeVariables {
    pub(crate) fn new(allprocs: PerKind<Vec<VariableInfo>>) -> Self {
        Self {
            allprocs,
            ..Default::default()
        }
    }

    pub(crate) fn assign_range(&mut self, start: &PerKind<usize>) {
        for kind in VariableKind::ALL {
            let begin = start[kind];
            self.range[kind] = begin..begin + self.allprocs[kind].len();
            let mut by_name: FxHashMap<String, Vec<usize>> = FxHashMap::default();
            for (i, info) in self.allprocs[kind].iter().enumerate() {
                by_name.entry(info.name.clone()).or_default().push(begin + i);
            }
            self.by_name[kind] = by_name;
        }
    }

    /// Names of all variables of the given kind, in global index order, on all processes.
    pub fn names(&self, kind: VariableKind) -> impl Iterator<Item = &str> {
        self.allprocs[kind].iter().map(|info| info.name.as_str())
    }

    pub fn infos(&self, kind: VariableKind) -> &[VariableInfo] {
        &self.allprocs[kind]
    }

    pub fn len(&self, kind: VariableKind) -> usize {
        self.allprocs[kind].len()
    }

    pub fn is_empty(&self) -> bool {
        VariableKind::ALL.iter().all(|&kind| self.len(kind) == 0)
    }

    /// The global index range covered by this node.
    pub fn range(&self, kind: VariableKind) -> Range<usize> {
        self.range[kind].clone()
    }

    /// Global indices of all variables carrying `name` in this namespace.
    ///
    /// Several inputs may share one promoted name; outputs never do.
    pub fn global_indices(&self, kind: VariableKind, name: &str) -> &[usize] {
        self.by_name[kind].get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn info(&self, kind: VariableKind, global_index: usize) -> Option<&VariableInfo> {
        let range = &self.range[kind];
        if range.contains(&global_index) {
            self.allprocs[kind].get(global_index - range.start)
        } else {
            None
        }
    }

    pub fn name_of(&self, kind: VariableKind, global_index: usize) -> Option<&str> {
        self.info(kind, global_index).map(|info| info.name.as_str())
    }
}

/// Ensures no two outputs of a namespace share a name.
pub(crate) fn check_unique_outputs(path_name: &str, outputs: &[VariableInfo]) -> Result<(), Error> {
    if let Some(name) = outputs.iter().map(|info| &info.name).duplicates().next() {
        Err(Error::configuration(format!(
            "output name '{}' is used more than once in '{}'",
            name,
            display_path(path_name)
        )))
    } else {
        Ok(())
    }
}

pub(crate) fn display_path(path_name: &str) -> &str {
    if path_name.is_empty() {
        "<root>"
    } else {
        path_name
    }
}

/// Per global index information for the whole model, identical on every process.
#[derive(Debug, Clone)]
pub struct VariableTable {
    names: PerKind<Vec<String>>,
    sizes: PerKind<Vec<usize>>,
    varsets: PerKind<Vec<usize>>,
    varset_names: Vec<String>,
    owners: PerKind<Vec<usize>>,
    sources: Vec<Option<usize>>,
    src_indices: Vec<Option<Vec<usize>>>,
}

impl VariableTable {
    /// Builds the table from the root's variables, the resolved connections of the whole model
    /// and, for every world rank, the global index ranges of the leaves it holds.
    pub(crate) fn new(
        root: &NodeVariables,
        connections: &[ConnectionIndex],
        residency: &[PerKind<Vec<Range<usize>>>],
    ) -> Result<Self, Error> {
        let varset_names: Vec<String> = VariableKind::ALL
            .iter()
            .flat_map(|&kind| root.infos(kind).iter().map(|info| info.varset.clone()))
            .sorted()
            .dedup()
            .collect();
        let varset_id = |name: &str| {
            varset_names
                .binary_search_by(|probe| probe.as_str().cmp(name))
                .expect("varset names are collected from the same infos")
        };

        let names: PerKind<Vec<String>> = PerKind::from_fn(|kind| root.names(kind).map(str::to_string).collect());
        let mut sizes: PerKind<Vec<usize>> =
            PerKind::from_fn(|kind| root.infos(kind).iter().map(|info| info.size).collect());
        let varsets: PerKind<Vec<usize>> =
            PerKind::from_fn(|kind| root.infos(kind).iter().map(|info| varset_id(&info.varset)).collect());

        let num_inputs = root.len(VariableKind::Input);
        let mut sources = vec![None; num_inputs];
        let mut src_indices = vec![None; num_inputs];
        for connection in connections {
            sources[connection.input] = Some(connection.output);
            if let Some(indices) = &connection.src_indices {
                sizes.input[connection.input] = indices.len();
                src_indices[connection.input] = Some(indices.clone());
            }
        }

        let mut owners = PerKind::from_fn(|kind| vec![usize::MAX; root.len(kind)]);
        for (rank, ranges) in residency.iter().enumerate() {
            for kind in VariableKind::ALL {
                for range in &ranges[kind] {
                    for global_index in range.clone() {
                        let owner = &mut owners[kind][global_index];
                        *owner = (*owner).min(rank);
                    }
                }
            }
        }
        for kind in VariableKind::ALL {
            if let Some(orphan) = owners[kind].iter().position(|&owner| owner == usize::MAX) {
                return Err(Error::configuration(format!(
                    "{} '{}' is not held by any process",
                    kind.as_str(),
                    names[kind][orphan]
                )));
            }
        }

        Ok(Self {
            names,
            sizes,
            varsets,
            varset_names,
            owners,
            sources,
            src_indices,
        })
    }

    pub fn len(&self, kind: VariableKind) -> usize {
        self.sizes[kind].len()
    }

    pub fn is_empty(&self) -> bool {
        VariableKind::ALL.iter().all(|&kind| self.len(kind) == 0)
    }

    /// The fully promoted name of a variable.
    pub fn name(&self, kind: VariableKind, global_index: usize) -> &str {
        &self.names[kind][global_index]
    }

    pub fn size(&self, kind: VariableKind, global_index: usize) -> usize {
        self.sizes[kind][global_index]
    }

    pub fn varset(&self, kind: VariableKind, global_index: usize) -> usize {
        self.varsets[kind][global_index]
    }

    pub fn varset_names(&self) -> &[String] {
        &self.varset_names
    }

    /// The lowest world rank holding the variable.
    pub fn owner(&self, kind: VariableKind, global_index: usize) -> usize {
        self.owners[kind][global_index]
    }

    /// The output connected to an input, if any.
    pub fn source(&self, input: usize) -> Option<usize> {
        self.sources[input]
    }

    pub fn src_indices(&self, input: usize) -> Option<&[usize]> {
        self.src_indices[input].as_deref()
    }
}
