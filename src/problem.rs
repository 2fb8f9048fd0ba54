//! The top-level driver: setup of a model and evaluation entry points.
use crate::error::Error;
use crate::system::System;
use crate::transfer::Mode;
use crate::variables::{display_path, PerKind, VariableKind, VariableTable};
use crate::vector::{Relevance, RootVectors, SystemVectors, VectorName};
use log::{debug, info};
use mdao_comm::Comm;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The name of the linear vector set that is always allocated.
pub const DEFAULT_LINEAR_VECTOR: &str = "linear";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemOptions {
    /// Initial solver-print flag of every system.
    pub solver_print: bool,
}

#[derive(Debug)]
struct VectorStore {
    nonlinear: RootVectors,
    linear: FxHashMap<String, RootVectors>,
}

#[derive(Debug)]
struct SetupState {
    table: VariableTable,
    vectors: VectorStore,
}

/// Setup mutates the system tree, so a failed setup cannot be retried.
#[derive(Debug)]
enum SetupStatus {
    Pending,
    Failed,
    Ready(SetupState),
}

/// A model together with the communicator it runs on and its vectors.
#[derive(Debug)]
pub struct Problem {
    root: System,
    comm: Comm,
    options: ProblemOptions,
    /// Additional linear vectors and the root output names they are restricted to.
    extra_vectors: Vec<(String, Vec<String>)>,
    status: SetupStatus,
}

impl Problem {
    pub fn new(root: System) -> Self {
        Self {
            root,
            comm: Comm::serial(),
            options: ProblemOptions::default(),
            extra_vectors: Vec::new(),
            status: SetupStatus::Pending,
        }
    }

    /// Runs the problem on the processes of `comm`, which is treated as the world.
    pub fn with_comm(mut self, comm: Comm) -> Self {
        self.comm = comm;
        self
    }

    pub fn with_options(mut self, options: ProblemOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers a linear vector set restricted to the given outputs, named in the root
    /// namespace, and the inputs connected to them.
    pub fn add_vector(&mut self, name: &str, relevant_outputs: &[&str]) -> Result<(), Error> {
        if !matches!(self.status, SetupStatus::Pending) {
            return Err(Error::configuration("vectors must be added before setup"));
        }
        if name == DEFAULT_LINEAR_VECTOR || self.extra_vectors.iter().any(|(n, _)| n == name) {
            return Err(Error::configuration(format!("vector '{}' already exists", name)));
        }
        self.extra_vectors.push((
            name.to_string(),
            relevant_outputs.iter().map(|s| s.to_string()).collect(),
        ));
        Ok(())
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    pub fn root(&self) -> &System {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut System {
        &mut self.root
    }

    /// A resident system by path. The empty path names the root.
    pub fn system(&self, path: &str) -> Result<&System, Error> {
        self.root.get_subsystem(path).ok_or_else(|| not_resident(path))
    }

    pub fn system_mut(&mut self, path: &str) -> Result<&mut System, Error> {
        self.root.get_subsystem_mut(path).ok_or_else(|| not_resident(path))
    }

    pub fn is_set_up(&self) -> bool {
        matches!(self.status, SetupStatus::Ready(_))
    }

    pub fn variable_table(&self) -> Result<&VariableTable, Error> {
        Ok(&self.state()?.table)
    }

    fn state(&self) -> Result<&SetupState, Error> {
        match &self.status {
            SetupStatus::Ready(state) => Ok(state),
            SetupStatus::Pending => Err(Error::configuration("the problem has not been set up")),
            SetupStatus::Failed => Err(setup_failed()),
        }
    }

    /// Configures the model: process allocation, variables, global indices, connections,
    /// vector layouts, transfers and partial derivatives, then allocates the vectors.
    ///
    /// Collective over the problem's communicator. After a failure the problem stays unusable.
    pub fn setup(&mut self) -> Result<(), Error> {
        match self.status {
            SetupStatus::Pending => {}
            SetupStatus::Ready(_) => return Err(Error::configuration("the problem has already been set up")),
            SetupStatus::Failed => return Err(setup_failed()),
        }
        match self.configure() {
            Ok(state) => {
                self.status = SetupStatus::Ready(state);
                Ok(())
            }
            Err(err) => {
                self.status = SetupStatus::Failed;
                Err(err)
            }
        }
    }

    fn configure(&mut self) -> Result<SetupState, Error> {
        let world_rank = self.comm.rank();
        let procs = 0..self.comm.size();
        let root = &mut self.root;

        root.setup_processors(String::new(), 0, self.comm.clone(), procs, self.options.solver_print)?;
        root.setup_variables()?;
        root.setup_indices(PerKind::default());
        root.setup_connections()?;

        let residency = self.comm.all_gather(&root.resident_leaf_ranges())?;
        let table = VariableTable::new(root.variables(), root.connections(), &residency)?;

        let mut counters = PerKind::from_fn(|_| vec![0; table.varset_names().len()]);
        root.setup_layouts(&table, world_rank, &mut counters);
        root.setup_transfers(&table);
        root.setup_partials(None)?;

        let mut nonlinear = RootVectors::allocate(root.layouts(), None);
        write_defaults(root, &mut nonlinear)?;
        let mut linear = FxHashMap::default();
        linear.insert(
            DEFAULT_LINEAR_VECTOR.to_string(),
            RootVectors::allocate(root.layouts(), None),
        );
        for (name, outputs) in &self.extra_vectors {
            let relevance = relevance(root, &table, outputs)?;
            linear.insert(name.clone(), RootVectors::allocate(root.layouts(), Some(Arc::new(relevance))));
        }

        info!(
            "setup complete on rank {}: {} inputs, {} outputs, {} connections",
            world_rank,
            table.len(VariableKind::Input),
            table.len(VariableKind::Output),
            root.connections().len()
        );
        Ok(SetupState {
            table,
            vectors: VectorStore { nonlinear, linear },
        })
    }

    fn parts(&mut self) -> Result<(&mut System, &mut VectorStore), Error> {
        match &mut self.status {
            SetupStatus::Ready(state) => Ok((&mut self.root, &mut state.vectors)),
            SetupStatus::Pending => Err(Error::configuration("the problem has not been set up")),
            SetupStatus::Failed => Err(setup_failed()),
        }
    }

    /// The vectors of a resident system.
    pub fn vectors(&mut self, path: &str, name: &VectorName) -> Result<SystemVectors<'_>, Error> {
        let (root, store) = self.parts()?;
        let system = root.get_subsystem(path).ok_or_else(|| not_resident(path))?;
        let storage = match name {
            VectorName::Nonlinear => &mut store.nonlinear,
            VectorName::Linear(linear) => store
                .linear
                .get_mut(linear)
                .ok_or_else(|| Error::configuration(format!("no vector named '{}'", linear)))?,
        };
        Ok(storage.views(system.layouts(), system.comm()))
    }

    pub fn run_solve_nonlinear(&mut self) -> eyre::Result<()> {
        let (root, store) = self.parts()?;
        let mut vectors = store.nonlinear.views(root.layouts(), root.comm());
        root.solve_nonlinear(&mut vectors)
    }

    pub fn run_apply_nonlinear(&mut self) -> eyre::Result<()> {
        let (root, store) = self.parts()?;
        let mut vectors = store.nonlinear.views(root.layouts(), root.comm());
        root.apply_nonlinear(&mut vectors)
    }

    pub fn run_linearize(&mut self) -> eyre::Result<()> {
        let (root, store) = self.parts()?;
        let mut vectors = store.nonlinear.views(root.layouts(), root.comm());
        root.linearize(&mut vectors)
    }

    /// Applies the jacobian of the whole model to the linear vector set `name`.
    pub fn run_apply_linear(&mut self, name: &str, mode: Mode) -> eyre::Result<()> {
        let (root, store) = self.parts()?;
        let (mut nonlinear, mut linear) = store.pair(name, root)?;
        root.apply_linear(&mut nonlinear, &mut linear, mode, true)
    }

    /// Solves with the jacobian of the whole model on the linear vector set `name`.
    pub fn run_solve_linear(&mut self, name: &str, mode: Mode) -> eyre::Result<()> {
        let (root, store) = self.parts()?;
        let (mut nonlinear, mut linear) = store.pair(name, root)?;
        root.solve_linear(&mut nonlinear, &mut linear, mode)
    }
}

impl VectorStore {
    fn pair<'s>(&'s mut self, name: &str, root: &System) -> Result<(SystemVectors<'s>, SystemVectors<'s>), Error> {
        let linear = self
            .linear
            .get_mut(name)
            .ok_or_else(|| Error::configuration(format!("no vector named '{}'", name)))?;
        Ok((
            self.nonlinear.views(root.layouts(), root.comm()),
            linear.views(root.layouts(), root.comm()),
        ))
    }
}

fn setup_failed() -> Error {
    Error::configuration("a previous setup of this problem failed")
}

fn not_resident(path: &str) -> Error {
    Error::configuration(format!("system '{}' is not resident on this process", display_path(path)))
}

/// Initializes the nonlinear vectors with the declared default values.
fn write_defaults(root: &System, vectors: &mut RootVectors) -> Result<(), Error> {
    let mut views = vectors.views(root.layouts(), root.comm());
    for kind in VariableKind::ALL {
        let vector = match kind {
            VariableKind::Input => &mut views.inputs,
            VariableKind::Output => &mut views.outputs,
        };
        let layout = Arc::clone(&root.layouts()[kind]);
        let mut flat = vector.get_flat();
        for leaf in root.leaves() {
            let start = leaf.variables().range(kind).start;
            for (offset, meta) in leaf.metadata(kind).iter().enumerate() {
                if let Some(view) = layout.view_by_global(start + offset) {
                    flat[layout.flat_range(view)].copy_from_slice(&meta.value);
                }
            }
        }
        vector.set_flat(&flat)?;
    }
    debug!("initialized default values");
    Ok(())
}

/// The outputs named in `outputs` and the inputs they feed.
fn relevance(root: &System, table: &VariableTable, outputs: &[String]) -> Result<Relevance, Error> {
    let mut relevance = Relevance::default();
    for name in outputs {
        let indices = root.variables().global_indices(VariableKind::Output, name);
        if indices.is_empty() {
            return Err(Error::VariableNotFound(name.clone()));
        }
        relevance.outputs.extend(indices.iter().copied());
    }
    relevance.inputs = (0..table.len(VariableKind::Input))
        .filter(|&input| {
            table
                .source(input)
                .map(|output| relevance.outputs.contains(&output))
                .unwrap_or(false)
        })
        .collect::<FxHashSet<_>>();
    Ok(relevance)
}
