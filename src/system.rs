//! The model hierarchy.
//!
//! A [`System`] is either a group of subsystems or a leaf wrapping a [`Component`]. Systems are
//! assembled with the builder methods, then configured by [`Problem::setup`](crate::Problem::setup)
//! in a fixed sequence of passes. After setup, every process holds only the part of the tree that
//! is resident on it: the path from the root plus the subsystems allocated to its processes.
use crate::component::{Component, Explicit, ExplicitComponent, ProcessorInfo};
use crate::connections::{self, ConnectionIndex, DeclaredConnection};
use crate::error::Error;
use crate::jacobian::{AssembledJacobian, BlockPlacement, JacobianAttachment, JacobianKind, Partials};
use crate::proc_allocator::{validate_plan, DefaultProcAllocator, ProcAllocator, ProcRange};
use crate::solvers::{LinearRunOnce, LinearSolver, NonlinearRunOnce, NonlinearSolver};
use crate::transfer::{Mode, TransferSet};
use crate::variables::{
    check_unique_outputs, display_path, leaf_infos, validate_name, NodeVariables, PerKind, Promotions,
    VariableDeclarations, VariableInfo, VariableKind, VariableMetadata, VariableTable,
};
use crate::vector::{SystemVectors, VectorLayout, ViewSpec};
use eyre::WrapErr;
use log::debug;
use mdao_comm::Comm;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Selects one of the transfers of a group.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferSelection {
    Full,
    /// Connections into the given subsystem from subsystems executing before it.
    Forward(usize),
    /// Connections into the given subsystem from subsystems executing after it.
    Reverse(usize),
}

#[derive(Debug)]
pub struct System {
    name: String,
    path_name: String,
    depth: usize,
    promotions: Promotions,
    proc_weight: usize,
    comm: Comm,
    proc_range: ProcRange,
    solver_print: bool,
    jacobian: JacobianAttachment,
    variables: NodeVariables,
    connections: Vec<ConnectionIndex>,
    layouts: PerKind<Arc<VectorLayout>>,
    is_set_up: bool,
    node: Node,
}

#[derive(Debug)]
enum Node {
    Group(Group),
    Leaf(Leaf),
}

#[derive(Debug)]
struct Group {
    /// All subsystems before setup, the resident ones afterwards.
    subsystems: Vec<System>,
    /// Positions of the resident subsystems among all subsystems.
    subsystem_indices: Vec<usize>,
    subsystem_names: Vec<String>,
    declared: Vec<DeclaredConnection>,
    allocator: Box<dyn ProcAllocator>,
    /// Number of variables of every subsystem, on all processes.
    child_counts: PerKind<Vec<usize>>,
    /// Global index ranges of every subsystem.
    child_ranges: PerKind<Vec<Range<usize>>>,
    transfers: Option<TransferSet>,
    nonlinear_solver: Arc<dyn NonlinearSolver>,
    linear_solver: Arc<dyn LinearSolver>,
    assembled: Option<AssembledJacobian>,
}

struct Leaf {
    component: Box<dyn Component>,
    metadata: PerKind<Vec<VariableMetadata>>,
    partials: Partials,
}

impl fmt::Debug for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leaf")
            .field("metadata", &self.metadata)
            .field("partials", &self.partials)
            .finish_non_exhaustive()
    }
}

fn empty_layouts() -> PerKind<Arc<VectorLayout>> {
    PerKind::from_fn(|kind| Arc::new(VectorLayout::new(kind, Vec::new(), Vec::new(), Vec::new())))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

impl System {
    fn new(name: &str, node: Node) -> Self {
        Self {
            name: name.to_string(),
            path_name: String::new(),
            depth: 0,
            promotions: Promotions::default(),
            proc_weight: 1,
            comm: Comm::serial(),
            proc_range: 0..1,
            solver_print: false,
            jacobian: JacobianAttachment::default(),
            variables: NodeVariables::default(),
            connections: Vec::new(),
            layouts: empty_layouts(),
            is_set_up: false,
            node,
        }
    }

    pub fn group(name: &str) -> Self {
        Self::new(
            name,
            Node::Group(Group {
                subsystems: Vec::new(),
                subsystem_indices: Vec::new(),
                subsystem_names: Vec::new(),
                declared: Vec::new(),
                allocator: Box::new(DefaultProcAllocator),
                child_counts: PerKind::default(),
                child_ranges: PerKind::default(),
                transfers: None,
                nonlinear_solver: Arc::new(NonlinearRunOnce),
                linear_solver: Arc::new(LinearRunOnce),
                assembled: None,
            }),
        )
    }

    pub fn component(name: &str, component: impl Component + 'static) -> Self {
        Self::new(
            name,
            Node::Leaf(Leaf {
                component: Box::new(component),
                metadata: PerKind::default(),
                partials: Partials::default(),
            }),
        )
    }

    /// A leaf holding an explicit component.
    pub fn explicit(name: &str, component: impl ExplicitComponent + 'static) -> Self {
        Self::component(name, Explicit(component))
    }

    fn group_mut(&mut self, operation: &str) -> Result<&mut Group, Error> {
        match &mut self.node {
            Node::Group(group) => Ok(group),
            Node::Leaf(_) => Err(Error::configuration(format!(
                "cannot {} on '{}': it is not a group",
                operation, self.name
            ))),
        }
    }

    pub fn add_subsystem(&mut self, subsystem: System) -> Result<&mut Self, Error> {
        validate_name(&subsystem.name)?;
        let name = self.name.clone();
        let group = self.group_mut("add a subsystem")?;
        if group.subsystem_names.contains(&subsystem.name) {
            return Err(Error::configuration(format!(
                "group '{}' already has a subsystem named '{}'",
                name, subsystem.name
            )));
        }
        group.subsystem_names.push(subsystem.name.clone());
        group.subsystems.push(subsystem);
        Ok(self)
    }

    /// Connects the output `source` to the input `target`, both named in this group's namespace.
    pub fn connect(&mut self, source: &str, target: &str) -> Result<&mut Self, Error> {
        self.declare_connection(source, target, None)
    }

    /// Connects selected entries of the output `source` to the input `target`.
    pub fn connect_with_indices(&mut self, source: &str, target: &str, indices: &[usize]) -> Result<&mut Self, Error> {
        self.declare_connection(source, target, Some(indices.to_vec()))
    }

    fn declare_connection(
        &mut self,
        source: &str,
        target: &str,
        src_indices: Option<Vec<usize>>,
    ) -> Result<&mut Self, Error> {
        self.group_mut("connect variables")?
            .declared
            .push(DeclaredConnection {
                source: source.to_string(),
                target: target.to_string(),
                src_indices,
            });
        Ok(self)
    }

    pub fn set_proc_allocator(&mut self, allocator: Box<dyn ProcAllocator>) -> Result<&mut Self, Error> {
        self.group_mut("set a process allocator")?.allocator = allocator;
        Ok(self)
    }

    pub fn set_nonlinear_solver(&mut self, solver: impl NonlinearSolver + 'static) -> Result<&mut Self, Error> {
        self.group_mut("set a nonlinear solver")?.nonlinear_solver = Arc::new(solver);
        Ok(self)
    }

    pub fn set_linear_solver(&mut self, solver: impl LinearSolver + 'static) -> Result<&mut Self, Error> {
        self.group_mut("set a linear solver")?.linear_solver = Arc::new(solver);
        Ok(self)
    }

    /// Promotes variables of either kind matching the given names or patterns.
    ///
    /// When set, this list replaces the per-kind lists.
    pub fn promotes(mut self, names: &[&str]) -> Self {
        self.promotions.any.extend(names.iter().map(|s| s.to_string()));
        self
    }

    pub fn promotes_inputs(mut self, names: &[&str]) -> Self {
        self.promotions.inputs.extend(names.iter().map(|s| s.to_string()));
        self
    }

    pub fn promotes_outputs(mut self, names: &[&str]) -> Self {
        self.promotions.outputs.extend(names.iter().map(|s| s.to_string()));
        self
    }

    pub fn rename_input(mut self, old: &str, new: &str) -> Self {
        self.promotions.renames.input.push((old.to_string(), new.to_string()));
        self
    }

    pub fn rename_output(mut self, old: &str, new: &str) -> Self {
        self.promotions.renames.output.push((old.to_string(), new.to_string()));
        self
    }

    /// The weight used when processes are shared among siblings.
    pub fn with_proc_weight(mut self, weight: usize) -> Self {
        self.proc_weight = weight;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The dot-separated path from the root. Empty for the root.
    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// The world ranks this system runs on.
    pub fn proc_range(&self) -> ProcRange {
        self.proc_range.clone()
    }

    pub fn solver_print(&self) -> bool {
        self.solver_print
    }

    pub fn jacobian(&self) -> JacobianAttachment {
        self.jacobian
    }

    pub fn is_group(&self) -> bool {
        matches!(self.node, Node::Group(_))
    }

    pub fn variables(&self) -> &NodeVariables {
        &self.variables
    }

    /// The resolved connections of this system's subtree.
    pub fn connections(&self) -> &[ConnectionIndex] {
        &self.connections
    }

    pub fn layouts(&self) -> &PerKind<Arc<VectorLayout>> {
        &self.layouts
    }

    /// The subsystems held by this process.
    pub fn subsystems(&self) -> &[System] {
        match &self.node {
            Node::Group(group) => &group.subsystems,
            Node::Leaf(_) => &[],
        }
    }

    /// Positions of the resident subsystems among all subsystems of the group.
    pub fn subsystem_indices(&self) -> &[usize] {
        match &self.node {
            Node::Group(group) => &group.subsystem_indices,
            Node::Leaf(_) => &[],
        }
    }

    /// The number of subsystems on all processes.
    pub fn num_subsystems(&self) -> usize {
        match &self.node {
            Node::Group(group) => group.subsystem_names.len(),
            Node::Leaf(_) => 0,
        }
    }

    pub fn transfers(&self) -> Option<&TransferSet> {
        match &self.node {
            Node::Group(group) => group.transfers.as_ref(),
            Node::Leaf(_) => None,
        }
    }

    pub fn partials(&self) -> Option<&Partials> {
        match &self.node {
            Node::Leaf(leaf) => Some(&leaf.partials),
            Node::Group(_) => None,
        }
    }

    pub fn assembled_jacobian(&self) -> Option<&AssembledJacobian> {
        match &self.node {
            Node::Group(group) => group.assembled.as_ref(),
            Node::Leaf(_) => None,
        }
    }

    /// Metadata of the variables declared by a leaf.
    pub fn metadata(&self, kind: VariableKind) -> &[VariableMetadata] {
        match &self.node {
            Node::Leaf(leaf) => &leaf.metadata[kind],
            Node::Group(_) => &[],
        }
    }

    /// Finds a resident descendant by its path relative to this system.
    pub fn get_subsystem(&self, path: &str) -> Option<&System> {
        if path.is_empty() {
            return Some(self);
        }
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        self.subsystems()
            .iter()
            .find(|child| child.name == head)
            .and_then(|child| child.get_subsystem(rest))
    }

    pub fn get_subsystem_mut(&mut self, path: &str) -> Option<&mut System> {
        if path.is_empty() {
            return Some(self);
        }
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        match &mut self.node {
            Node::Group(group) => group
                .subsystems
                .iter_mut()
                .find(|child| child.name == head)
                .and_then(|child| child.get_subsystem_mut(rest)),
            Node::Leaf(_) => None,
        }
    }

    /// The resident subsystem at position `index` among all subsystems.
    pub fn subsystem_mut(&mut self, index: usize) -> Option<&mut System> {
        match &mut self.node {
            Node::Group(group) => group
                .subsystem_indices
                .iter()
                .position(|&i| i == index)
                .map(move |position| &mut group.subsystems[position]),
            Node::Leaf(_) => None,
        }
    }

    /// Sets the solver-print flag of this system and all resident descendants.
    pub fn set_solver_print(&mut self, print: bool) {
        self.solver_print = print;
        if let Node::Group(group) = &mut self.node {
            for child in &mut group.subsystems {
                child.set_solver_print(print);
            }
        }
    }

    /// Attaches a jacobian to this system and every resident descendant.
    ///
    /// A global jacobian is assembled at this system. When called after setup, the assembled
    /// matrices are rebuilt immediately.
    pub fn set_jacobian(&mut self, kind: JacobianKind) -> Result<(), Error> {
        self.jacobian = JacobianAttachment { kind, is_top: true };
        if let Node::Group(group) = &mut self.node {
            for child in &mut group.subsystems {
                child.inherit_jacobian(kind);
            }
        }
        if self.is_set_up {
            self.setup_partials(None)?;
        }
        Ok(())
    }

    fn inherit_jacobian(&mut self, kind: JacobianKind) {
        self.jacobian = JacobianAttachment { kind, is_top: false };
        if let Node::Group(group) = &mut self.node {
            for child in &mut group.subsystems {
                child.inherit_jacobian(kind);
            }
        }
    }

    /// Records the process context of the subtree and drops the subsystems not allocated to
    /// this process.
    pub(crate) fn setup_processors(
        &mut self,
        path_name: String,
        depth: usize,
        comm: Comm,
        procs: ProcRange,
        solver_print: bool,
    ) -> Result<(), Error> {
        self.path_name = path_name;
        self.depth = depth;
        self.comm = comm;
        self.proc_range = procs;
        self.solver_print = solver_print;

        match &mut self.node {
            Node::Leaf(leaf) => {
                let info = ProcessorInfo {
                    path_name: &self.path_name,
                    comm: &self.comm,
                    procs: self.proc_range.clone(),
                };
                leaf.component.initialize_processors(&info)
            }
            Node::Group(group) => {
                let weights: Vec<usize> = group.subsystems.iter().map(|child| child.proc_weight).collect();
                let plan = group.allocator.allocate(&weights, self.proc_range.clone())?;
                validate_plan(&self.path_name, &plan, weights.len(), &self.proc_range)?;
                if plan.is_empty() {
                    return Ok(());
                }

                let my_proc = self.proc_range.start + self.comm.rank();
                let color = plan
                    .iter()
                    .position(|assignment| assignment.procs.contains(&my_proc))
                    .ok_or_else(|| {
                        Error::configuration(format!(
                            "process {} is outside the range {:?} of '{}'",
                            my_proc,
                            self.proc_range,
                            display_path(&self.path_name)
                        ))
                    })?;
                let assignment = plan[color].clone();
                let sub_comm = self.comm.split(color);
                debug!(
                    "'{}': process {} runs subsystems {:?} on processes {:?}",
                    display_path(&self.path_name),
                    my_proc,
                    assignment.children,
                    assignment.procs
                );

                let mut resident = Vec::new();
                for (index, child) in group.subsystems.drain(..).enumerate() {
                    if assignment.children.contains(&index) {
                        resident.push(child);
                    }
                }
                group.subsystems = resident;
                group.subsystem_indices = assignment.children.clone().collect();

                for child in &mut group.subsystems {
                    let child_path = join_path(&self.path_name, &child.name);
                    child.setup_processors(
                        child_path,
                        depth + 1,
                        sub_comm.clone(),
                        assignment.procs.clone(),
                        solver_print,
                    )?;
                }
                Ok(())
            }
        }
    }

    /// Collects variable declarations bottom-up and builds the complete name lists of every
    /// namespace.
    pub(crate) fn setup_variables(&mut self) -> Result<(), Error> {
        match &mut self.node {
            Node::Leaf(leaf) => {
                let mut declarations = VariableDeclarations::default();
                leaf.component.declare_variables(&mut declarations)?;
                leaf.metadata = declarations.into_metadata();
                self.variables = NodeVariables::new(leaf_infos(&leaf.metadata));
            }
            Node::Group(group) => {
                let mut local: Vec<(usize, PerKind<Vec<VariableInfo>>)> = Vec::new();
                for (child, &index) in group.subsystems.iter_mut().zip(&group.subsystem_indices) {
                    child.setup_variables()?;
                    let promoted = child.variables.allprocs.map(|kind, infos| {
                        infos
                            .iter()
                            .map(|info| VariableInfo {
                                name: child.promotions.map_name(&child.name, kind, &info.name),
                                ..info.clone()
                            })
                            .collect::<Vec<_>>()
                    });
                    local.push((index, promoted));
                }

                let mut all = if self.comm.size() > 1 {
                    // One representative per subsystem communicator contributes
                    let representative = group
                        .subsystems
                        .first()
                        .map(|child| child.comm.rank() == 0)
                        .unwrap_or(false);
                    let contribution = if representative { local } else { Vec::new() };
                    let mut gathered: Vec<_> = self.comm.all_gather(&contribution)?.into_iter().flatten().collect();
                    gathered.sort_by_key(|(index, _)| *index);
                    gathered.dedup_by_key(|(index, _)| *index);
                    gathered
                } else {
                    local
                };
                all.sort_by_key(|(index, _)| *index);
                if all.len() != group.subsystem_names.len() {
                    return Err(Error::Communication(format!(
                        "'{}' received variables of {} out of {} subsystems",
                        display_path(&self.path_name),
                        all.len(),
                        group.subsystem_names.len()
                    )));
                }

                group.child_counts = PerKind::from_fn(|kind| all.iter().map(|(_, infos)| infos[kind].len()).collect());
                let allprocs = PerKind::from_fn(|kind| {
                    all.iter()
                        .flat_map(|(_, infos)| infos[kind].iter().cloned())
                        .collect::<Vec<_>>()
                });
                self.variables = NodeVariables::new(allprocs);
            }
        }
        check_unique_outputs(&self.path_name, self.variables.infos(VariableKind::Output))?;
        debug!(
            "'{}' has {} inputs and {} outputs",
            display_path(&self.path_name),
            self.variables.len(VariableKind::Input),
            self.variables.len(VariableKind::Output)
        );
        Ok(())
    }

    /// Assigns global index ranges depth-first, starting from `start`.
    pub(crate) fn setup_indices(&mut self, start: PerKind<usize>) {
        self.variables.assign_range(&start);
        if let Node::Group(group) = &mut self.node {
            group.child_ranges = group.child_counts.map(|kind, counts| {
                let mut counter = start[kind];
                counts
                    .iter()
                    .map(|&count| {
                        let range = counter..counter + count;
                        counter += count;
                        range
                    })
                    .collect()
            });
            for (child, &index) in group.subsystems.iter_mut().zip(&group.subsystem_indices) {
                let child_start = PerKind::from_fn(|kind| group.child_ranges[kind][index].start);
                child.setup_indices(child_start);
            }
        }
    }

    /// Resolves the connections of the subtree bottom-up.
    pub(crate) fn setup_connections(&mut self) -> Result<(), Error> {
        let Node::Group(group) = &mut self.node else {
            self.connections = Vec::new();
            return Ok(());
        };

        let mut local: Vec<(usize, Vec<ConnectionIndex>)> = Vec::new();
        for (child, &index) in group.subsystems.iter_mut().zip(&group.subsystem_indices) {
            child.setup_connections()?;
            local.push((index, child.connections.clone()));
        }
        let from_children: Vec<ConnectionIndex> = if self.comm.size() > 1 {
            let representative = group
                .subsystems
                .first()
                .map(|child| child.comm.rank() == 0)
                .unwrap_or(false);
            let contribution = if representative { local } else { Vec::new() };
            let mut gathered: Vec<_> = self.comm.all_gather(&contribution)?.into_iter().flatten().collect();
            gathered.sort_by_key(|(index, _)| *index);
            gathered.dedup_by_key(|(index, _)| *index);
            gathered.into_iter().flat_map(|(_, list)| list).collect()
        } else {
            local.into_iter().flat_map(|(_, list)| list).collect()
        };

        let declared = connections::resolve_declared(&self.path_name, &self.variables, &group.declared)?;
        let implicit = connections::resolve_implicit(&self.variables, &group.child_ranges);
        let own: Vec<ConnectionIndex> = declared.iter().chain(&implicit).cloned().collect();
        self.connections = connections::merge(
            &self.path_name,
            &self.variables,
            from_children.into_iter().chain(own.iter().cloned()),
        )?;

        for connection in &own {
            if let Some(indices) = &connection.src_indices {
                self.apply_src_indices(connection.input, indices)?;
            }
        }
        Ok(())
    }

    /// Updates the metadata of a locally held input that reads selected source entries.
    fn apply_src_indices(&mut self, input: usize, indices: &[usize]) -> Result<(), Error> {
        let range = self.variables.range(VariableKind::Input);
        if !range.contains(&input) {
            return Ok(());
        }
        match &mut self.node {
            Node::Leaf(leaf) => leaf.metadata.input[input - range.start].apply_src_indices(indices),
            Node::Group(group) => {
                for child in &mut group.subsystems {
                    child.apply_src_indices(input, indices)?;
                }
                Ok(())
            }
        }
    }

    /// Global index ranges of the leaves held by this process.
    pub(crate) fn resident_leaf_ranges(&self) -> PerKind<Vec<Range<usize>>> {
        let mut ranges = PerKind::<Vec<Range<usize>>>::default();
        self.collect_leaf_ranges(&mut ranges);
        ranges
    }

    fn collect_leaf_ranges(&self, ranges: &mut PerKind<Vec<Range<usize>>>) {
        match &self.node {
            Node::Leaf(_) => {
                for kind in VariableKind::ALL {
                    ranges[kind].push(self.variables.range(kind));
                }
            }
            Node::Group(group) => {
                for child in &group.subsystems {
                    child.collect_leaf_ranges(ranges);
                }
            }
        }
    }

    /// Places the variables held by this process in the varset buffers.
    ///
    /// `counters` holds, per kind and varset, the next free offset of the process-wide buffers.
    pub(crate) fn setup_layouts(
        &mut self,
        table: &VariableTable,
        world_rank: usize,
        counters: &mut PerKind<Vec<usize>>,
    ) {
        let base = counters.clone();
        let views: PerKind<Vec<ViewSpec>> = match &mut self.node {
            Node::Leaf(leaf) => PerKind::from_fn(|kind| {
                let start = self.variables.range(kind).start;
                leaf.metadata[kind]
                    .iter()
                    .enumerate()
                    .map(|(offset, meta)| {
                        let global_index = start + offset;
                        let varset = table.varset(kind, global_index);
                        let len = table.size(kind, global_index);
                        let view = ViewSpec {
                            name: meta.name.clone(),
                            global_index,
                            varset,
                            offset: counters[kind][varset],
                            len,
                            shape: meta.shape.clone(),
                            scalar: len == 1,
                            owned: table.owner(kind, global_index) == world_rank,
                        };
                        counters[kind][varset] += len;
                        view
                    })
                    .collect()
            }),
            Node::Group(group) => {
                for child in &mut group.subsystems {
                    child.setup_layouts(table, world_rank, counters);
                }
                let variables = &self.variables;
                PerKind::from_fn(|kind| {
                    group
                        .subsystems
                        .iter()
                        .flat_map(|child| child.layouts[kind].views().iter())
                        .map(|view| ViewSpec {
                            name: variables
                                .name_of(kind, view.global_index)
                                .unwrap_or(&view.name)
                                .to_string(),
                            ..view.clone()
                        })
                        .collect()
                })
            }
        };

        self.layouts = views.map_owned(|kind, views| {
            let lens = counters[kind]
                .iter()
                .zip(&base[kind])
                .map(|(end, start)| end - start)
                .collect();
            Arc::new(VectorLayout::new(kind, base[kind].clone(), lens, views))
        });
    }

    pub(crate) fn setup_transfers(&mut self, table: &VariableTable) {
        if let Node::Group(group) = &mut self.node {
            for child in &mut group.subsystems {
                child.setup_transfers(table);
            }
            group.transfers = Some(TransferSet::new(
                &self.path_name,
                &self.connections,
                &group.child_ranges,
                &self.layouts,
                table,
                &self.comm,
            ));
        }
    }

    /// Declares partial derivatives and builds assembled jacobians.
    ///
    /// `inherited` is the jacobian kind of the nearest ancestor with an attached jacobian.
    pub(crate) fn setup_partials(&mut self, inherited: Option<JacobianKind>) -> Result<(), Error> {
        if !self.jacobian.is_top {
            if let Some(kind) = inherited {
                self.jacobian = JacobianAttachment { kind, is_top: false };
            }
        }
        let kind = self.jacobian.kind;
        let under_global = matches!(kind, JacobianKind::Global(_));

        match &mut self.node {
            Node::Leaf(leaf) => {
                if under_global && leaf.component.is_matrix_free() {
                    return Err(Error::configuration(format!(
                        "matrix-free component '{}' cannot be part of a global jacobian",
                        self.path_name
                    )));
                }
                let mut partials = Partials::new(&leaf.metadata.input, &leaf.metadata.output);
                leaf.component.declare_partials(&mut partials)?;
                leaf.partials = partials;
            }
            Node::Group(group) => {
                let inherit = if self.jacobian.is_top || inherited.is_some() {
                    Some(kind)
                } else {
                    None
                };
                for child in &mut group.subsystems {
                    child.setup_partials(inherit)?;
                }
                group.assembled = match kind {
                    JacobianKind::Global(format) if self.jacobian.is_top => {
                        debug!(
                            "'{}' assembles a {:?} jacobian of {} rows",
                            display_path(&self.path_name),
                            format,
                            self.layouts.output.len()
                        );
                        let mut assembled =
                            AssembledJacobian::new(format, self.layouts.output.len(), self.layouts.input.len());
                        assembled.assemble(placements(&group.subsystems, &self.layouts));
                        Some(assembled)
                    }
                    _ => None,
                };
            }
        }
        self.is_set_up = true;
        Ok(())
    }

    fn collect_placements<'s>(&'s self, top: &PerKind<Arc<VectorLayout>>, placements: &mut Vec<BlockPlacement<'s>>) {
        match &self.node {
            Node::Leaf(leaf) => {
                let offset = |kind: VariableKind, name: &str| {
                    self.layouts[kind]
                        .view(name)
                        .and_then(|view| top[kind].view_by_global(view.global_index))
                        .map(|view| top[kind].flat_range(view).start)
                };
                for block in leaf.partials.blocks() {
                    if let (Some(row_offset), Some(col_offset)) =
                        (offset(VariableKind::Output, &block.of), offset(block.wrt_kind, &block.wrt))
                    {
                        placements.push(BlockPlacement {
                            block,
                            row_offset,
                            col_offset,
                        });
                    }
                }
            }
            Node::Group(group) => {
                for child in &group.subsystems {
                    child.collect_placements(top, placements);
                }
            }
        }
    }

    /// Applies one of this group's transfers. Does nothing on a leaf.
    ///
    /// Collective over the group's communicator.
    /// Moves values along the selected connections of a group. Does nothing for leaves.
    ///
    /// `vectors` must be the vectors of this system.
    pub fn apply_transfer(
        &self,
        selection: TransferSelection,
        vectors: &mut SystemVectors,
        mode: Mode,
    ) -> Result<(), Error> {
        match &self.node {
            Node::Group(group) => group.transfer(selection, vectors, mode),
            Node::Leaf(_) => Ok(()),
        }
    }

    pub fn solve_nonlinear(&mut self, vectors: &mut SystemVectors) -> eyre::Result<()> {
        if let Node::Group(group) = &self.node {
            let solver = Arc::clone(&group.nonlinear_solver);
            return solver.solve(self, vectors);
        }
        match &mut self.node {
            Node::Leaf(leaf) => leaf
                .component
                .solve_nonlinear(&vectors.inputs, &mut vectors.outputs)
                .wrap_err_with(|| format!("solve_nonlinear failed in '{}'", self.path_name)),
            Node::Group(_) => Ok(()),
        }
    }

    pub fn apply_nonlinear(&mut self, vectors: &mut SystemVectors) -> eyre::Result<()> {
        match &mut self.node {
            Node::Leaf(leaf) => leaf
                .component
                .apply_nonlinear(&vectors.inputs, &vectors.outputs, &mut vectors.residuals)
                .wrap_err_with(|| format!("apply_nonlinear failed in '{}'", self.path_name)),
            Node::Group(group) => {
                group.transfer(TransferSelection::Full, vectors, Mode::Forward)?;
                for child in &mut group.subsystems {
                    let mut sub = vectors.restrict(&child.layouts, &child.comm);
                    child.apply_nonlinear(&mut sub)?;
                }
                Ok(())
            }
        }
    }

    pub fn linearize(&mut self, vectors: &mut SystemVectors) -> eyre::Result<()> {
        match &mut self.node {
            Node::Leaf(leaf) => leaf
                .component
                .linearize(&vectors.inputs, &vectors.outputs, &mut leaf.partials)
                .wrap_err_with(|| format!("linearize failed in '{}'", self.path_name)),
            Node::Group(group) => {
                group.transfer(TransferSelection::Full, vectors, Mode::Forward)?;
                for child in &mut group.subsystems {
                    let mut sub = vectors.restrict(&child.layouts, &child.comm);
                    child.linearize(&mut sub)?;
                }
                if let Some(assembled) = group.assembled.as_mut() {
                    assembled.assemble(placements(&group.subsystems, &self.layouts));
                }
                Ok(())
            }
        }
    }

    /// Applies the jacobian of this system's residuals to the linear vectors.
    ///
    /// Forward mode accumulates `J [d_inputs; d_outputs]` into `d_residuals`; reverse mode
    /// accumulates `J^T d_residuals` into `d_inputs` and `d_outputs`. With `with_transfer`, a
    /// group first (forward) or last (reverse) moves values along its connections, so that
    /// connected inputs are eliminated from the product.
    pub fn apply_linear(
        &mut self,
        nonlinear: &mut SystemVectors,
        linear: &mut SystemVectors,
        mode: Mode,
        with_transfer: bool,
    ) -> eyre::Result<()> {
        match &mut self.node {
            Node::Leaf(leaf) => {
                if leaf.component.is_matrix_free() {
                    leaf.component
                        .apply_linear(
                            &nonlinear.inputs,
                            &nonlinear.outputs,
                            &mut linear.inputs,
                            &mut linear.outputs,
                            &mut linear.residuals,
                            mode,
                        )
                        .wrap_err_with(|| format!("apply_linear failed in '{}'", self.path_name))
                } else {
                    leaf.partials
                        .apply(&mut linear.inputs, &mut linear.outputs, &mut linear.residuals, mode)
                        .wrap_err_with(|| format!("applying partials failed in '{}'", self.path_name))
                }
            }
            Node::Group(group) => {
                if with_transfer && mode == Mode::Forward {
                    group.transfer(TransferSelection::Full, linear, Mode::Forward)?;
                }
                if let Some(assembled) = &group.assembled {
                    assembled.apply(&mut linear.inputs, &mut linear.outputs, &mut linear.residuals, mode)?;
                } else {
                    for child in &mut group.subsystems {
                        let mut sub_nonlinear = nonlinear.restrict(&child.layouts, &child.comm);
                        let mut sub_linear = linear.restrict(&child.layouts, &child.comm);
                        // The full transfer of this group covers the connections of the subtree
                        child.apply_linear(&mut sub_nonlinear, &mut sub_linear, mode, false)?;
                    }
                }
                if with_transfer && mode == Mode::Reverse {
                    group.transfer(TransferSelection::Full, linear, Mode::Reverse)?;
                }
                Ok(())
            }
        }
    }

    /// Solves with the output block of this system's jacobian.
    ///
    /// Forward mode maps `d_residuals` to `d_outputs`, reverse mode maps `d_outputs` to
    /// `d_residuals`.
    pub fn solve_linear(
        &mut self,
        nonlinear: &mut SystemVectors,
        linear: &mut SystemVectors,
        mode: Mode,
    ) -> eyre::Result<()> {
        if let Node::Group(group) = &self.node {
            let solver = Arc::clone(&group.linear_solver);
            return solver.solve(self, nonlinear, linear, mode);
        }
        match &mut self.node {
            Node::Leaf(leaf) => leaf
                .component
                .solve_linear(&mut linear.outputs, &mut linear.residuals, mode)
                .wrap_err_with(|| format!("solve_linear failed in '{}'", self.path_name)),
            Node::Group(_) => Ok(()),
        }
    }

    /// Resident leaves of the subtree.
    pub(crate) fn leaves(&self) -> Vec<&System> {
        match &self.node {
            Node::Leaf(_) => vec![self],
            Node::Group(group) => group.subsystems.iter().flat_map(System::leaves).collect(),
        }
    }
}

impl Group {
    fn transfer(&self, selection: TransferSelection, vectors: &mut SystemVectors, mode: Mode) -> Result<(), Error> {
        let Some(transfers) = &self.transfers else {
            return Ok(());
        };
        let transfer = match selection {
            TransferSelection::Full => Some(&transfers.full),
            TransferSelection::Forward(index) => transfers.forward.get(index),
            TransferSelection::Reverse(index) => transfers.reverse.get(index),
        };
        match transfer {
            Some(transfer) => transfer.apply(&mut vectors.inputs, &mut vectors.outputs, mode),
            None => Ok(()),
        }
    }
}

/// Placements of the partial-derivative blocks of every resident leaf below `subsystems`.
fn placements<'s>(subsystems: &'s [System], top: &PerKind<Arc<VectorLayout>>) -> Vec<BlockPlacement<'s>> {
    let mut placements = Vec::new();
    for child in subsystems {
        child.collect_placements(top, &mut placements);
    }
    placements
}
