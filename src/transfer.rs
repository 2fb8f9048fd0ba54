//! Transfers of output values into connected inputs.
//!
//! A transfer is a fixed list of element pairs (input entry, output entry), computed once during
//! setup from the resolved connections of a group. The same transfer serves every vector name:
//! the direction is chosen on application.
use crate::connections::{owning_child, ConnectionIndex};
use crate::error::Error;
use crate::variables::{PerKind, VariableKind, VariableTable};
use crate::vector::{Vector, VectorLayout};
use log::debug;
use mdao_comm::Comm;
use std::ops::Range;
use std::sync::Arc;

/// The direction in which data flows through a transfer or a linear operator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Output values are copied into inputs.
    Forward,
    /// Input values are accumulated into outputs.
    Reverse,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Element {
    /// (varset, offset relative to the group's vector), if the entry is held locally.
    input: Option<(usize, usize)>,
    output: Option<(usize, usize)>,
    input_owned: bool,
    output_owned: bool,
}

#[derive(Debug, Clone)]
pub struct Transfer {
    connections: Vec<(usize, usize)>,
    elements: Vec<Element>,
    /// The layouts the element offsets refer to.
    layouts: PerKind<Arc<VectorLayout>>,
    comm: Comm,
}

impl Transfer {
    pub(crate) fn new<'c>(
        connections: impl IntoIterator<Item = &'c ConnectionIndex>,
        layouts: &PerKind<Arc<VectorLayout>>,
        table: &VariableTable,
        comm: &Comm,
    ) -> Self {
        let locate = |kind: VariableKind, global_index: usize, entry: usize| {
            let layout = &layouts[kind];
            layout.view_by_global(global_index).map(|view| {
                let range = layout.local_range(view);
                ((view.varset, range.start + entry), view.owned)
            })
        };

        let mut pairs = Vec::new();
        let mut elements = Vec::new();
        for connection in connections {
            pairs.push((connection.input, connection.output));
            let size = table.size(VariableKind::Input, connection.input);
            for k in 0..size {
                let source_entry = table
                    .src_indices(connection.input)
                    .map(|indices| indices[k])
                    .unwrap_or(k);
                let input = locate(VariableKind::Input, connection.input, k);
                let output = locate(VariableKind::Output, connection.output, source_entry);
                elements.push(Element {
                    input: input.map(|(slot, _)| slot),
                    output: output.map(|(slot, _)| slot),
                    input_owned: input.map(|(_, owned)| owned).unwrap_or(false),
                    output_owned: output.map(|(_, owned)| owned).unwrap_or(false),
                });
            }
        }

        Self {
            connections: pairs,
            elements,
            layouts: layouts.clone(),
            comm: comm.clone(),
        }
    }

    /// The (input, output) global index pairs moved by this transfer.
    pub fn connections(&self) -> &[(usize, usize)] {
        &self.connections
    }

    /// The number of scalar entries moved by this transfer.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Applies the transfer.
    ///
    /// In forward mode, every connected input entry is overwritten with its source entry. In
    /// reverse mode, every input entry is added to its source entry.
    ///
    /// The vectors must be those of the group the transfer was computed for.
    ///
    /// Collective over the group's communicator when it spans several processes.
    pub fn apply(&self, inputs: &mut Vector, outputs: &mut Vector, mode: Mode) -> Result<(), Error> {
        if !Arc::ptr_eq(inputs.layout(), &self.layouts.input) || !Arc::ptr_eq(outputs.layout(), &self.layouts.output) {
            return Err(Error::configuration(
                "transfer applied to vectors of a different system than it was computed for",
            ));
        }
        if self.elements.is_empty() {
            return Ok(());
        }
        if self.comm.size() == 1 {
            self.apply_local(inputs, outputs, mode);
        } else {
            self.apply_distributed(inputs, outputs, mode);
        }
        Ok(())
    }

    fn apply_local(&self, inputs: &mut Vector, outputs: &mut Vector, mode: Mode) {
        for element in &self.elements {
            if let (Some((iv, io)), Some((ov, oo))) = (element.input, element.output) {
                match mode {
                    Mode::Forward => *inputs.entry_mut(iv, io) = outputs.entry(ov, oo),
                    Mode::Reverse => *outputs.entry_mut(ov, oo) += inputs.entry(iv, io),
                }
            }
        }
    }

    fn apply_distributed(&self, inputs: &mut Vector, outputs: &mut Vector, mode: Mode) {
        let mut buffer = vec![0.0; self.elements.len()];
        match mode {
            Mode::Forward => {
                for (value, element) in buffer.iter_mut().zip(&self.elements) {
                    if let (true, Some((v, o))) = (element.output_owned, element.output) {
                        *value = outputs.entry(v, o);
                    }
                }
                self.comm.all_reduce_sum(&mut buffer);
                for (value, element) in buffer.iter().zip(&self.elements) {
                    if let Some((v, o)) = element.input {
                        *inputs.entry_mut(v, o) = *value;
                    }
                }
            }
            Mode::Reverse => {
                for (value, element) in buffer.iter_mut().zip(&self.elements) {
                    if let (true, Some((v, o))) = (element.input_owned, element.input) {
                        *value = inputs.entry(v, o);
                    }
                }
                self.comm.all_reduce_sum(&mut buffer);
                for (value, element) in buffer.iter().zip(&self.elements) {
                    if let Some((v, o)) = element.output {
                        *outputs.entry_mut(v, o) += *value;
                    }
                }
            }
        }
    }
}

/// The transfers of one group.
#[derive(Debug, Clone)]
pub struct TransferSet {
    /// Every connection of the group's subtree.
    pub full: Transfer,
    /// Per subsystem: connections into it from subsystems executing earlier.
    pub forward: Vec<Transfer>,
    /// Per subsystem: connections into it from subsystems executing later.
    pub reverse: Vec<Transfer>,
}

impl TransferSet {
    pub(crate) fn new(
        path_name: &str,
        connections: &[ConnectionIndex],
        child_ranges: &PerKind<Vec<Range<usize>>>,
        layouts: &PerKind<Arc<VectorLayout>>,
        table: &VariableTable,
        comm: &Comm,
    ) -> Self {
        let num_children = child_ranges.input.len();
        let mut forward = vec![Vec::new(); num_children];
        let mut reverse = vec![Vec::new(); num_children];

        for connection in connections {
            let input_child = owning_child(&child_ranges.input, connection.input);
            let output_child = owning_child(&child_ranges.output, connection.output);
            if let (Some(i), Some(j)) = (input_child, output_child) {
                if j < i {
                    forward[i].push(connection);
                } else if j > i {
                    reverse[i].push(connection);
                }
            }
        }

        let full = Transfer::new(connections, layouts, table, comm);
        let forward: Vec<_> = forward
            .into_iter()
            .map(|list| Transfer::new(list, layouts, table, comm))
            .collect();
        let reverse: Vec<_> = reverse
            .into_iter()
            .map(|list| Transfer::new(list, layouts, table, comm))
            .collect();
        debug!(
            "'{}': full transfer of {} entries, {} partial transfers",
            path_name,
            full.len(),
            forward.iter().chain(&reverse).filter(|t| !t.is_empty()).count()
        );

        Self { full, forward, reverse }
    }
}
