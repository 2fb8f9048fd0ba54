//! Resolution of name-based connections into pairs of global variable indices.
use crate::error::Error;
use crate::variables::{display_path, NodeVariables, PerKind, VariableKind};
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A connection as declared on a group, in that group's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredConnection {
    pub source: String,
    pub target: String,
    pub src_indices: Option<Vec<usize>>,
}

/// A resolved connection from the output `output` into the input `input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionIndex {
    pub input: usize,
    pub output: usize,
    pub src_indices: Option<Vec<usize>>,
}

/// Resolves the connections declared on a group against its complete (all-process) name lists.
///
/// Every input carrying the target name is connected to the first output carrying the source
/// name. Source indices are checked against the declared sizes of both sides.
pub(crate) fn resolve_declared(
    path_name: &str,
    variables: &NodeVariables,
    declared: &[DeclaredConnection],
) -> Result<Vec<ConnectionIndex>, Error> {
    let mut resolved = Vec::new();
    for connection in declared {
        let output = *variables
            .global_indices(VariableKind::Output, &connection.source)
            .first()
            .ok_or_else(|| {
                Error::configuration(format!(
                    "cannot connect '{}' to '{}' in '{}': no output named '{}'",
                    connection.source,
                    connection.target,
                    display_path(path_name),
                    connection.source
                ))
            })?;
        let inputs = variables.global_indices(VariableKind::Input, &connection.target);
        if inputs.is_empty() {
            return Err(Error::configuration(format!(
                "cannot connect '{}' to '{}' in '{}': no input named '{}'",
                connection.source,
                connection.target,
                display_path(path_name),
                connection.target
            )));
        }

        if let Some(indices) = &connection.src_indices {
            let output_size = variables
                .info(VariableKind::Output, output)
                .map(|info| info.size)
                .unwrap_or(0);
            if let Some(&bad) = indices.iter().find(|&&i| i >= output_size) {
                return Err(Error::dimension(&connection.source, output_size, bad + 1));
            }
            for &input in inputs {
                let input_size = variables
                    .info(VariableKind::Input, input)
                    .map(|info| info.size)
                    .unwrap_or(0);
                if input_size != indices.len() && input_size != 1 {
                    return Err(Error::dimension(&connection.target, input_size, indices.len()));
                }
            }
        }

        resolved.extend(inputs.iter().map(|&input| ConnectionIndex {
            input,
            output,
            src_indices: connection.src_indices.clone(),
        }));
    }
    Ok(resolved)
}

/// Connects inputs and outputs that were promoted to the same name from different subsystems.
pub(crate) fn resolve_implicit(
    variables: &NodeVariables,
    child_ranges: &PerKind<Vec<Range<usize>>>,
) -> Vec<ConnectionIndex> {
    let input_range = variables.range(VariableKind::Input);
    let mut implicit = Vec::new();
    for (offset, info) in variables.infos(VariableKind::Input).iter().enumerate() {
        let input = input_range.start + offset;
        if let Some(&output) = variables
            .global_indices(VariableKind::Output, &info.name)
            .first()
        {
            let input_child = owning_child(&child_ranges.input, input);
            let output_child = owning_child(&child_ranges.output, output);
            if input_child.is_some() && input_child != output_child {
                implicit.push(ConnectionIndex {
                    input,
                    output,
                    src_indices: None,
                });
            }
        }
    }
    implicit
}

/// Merges connection lists, rejecting inputs with more than one distinct source.
pub(crate) fn merge(
    path_name: &str,
    variables: &NodeVariables,
    lists: impl IntoIterator<Item = ConnectionIndex>,
) -> Result<Vec<ConnectionIndex>, Error> {
    let mut by_input: FxHashMap<usize, ConnectionIndex> = FxHashMap::default();
    for connection in lists {
        if connection.src_indices.is_none() {
            let size = |kind: VariableKind, index: usize| variables.info(kind, index).map(|info| info.size);
            if let (Some(input_size), Some(output_size)) = (
                size(VariableKind::Input, connection.input),
                size(VariableKind::Output, connection.output),
            ) {
                if input_size != output_size {
                    let name = variables.name_of(VariableKind::Input, connection.input).unwrap_or("<unknown>");
                    return Err(Error::dimension(name, output_size, input_size));
                }
            }
        }
        match by_input.get(&connection.input) {
            Some(existing) if *existing == connection => {}
            Some(existing) => {
                let name = |kind: VariableKind, index: usize| {
                    variables
                        .name_of(kind, index)
                        .unwrap_or("<unknown>")
                        .to_string()
                };
                return Err(Error::configuration(format!(
                    "input '{}' in '{}' is connected to both '{}' and '{}'",
                    name(VariableKind::Input, connection.input),
                    display_path(path_name),
                    name(VariableKind::Output, existing.output),
                    name(VariableKind::Output, connection.output)
                )));
            }
            None => {
                by_input.insert(connection.input, connection);
            }
        }
    }
    let mut merged: Vec<_> = by_input.into_values().collect();
    merged.sort_by_key(|connection| connection.input);
    debug!(
        "'{}' resolves {} connections in its subtree",
        display_path(path_name),
        merged.len()
    );
    Ok(merged)
}

/// The position of the child whose global range contains `index`.
pub(crate) fn owning_child(ranges: &[Range<usize>], index: usize) -> Option<usize> {
    ranges.iter().position(|range| range.contains(&index))
}
