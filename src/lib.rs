//! Assembly and evaluation of hierarchical multidisciplinary models.
//!
//! A model is a tree of [`System`]s: groups of subsystems, with components at the leaves. A
//! [`Problem`] splits the tree over the processes of a communicator, assigns every variable a
//! global index, resolves connections, lays out distributed vectors and computes the transfers
//! that move data along connections.
pub mod component;
pub mod components;
pub mod connections;
pub mod error;
pub mod jacobian;
pub mod problem;
pub mod proc_allocator;
pub mod solvers;
pub mod system;
pub mod transfer;
pub mod variables;
pub mod vector;

#[cfg(feature = "proptest-support")]
pub mod proptest;

pub use component::{Component, Explicit, ExplicitComponent, IndepVarComp, ProcessorInfo};
pub use error::Error;
pub use problem::{Problem, ProblemOptions};
pub use system::System;
pub use transfer::Mode;
pub use variables::{Variable, VariableDeclarations, VariableKind};
pub use vector::{SystemVectors, Value, Vector, VectorName};

pub extern crate mdao_comm;
pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
