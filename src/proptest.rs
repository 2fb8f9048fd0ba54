use crate::variables::Variable;
use ::proptest::collection::vec;
use ::proptest::prelude::*;
use nalgebra::{DMatrix, DVector};

/// Weights of a group with 1 to 6 subsystems. Zero weights are included.
pub fn proc_weights() -> impl Strategy<Value = Vec<usize>> {
    vec(0..5usize, 1..=6)
}

/// A variable with a scalar, vector or matrix shape and small values.
pub fn variable() -> impl Strategy<Value = Variable> {
    let shape = prop_oneof![
        Just(vec![1]),
        (2..5usize).prop_map(|n| vec![n]),
        (1..4usize, 1..4usize).prop_map(|(m, n)| vec![m, n]),
    ];
    shape.prop_flat_map(|shape| {
        let size: usize = shape.iter().product();
        vec(-10.0..10.0, size).prop_map(move |values: Vec<f64>| Variable::array(&shape, values))
    })
}

pub fn dvector(n: usize) -> impl Strategy<Value = DVector<f64>> {
    vec(-10.0..10.0, n).prop_map(DVector::from_vec)
}

/// A strictly diagonally dominant, and therefore non-singular, `n x n` matrix.
pub fn nonsingular_matrix(n: usize) -> impl Strategy<Value = DMatrix<f64>> {
    vec(-1.0..1.0, n * n).prop_map(move |values: Vec<f64>| {
        let mut matrix = DMatrix::from_vec(n, n, values);
        for i in 0..n {
            matrix[(i, i)] = n as f64 + 1.0 + matrix[(i, i)].abs();
        }
        matrix
    })
}
