use matrixcompare::assert_matrix_eq;
use mdao::components::{LinearSystemComp, LinearSystemOptions, PartialType};
use mdao::jacobian::{JacobianKind, MatrixFormat};
use mdao::problem::DEFAULT_LINEAR_VECTOR;
use mdao::proptest::{dvector, nonsingular_matrix};
use mdao::{Error, IndepVarComp, Mode, Problem, System, Variable, VectorName};
use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;

const PARTIAL_TYPES: [PartialType; 3] = [PartialType::Dense, PartialType::Sparse, PartialType::MatrixFree];

fn linear() -> VectorName {
    VectorName::linear(DEFAULT_LINEAR_VECTOR)
}

/// Independent `A` and `b` connected to a linear system of matching size.
fn linear_model(partial_type: PartialType, a: &DMatrix<f64>, b: &[f64], jacobian: Option<JacobianKind>) -> Problem {
    let n = b.len();
    let row_major = a.transpose().as_slice().to_vec();
    let component = LinearSystemComp::new(LinearSystemOptions { size: n, partial_type }).unwrap();

    let mut root = System::group("root");
    root.add_subsystem(System::component(
        "p",
        IndepVarComp::new()
            .with_output("A", Variable::array(&[n, n], row_major))
            .with_output("b", Variable::array(&[n], b.to_vec())),
    ))
    .unwrap()
    .add_subsystem(System::component("lin", component))
    .unwrap()
    .connect("p.A", "lin.A")
    .unwrap()
    .connect("p.b", "lin.b")
    .unwrap();
    if let Some(kind) = jacobian {
        root.set_jacobian(kind).unwrap();
    }

    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    problem
}

fn solved_model(partial_type: PartialType, a: &DMatrix<f64>, b: &[f64], jacobian: Option<JacobianKind>) -> Problem {
    let mut problem = linear_model(partial_type, a, b, jacobian);
    problem.run_solve_nonlinear().unwrap();
    problem.run_linearize().unwrap();
    problem
}

fn test_matrix() -> DMatrix<f64> {
    DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, -1.0, 0.5, 1.0, 2.0])
}

#[test]
fn identity_system_of_size_three() {
    let mut problem = solved_model(PartialType::Dense, &DMatrix::identity(3, 3), &[1.0, 2.0, 3.0], None);
    {
        let vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
        assert_eq!(vectors.outputs.slice("lin.x").unwrap(), &[1.0, 2.0, 3.0]);
    }

    {
        let mut vectors = problem.vectors("", &linear()).unwrap();
        vectors.outputs.set("lin.x", &[1.0, 0.0, 0.0]).unwrap();
    }
    problem.run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Reverse).unwrap();
    let vectors = problem.vectors("", &linear()).unwrap();
    assert_eq!(vectors.residuals.slice("lin.x").unwrap(), &[1.0, 0.0, 0.0]);
    assert_eq!(vectors.residuals.slice("p.b").unwrap(), &[1.0, 0.0, 0.0]);
    // The right-hand side is left in place
    assert_eq!(vectors.outputs.slice("lin.x").unwrap(), &[1.0, 0.0, 0.0]);
}

#[test]
fn primal_solution_and_residual() {
    let a = test_matrix();
    let b = [1.0, -2.0, 0.5];
    let expected = a.clone().lu().solve(&DVector::from_column_slice(&b)).unwrap();
    for partial_type in PARTIAL_TYPES {
        let mut problem = solved_model(partial_type, &a, &b, None);
        problem.run_apply_nonlinear().unwrap();
        let vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
        let x = DVector::from_column_slice(vectors.outputs.slice("lin.x").unwrap());
        assert_matrix_eq!(x, expected, comp = abs, tol = 1e-12);
        assert!(vectors.residuals.norm() < 1e-12);
    }
}

#[test]
fn forward_derivatives_agree_across_partial_types() {
    let a = test_matrix();
    let inverse = a.clone().try_inverse().unwrap();
    for partial_type in PARTIAL_TYPES {
        let mut problem = solved_model(partial_type, &a, &[1.0, 1.0, 1.0], None);
        for k in 0..3 {
            {
                let mut vectors = problem.vectors("", &linear()).unwrap();
                vectors.residuals.set_const(0.0);
                vectors.residuals.slice_mut("p.b").unwrap()[k] = 1.0;
            }
            problem.run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Forward).unwrap();
            let vectors = problem.vectors("", &linear()).unwrap();
            let dx = DVector::from_column_slice(vectors.outputs.slice("lin.x").unwrap());
            assert_matrix_eq!(dx, inverse.column(k), comp = abs, tol = 1e-12);
        }
    }
}

#[test]
fn reverse_derivatives_agree_across_partial_types() {
    let a = test_matrix();
    let b = [2.0, 0.0, -1.0];
    let inverse = a.clone().try_inverse().unwrap();
    let x = &inverse * DVector::from_column_slice(&b);
    for partial_type in PARTIAL_TYPES {
        let mut problem = solved_model(partial_type, &a, &b, None);
        for k in 0..3 {
            {
                let mut vectors = problem.vectors("", &linear()).unwrap();
                vectors.outputs.set_const(0.0);
                vectors.outputs.slice_mut("lin.x").unwrap()[k] = 1.0;
            }
            problem.run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Reverse).unwrap();
            let vectors = problem.vectors("", &linear()).unwrap();

            // dx_k/db is row k of the inverse, dx_k/dA_ij = -(A^-1)_ki x_j
            let adjoint = inverse.row(k).transpose();
            let db = DVector::from_column_slice(vectors.residuals.slice("p.b").unwrap());
            assert_matrix_eq!(db, adjoint, comp = abs, tol = 1e-12);
            let da = DMatrix::from_row_slice(3, 3, vectors.residuals.slice("p.A").unwrap());
            assert_matrix_eq!(da, -&adjoint * x.transpose(), comp = abs, tol = 1e-12);
        }
    }
}

#[test]
fn assembled_jacobians_match_the_recursive_product() {
    let a = test_matrix();
    let b = [1.0, 2.0, 3.0];
    let seed: Vec<f64> = (0..15).map(|i| (i as f64 * 0.7).sin()).collect();

    let apply = |jacobian: Option<JacobianKind>| {
        let mut problem = solved_model(PartialType::Dense, &a, &b, jacobian);
        {
            let mut vectors = problem.vectors("", &linear()).unwrap();
            vectors.outputs.set_flat(&seed).unwrap();
        }
        problem.run_apply_linear(DEFAULT_LINEAR_VECTOR, Mode::Forward).unwrap();
        let vectors = problem.vectors("", &linear()).unwrap();
        DVector::from_vec(vectors.residuals.get_flat())
    };

    let recursive = apply(None);
    let dense = apply(Some(JacobianKind::Global(MatrixFormat::Dense)));
    let csr = apply(Some(JacobianKind::Global(MatrixFormat::Csr)));
    assert_matrix_eq!(dense, recursive, comp = abs, tol = 1e-12);
    assert_matrix_eq!(csr, recursive, comp = abs, tol = 1e-12);
}

#[test]
fn global_jacobian_records_its_attachment_point() {
    let problem = linear_model(
        PartialType::Sparse,
        &test_matrix(),
        &[1.0, 1.0, 1.0],
        Some(JacobianKind::Global(MatrixFormat::Csr)),
    );
    let root = problem.root();
    assert!(root.jacobian().is_top);
    assert!(root.assembled_jacobian().is_some());
    let lin = problem.system("lin").unwrap();
    assert_eq!(lin.jacobian().kind, JacobianKind::Global(MatrixFormat::Csr));
    assert!(!lin.jacobian().is_top);
    assert_eq!(root.assembled_jacobian().unwrap().wrt_outputs_dense().shape(), (15, 15));
    assert_eq!(root.assembled_jacobian().unwrap().wrt_inputs_dense().shape(), (15, 12));
}

#[test]
fn matrix_free_components_cannot_join_a_global_jacobian() {
    let mut root = System::group("root");
    root.add_subsystem(System::component(
        "lin",
        LinearSystemComp::new(LinearSystemOptions {
            size: 2,
            partial_type: PartialType::MatrixFree,
        })
        .unwrap(),
    ))
    .unwrap();
    root.set_jacobian(JacobianKind::Global(MatrixFormat::Dense)).unwrap();
    assert!(matches!(Problem::new(root).setup(), Err(Error::Configuration(_))));
}

#[test]
fn singular_systems_are_numeric_failures() {
    let mut problem = linear_model(PartialType::Dense, &DMatrix::zeros(2, 2), &[1.0, 1.0], None);
    let report = problem.run_solve_nonlinear().unwrap_err();
    assert!(matches!(report.downcast_ref::<Error>(), Some(Error::NumericFailure(_))));

    // Nearly dependent rows exceed the pivot ratio limit
    let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0 + 1e-15]);
    let mut problem = linear_model(PartialType::Dense, &a, &[1.0, 1.0], None);
    assert!(problem.run_solve_nonlinear().is_err());
}

#[test]
fn derivative_solves_need_a_factorization() {
    let mut problem = linear_model(PartialType::Dense, &test_matrix(), &[1.0, 1.0, 1.0], None);
    let report = problem
        .run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Forward)
        .unwrap_err();
    assert!(matches!(report.downcast_ref::<Error>(), Some(Error::NumericFailure(_))));
}

#[test]
fn matrix_free_linearize_keeps_the_nonlinear_factorization() {
    // Dense partials refactorize on linearize and reject a singular matrix
    let mut problem = linear_model(PartialType::Dense, &DMatrix::zeros(2, 2), &[1.0, 1.0], None);
    let report = problem.run_linearize().unwrap_err();
    assert!(matches!(report.downcast_ref::<Error>(), Some(Error::NumericFailure(_))));

    let mut problem = linear_model(PartialType::MatrixFree, &DMatrix::zeros(2, 2), &[1.0, 1.0], None);
    problem.run_linearize().unwrap();
    let report = problem
        .run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Forward)
        .unwrap_err();
    assert!(matches!(report.downcast_ref::<Error>(), Some(Error::NumericFailure(_))));

    // The factorization of the last nonlinear solve serves derivative solves
    let a = test_matrix();
    let mut problem = solved_model(PartialType::MatrixFree, &a, &[1.0, 2.0, 3.0], None);
    {
        let mut vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
        vectors.outputs.set("p.A", &[0.0; 9]).unwrap();
    }
    problem.run_linearize().unwrap();
    {
        let mut vectors = problem.vectors("", &linear()).unwrap();
        vectors.residuals.set("lin.x", &[1.0, 0.0, 0.0]).unwrap();
    }
    problem.run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Forward).unwrap();
    let vectors = problem.vectors("", &linear()).unwrap();
    let dx = DVector::from_column_slice(vectors.outputs.slice("lin.x").unwrap());
    let inverse = a.try_inverse().unwrap();
    assert_matrix_eq!(dx, inverse.column(0), comp = abs, tol = 1e-12);
}

#[test]
fn size_must_be_positive() {
    assert!(matches!(LinearSystemComp::with_size(0), Err(Error::Configuration(_))));
    let component = LinearSystemComp::with_size(4).unwrap();
    assert_eq!(component.options().size, 4);
    assert_eq!(component.options().partial_type, PartialType::Dense);
}

#[test]
fn default_variables() {
    let mut root = System::group("root");
    root.add_subsystem(System::component("lin", LinearSystemComp::with_size(2).unwrap()))
        .unwrap();
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    let vectors = problem.vectors("lin", &VectorName::Nonlinear).unwrap();
    assert_eq!(vectors.inputs.slice("A").unwrap(), &[1.0, 0.0, 0.0, 1.0]);
    assert_eq!(vectors.inputs.slice("b").unwrap(), &[1.0, 1.0]);
    assert_eq!(vectors.outputs.slice("x").unwrap(), &[2.0, 2.0]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn matrix_free_operator_is_consistent_with_its_adjoint(
        a in nonsingular_matrix(3),
        b in dvector(3),
        v in dvector(15),
        w in dvector(15),
    ) {
        let mut problem = solved_model(PartialType::MatrixFree, &a, b.as_slice(), None);

        {
            let mut vectors = problem.vectors("", &linear()).unwrap();
            vectors.inputs.set_const(0.0);
            vectors.residuals.set_const(0.0);
            vectors.outputs.set_flat(v.as_slice()).unwrap();
        }
        problem.run_apply_linear(DEFAULT_LINEAR_VECTOR, Mode::Forward).unwrap();
        let jv = {
            let vectors = problem.vectors("", &linear()).unwrap();
            DVector::from_vec(vectors.residuals.get_flat())
        };

        {
            let mut vectors = problem.vectors("", &linear()).unwrap();
            vectors.inputs.set_const(0.0);
            vectors.outputs.set_const(0.0);
            vectors.residuals.set_flat(w.as_slice()).unwrap();
        }
        problem.run_apply_linear(DEFAULT_LINEAR_VECTOR, Mode::Reverse).unwrap();
        let jtw = {
            let vectors = problem.vectors("", &linear()).unwrap();
            DVector::from_vec(vectors.outputs.get_flat())
        };

        let (lhs, rhs) = (jv.dot(&w), v.dot(&jtw));
        prop_assert!((lhs - rhs).abs() <= 1e-9 * (1.0 + lhs.abs().max(rhs.abs())));
    }
}
