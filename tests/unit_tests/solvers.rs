use crate::Scale;
use mdao::problem::DEFAULT_LINEAR_VECTOR;
use mdao::solvers::{LinearBlockGs, LinearBlockGsSettings, NonlinearBlockGs, NonlinearBlockGsSettings};
use mdao::{IndepVarComp, Mode, Problem, System, Variable, VectorName};

fn linear() -> VectorName {
    VectorName::linear(DEFAULT_LINEAR_VECTOR)
}

/// `p.x -> s1 (y = 2x) -> s2 (y = 3x)`.
fn chain(block_gs: bool) -> Problem {
    let mut root = System::group("root");
    root.add_subsystem(System::component(
        "p",
        IndepVarComp::new().with_output("x", Variable::array(&[1], vec![1.5])),
    ))
    .unwrap()
    .add_subsystem(System::explicit("s1", Scale::new(1, 2.0)))
    .unwrap()
    .add_subsystem(System::explicit("s2", Scale::new(1, 3.0)))
    .unwrap()
    .connect("p.x", "s1.x")
    .unwrap()
    .connect("s1.y", "s2.x")
    .unwrap();
    if block_gs {
        root.set_linear_solver(LinearBlockGs::default()).unwrap();
    }
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    problem.run_solve_nonlinear().unwrap();
    problem.run_linearize().unwrap();
    problem
}

#[test]
fn run_once_evaluates_a_feed_forward_chain() {
    let mut problem = chain(false);
    problem.run_apply_nonlinear().unwrap();
    let vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
    assert_eq!(vectors.outputs.scalar("s1.y").unwrap(), 3.0);
    assert_eq!(vectors.outputs.scalar("s2.y").unwrap(), 9.0);
    assert_eq!(vectors.residuals.norm(), 0.0);
}

#[test]
fn chain_rule_in_both_modes() {
    for block_gs in [false, true] {
        let mut problem = chain(block_gs);
        {
            let mut vectors = problem.vectors("", &linear()).unwrap();
            vectors.residuals.set_scalar("p.x", 1.0).unwrap();
        }
        problem.run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Forward).unwrap();
        {
            let mut vectors = problem.vectors("", &linear()).unwrap();
            assert_eq!(vectors.outputs.scalar("s1.y").unwrap(), 2.0);
            assert_eq!(vectors.outputs.scalar("s2.y").unwrap(), 6.0);

            vectors.residuals.set_const(0.0);
            vectors.outputs.set_const(0.0);
            vectors.outputs.set_scalar("s2.y", 1.0).unwrap();
        }
        problem.run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Reverse).unwrap();
        let vectors = problem.vectors("", &linear()).unwrap();
        assert_eq!(vectors.residuals.scalar("p.x").unwrap(), 6.0);
        assert_eq!(vectors.residuals.scalar("s1.y").unwrap(), 3.0);
    }
}

/// `s1` and `s2` feed each other, each halving its input. The fixed point is zero, the initial
/// guess is not.
fn cycle(settings: NonlinearBlockGsSettings) -> Problem {
    let mut root = System::group("root");
    root.add_subsystem(System::explicit("s1", Scale::new(2, 0.5)))
        .unwrap()
        .add_subsystem(System::explicit("s2", Scale::new(2, 0.5)))
        .unwrap()
        .connect("s1.y", "s2.x")
        .unwrap()
        .connect("s2.y", "s1.x")
        .unwrap();
    root.set_nonlinear_solver(NonlinearBlockGs::new(settings)).unwrap();
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    {
        let mut vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
        vectors.outputs.set("s2.y", &[1.0, 2.0]).unwrap();
    }
    problem
}

#[test]
fn block_gauss_seidel_converges_a_cycle() {
    let mut problem = cycle(NonlinearBlockGsSettings {
        max_iterations: 100,
        atol: 1e-12,
        rtol: 1e-12,
        err_on_non_convergence: true,
    });
    problem.run_solve_nonlinear().unwrap();
    problem.run_apply_nonlinear().unwrap();
    let vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
    assert!(vectors.residuals.norm() <= 1e-12);
    assert!(vectors.outputs.norm() < 1e-10);
}

#[test]
fn non_convergence_is_reported_when_requested() {
    let settings = NonlinearBlockGsSettings {
        max_iterations: 2,
        atol: 1e-30,
        rtol: 1e-30,
        err_on_non_convergence: false,
    };
    let mut problem = cycle(settings);
    assert!(problem.run_solve_nonlinear().is_ok());

    let mut problem = cycle(NonlinearBlockGsSettings {
        err_on_non_convergence: true,
        ..settings
    });
    let report = problem.run_solve_nonlinear().unwrap_err();
    assert!(report.to_string().contains("did not converge in 2 iterations"));
}

#[test]
fn linear_block_gauss_seidel_solves_a_coupled_system() {
    // Residuals: r1 = y1 - 0.5 y2, r2 = y2 - 0.5 y1. The inverse of [[1, -0.5], [-0.5, 1]] is
    // [[4/3, 2/3], [2/3, 4/3]].
    let mut problem = cycle(NonlinearBlockGsSettings::default());
    problem
        .root_mut()
        .set_linear_solver(LinearBlockGs::new(LinearBlockGsSettings {
            max_iterations: 100,
            atol: 1e-13,
            rtol: 1e-13,
            err_on_non_convergence: true,
        }))
        .unwrap();
    problem.run_linearize().unwrap();

    {
        let mut vectors = problem.vectors("", &linear()).unwrap();
        vectors.residuals.set("s1.y", &[1.0, 0.0]).unwrap();
    }
    problem.run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Forward).unwrap();
    {
        let mut vectors = problem.vectors("", &linear()).unwrap();
        let y1 = vectors.outputs.slice("s1.y").unwrap().to_vec();
        let y2 = vectors.outputs.slice("s2.y").unwrap().to_vec();
        assert!((y1[0] - 4.0 / 3.0).abs() < 1e-12 && y1[1].abs() < 1e-12);
        assert!((y2[0] - 2.0 / 3.0).abs() < 1e-12 && y2[1].abs() < 1e-12);

        vectors.residuals.set_const(0.0);
        vectors.outputs.set_const(0.0);
        vectors.outputs.set("s2.y", &[0.0, 1.0]).unwrap();
    }
    problem.run_solve_linear(DEFAULT_LINEAR_VECTOR, Mode::Reverse).unwrap();
    let vectors = problem.vectors("", &linear()).unwrap();
    let r1 = vectors.residuals.slice("s1.y").unwrap();
    let r2 = vectors.residuals.slice("s2.y").unwrap();
    assert!(r1[0].abs() < 1e-12 && (r1[1] - 2.0 / 3.0).abs() < 1e-12);
    assert!(r2[0].abs() < 1e-12 && (r2[1] - 4.0 / 3.0).abs() < 1e-12);
}
