use mdao::component::ExplicitComponent;
use mdao::jacobian::Partials;
use mdao::mdao_comm::{run_spmd, Comm};
use mdao::vector::Vector;
use mdao::{Error, IndepVarComp, Problem, System, Variable, VariableDeclarations, VariableKind, VectorName};
use nalgebra::DMatrix;
use std::collections::BTreeMap;

/// `f = 2 x`
#[derive(Debug, Clone, Copy)]
struct Double;

impl ExplicitComponent for Double {
    fn declare_variables(&mut self, variables: &mut VariableDeclarations) -> Result<(), Error> {
        variables
            .add_input("x", Variable::scalar(0.0))?
            .add_output("f", Variable::scalar(0.0))?;
        Ok(())
    }

    fn declare_partials(&mut self, partials: &mut Partials) -> Result<(), Error> {
        partials.declare_dense_value("f", "x", DMatrix::from_element(1, 1, 2.0))
    }

    fn compute(&mut self, inputs: &Vector, outputs: &mut Vector) -> eyre::Result<()> {
        outputs.set_scalar("f", 2.0 * inputs.scalar("x")?)?;
        Ok(())
    }
}

/// `s = x0 + x1`
#[derive(Debug, Clone, Copy)]
struct Sum;

impl ExplicitComponent for Sum {
    fn declare_variables(&mut self, variables: &mut VariableDeclarations) -> Result<(), Error> {
        variables
            .add_input("x", Variable::zeros(&[2]))?
            .add_output("s", Variable::scalar(0.0))?;
        Ok(())
    }

    fn declare_partials(&mut self, partials: &mut Partials) -> Result<(), Error> {
        partials.declare_dense_value("s", "x", DMatrix::from_element(1, 2, 1.0))
    }

    fn compute(&mut self, inputs: &Vector, outputs: &mut Vector) -> eyre::Result<()> {
        outputs.set_scalar("s", inputs.slice("x")?.iter().sum())?;
        Ok(())
    }
}

fn two_components(comm: Comm) -> Problem {
    let mut root = System::group("root");
    root.add_subsystem(System::component("A", IndepVarComp::new().with_output("x", Variable::scalar(0.0))))
        .unwrap()
        .add_subsystem(System::explicit("B", Double))
        .unwrap()
        .connect("A.x", "B.x")
        .unwrap();
    let mut problem = Problem::new(root).with_comm(comm);
    problem.setup().unwrap();
    problem
}

#[derive(Debug, PartialEq)]
struct RankReport {
    inputs: Vec<String>,
    outputs: Vec<String>,
    input_range: std::ops::Range<usize>,
    output_range: std::ops::Range<usize>,
    f: Option<f64>,
    norm: f64,
}

#[test]
fn two_components_agree_on_any_number_of_processes() {
    for size in 1..=3 {
        let reports = run_spmd(size, |comm| {
            let mut problem = two_components(comm);
            {
                let mut vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
                if vectors.outputs.contains("A.x") {
                    vectors.outputs.set_scalar("A.x", 10.0).unwrap();
                }
            }
            problem.run_solve_nonlinear().unwrap();

            let root = problem.root();
            let names = |kind| root.variables().names(kind).map(str::to_string).collect::<Vec<_>>();
            let (inputs, outputs) = (names(VariableKind::Input), names(VariableKind::Output));
            let (input_range, output_range) = (
                root.variables().range(VariableKind::Input),
                root.variables().range(VariableKind::Output),
            );
            let vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
            let f = vectors
                .outputs
                .contains("B.f")
                .then(|| vectors.outputs.scalar("B.f").unwrap());
            RankReport {
                inputs,
                outputs,
                input_range,
                output_range,
                f,
                norm: vectors.outputs.norm(),
            }
        });

        assert_eq!(reports.len(), size);
        assert!(reports.iter().any(|report| report.f.is_some()));
        for report in &reports {
            assert_eq!(report.inputs, vec!["B.x"]);
            assert_eq!(report.outputs, vec!["A.x", "B.f"]);
            assert_eq!(report.input_range, 0..1);
            assert_eq!(report.output_range, 0..2);
            if let Some(f) = report.f {
                assert_eq!(f, 20.0);
            }
            // Duplicated variables are counted once
            assert!((report.norm - 500.0f64.sqrt()).abs() < 1e-12);
        }
    }
}

#[test]
fn subsystems_are_split_among_processes() {
    let ranges = run_spmd(3, |comm| {
        let problem = two_components(comm);
        let root = problem.root();
        (
            root.proc_range(),
            root.subsystem_indices().to_vec(),
            root.subsystems()[0].proc_range(),
            root.subsystems()[0].comm().size(),
        )
    });
    // The surplus process goes to the first subsystem
    assert_eq!(ranges[0], (0..3, vec![0], 0..2, 2));
    assert_eq!(ranges[1], (0..3, vec![0], 0..2, 2));
    assert_eq!(ranges[2], (0..3, vec![1], 2..3, 1));
}

#[test]
fn derivatives_cross_process_boundaries() {
    for size in 1..=3 {
        let results = run_spmd(size, |comm| {
            let mut problem = two_components(comm);
            problem.run_solve_nonlinear().unwrap();
            problem.run_linearize().unwrap();
            let linear = VectorName::linear(mdao::problem::DEFAULT_LINEAR_VECTOR);
            {
                let mut vectors = problem.vectors("", &linear).unwrap();
                if vectors.outputs.contains("B.f") {
                    vectors.outputs.set_scalar("B.f", 1.0).unwrap();
                }
            }
            problem
                .run_solve_linear(mdao::problem::DEFAULT_LINEAR_VECTOR, mdao::Mode::Reverse)
                .unwrap();
            let vectors = problem.vectors("", &linear).unwrap();
            vectors
                .residuals
                .contains("A.x")
                .then(|| vectors.residuals.scalar("A.x").unwrap())
        });
        let gradients: Vec<f64> = results.into_iter().flatten().collect();
        assert!(!gradients.is_empty());
        assert!(gradients.iter().all(|&gradient| gradient == 2.0));
    }
}

/// `root -> {g1: [a, b], g2: [c, d, e]}` with `a.y = [1, 2, 3]`, `b.f = 2 a.y[2]`, `c.f = 2 b.f`,
/// `d.f = 2 c.f` and `e.s = a.y[0] + a.y[2]`. Source indices select from `a.y` both inside `g1`
/// and across the groups.
fn nested_groups(comm: Comm) -> Problem {
    let mut g1 = System::group("g1");
    g1.add_subsystem(System::component(
        "a",
        IndepVarComp::new().with_output("y", Variable::array(&[3], vec![1.0, 2.0, 3.0])),
    ))
    .unwrap()
    .add_subsystem(System::explicit("b", Double))
    .unwrap()
    .connect_with_indices("a.y", "b.x", &[2])
    .unwrap();

    let mut g2 = System::group("g2");
    g2.add_subsystem(System::explicit("c", Double))
        .unwrap()
        .add_subsystem(System::explicit("d", Double))
        .unwrap()
        .add_subsystem(System::explicit("e", Sum))
        .unwrap()
        .connect("c.f", "d.x")
        .unwrap();

    let mut root = System::group("root");
    root.add_subsystem(g1)
        .unwrap()
        .add_subsystem(g2)
        .unwrap()
        .connect("g1.b.f", "g2.c.x")
        .unwrap()
        .connect_with_indices("g1.a.y", "g2.e.x", &[0, 2])
        .unwrap();
    let mut problem = Problem::new(root).with_comm(comm);
    problem.setup().unwrap();
    problem
}

/// Values of the variables held on one process, by name.
fn resident_values(vector: &Vector) -> BTreeMap<String, Vec<f64>> {
    vector
        .names()
        .map(|name| (name.to_string(), vector.slice(name).unwrap().to_vec()))
        .collect()
}

/// Merges the per-process values, checking that every copy of a variable agrees.
fn merge(per_rank: impl IntoIterator<Item = BTreeMap<String, Vec<f64>>>) -> BTreeMap<String, Vec<f64>> {
    let mut merged = BTreeMap::new();
    for values in per_rank {
        for (name, value) in values {
            let existing = merged.entry(name.clone()).or_insert_with(|| value.clone());
            assert_eq!(*existing, value, "copies of {} disagree", name);
        }
    }
    merged
}

#[test]
fn nested_splits_agree_on_any_number_of_processes() {
    let expected: BTreeMap<String, Vec<f64>> = [
        ("g1.a.y", vec![1.0, 2.0, 3.0]),
        ("g1.b.f", vec![6.0]),
        ("g2.c.f", vec![12.0]),
        ("g2.d.f", vec![24.0]),
        ("g2.e.s", vec![4.0]),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect();

    for size in 1..=5 {
        let reports = run_spmd(size, |comm| {
            let mut problem = nested_groups(comm);
            problem.run_solve_nonlinear().unwrap();

            let root = problem.root();
            let names = |kind| root.variables().names(kind).map(str::to_string).collect::<Vec<_>>();
            let (inputs, outputs) = (names(VariableKind::Input), names(VariableKind::Output));
            let resident_groups = root.subsystems().len();
            let vectors = problem.vectors("", &VectorName::Nonlinear).unwrap();
            (
                inputs,
                outputs,
                resident_groups,
                resident_values(&vectors.inputs),
                resident_values(&vectors.outputs),
                vectors.outputs.norm(),
            )
        });

        assert_eq!(reports.len(), size);
        for (inputs, outputs, resident_groups, _, _, norm) in &reports {
            assert_eq!(inputs, &["g1.b.x", "g2.c.x", "g2.d.x", "g2.e.x"]);
            assert_eq!(outputs, &["g1.a.y", "g1.b.f", "g2.c.f", "g2.d.f", "g2.e.s"]);
            assert_eq!(*resident_groups, if size == 1 { 2 } else { 1 });
            assert!((norm - 786.0f64.sqrt()).abs() < 1e-12);
        }

        let outputs = merge(reports.iter().map(|report| report.4.clone()));
        assert_eq!(outputs, expected);
        let inputs = merge(reports.iter().map(|report| report.3.clone()));
        assert_eq!(inputs["g1.b.x"], vec![3.0]);
        assert_eq!(inputs["g2.c.x"], vec![6.0]);
        assert_eq!(inputs["g2.d.x"], vec![12.0]);
        assert_eq!(inputs["g2.e.x"], vec![1.0, 3.0]);
    }
}

#[test]
fn groups_split_again_inside_their_process_range() {
    let splits = run_spmd(5, |comm| {
        let problem = nested_groups(comm);
        let group = &problem.root().subsystems()[0];
        (group.name().to_string(), group.comm().size(), group.subsystems().len())
    });
    // Three processes for g1, two for g2; g1 splits again, g2 has fewer processes than subsystems
    for (name, comm_size, resident) in &splits[..3] {
        assert_eq!((name.as_str(), *comm_size, *resident), ("g1", 3, 1));
    }
    for (name, comm_size, _) in &splits[3..] {
        assert_eq!((name.as_str(), *comm_size), ("g2", 2));
    }
}

#[test]
fn nested_derivatives_cross_process_boundaries() {
    for size in 1..=5 {
        let results = run_spmd(size, |comm| {
            let mut problem = nested_groups(comm);
            problem.run_solve_nonlinear().unwrap();
            problem.run_linearize().unwrap();
            let linear = VectorName::linear(mdao::problem::DEFAULT_LINEAR_VECTOR);
            {
                let mut vectors = problem.vectors("", &linear).unwrap();
                for name in ["g2.d.f", "g2.e.s"] {
                    if vectors.outputs.contains(name) {
                        vectors.outputs.set_scalar(name, 1.0).unwrap();
                    }
                }
            }
            problem
                .run_solve_linear(mdao::problem::DEFAULT_LINEAR_VECTOR, mdao::Mode::Reverse)
                .unwrap();
            let vectors = problem.vectors("", &linear).unwrap();
            vectors
                .residuals
                .contains("g1.a.y")
                .then(|| vectors.residuals.slice("g1.a.y").unwrap().to_vec())
        });
        let gradients: Vec<Vec<f64>> = results.into_iter().flatten().collect();
        assert!(!gradients.is_empty());
        for gradient in gradients {
            // d(d.f + e.s)/d(a.y) = [0, 0, 8] + [1, 0, 1]
            assert_eq!(gradient, vec![1.0, 0.0, 9.0]);
        }
    }
}
