use crate::{Passive, Scale};
use mdao::proptest::variable;
use mdao::variables::{wildcard_match, Promotions, PerKind};
use mdao::{Error, Problem, System, Variable, VariableDeclarations, VariableKind};
use proptest::collection::vec;
use proptest::prelude::*;

#[test]
fn exact_promotion_overrides_rename() {
    let promotions = Promotions {
        inputs: vec!["x".to_string()],
        renames: PerKind::new(vec![("x".to_string(), "renamed".to_string())], Vec::new()),
        ..Default::default()
    };
    assert_eq!(promotions.map_name("comp", VariableKind::Input, "x"), "x");
}

#[test]
fn wildcard_promotion_overrides_rename() {
    let promotions = Promotions {
        outputs: vec!["y*".to_string()],
        renames: PerKind::new(Vec::new(), vec![("y1".to_string(), "z".to_string())]),
        ..Default::default()
    };
    assert_eq!(promotions.map_name("comp", VariableKind::Output, "y1"), "y1");
    assert_eq!(promotions.map_name("comp", VariableKind::Input, "y1"), "comp.y1");
}

#[test]
fn renames_apply_to_their_kind_only() {
    let promotions = Promotions {
        renames: PerKind::new(vec![("x".to_string(), "a".to_string())], Vec::new()),
        ..Default::default()
    };
    assert_eq!(promotions.map_name("comp", VariableKind::Input, "x"), "a");
    assert_eq!(promotions.map_name("comp", VariableKind::Output, "x"), "comp.x");
}

#[test]
fn promotion_of_any_kind_replaces_per_kind_lists() {
    let promotions = Promotions {
        any: vec!["x".to_string()],
        outputs: vec!["y".to_string()],
        ..Default::default()
    };
    assert_eq!(promotions.map_name("comp", VariableKind::Input, "x"), "x");
    assert_eq!(promotions.map_name("comp", VariableKind::Output, "y"), "comp.y");
}

#[test]
fn wildcards() {
    assert!(wildcard_match("*", "anything"));
    assert!(wildcard_match("d?.y", "d1.y"));
    assert!(!wildcard_match("d?.y", "d12.y"));
    assert!(!wildcard_match("X*", "x1"));
}

#[test]
fn declarations_are_validated() {
    let mut declarations = VariableDeclarations::default();
    declarations.add_input("x", Variable::scalar(1.0)).unwrap();
    assert!(matches!(
        declarations.add_input("x", Variable::scalar(1.0)),
        Err(Error::Configuration(_))
    ));
    // Inputs and outputs live in separate namespaces
    declarations.add_output("x", Variable::scalar(1.0)).unwrap();
    assert!(matches!(
        declarations.add_output("a.b", Variable::scalar(1.0)),
        Err(Error::Configuration(_))
    ));
    assert_eq!(
        declarations
            .add_output("m", Variable::array(&[2, 2], vec![1.0, 2.0, 3.0]))
            .err(),
        Some(Error::Dimension {
            variable: "m".to_string(),
            expected: 4,
            actual: 3
        })
    );
}

#[test]
fn names_are_promoted_through_the_hierarchy() {
    let mut inner = System::group("inner");
    inner
        .add_subsystem(System::explicit("s1", Scale::new(1, 2.0)).promotes_outputs(&["y"]))
        .unwrap()
        .add_subsystem(System::explicit("s2", Scale::new(1, 3.0)).rename_input("x", "u"))
        .unwrap();
    let mut root = System::group("root");
    root.add_subsystem(inner.promotes_inputs(&["s1.*"]))
        .unwrap()
        .add_subsystem(System::explicit("last", Scale::new(1, 1.0)))
        .unwrap();

    let mut problem = Problem::new(root);
    problem.setup().unwrap();

    let names = |kind| problem.root().variables().names(kind).map(str::to_string).collect::<Vec<_>>();
    assert_eq!(names(VariableKind::Input), vec!["s1.x", "inner.u", "last.x"]);
    assert_eq!(names(VariableKind::Output), vec!["inner.y", "inner.s2.y", "last.y"]);

    let inner = problem.system("inner").unwrap();
    assert_eq!(inner.path_name(), "inner");
    assert_eq!(inner.depth(), 1);
    assert_eq!(inner.variables().names(VariableKind::Input).collect::<Vec<_>>(), vec!["s1.x", "u"]);
    assert_eq!(problem.system("inner.s2").unwrap().path_name(), "inner.s2");
}

#[test]
fn duplicate_outputs_in_one_namespace_are_rejected() {
    let mut root = System::group("root");
    root.add_subsystem(System::explicit("a", Scale::new(1, 1.0)).promotes(&["y"]))
        .unwrap()
        .add_subsystem(System::explicit("b", Scale::new(1, 1.0)).promotes(&["y"]))
        .unwrap();
    let mut problem = Problem::new(root);
    assert!(matches!(problem.setup(), Err(Error::Configuration(_))));
}

#[test]
fn variable_table_records_sources_and_owners() {
    let mut root = System::group("root");
    root.add_subsystem(System::explicit("a", Scale::new(2, 1.0)).promotes_outputs(&["y"]))
        .unwrap()
        .add_subsystem(System::explicit("b", Scale::new(2, 1.0)).rename_input("x", "y"))
        .unwrap();
    let mut problem = Problem::new(root);
    problem.setup().unwrap();

    let table = problem.variable_table().unwrap();
    assert_eq!(table.len(VariableKind::Input), 2);
    assert_eq!(table.len(VariableKind::Output), 2);
    assert_eq!(table.name(VariableKind::Input, 1), "y");
    assert_eq!(table.source(0), None);
    assert_eq!(table.source(1), Some(0));
    assert_eq!(table.size(VariableKind::Output, 1), 2);
    assert_eq!(table.owner(VariableKind::Output, 1), 0);
    assert_eq!(table.varset_names().to_vec(), vec!["default".to_string()]);
}

/// Checks the index ranges of every node against those of its children.
fn check_ranges(system: &System) {
    for kind in VariableKind::ALL {
        let range = system.variables().range(kind);
        assert_eq!(range.len(), system.variables().len(kind));
        if system.is_group() {
            let mut next = range.start;
            for child in system.subsystems() {
                let child_range = child.variables().range(kind);
                assert_eq!(child_range.start, next);
                next = child_range.end;
                check_ranges(child);
            }
            assert_eq!(next, range.end);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sibling_ranges_are_contiguous_and_cover_their_parent(
        leaves in vec((vec(variable(), 0..3), vec(variable(), 0..3)), 1..6),
        split in 0..6usize,
    ) {
        let split = split.min(leaves.len());
        let mut groups = [System::group("g0"), System::group("g1")];
        for (i, (inputs, outputs)) in leaves.into_iter().enumerate() {
            let mut passive = Passive::new();
            for (j, input) in inputs.into_iter().enumerate() {
                passive = passive.with_input(&format!("in{}", j), input);
            }
            for (j, output) in outputs.into_iter().enumerate() {
                passive = passive.with_output(&format!("out{}", j), output);
            }
            let group = if i < split { &mut groups[0] } else { &mut groups[1] };
            group.add_subsystem(System::component(&format!("c{}", i), passive)).unwrap();
        }
        let mut root = System::group("root");
        for group in groups {
            root.add_subsystem(group).unwrap();
        }

        let mut problem = Problem::new(root);
        problem.setup().unwrap();
        let root = problem.root();
        prop_assert_eq!(root.variables().range(VariableKind::Input).start, 0);
        prop_assert_eq!(root.variables().range(VariableKind::Output).start, 0);
        check_ranges(root);
    }
}
