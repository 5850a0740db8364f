//! Property-based tests for the event merge algebra, block restriction,
//! topological stability and dynamic bindings.

mod common;

use flowbench::block::{execute, execute_restricted, Block};
use flowbench::context::DictModified;
use flowbench::{Context, DynamicObject, Value};
use proptest::prelude::*;
use std::collections::BTreeSet;

const KEYS: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Clone)]
enum Op {
    Set(usize, i64),
    Remove(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..KEYS.len(), -3i64..3).prop_map(|(k, v)| Op::Set(k, v)),
        1 => (0..KEYS.len()).prop_map(Op::Remove),
    ]
}

/// Apply `ops`, skipping removals of unbound names.
fn apply(ctx: &Context, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Set(k, v) => ctx.set(KEYS[*k], *v).unwrap(),
            Op::Remove(k) => {
                if ctx.contains(KEYS[*k]) {
                    ctx.remove(KEYS[*k]).unwrap();
                }
            }
        }
    }
}

/// Statements `s{i} = <earlier names> ...` that each read at least one name.
fn block_strategy() -> impl Strategy<Value = Vec<String>> {
    (1usize..8).prop_flat_map(|n| {
        let reads: Vec<_> = (0..n)
            .map(|i| (proptest::collection::vec(0..=i, 1..3), 0i64..5))
            .collect();
        reads.prop_map(|statements| {
            statements
                .into_iter()
                .enumerate()
                .map(|(i, (sources, constant))| {
                    let terms: Vec<String> = sources
                        .into_iter()
                        .map(|s| if s == i { "x".to_string() } else { format!("s{s}") })
                        .collect();
                    format!("s{i} = {} + {constant}", terms.join(" - "))
                })
                .collect()
        })
    })
}

proptest! {
    #[test]
    fn prop_deferred_event_is_merge_of_trace(ops in proptest::collection::vec(op_strategy(), 0..12)) {
        let eager = Context::new("eager");
        let trace = common::record_dict_events(&eager);
        apply(&eager, &ops);

        let deferred = Context::new("deferred");
        let batched = common::record_dict_events(&deferred);
        deferred.batch(|| {
            apply(&deferred, &ops);
            Ok(())
        }).unwrap();

        let mut merged = DictModified::default();
        for event in trace.borrow().iter().cloned() {
            merged.merge(event);
        }
        let batched = batched.borrow();
        if merged.is_empty() {
            prop_assert!(batched.iter().all(DictModified::is_empty));
        } else {
            prop_assert_eq!(batched.len(), 1);
            prop_assert_eq!(&batched[0], &merged);
        }

        // The merged event replayed on an empty map reproduces the final state.
        let mut replayed: Vec<(String, Value)> = merged.added.clone().into_iter().collect();
        replayed.extend(merged.changed.iter().map(|(k, c)| (k.clone(), c.new.clone())));
        replayed.sort_by(|a, b| a.0.cmp(&b.0));
        let mut actual = deferred.entries();
        actual.sort_by(|a, b| a.0.cmp(&b.0));
        prop_assert_eq!(replayed, actual);
    }

    #[test]
    fn prop_restrict_matches_full_execution(
        statements in block_strategy(),
        picks in proptest::collection::vec(any::<bool>(), 8),
        x in -10i64..10,
    ) {
        let block = Block::parse(&statements.join("\n")).unwrap();
        let outputs: BTreeSet<String> = (0..statements.len())
            .filter(|i| picks[*i])
            .map(|i| format!("s{i}"))
            .collect();
        let inputs: BTreeSet<String> = ["x".to_string()].into();

        let full = Context::new("full");
        full.set("x", x).unwrap();
        execute(&block, &full).unwrap();

        let partial = Context::new("partial");
        partial.set("x", x).unwrap();
        execute_restricted(&block, &partial, Some(&inputs), Some(&outputs)).unwrap();

        for name in &outputs {
            prop_assert_eq!(full.get(name).unwrap(), partial.get(name).unwrap());
        }
    }

    #[test]
    fn prop_restrict_excludes_statements_unreachable_from_inputs(
        statements in block_strategy(),
        detached in 1usize..4,
        position in any::<prop::sample::Index>(),
        x in -10i64..10,
    ) {
        // u{j} only read `w`, which is never supplied.
        let mut lines = statements.clone();
        for j in 0..detached {
            let source = if j == 0 { "w".to_string() } else { format!("u{}", j - 1) };
            let at = position.index(lines.len() + 1);
            lines.insert(at, format!("u{j} = {source} + {j}"));
        }
        let block = Block::parse(&lines.join("\n")).unwrap();
        let inputs: BTreeSet<String> = ["x".to_string()].into();
        let outputs = block.outputs();

        let restricted = block.restrict(Some(&inputs), Some(&outputs)).unwrap();
        prop_assert_eq!(restricted.len(), statements.len());
        for statement in restricted.statements() {
            prop_assert!(statement.outputs().iter().all(|name| name.starts_with('s')));
        }

        let ctx = Context::new("partial");
        ctx.set("x", x).unwrap();
        let report = execute_restricted(&block, &ctx, Some(&inputs), Some(&outputs)).unwrap();
        prop_assert_eq!(report.skipped, detached);
        prop_assert!(!ctx.contains("u0"));
    }

    #[test]
    fn prop_topological_order_is_stable(
        statements in block_strategy().prop_shuffle(),
        position in any::<prop::sample::Index>(),
    ) {
        let block = Block::parse(&statements.join("\n")).unwrap();
        let before: Vec<String> = block
            .sorted()
            .unwrap()
            .statements()
            .iter()
            .map(|s| s.label())
            .collect();

        let mut extended = statements.clone();
        extended.insert(position.index(statements.len() + 1), "unrelated = 42".to_string());
        let extended = Block::parse(&extended.join("\n")).unwrap();
        let after: Vec<String> = extended
            .sorted()
            .unwrap()
            .statements()
            .iter()
            .map(|s| s.label())
            .filter(|label| label != "unrelated = 42")
            .collect();

        prop_assert_eq!(before, after);
    }

    #[test]
    fn prop_dynamic_binding_follows_renames(renames in proptest::collection::vec(
        prop_oneof![Just("a"), Just("b"), Just("c"), Just("d"), Just("taken")], 0..10)
    ) {
        let ctx = Context::new("root");
        ctx.set("taken", 1).unwrap();
        let object = DynamicObject::new("well").with_attr("name", "start");
        prop_assert!(ctx.bind_dynamic(&object, "name").unwrap());

        let mut location = "start".to_string();
        let mut bound = true;
        for name in renames {
            object.set_attr("name", name);
            if bound && name != location {
                if name == "taken" {
                    bound = false;
                } else {
                    location = name.to_string();
                }
            }

            let holders: Vec<String> = ctx
                .entries()
                .into_iter()
                .filter(|(_, v)| v.is_same(&Value::Object(object.clone())))
                .map(|(k, _)| k)
                .collect();
            prop_assert_eq!(holders, vec![location.clone()]);
            prop_assert_eq!(ctx.binding_name(&object), bound.then(|| location.clone()));
            prop_assert_eq!(ctx.get("taken").unwrap(), Value::Int(1));
        }
    }

    #[test]
    fn prop_render_round_trip(statements in block_strategy()) {
        let block = Block::parse(&statements.join("\n")).unwrap();
        prop_assert_eq!(Block::parse(&block.render()).unwrap(), block);
    }
}
