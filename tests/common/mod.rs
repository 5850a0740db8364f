//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use flowbench::context::{ContextModified, DictModified, NumericContext};
use flowbench::{Context, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Assert two float slices are elementwise approximately equal; NaN matches NaN.
pub fn assert_floats_eq(actual: &[f64], expected: &[f64], epsilon: f64) {
    assert_eq!(actual.len(), expected.len(), "length of {:?} vs {:?}", actual, expected);
    for (a, b) in actual.iter().zip(expected) {
        if a.is_nan() && b.is_nan() {
            continue;
        }
        assert_float_eq(*a, *b, epsilon);
    }
}

/// Array contents of `name` as seen through `ctx`.
pub fn values(ctx: &dyn NumericContext, name: &str) -> Vec<f64> {
    match ctx.get_context_data(name) {
        Ok(Value::Array(array)) => array.to_vec(),
        Ok(other) => panic!("'{name}' is {}, not an array", other.type_name()),
        Err(e) => panic!("'{name}' not readable: {e}"),
    }
}

/// Records every `ContextModified` a context or stage emits.
pub fn record_context_events(ctx: &dyn NumericContext) -> Rc<RefCell<Vec<ContextModified>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    ctx.context_modified().subscribe(move |e| {
        sink.borrow_mut().push(e.clone());
        Ok(())
    });
    events
}

/// Records every `DictModified` a root context emits.
pub fn record_dict_events(ctx: &Context) -> Rc<RefCell<Vec<DictModified>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    ctx.dict_modified().subscribe(move |e| {
        sink.borrow_mut().push(e.clone());
        Ok(())
    });
    events
}
