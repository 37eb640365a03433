use std::collections::HashSet;

use crate::value::Value;

/// Reads every nested field of `value` so the evaluating watcher records
/// all of them. Shared or cyclic containers are visited once.
pub(crate) fn traverse(value: &Value) {
    let mut seen = HashSet::new();
    walk(value, &mut seen);
}

fn walk(value: &Value, seen: &mut HashSet<usize>) {
    match value {
        Value::Object(object) => {
            if object.is_frozen() {
                return;
            }
            if let Some(addr) = value.identity()
                && !seen.insert(addr)
            {
                return;
            }
            for key in object.field_names() {
                walk(&object.get(&key), seen);
            }
        }
        Value::Array(array) => {
            if let Some(addr) = value.identity()
                && !seen.insert(addr)
            {
                return;
            }
            array.len();
            for item in array.snapshot() {
                walk(&item, seen);
            }
        }
        _ => {}
    }
}
