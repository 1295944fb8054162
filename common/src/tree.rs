//! Path access into a JSON tree laid out like the realtime store: objects
//! nested by slash-separated keys, with `null` meaning "absent".

use serde_json::{Map, Value};

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path)
        .into_iter()
        .try_fold(root, |node, segment| node.get(segment))
        .filter(|value| !value.is_null())
}

/// Writes `value` at `path`, creating intermediate objects. Writing `null`
/// removes the key.
pub fn set(root: &mut Value, path: &str, value: Value) {
    let segments = segments(path);
    let Some((last, parents)) = segments.split_last() else {
        *root = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        return;
    };

    if value.is_null() {
        remove(root, parents, last);
        return;
    }

    let mut node = root;
    for segment in parents {
        node = as_object(node)
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object(node).insert(last.to_string(), value);
}

/// Shallow merge of `fields` into the object at `path`. Keys may themselves
/// be paths.
pub fn update(root: &mut Value, path: &str, fields: Map<String, Value>) {
    for (key, value) in fields {
        set(root, &format!("{path}/{key}"), value);
    }
}

fn remove(root: &mut Value, parents: &[&str], last: &str) {
    let mut node = root;
    for segment in parents {
        match node.get_mut(*segment) {
            Some(child) => node = child,
            None => return,
        }
    }
    if let Value::Object(map) = node {
        map.remove(last);
    }
}

fn as_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was replaced with an object"),
    }
}
