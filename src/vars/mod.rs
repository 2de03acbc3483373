//! Wrapper variable encoder.
//!
//! A tagged value tree (`Value::Str | Value::Map | Value::Seq`) is
//! walked once per top-level environment name and handed to a
//! per-language emitter that materializes the startup script. Flattened
//! emitters (shell, batch, make, ant, nant) drive the walk with a
//! [`PathCollector`] that builds `<path>=<value>` pairs from the
//! walker's name/index stack. Literal-syntax emitters (perl, python,
//! ruby, wsh) don't need the path stack — they recurse over the
//! [`Value`] tree directly and build their own nested bracket syntax,
//! which don't drive the generic path-collecting walk at all — they
//! capture the subtree themselves.

pub mod lang;

use indexmap::IndexMap;

/// One segment of the walker's context stack: a map-entry name or a
/// sequence index.
#[derive(Debug, Clone)]
pub enum PathSegment {
    Name(String),
    Index(usize),
}

impl PathSegment {
    fn as_str(&self) -> String {
        match self {
            PathSegment::Name(n) => n.clone(),
            PathSegment::Index(i) => i.to_string(),
        }
    }
}

/// The union type `String | OrderedMap<String,Value> | Sequence<Value>`
/// the walker visits. Map order is insertion order (`IndexMap`); sequence
/// order is vector order.
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Map(IndexMap<String, Value>),
    Seq(Vec<Value>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn seq(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Seq(items.into_iter().collect())
    }

    /// All leaf strings in document order, for emitters that need a
    /// space-joined scalar form alongside the structured one (the Perl
    /// emitter: "sequences of pure strings additionally emit a scalar
    /// form with space-joined values").
    pub fn flatten_strings(&self) -> Vec<String> {
        match self {
            Value::Str(s) => vec![s.clone()],
            Value::Seq(items) => items.iter().flat_map(Value::flatten_strings).collect(),
            Value::Map(map) => map.values().flat_map(Value::flatten_strings).collect(),
        }
    }

    pub fn is_all_strings(&self) -> bool {
        match self {
            Value::Str(_) => true,
            Value::Seq(items) => items.iter().all(Value::is_all_strings),
            Value::Map(_) => false,
        }
    }
}

/// The full startup environment: an ordered map of top-level variable
/// name to value, built by the task run engine.
pub type Environment = IndexMap<String, Value>;

/// Builds `<path>=<value>` pairs for one top-level name by walking the
/// value tree and joining the context stack with `separator`. Emits an
/// additional `<path>_KEYS`/`.KEYS`-suffixed entry (space-joined key
/// list) for every map node.
pub fn flatten(name: &str, value: &Value, separator: char) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut path = vec![PathSegment::Name(name.to_string())];
    flatten_into(value, &mut path, separator, &mut pairs);
    pairs
}

fn joined(path: &[PathSegment], separator: char) -> String {
    path.iter()
        .map(PathSegment::as_str)
        .collect::<Vec<_>>()
        .join(&separator.to_string())
}

fn flatten_into(
    value: &Value,
    path: &mut Vec<PathSegment>,
    separator: char,
    pairs: &mut Vec<(String, String)>,
) {
    match value {
        Value::Str(s) => {
            pairs.push((joined(path, separator), s.clone()));
        }
        Value::Map(map) => {
            let base = joined(path, separator);
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            pairs.push((format!("{base}{separator}KEYS"), keys.join(" ")));
            for (key, child) in map {
                path.push(PathSegment::Name(key.clone()));
                flatten_into(child, path, separator, pairs);
                path.pop();
            }
        }
        Value::Seq(items) => {
            if items.iter().all(|v| matches!(v, Value::Str(_))) {
                let joined_values: Vec<&str> = items
                    .iter()
                    .map(|v| match v {
                        Value::Str(s) => s.as_str(),
                        _ => unreachable!(),
                    })
                    .collect();
                pairs.push((joined(path, separator), joined_values.join(" ")));
            } else {
                for (idx, child) in items.iter().enumerate() {
                    path.push(PathSegment::Index(idx));
                    flatten_into(child, path, separator, pairs);
                    path.pop();
                }
            }
        }
    }
}
