//! Perl startup-script emitter.
//!
//! First-level scalars become `our $NAME = 'v';`; first-level maps
//! become `our %NAME=(…);`; nested sequences/maps render as `[…]`/`{…}`
//! with `'key'=>…` entries. This module recurses over the value tree
//! directly rather than through the generic walker, capturing the
//! subtree itself rather than driving a path-collecting walk.

use std::path::Path;

use indexmap::IndexMap;

use crate::vars::{Environment, Value};

pub fn render_startup_script(env: &Environment, wrapper_path: &Path) -> String {
    let mut out = String::from("#!/usr/bin/perl -w\nuse strict;\n");
    for (name, value) in env {
        out.push_str(&render_top_level(name, value));
    }
    out.push_str(&format!("do {};\n", quote(&wrapper_path.display().to_string())));
    out
}

fn render_top_level(name: &str, value: &Value) -> String {
    match value {
        Value::Str(s) => format!("our ${name} = {};\n", quote(s)),
        Value::Seq(items) if items.iter().all(|v| matches!(v, Value::Str(_))) => {
            let scalars: Vec<&str> = items
                .iter()
                .map(|v| match v {
                    Value::Str(s) => s.as_str(),
                    _ => unreachable!(),
                })
                .collect();
            let list = scalars.iter().map(|s| quote(s)).collect::<Vec<_>>().join(", ");
            format!(
                "our ${name} = {};\nour @{name} = ({list});\n",
                quote(&scalars.join(" "))
            )
        }
        Value::Seq(items) => format!("our @{name} = {};\n", render_seq(items)),
        Value::Map(map) => format!("our %{name} = {};\n", render_map_body(map)),
    }
}

fn render_nested(value: &Value) -> String {
    match value {
        Value::Str(s) => quote(s),
        Value::Seq(items) => format!("[{}]", items.iter().map(render_nested).collect::<Vec<_>>().join(", ")),
        Value::Map(map) => format!("{{{}}}", render_map_entries(map)),
    }
}

fn render_seq(items: &[Value]) -> String {
    format!("({})", items.iter().map(render_nested).collect::<Vec<_>>().join(", "))
}

fn render_map_body(map: &IndexMap<String, Value>) -> String {
    format!("({})", render_map_entries(map))
}

fn render_map_entries(map: &IndexMap<String, Value>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}=>{}", quote(k), render_nested(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Single-quoted with `'` escaped as `'."'".'`.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "'.\"'\".'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_embedded_single_quote() {
        assert_eq!(quote("it's"), "'it'.\"'\".'s'");
    }

    #[test]
    fn top_level_scalar_renders_our_dollar() {
        assert_eq!(render_top_level("FOO", &Value::str("bar")), "our $FOO = 'bar';\n");
    }

    #[test]
    fn pure_string_sequence_emits_scalar_and_array() {
        let rendered = render_top_level("SF_INPUTS", &Value::seq([Value::str("A"), Value::str("B")]));
        assert!(rendered.contains("our $SF_INPUTS = 'A B';"));
        assert!(rendered.contains("our @SF_INPUTS = ('A', 'B');"));
    }
}
