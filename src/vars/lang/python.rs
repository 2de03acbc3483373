//! Python startup-script emitter.

use std::path::Path;

use indexmap::IndexMap;

use crate::vars::{Environment, Value};

pub fn render_startup_script(env: &Environment, wrapper_path: &Path) -> String {
    let mut out = String::from("#!/usr/bin/env python\n# -*- coding: utf-8 -*-\n");
    for (name, value) in env {
        out.push_str(&format!("{name} = {}\n", render_value(value)));
    }
    out.push_str(&format!(
        "exec(compile(open({0}).read(), {0}, 'exec'))\n",
        quote(&wrapper_path.display().to_string())
    ));
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Str(s) => quote(s),
        Value::Seq(items) => format!("[{}]", items.iter().map(render_value).collect::<Vec<_>>().join(", ")),
        Value::Map(map) => format!("{{{}}}", render_map_entries(map)),
    }
}

fn render_map_entries(map: &IndexMap<String, Value>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}: {}", quote(k), render_value(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Single-quoted with `\` and `'` backslash-escaped.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_backslash_and_single_quote() {
        assert_eq!(quote(r"a\b'c"), r"'a\\b\'c'");
    }

    #[test]
    fn renders_map_literal() {
        let mut map = IndexMap::new();
        map.insert("k".to_string(), Value::str("v"));
        assert_eq!(render_value(&Value::Map(map)), "{'k': 'v'}");
    }
}
