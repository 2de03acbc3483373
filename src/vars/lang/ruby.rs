//! Ruby startup-script emitter.
//! First-level values become `$NAME=expr`; maps use `'key'=>value`.

use std::path::Path;

use indexmap::IndexMap;

use crate::vars::{Environment, Value};

pub fn render_startup_script(env: &Environment, wrapper_path: &Path) -> String {
    let mut out = String::from("#!/usr/bin/env ruby\n");
    for (name, value) in env {
        out.push_str(&format!("${name}={}\n", render_value(value)));
    }
    out.push_str(&format!("load {}\n", quote(&wrapper_path.display().to_string())));
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
        .map(|(k, v)| format!("{}=>{}", quote(k), render_value(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
