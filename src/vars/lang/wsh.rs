//! WSH (JScript/VBScript) startup-script emitter.
//!
//! First-level values become `var NAME = SF_WRAP(expr)`; a prelude
//! defines `SF_WRAP` so VBScript code (which has no `for … in` over
//! JScript objects) can introspect an emitted map via `.size()`/`.get(k)`.
//! A common-dir include mechanism splices every `.vbs`/`.js` file found
//! under a `common/` subdirectory between the prelude and the wrapper,
//! as `<script language="…" src="…"/>` elements.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use super::xml_escape;
use crate::vars::{Environment, Value};

const SF_WRAP_PRELUDE: &str = r#"function SF_WRAP(v) {
    if (v !== null && typeof v === "object" && !(v instanceof Array)) {
        v.size = function() {
            var n = 0;
            for (var k in this) { if (k !== "size" && k !== "get") n++; }
            return n;
        };
        v.get = function(k) { return this[k]; };
    }
    return v;
}
"#;

pub fn render_startup_script(env: &Environment, wrapper_path: &Path, common_scripts: &[PathBuf]) -> String {
    let mut out = String::from("<job>\n<script language=\"JScript\">\n");
    out.push_str(SF_WRAP_PRELUDE);
    for (name, value) in env {
        out.push_str(&format!("var {name} = SF_WRAP({});\n", render_value(value)));
    }
    out.push_str("</script>\n");

    for script in common_scripts {
        let language = match script.extension().and_then(|e| e.to_str()) {
            Some("vbs") => "VBScript",
            _ => "JScript",
        };
        out.push_str(&format!(
            "<script language=\"{language}\" src=\"{}\"/>\n",
            xml_escape(&script.display().to_string())
        ));
    }

    let wrapper_language = match wrapper_path.extension().and_then(|e| e.to_str()) {
        Some("vbs") => "VBScript",
        _ => "JScript",
    };
    out.push_str(&format!(
        "<script language=\"{wrapper_language}\" src=\"{}\"/>\n",
        xml_escape(&wrapper_path.display().to_string())
    ));
    out.push_str("</job>\n");
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

/// JScript double-quoted string literal.
pub fn quote(value: &str) -> String {
    format!(
        "\"{}\"",
        value.replace('\\', "\\\\").replace('"', "\\\"")
    )
}
