//! Shell (`/bin/sh`) startup-script emitter.

use std::path::Path;

use crate::vars::{flatten, Environment};

pub fn render_startup_script(env: &Environment, wrapper_path: &Path) -> String {
    let mut out = String::from("#!/bin/sh\n");
    for (name, value) in env {
        for (path, value) in flatten(name, value, '_') {
            out.push_str(&format!("{path}={}\n", quote(&value)));
            out.push_str(&format!("export {path}\n"));
        }
    }
    out.push_str(&format!(". {}\n", quote(&wrapper_path.display().to_string())));
    out
}

/// Backslash-escapes shell metacharacters so the value can be embedded
/// unquoted.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(
            ch,
            ' ' | '\t' | '\n' | '$' | '`' | '"' | '\'' | '\\' | ';' | '&' | '|' | '(' | ')'
                | '<' | '>' | '*' | '?' | '[' | ']' | '#' | '~' | '=' | '%' | '!'
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
