//! Makefile startup-script emitter.

use std::path::Path;

use crate::vars::{flatten, Environment};

pub fn render_startup_script(env: &Environment, wrapper_path: &Path) -> String {
    let mut out = String::new();
    for (name, value) in env {
        for (path, value) in flatten(name, value, '_') {
            out.push_str(&format!("export {path}\n{path} := {value}\n"));
        }
    }
    out.push_str("all:\n");
    out.push_str(&format!("\t$(MAKE) -f {}\n", wrapper_path.display()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::Value;
    use std::path::PathBuf;

    #[test]
    fn emits_export_and_assignment() {
        let mut env = Environment::new();
        env.insert("FOO".to_string(), Value::str("a b"));
        let out = render_startup_script(&env, &PathBuf::from("wrapper.mk"));
        assert!(out.contains("export FOO\n"));
        assert!(out.contains("FOO := a b\n"));
    }
}
