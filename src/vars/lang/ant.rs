//! Ant startup-buildfile emitter.

use std::path::Path;

use super::xml_escape;
use crate::vars::{flatten, Environment};

pub fn render_startup_script(env: &Environment, wrapper_path: &Path) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<project default=\"run\">\n");
    for (name, value) in env {
        for (path, value) in flatten(name, value, '.') {
            out.push_str(&format!(
                "  <property name=\"{}\" value=\"{}\"/>\n",
                xml_escape(&path),
                xml_escape(&value)
            ));
        }
    }
    out.push_str(&format!(
        "  <target name=\"run\">\n    <ant antfile=\"{}\"/>\n  </target>\n</project>\n",
        xml_escape(&wrapper_path.display().to_string())
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::Value;
    use std::path::PathBuf;

    #[test]
    fn emits_property_elements() {
        let mut env = Environment::new();
        env.insert("FOO".to_string(), Value::str("a b"));
        let out = render_startup_script(&env, &PathBuf::from("wrapper.xml"));
        assert!(out.contains("<property name=\"FOO\" value=\"a b\"/>"));
        assert!(out.contains("<ant antfile=\"wrapper.xml\"/>"));
    }
}
