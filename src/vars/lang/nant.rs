//! NAnt startup-buildfile emitter: same flattened shape as
//! [`super::ant`], with the added rewrite `$` → `${'$'}` so NAnt's own
//! `${…}` property evaluation does not fire on emitted values.

use std::path::Path;

use super::xml_escape;
use crate::vars::{flatten, Environment};

pub fn render_startup_script(env: &Environment, wrapper_path: &Path) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<project name=\"startup\" default=\"run\">\n");
    for (name, value) in env {
        for (path, value) in flatten(name, value, '.') {
            out.push_str(&format!(
                "  <property name=\"{}\" value=\"{}\"/>\n",
                xml_escape(&path),
                xml_escape(&escape_dollar(&value))
            ));
        }
    }
    out.push_str(&format!(
        "  <target name=\"run\">\n    <nant buildfile=\"{}\"/>\n  </target>\n</project>\n",
        xml_escape(&wrapper_path.display().to_string())
    ));
    out
}

fn escape_dollar(value: &str) -> String {
    value.replace('$', "${'$'}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::Value;
    use std::path::PathBuf;

    #[test]
    fn escapes_dollar_before_xml_escaping() {
        let mut env = Environment::new();
        env.insert("FOO".to_string(), Value::str("$HOME"));
        let out = render_startup_script(&env, &PathBuf::from("wrapper.build"));
        assert!(out.contains("value=\"${'$'}HOME\""));
    }
}
