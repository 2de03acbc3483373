//! Run Factory.
//!
//! Resolves a configured wrapper name to a concrete wrapper file by
//! scanning the configured base directories in order and matching a
//! fixed extension-priority list. The same resolution logic serves all
//! three flavors (execution, extraction, abort) — they differ only in
//! which base filename (`wrapper`, `extractor`, `..._abort`) is
//! searched for and in the auxiliary filenames the task run engine
//! writes alongside the startup script.

use std::path::{Path, PathBuf};

/// Which run this wrapper resolution is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Execution,
    Extraction,
}

impl RunKind {
    fn base_name(self) -> &'static str {
        match self {
            RunKind::Execution => "wrapper",
            RunKind::Extraction => "extractor",
        }
    }
}

/// The normal run wrapper, or its optional `_abort` companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperFlavor {
    Normal(RunKind),
    Abort(RunKind),
}

impl WrapperFlavor {
    fn base_name(self) -> String {
        match self {
            WrapperFlavor::Normal(kind) => kind.base_name().to_string(),
            WrapperFlavor::Abort(kind) => format!("{}_abort", kind.base_name()),
        }
    }

    /// The auxiliary filenames the task run engine writes for this
    /// flavor: log file, startup script basename (extension is added by
    /// the resolved language), and the results filename the run type
    /// declares (none for abort — only execution and extraction runs
    /// report results).
    pub fn files(self) -> FlavorFiles {
        match self {
            WrapperFlavor::Normal(RunKind::Execution) => FlavorFiles {
                log_file: "wrapper.log",
                startup_basename: "startup",
                results_file: Some("results"),
            },
            WrapperFlavor::Normal(RunKind::Extraction) => FlavorFiles {
                log_file: "extractor.log",
                startup_basename: "startup",
                results_file: Some("results"),
            },
            WrapperFlavor::Abort(_) => FlavorFiles {
                log_file: "abort.log",
                startup_basename: "startup_abort",
                results_file: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlavorFiles {
    pub log_file: &'static str,
    pub startup_basename: &'static str,
    pub results_file: Option<&'static str>,
}

/// One entry of the fixed extension-priority list.
struct LanguageExt {
    extension: &'static str,
    language: &'static str,
    windows_only: bool,
}

const PRIORITY: &[LanguageExt] = &[
    LanguageExt { extension: "bat", language: "batch", windows_only: true },
    LanguageExt { extension: "sh", language: "shell", windows_only: false },
    LanguageExt { extension: "mk", language: "make", windows_only: false },
    LanguageExt { extension: "pl", language: "perl", windows_only: false },
    LanguageExt { extension: "py", language: "python", windows_only: false },
    LanguageExt { extension: "rb", language: "ruby", windows_only: false },
    LanguageExt { extension: "xml", language: "ant", windows_only: false },
    LanguageExt { extension: "build", language: "nant", windows_only: false },
    LanguageExt { extension: "vbs", language: "wsh", windows_only: true },
    LanguageExt { extension: "js", language: "wsh", windows_only: true },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWrapper {
    pub language: &'static str,
    pub path: PathBuf,
}

/// Resolves `wrapperName` against `baseDirs` in order. `windows` gates the Windows-only extensions (`.bat`, `.vbs`,
/// `.js`). Returns `None` — "no wrapper" — when nothing matches; the
/// caller treats that as a skip for optional flavors and a fatal
/// configuration error for execution.
pub fn resolve(
    base_dirs: &[PathBuf],
    wrapper_name: &str,
    flavor: WrapperFlavor,
    windows: bool,
) -> Option<ResolvedWrapper> {
    let base = flavor.base_name();
    for dir in base_dirs {
        let wrapper_dir = dir.join(wrapper_name);
        if !wrapper_dir.is_dir() {
            continue;
        }
        for entry in PRIORITY {
            if entry.windows_only && !windows {
                continue;
            }
            let candidate = wrapper_dir.join(format!("{base}.{}", entry.extension));
            if candidate.is_file() {
                return Some(ResolvedWrapper {
                    language: entry.language,
                    path: candidate,
                });
            }
        }
    }
    None
}

/// Argv-prefix rule for the shell run type: if the file has no
/// shebang, default to `/bin/sh`.
pub fn shell_interpreter(script_path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(script_path) else {
        return "/bin/sh".to_string();
    };
    let Some(first_line) = content.lines().next() else {
        return "/bin/sh".to_string();
    };
    if let Some(rest) = first_line.strip_prefix("#!") {
        let interpreter = rest.trim();
        if !interpreter.is_empty() {
            return interpreter.to_string();
        }
    }
    "/bin/sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "task-runner-agent-test-{label}-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn resolves_first_matching_extension_in_priority_order() {
        let base = scratch_dir("factory-priority");
        let wrapper_dir = base.join("build");
        fs::create_dir_all(&wrapper_dir).unwrap();
        fs::write(wrapper_dir.join("wrapper.py"), "").unwrap();
        fs::write(wrapper_dir.join("wrapper.sh"), "").unwrap();

        let resolved = resolve(
            &[base.clone()],
            "build",
            WrapperFlavor::Normal(RunKind::Execution),
            false,
        )
        .unwrap();
        assert_eq!(resolved.language, "shell");

        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn skips_windows_only_extensions_off_windows() {
        let base = scratch_dir("factory-windows");
        let wrapper_dir = base.join("build");
        fs::create_dir_all(&wrapper_dir).unwrap();
        fs::write(wrapper_dir.join("wrapper.bat"), "").unwrap();
        fs::write(wrapper_dir.join("wrapper.pl"), "").unwrap();

        let resolved = resolve(
            &[base.clone()],
            "build",
            WrapperFlavor::Normal(RunKind::Execution),
            false,
        )
        .unwrap();
        assert_eq!(resolved.language, "perl");

        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn abort_flavor_looks_for_suffixed_base_name() {
        let base = scratch_dir("factory-abort");
        let wrapper_dir = base.join("build");
        fs::create_dir_all(&wrapper_dir).unwrap();
        fs::write(wrapper_dir.join("wrapper_abort.sh"), "").unwrap();

        let resolved = resolve(
            &[base.clone()],
            "build",
            WrapperFlavor::Abort(RunKind::Execution),
            false,
        )
        .unwrap();
        assert_eq!(resolved.path, wrapper_dir.join("wrapper_abort.sh"));

        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn no_match_returns_none() {
        let base = scratch_dir("factory-empty");
        let wrapper_dir = base.join("build");
        fs::create_dir_all(&wrapper_dir).unwrap();

        assert!(resolve(
            &[base.clone()],
            "build",
            WrapperFlavor::Normal(RunKind::Execution),
            false,
        )
        .is_none());

        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn shell_interpreter_defaults_to_bin_sh_without_shebang() {
        let base = scratch_dir("factory-shebang");
        let script = base.join("wrapper.sh");
        fs::write(&script, "echo hi\n").unwrap();
        assert_eq!(shell_interpreter(&script), "/bin/sh");
        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn shell_interpreter_reads_shebang() {
        let base = scratch_dir("factory-shebang2");
        let script = base.join("wrapper.sh");
        fs::write(&script, "#!/usr/bin/env bash\necho hi\n").unwrap();
        assert_eq!(shell_interpreter(&script), "/usr/bin/env bash");
        fs::remove_dir_all(&base).ok();
    }
}
