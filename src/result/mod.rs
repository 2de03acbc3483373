//! Result model and results-file parser.
//!
//! A task communicates its outcome back to the agent through a
//! line-oriented `key=value` file written by the wrapper script. This
//! module owns both the in-memory `Result` (renamed `TaskResult` to
//! avoid shadowing `std::result::Result`) and the parser that produces
//! one from a file on disk.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// `result`/`extraction.result` code domain. `Ignore` is not
/// part of the wire vocabulary the wrapper can write, but is produced
/// internally by `TaskRunError::to_result` analogues and suppresses the
/// `TaskDone` report entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Unknown,
    Ok,
    Warning,
    Error,
    Inspect,
    Ignore,
}

impl ResultCode {
    pub fn wire_str(self) -> &'static str {
        match self {
            ResultCode::Unknown => "unknown",
            ResultCode::Ok => "ok",
            ResultCode::Warning => "warning",
            ResultCode::Error => "error",
            ResultCode::Inspect => "inspect",
            ResultCode::Ignore => "ignore",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(ResultCode::Unknown),
            "ok" => Some(ResultCode::Ok),
            "warning" => Some(ResultCode::Warning),
            "error" => Some(ResultCode::Error),
            "inspect" => Some(ResultCode::Inspect),
            "ignore" => Some(ResultCode::Ignore),
            _ => None,
        }
    }
}

/// The outcome of one task run, whether produced from a results file or
/// synthesized from a wrapper exit code / abort / error path.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub code: Option<ResultCode>,
    pub summary: Option<String>,
    /// priority → report path, keyed so iteration is priority order.
    pub reports: BTreeMap<u32, String>,
    /// `"output."+product` → locator.
    pub locators: HashMap<String, String>,
    /// `"data."+key` → value, prefix retained.
    pub extracted: HashMap<String, String>,
    pub extract_code: Option<ResultCode>,
}

impl TaskResult {
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            code: Some(ResultCode::Error),
            summary: Some(summary.into()),
            ..Default::default()
        }
    }

    /// A wrapper exit code other than 0 short-circuits result
    /// construction entirely; the results file is not consulted.
    pub fn from_wrapper_exit_code(exit_code: i32) -> Option<Self> {
        if exit_code == 0 {
            None
        } else {
            Some(Self::error(format!("wrapper exit code: {exit_code}")))
        }
    }

    /// Whether this result should suppress the `TaskDone` report
    /// entirely (`IGNORE` suppresses reporting).
    pub fn is_ignored(&self) -> bool {
        self.code == Some(ResultCode::Ignore)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResultParseError {
    #[error("line {line}: does not match 'key = value': {text:?}")]
    InvalidSyntax { line: usize, text: String },

    #[error("line {line}: unknown key '{key}'")]
    UnknownKey { line: usize, key: String },

    #[error("line {line}: report priority '{value}' is not a non-negative integer")]
    InvalidPriority { line: usize, value: String },

    #[error("line {line}: unsupported property 'output.{product}.{property}'")]
    UnsupportedOutputProperty {
        line: usize,
        product: String,
        property: String,
    },

    #[error("line {line}: '{value}' is not a recognized result code")]
    UnknownResultCode { line: usize, value: String },
}

static LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([\w.]+)\s*=\s*((?:.*\S)?)\s*$").expect("valid line regex"));

/// Parses the line-oriented `key=value` results file content described
/// the wrapper writes. `#`-prefixed lines and blank lines are ignored.
pub fn parse(content: &str) -> Result<TaskResult, ResultParseError> {
    let mut result = TaskResult::default();

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let caps = LINE_RE
            .captures(raw_line)
            .ok_or_else(|| ResultParseError::InvalidSyntax {
                line: line_no,
                text: raw_line.to_string(),
            })?;
        let key = caps.get(1).unwrap().as_str();
        let value = caps.get(2).unwrap().as_str();

        apply_entry(&mut result, line_no, key, value)?;
    }

    Ok(result)
}

fn apply_entry(
    result: &mut TaskResult,
    line_no: usize,
    key: &str,
    value: &str,
) -> Result<(), ResultParseError> {
    match key {
        "result" => {
            result.code = Some(parse_code(line_no, value)?);
        }
        "summary" => {
            result.summary = Some(value.to_string());
        }
        "extraction.result" => {
            result.extract_code = Some(parse_code(line_no, value)?);
        }
        "report" => {
            result.reports.insert(0, value.to_string());
        }
        _ if key.starts_with("report.") => {
            let n_str = &key["report.".len()..];
            let n: u32 = n_str
                .parse()
                .map_err(|_| ResultParseError::InvalidPriority {
                    line: line_no,
                    value: n_str.to_string(),
                })?;
            result.reports.insert(n, value.to_string());
        }
        _ if key.starts_with("output.") => {
            let rest = &key["output.".len()..];
            match rest.rsplit_once('.') {
                Some((product, "locator")) => {
                    result
                        .locators
                        .insert(format!("output.{product}"), value.to_string());
                }
                Some((product, property)) => {
                    return Err(ResultParseError::UnsupportedOutputProperty {
                        line: line_no,
                        product: product.to_string(),
                        property: property.to_string(),
                    });
                }
                None => {
                    return Err(ResultParseError::UnsupportedOutputProperty {
                        line: line_no,
                        product: rest.to_string(),
                        property: String::new(),
                    });
                }
            }
        }
        _ if key.starts_with("data.") => {
            result.extracted.insert(key.to_string(), value.to_string());
        }
        other => {
            return Err(ResultParseError::UnknownKey {
                line: line_no,
                key: other.to_string(),
            });
        }
    }
    Ok(())
}

fn parse_code(line_no: usize, value: &str) -> Result<ResultCode, ResultParseError> {
    ResultCode::from_wire(value).ok_or_else(|| ResultParseError::UnknownResultCode {
        line: line_no,
        value: value.to_string(),
    })
}

/// Reads and parses the results file at `path`. Returns `Ok(None)` only
/// when the caller already knows the wrapper exit code was non-zero and
/// should not consult the file at all (handled by the caller, not here);
/// a genuinely missing file is always an error from this function's
/// point of view.
pub fn parse_file(path: &Path) -> std::io::Result<Result<TaskResult, ResultParseError>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_fields() {
        let r = parse("result=ok\nsummary=all good\n").unwrap();
        assert_eq!(r.code, Some(ResultCode::Ok));
        assert_eq!(r.summary.as_deref(), Some("all good"));
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let r = parse("# a comment\n\nresult=warning\n").unwrap();
        assert_eq!(r.code, Some(ResultCode::Warning));
    }

    #[test]
    fn report_and_report_zero_are_aliases() {
        let a = parse("report=path/a.xml\n").unwrap();
        let b = parse("report.0=path/a.xml\n").unwrap();
        assert_eq!(a.reports, b.reports);
        assert_eq!(a.reports.get(&0), Some(&"path/a.xml".to_string()));
    }

    #[test]
    fn report_n_parses_priority() {
        let r = parse("report.3=path/c.xml\nreport.1=path/a.xml\n").unwrap();
        let ordered: Vec<_> = r.reports.iter().collect();
        assert_eq!(ordered, vec![(&1, &"path/a.xml".to_string()), (&3, &"path/c.xml".to_string())]);
    }

    #[test]
    fn output_locator_is_stored_with_prefix() {
        let r = parse("output.binary.locator=/tmp/x.bin\n").unwrap();
        assert_eq!(
            r.locators.get("output.binary"),
            Some(&"/tmp/x.bin".to_string())
        );
    }

    #[test]
    fn unsupported_output_property_fails() {
        let err = parse("output.binary.checksum=abc\n").unwrap_err();
        assert!(matches!(
            err,
            ResultParseError::UnsupportedOutputProperty { .. }
        ));
    }

    #[test]
    fn data_key_retains_prefix() {
        let r = parse("data.coverage=87\n").unwrap();
        assert_eq!(r.extracted.get("data.coverage"), Some(&"87".to_string()));
    }

    #[test]
    fn unknown_key_fails() {
        let err = parse("bogus=1\n").unwrap_err();
        assert!(matches!(err, ResultParseError::UnknownKey { .. }));
    }

    #[test]
    fn malformed_line_fails() {
        let err = parse("not a kv line\n").unwrap_err();
        assert!(matches!(err, ResultParseError::InvalidSyntax { .. }));
    }

    #[test]
    fn unknown_result_code_fails() {
        let err = parse("result=maybe\n").unwrap_err();
        assert!(matches!(err, ResultParseError::UnknownResultCode { .. }));
    }

    #[test]
    fn invalid_priority_fails() {
        let err = parse("report.abc=x\n").unwrap_err();
        assert!(matches!(err, ResultParseError::InvalidPriority { .. }));
    }

    #[test]
    fn wrapper_exit_code_short_circuits() {
        let r = TaskResult::from_wrapper_exit_code(2).unwrap();
        assert_eq!(r.code, Some(ResultCode::Error));
        assert_eq!(r.summary.as_deref(), Some("wrapper exit code: 2"));

        assert!(TaskResult::from_wrapper_exit_code(0).is_none());
    }
}
