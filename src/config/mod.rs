//! Agent configuration.
//!
//! The source binds this XML document through a generic reflective
//! unmarshaller, which is gratuitous here; this reads with a
//! handwritten reader per record type instead. `AgentConfig::load`
//! reads the whole tree with `quick_xml` in one pass and is wrapped in
//! an `Arc` by the caller — there is no process-wide singleton, only an
//! explicitly threaded owned value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;

use crate::errors::ConfigError;

static PARAMETER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z_0-9]*$").expect("valid parameter name regex"));

#[derive(Debug, Clone)]
pub struct ControlCenterConfig {
    pub server_base_url: String,
    pub token_id: String,
    pub token_pass: String,
}

impl ControlCenterConfig {
    /// `Authorization: Basic base64(tokenId ":" tokenPass)`.
    pub fn basic_auth_header(&self) -> String {
        let raw = format!("{}:{}", self.token_id, self.token_pass);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub report_base_dir: PathBuf,
    pub product_base_dir: PathBuf,
    pub report_base_url: Option<String>,
    pub product_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenericConfig {
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub process_wrapper: Option<String>,
}

/// The full configuration tree, loaded once and treated as immutable
/// for the process lifetime.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub control_center: ControlCenterConfig,
    pub output: OutputConfig,
    pub generic: GenericConfig,
    pub wrapper_dirs: Vec<PathBuf>,
    pub parameters: HashMap<String, String>,
}

fn local_name(name: &[u8]) -> String {
    let s = std::str::from_utf8(name).unwrap_or("");
    match s.rfind(':') {
        Some(pos) => s[pos + 1..].to_string(),
        None => s.to_string(),
    }
}

fn get_attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if local_name(attr.key.as_ref()) == name {
            attr.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

fn required(e: &BytesStart, element: &str, attribute: &str) -> Result<String, ConfigError> {
    get_attr(e, attribute).ok_or_else(|| ConfigError::MissingAttribute {
        element: element.to_string(),
        attribute: attribute.to_string(),
    })
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    fn parse(xml: &str) -> Result<Self, ConfigError> {
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();

        let mut control_center = None;
        let mut output = None;
        let mut generic = GenericConfig {
            log_file: None,
            log_level: "INFO".to_string(),
            process_wrapper: None,
        };
        let mut wrapper_dirs = Vec::new();
        let mut parameters = HashMap::new();

        loop {
            match reader
                .read_event_into(&mut buf)
                .map_err(|e| ConfigError::Xml(e.to_string()))?
            {
                Event::Eof => break,
                Event::Start(e) | Event::Empty(e) => {
                    let name = local_name(e.name().as_ref());
                    match name.as_str() {
                        "controlCenter" => {
                            control_center = Some(ControlCenterConfig {
                                server_base_url: normalize_base_url(&required(
                                    &e,
                                    "controlCenter",
                                    "serverBaseURL",
                                )?),
                                token_id: required(&e, "controlCenter", "tokenId")?,
                                token_pass: required(&e, "controlCenter", "tokenPass")?,
                            });
                        }
                        "output" => {
                            let report_base_dir = get_attr(&e, "reportBaseDir")
                                .or_else(|| get_attr(&e, "reportDir"))
                                .ok_or_else(|| ConfigError::MissingAttribute {
                                    element: "output".to_string(),
                                    attribute: "reportBaseDir".to_string(),
                                })?;
                            let product_base_dir = get_attr(&e, "productBaseDir")
                                .or_else(|| get_attr(&e, "productDir"))
                                .ok_or_else(|| ConfigError::MissingAttribute {
                                    element: "output".to_string(),
                                    attribute: "productBaseDir".to_string(),
                                })?;
                            output = Some(OutputConfig {
                                report_base_dir: PathBuf::from(report_base_dir),
                                product_base_dir: PathBuf::from(product_base_dir),
                                report_base_url: get_attr(&e, "reportBaseURL"),
                                product_base_url: get_attr(&e, "productBaseURL"),
                            });
                        }
                        "generic" => {
                            generic.log_file = get_attr(&e, "logFile").map(PathBuf::from);
                            generic.log_level =
                                get_attr(&e, "logLevel").unwrap_or_else(|| "INFO".to_string());
                            generic.process_wrapper = get_attr(&e, "processWrapper");
                        }
                        "wrappers" => {
                            let dir = required(&e, "wrappers", "dir")?;
                            wrapper_dirs.push(PathBuf::from(dir));
                        }
                        "parameter" => {
                            let pname = required(&e, "parameter", "name")?;
                            if !PARAMETER_NAME_RE.is_match(&pname) {
                                return Err(ConfigError::InvalidParameterName(pname));
                            }
                            let pvalue = get_attr(&e, "value").unwrap_or_default();
                            parameters.insert(pname, pvalue);
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
            buf.clear();
        }

        let control_center = control_center.ok_or_else(|| ConfigError::MissingAttribute {
            element: "controlCenter".to_string(),
            attribute: "(element itself)".to_string(),
        })?;
        let output = output.ok_or_else(|| ConfigError::MissingAttribute {
            element: "output".to_string(),
            attribute: "(element itself)".to_string(),
        })?;

        Ok(AgentConfig {
            control_center,
            output,
            generic,
            wrapper_dirs,
            parameters,
        })
    }
}

/// `serverBaseURL` is post-processed to end with `/`.
fn normalize_base_url(raw: &str) -> String {
    if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<config>
        <controlCenter serverBaseURL="http://cc.example" tokenId="abc" tokenPass="secret"/>
        <output reportBaseDir="/var/reports" productBaseDir="/var/products" reportBaseURL="http://cc.example/reports/"/>
        <generic logFile="/var/log/runner.log" logLevel="DEBUG" processWrapper="nice -n 10"/>
        <wrappers dir="/opt/wrappers"/>
        <wrappers dir="/opt/wrappers2"/>
        <parameter name="SITE" value="factory-1"/>
    </config>"#;

    #[test]
    fn parses_full_document() {
        let config = AgentConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.control_center.server_base_url, "http://cc.example/");
        assert_eq!(config.output.report_base_dir, PathBuf::from("/var/reports"));
        assert_eq!(config.generic.log_level, "DEBUG");
        assert_eq!(config.wrapper_dirs.len(), 2);
        assert_eq!(config.parameters.get("SITE"), Some(&"factory-1".to_string()));
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        assert_eq!(normalize_base_url("http://cc"), "http://cc/");
        assert_eq!(normalize_base_url("http://cc/"), "http://cc/");
    }

    #[test]
    fn invalid_parameter_name_is_rejected() {
        let xml = r#"<config>
            <controlCenter serverBaseURL="http://cc" tokenId="a" tokenPass="b"/>
            <output reportBaseDir="/r" productBaseDir="/p"/>
            <parameter name="1bad" value="x"/>
        </config>"#;
        let err = AgentConfig::parse(xml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameterName(_)));
    }

    #[test]
    fn missing_control_center_is_an_error() {
        let xml = r#"<config><output reportBaseDir="/r" productBaseDir="/p"/></config>"#;
        assert!(AgentConfig::parse(xml).is_err());
    }

    #[test]
    fn basic_auth_header_encodes_token_pair() {
        let cc = ControlCenterConfig {
            server_base_url: "http://cc/".to_string(),
            token_id: "abc".to_string(),
            token_pass: "secret".to_string(),
        };
        assert_eq!(cc.basic_auth_header(), "Basic YWJjOnNlY3JldA==");
    }
}
