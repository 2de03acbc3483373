//! Wire protocol adapters.
//!
//! Covers the run-identity and task-descriptor data model received from
//! the coordinator, the `<response>` command stream parser, and the
//! outbound request builders for `Synchronize`, `TaskDone`, and
//! `TaskReport`. XML is read with a handwritten `quick_xml` pull parser
//! in the style of a schema-driven record reader, one function per
//! record type, rather than a reflective binder.

use std::collections::HashMap;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;

use crate::errors::ProtocolError;
use crate::queue::{OutgoingRequest, RequestBody};
use crate::result::TaskResult;

static JOB_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{6})-(\d{4}-[0-9A-Fa-f]{4})$").expect("valid job path regex"));

/// `(jobId, taskId, runId)` for an execution run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub job_id: String,
    pub task_id: String,
    pub run_id: String,
}

/// `jobPath = matches(/^(\d{6})-(\d{4}-[0-9A-Fa-f]{4})$/, jobId) ?
/// "$1/$2" : jobId`.
pub fn job_path(job_id: &str) -> String {
    match JOB_PATH_RE.captures(job_id) {
        Some(caps) => format!("{}/{}", &caps[1], &caps[2]),
        None => job_id.to_string(),
    }
}

/// One producer of a combined input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer {
    pub task_id: String,
    pub locator: String,
    pub result: Option<String>,
}

/// One entry of the `inputs` mapping. A product with non-empty
/// `producers` is *combined*.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Input {
    pub name: String,
    pub locator: String,
    pub producers: IndexMap<String, Producer>,
}

impl Input {
    pub fn is_combined(&self) -> bool {
        !self.producers.is_empty()
    }
}

/// One reserved resource (execution runs only); order is material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub reference: String,
    pub locator: String,
    pub parameters: HashMap<String, String>,
}

/// `task`: `{target, framework, script, parameters}`. Parameter
/// keys with prefix `sf.` are reserved for the runner itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Task {
    pub target: String,
    pub framework: String,
    pub script: String,
    pub parameters: HashMap<String, String>,
}

impl Task {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// `<start>` command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRunInfo {
    pub run: RunIdentity,
    pub task: Task,
    pub inputs: IndexMap<String, Input>,
    pub outputs: Vec<String>,
    pub resources: IndexMap<String, Resource>,
}

/// `<extract>` command payload; carries a `shadowId` instead of a run
/// identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRunInfo {
    pub shadow_id: String,
    pub task: Task,
    pub inputs: IndexMap<String, Input>,
    pub outputs: Vec<String>,
}

/// One element of the `<response>` command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(ExecuteRunInfo),
    Extract(ExtractRunInfo),
    Abort,
    Wait { seconds: u64 },
    Exit,
}

fn local_name(name: &[u8]) -> String {
    let s = std::str::from_utf8(name).unwrap_or("");
    match s.rfind(':') {
        Some(pos) => s[pos + 1..].to_string(),
        None => s.to_string(),
    }
}

fn get_attr(e: &BytesStart, name: &str) -> Result<String, ProtocolError> {
    get_attr_opt(e, name).ok_or_else(|| {
        ProtocolError::MalformedRunInfo(format!("element '{}' missing attribute '{name}'", local_name(e.name().as_ref())))
    })
}

fn get_attr_opt(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if local_name(attr.key.as_ref()) == name {
            attr.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

/// Parses `<response>…</response>` into a sequence of per-command
/// outcomes, preserving document order. A malformed command does
/// not stop the stream — it is logged by the caller and the loop moves
/// to the next element — so each element's result is independent; only
/// a malformed root, or underlying XML syntax errors, abort the whole
/// parse.
pub fn parse_response(xml: &str) -> Result<Vec<Result<Command, ProtocolError>>, ProtocolError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut commands = Vec::new();
    let mut seen_root = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(|e| ProtocolError::Xml(e.to_string()))? {
            Event::Eof => break,
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                if !seen_root {
                    if name != "response" {
                        return Err(ProtocolError::UnexpectedRoot(name));
                    }
                    seen_root = true;
                    continue;
                }
                commands.push(parse_command(&mut reader, &name, &e, false));
            }
            Event::Empty(e) => {
                let name = local_name(e.name().as_ref());
                if !seen_root {
                    if name != "response" {
                        return Err(ProtocolError::UnexpectedRoot(name));
                    }
                    seen_root = true;
                    continue;
                }
                commands.push(parse_command(&mut reader, &name, &e, true));
            }
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(ProtocolError::UnexpectedRoot(String::new()));
    }

    Ok(commands)
}

fn parse_command(
    reader: &mut Reader<&[u8]>,
    name: &str,
    start: &BytesStart,
    self_closing: bool,
) -> Result<Command, ProtocolError> {
    match name {
        "start" if self_closing => Err(ProtocolError::MalformedRunInfo(
            "<start/> has no body".into(),
        )),
        "start" => parse_execute_run_info(reader, start).map(Command::Start),
        "extract" if self_closing => Err(ProtocolError::MalformedRunInfo(
            "<extract/> has no body".into(),
        )),
        "extract" => parse_extract_run_info(reader, start).map(Command::Extract),
        "abort" => Ok(Command::Abort),
        "wait" => {
            let seconds_str = get_attr(start, "seconds")?;
            let seconds: u64 = seconds_str.parse().map_err(|_| {
                ProtocolError::InvalidWaitSeconds(seconds_str.clone())
            })?;
            Ok(Command::Wait { seconds })
        }
        "exit" => Ok(Command::Exit),
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

/// Reads the body of a `<start>` element: a nested `<run>`, an optional
/// `<task>` with `<parameters>`, `<inputs>`, `<outputs>`, `<resources>`.
/// The exact nesting beyond the run-identity and task fields is deliberately
/// permissive — unrecognized children inside a known container are
/// skipped rather than failing the whole command.
fn parse_execute_run_info(
    reader: &mut Reader<&[u8]>,
    _start: &BytesStart,
) -> Result<ExecuteRunInfo, ProtocolError> {
    let mut run = None;
    let mut task = Task::default();
    let mut inputs = IndexMap::new();
    let mut outputs = Vec::new();
    let mut resources = IndexMap::new();
    let mut depth = 0i32;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| ProtocolError::Xml(e.to_string()))?;
        let is_eof = matches!(event, Event::Eof);
        let (e, self_closing) = match event {
            Event::Start(e) => (Some(e), false),
            Event::Empty(e) => (Some(e), true),
            Event::End(_) => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
                (None, false)
            }
            _ => (None, false),
        };
        if is_eof {
            break;
        }
        if let Some(e) = e {
            let name = local_name(e.name().as_ref());
            match name.as_str() {
                "run" => {
                    run = Some(RunIdentity {
                        job_id: get_attr(&e, "jobId")?,
                        task_id: get_attr(&e, "taskId")?,
                        run_id: get_attr(&e, "runId")?,
                    });
                }
                "task" => {
                    task.target = get_attr_opt(&e, "target").unwrap_or_default();
                    task.framework = get_attr_opt(&e, "framework").unwrap_or_default();
                    task.script = get_attr_opt(&e, "script").unwrap_or_default();
                }
                "parameter" => {
                    let pname = get_attr(&e, "name")?;
                    let pvalue = get_attr_opt(&e, "value").unwrap_or_default();
                    task.parameters.insert(pname, pvalue);
                }
                "input" => {
                    let input = parse_input(&e)?;
                    inputs.insert(input.name.clone(), input);
                }
                "output" => {
                    outputs.push(get_attr(&e, "name")?);
                }
                "resource" => {
                    let resource = parse_resource(&e)?;
                    resources.insert(resource.reference.clone(), resource);
                }
                _ => {}
            }
            if !self_closing {
                depth += 1;
            }
        }
        buf.clear();
    }

    let run = run.ok_or_else(|| ProtocolError::MalformedRunInfo("<start> missing <run>".into()))?;

    Ok(ExecuteRunInfo {
        run,
        task,
        inputs,
        outputs,
        resources,
    })
}

fn parse_extract_run_info(
    reader: &mut Reader<&[u8]>,
    _start: &BytesStart,
) -> Result<ExtractRunInfo, ProtocolError> {
    let mut shadow_id = None;
    let mut task = Task::default();
    let mut inputs = IndexMap::new();
    let mut outputs = Vec::new();
    let mut depth = 0i32;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| ProtocolError::Xml(e.to_string()))?;
        let is_eof = matches!(event, Event::Eof);
        let (e, self_closing) = match event {
            Event::Start(e) => (Some(e), false),
            Event::Empty(e) => (Some(e), true),
            Event::End(_) => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
                (None, false)
            }
            _ => (None, false),
        };
        if is_eof {
            break;
        }
        if let Some(e) = e {
            let name = local_name(e.name().as_ref());
            match name.as_str() {
                "shadowrun" => {
                    shadow_id = Some(get_attr(&e, "shadowId")?);
                }
                "task" => {
                    task.target = get_attr_opt(&e, "target").unwrap_or_default();
                    task.framework = get_attr_opt(&e, "framework").unwrap_or_default();
                    task.script = get_attr_opt(&e, "script").unwrap_or_default();
                }
                "parameter" => {
                    let pname = get_attr(&e, "name")?;
                    let pvalue = get_attr_opt(&e, "value").unwrap_or_default();
                    task.parameters.insert(pname, pvalue);
                }
                "input" => {
                    let input = parse_input(&e)?;
                    inputs.insert(input.name.clone(), input);
                }
                "output" => {
                    outputs.push(get_attr(&e, "name")?);
                }
                _ => {}
            }
            if !self_closing {
                depth += 1;
            }
        }
        buf.clear();
    }

    let shadow_id = shadow_id
        .ok_or_else(|| ProtocolError::MalformedRunInfo("<extract> missing <shadowrun>".into()))?;

    Ok(ExtractRunInfo {
        shadow_id,
        task,
        inputs,
        outputs,
    })
}

fn parse_input(e: &BytesStart) -> Result<Input, ProtocolError> {
    // Producers, if any, arrive as a pipe-separated `taskId:locator` list
    // in a `producers` attribute — the flattest shape that still fits a
    // single self-closing `<input/>` element.
    let name = get_attr(e, "name")?;
    let locator = get_attr_opt(e, "locator").unwrap_or_default();
    let mut producers = IndexMap::new();
    if let Some(raw) = get_attr_opt(e, "producers") {
        for entry in raw.split('|').filter(|s| !s.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let task_id = parts.next().unwrap_or_default().to_string();
            let producer_locator = parts.next().unwrap_or_default().to_string();
            let result = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
            producers.insert(
                task_id.clone(),
                Producer {
                    task_id,
                    locator: producer_locator,
                    result,
                },
            );
        }
    }
    Ok(Input {
        name,
        locator,
        producers,
    })
}

fn parse_resource(e: &BytesStart) -> Result<Resource, ProtocolError> {
    let reference = get_attr(e, "ref")?;
    let locator = get_attr_opt(e, "locator").unwrap_or_default();
    let mut parameters = HashMap::new();
    if let Some(raw) = get_attr_opt(e, "parameters") {
        for pair in raw.split('|').filter(|s| !s.is_empty()) {
            if let Some((k, v)) = pair.split_once('=') {
                parameters.insert(k.to_string(), v.to_string());
            }
        }
    }
    Ok(Resource {
        reference,
        locator,
        parameters,
    })
}

/// What the current in-progress run looks like to the `Synchronize`
/// request builder.
pub enum CurrentRun<'a> {
    Execution(&'a RunIdentity),
    Extraction(&'a str),
}

/// Builds the `Synchronize` request: `text/xml` body naming
/// this host, the runner version, and the in-progress run if any.
pub fn build_synchronize_request(
    host: &str,
    runner_version: &str,
    current: Option<CurrentRun<'_>>,
) -> OutgoingRequest {
    let mut body = format!(
        "<request host=\"{}\" runnerVersion=\"{}\">",
        xml_escape(host),
        xml_escape(runner_version)
    );
    match current {
        Some(CurrentRun::Execution(run)) => {
            body.push_str(&format!(
                "<run jobId=\"{}\" taskId=\"{}\" runId=\"{}\"/>",
                xml_escape(&run.job_id),
                xml_escape(&run.task_id),
                xml_escape(&run.run_id)
            ));
        }
        Some(CurrentRun::Extraction(shadow_id)) => {
            body.push_str(&format!(
                "<shadowrun shadowId=\"{}\"/>",
                xml_escape(shadow_id)
            ));
        }
        None => {}
    }
    body.push_str("</request>");

    OutgoingRequest::new("Synchronize").with_body(RequestBody::Xml(body))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn push_form_pair(pairs: &mut Vec<String>, key: &str, value: &str) {
    pairs.push(format!(
        "{}={}",
        urlencoding::encode(key),
        urlencoding::encode(value)
    ));
}

/// Builds a `TaskDone` request for an execution or abort result
/// (identical shape for both flavors).
pub fn build_task_done_execution(run: &RunIdentity, result: &TaskResult) -> OutgoingRequest {
    let query = format!(
        "id={}&name={}",
        urlencoding::encode(&run.job_id),
        urlencoding::encode(&run.task_id)
    );

    let mut pairs = Vec::new();
    if let Some(code) = result.code {
        push_form_pair(&mut pairs, "result", code.wire_str());
    }
    if let Some(summary) = &result.summary {
        push_form_pair(&mut pairs, "summary", summary);
    }
    for path in result.reports.values() {
        push_form_pair(&mut pairs, "report", path);
    }
    for (key, locator) in &result.locators {
        push_form_pair(&mut pairs, key, locator);
    }
    for (key, value) in &result.extracted {
        push_form_pair(&mut pairs, key, value);
    }

    OutgoingRequest::new("TaskDone")
        .with_query(query)
        .with_body(RequestBody::Form(pairs.join("&")))
}

/// Builds a `TaskDone` request for an extraction result: no output
/// locators, no `report` fields.
pub fn build_task_done_extraction(shadow_id: &str, result: &TaskResult) -> OutgoingRequest {
    let query = format!("shadowId={}", urlencoding::encode(shadow_id));

    let mut pairs = Vec::new();
    if let Some(code) = result.extract_code {
        push_form_pair(&mut pairs, "extraction.result", code.wire_str());
    }
    if let Some(summary) = &result.summary {
        push_form_pair(&mut pairs, "summary", summary);
    }
    for (key, value) in &result.extracted {
        push_form_pair(&mut pairs, key, value);
    }

    OutgoingRequest::new("TaskDone")
        .with_query(query)
        .with_body(RequestBody::Form(pairs.join("&")))
}

/// Advertises the report base URL for a run at startup.
pub fn build_task_report(run: &RunIdentity, report_url: &str) -> OutgoingRequest {
    let query = format!(
        "id={}&name={}",
        urlencoding::encode(&run.job_id),
        urlencoding::encode(&run.task_id)
    );
    let body = format!("reportURL={}", urlencoding::encode(report_url));

    OutgoingRequest::new("TaskReport")
        .with_query(query)
        .with_body(RequestBody::Form(body))
}
