//! Error taxonomy for the agent.
//!
//! Each component owns a closed error enum; this module also defines the
//! handful of cross-cutting error kinds
//! (`ConfigError`, `ProtocolError`, `TaskRunError`, `Aborted`,
//! `TransientTransportError`, `PermanentRequestFailure`). Component-local
//! errors (`config::ConfigError`, `result::ResultParseError`, ...) convert
//! into these via `From` so callers at the boundary (the sync loop, the
//! task-run worker) can match on one vocabulary.

use thiserror::Error;

/// Fatal at startup: the process cannot continue — inability to load
/// configuration, open the log file, or write the PID file ends the
/// process with exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration XML: {0}")]
    Xml(String),

    #[error("configuration element <{element}> missing required attribute '{attribute}'")]
    MissingAttribute { element: String, attribute: String },

    #[error("parameter name '{0}' does not match [A-Za-z_][A-Za-z_0-9]*")]
    InvalidParameterName(String),

    #[error("could not write PID file {path}: {source}")]
    PidFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not initialize log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A malformed response from the coordinator. Logged by the sync loop
/// and the loop continues — never fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("response root element is '{0}', expected 'response'")]
    UnexpectedRoot(String),

    #[error("unknown command element '{0}'")]
    UnknownCommand(String),

    #[error("<wait> seconds attribute '{0}' is not a non-negative integer")]
    InvalidWaitSeconds(String),

    #[error("malformed run descriptor: {0}")]
    MalformedRunInfo(String),

    #[error("xml parse error: {0}")]
    Xml(String),
}

/// Raised while materializing or running a task. Converted into a
/// `Result{code: Error, ..}` and reported to the coordinator rather than
/// propagated further.
#[derive(Debug, Error)]
pub enum TaskRunError {
    #[error("could not create output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("duplicate sanitized task id '{0}' among combined-product producers")]
    DuplicateSanitizedTaskId(String),

    #[error("could not write startup script {path}: {source}")]
    StartupScript {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no wrapper found for '{0}'")]
    NoWrapper(String),

    #[error("failed to launch wrapper: {0}")]
    Launch(#[source] std::io::Error),

    #[error("could not read results file {path}: {source}")]
    ResultsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("results file missing: {0}")]
    MissingResultsFile(String),

    #[error(transparent)]
    Parse(#[from] crate::result::ResultParseError),
}

impl TaskRunError {
    /// The cause chain joined the way `anyhow` renders it, used as the
    /// `Result.summary` field.
    pub fn cause_chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }
        chain.join(": ")
    }
}

/// A cooperative abort signal, surfaced as `Result{code: error, summary:
/// "Aborted by request of the Control Center"}`.
#[derive(Debug, Error)]
#[error("Aborted by request of the Control Center")]
pub struct Aborted;

/// Network IO while talking to the coordinator. Retried with backoff by
/// the request queue.
#[derive(Debug, Error)]
#[error("transient transport error: {0}")]
pub struct TransientTransportError(#[from] pub reqwest::Error);

/// An HTTP response classified permanent by the retry table. Delivered
/// to the submitting listener as a failure.
#[derive(Debug, Error)]
#[error("permanent request failure: HTTP {status} on {page}")]
pub struct PermanentRequestFailure {
    pub status: u16,
    pub page: String,
}
