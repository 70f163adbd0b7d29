//! Query parameters for exec and log sessions
//!
//! The action endpoints encode a request body into the query string of a
//! WebSocket URL; the stream endpoints parse it back into a session
//! descriptor. Both directions live here so they cannot drift apart.

use std::collections::HashMap;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::debug;
use url::form_urlencoded;

use crate::error::{Error, Result};

/// Separator between command arguments in the `command` parameter
pub const COMMAND_SEPARATOR: char = ',';

/// A validated exec session request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecDescriptor {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Container name; the pod's first container when `None`
    pub container: Option<String>,
    /// Command and arguments
    pub command: Vec<String>,
    /// Attach stdin
    pub stdin: bool,
    /// Attach stdout
    pub stdout: bool,
    /// Attach stderr
    pub stderr: bool,
    /// Allocate a TTY
    pub tty: bool,
}

/// A validated log session request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogDescriptor {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Container name; the pod's first container when `None`
    pub container: Option<String>,
    /// Keep streaming new lines
    pub follow: bool,
    /// Prefix lines with timestamps
    pub timestamps: bool,
    /// Only return lines newer than this instant
    pub since: Option<DateTime<Utc>>,
}

/// Body of the exec action
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecInput {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Container name (empty for the first container)
    pub container_name: String,
    /// Comma separated command
    pub command: String,
    /// Allocate a TTY
    pub tty: bool,
    /// Attach stdin
    pub stdin: bool,
    /// Attach stdout
    pub stdout: bool,
    /// Attach stderr
    pub stderr: bool,
}

/// Body of the logs action
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogInput {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Container name (empty for the first container)
    pub container_name: String,
    /// Keep streaming new lines
    pub follow: bool,
    /// Prefix lines with timestamps
    pub timestamp: bool,
    /// RFC3339 timestamp or duration
    pub since: String,
}

impl ExecInput {
    /// Encode as the stream endpoint's query string
    pub fn to_query(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("podName", &self.pod_name)
            .append_pair("containerName", &self.container_name)
            .append_pair("namespace", &self.namespace)
            .append_pair("command", &self.command)
            .append_pair("tty", bool_str(self.tty))
            .append_pair("stdin", bool_str(self.stdin))
            .append_pair("stdout", bool_str(self.stdout))
            .append_pair("stderr", bool_str(self.stderr))
            .finish()
    }
}

impl From<&ExecDescriptor> for ExecInput {
    fn from(d: &ExecDescriptor) -> Self {
        Self {
            namespace: d.namespace.clone(),
            pod_name: d.pod_name.clone(),
            container_name: d.container.clone().unwrap_or_default(),
            command: d.command.join(","),
            tty: d.tty,
            stdin: d.stdin,
            stdout: d.stdout,
            stderr: d.stderr,
        }
    }
}

impl LogInput {
    /// Encode as the stream endpoint's query string
    pub fn to_query(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("podName", &self.pod_name)
            .append_pair("containerName", &self.container_name)
            .append_pair("namespace", &self.namespace)
            .append_pair("timestamp", bool_str(self.timestamp))
            .append_pair("follow", bool_str(self.follow))
            .append_pair("since", &self.since)
            .finish()
    }
}

impl From<&LogDescriptor> for LogInput {
    fn from(d: &LogDescriptor) -> Self {
        Self {
            namespace: d.namespace.clone(),
            pod_name: d.pod_name.clone(),
            container_name: d.container.clone().unwrap_or_default(),
            follow: d.follow,
            timestamp: d.timestamps,
            since: d
                .since
                .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                .unwrap_or_default(),
        }
    }
}

/// Parse an exec stream query string.
///
/// `podName`, `namespace` and `command` are required. Fails before any
/// cluster call is made.
pub fn parse_exec_query(query: &str) -> Result<ExecDescriptor> {
    let params = QueryParams::parse(query);
    Ok(ExecDescriptor {
        pod_name: params.required("podName")?,
        namespace: params.required("namespace")?,
        command: params
            .required("command")?
            .split(COMMAND_SEPARATOR)
            .map(str::to_string)
            .collect(),
        container: params.optional("containerName"),
        tty: params.flag("tty"),
        stdin: params.flag("stdin"),
        stdout: params.flag("stdout"),
        stderr: params.flag("stderr"),
    })
}

/// Parse a log stream query string; relative `since` values count back from now
pub fn parse_log_query(query: &str) -> Result<LogDescriptor> {
    parse_log_query_at(query, Utc::now())
}

/// Parse a log stream query string with a fixed "now"
pub fn parse_log_query_at(query: &str, now: DateTime<Utc>) -> Result<LogDescriptor> {
    let params = QueryParams::parse(query);
    Ok(LogDescriptor {
        pod_name: params.required("podName")?,
        namespace: params.required("namespace")?,
        container: params.optional("containerName"),
        timestamps: params.flag("timestamp"),
        follow: params.flag("follow"),
        since: match params.optional("since") {
            Some(raw) => Some(parse_since(&raw, now)?),
            None => None,
        },
    })
}

/// Lenient boolean: the forms accepted by Go's `strconv.ParseBool`, anything else is false
pub fn parse_bool(value: &str) -> bool {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => true,
        "0" | "f" | "F" | "FALSE" | "false" | "False" => false,
        other => {
            debug!(value = %other, "Unparsable boolean parameter, using false");
            false
        }
    }
}

/// Parse `since` as an RFC3339 timestamp, or as a duration counted back from `now`
pub fn parse_since(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    parse_duration(value)
        .and_then(|d| now.checked_sub_signed(d))
        .ok_or_else(|| Error::InvalidTimestamp(value.to_string()))
}

/// Parse a compound duration such as `90s`, `1h30m` or `250ms`.
///
/// Units: `h`, `m`, `s`, `ms`. Returns `None` for anything else.
fn parse_duration(s: &str) -> Option<Duration> {
    let mut rest = s.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total = Duration::zero();
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let n: i64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let (unit, tail) = if let Some(tail) = rest.strip_prefix("ms") {
            (Duration::try_milliseconds(n)?, tail)
        } else if let Some(tail) = rest.strip_prefix('h') {
            (Duration::try_hours(n)?, tail)
        } else if let Some(tail) = rest.strip_prefix('m') {
            (Duration::try_minutes(n)?, tail)
        } else if let Some(tail) = rest.strip_prefix('s') {
            (Duration::try_seconds(n)?, tail)
        } else {
            return None;
        };
        total = total.checked_add(&unit)?;
        rest = tail;
    }
    Some(total)
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// First value wins for repeated keys
struct QueryParams(HashMap<String, String>);

impl QueryParams {
    fn parse(query: &str) -> Self {
        let mut values = HashMap::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            values
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
        Self(values)
    }

    fn required(&self, key: &'static str) -> Result<String> {
        self.optional(key).ok_or(Error::MissingParameter(key))
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.0.get(key).filter(|v| !v.is_empty()).cloned()
    }

    fn flag(&self, key: &str) -> bool {
        self.0.get(key).map(|v| parse_bool(v)).unwrap_or(false)
    }
}
