//! Flow records and where they go.
//!
//! A [`FlowRecord`] is built once per evaluated flow and handed to a
//! [`RecordSink`]. Sinks only ever append.

use std::fmt;
use std::io::Write;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Serialize, Serializer};
use tracing::info;

use crate::dns::{Question, RData, ResourceRecord, type_name};
use crate::error::ParseErrorKind;
use crate::filter::{Action, PolicyVerdict};
use crate::process::ProcessIdentity;

/// Which side of the exchange a datagram belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to resolver.
    Query,
    /// Resolver to client.
    Response,
}

/// The emitted unit of observability for one flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRecord {
    pub seq: u64,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: SystemTime,
    pub flow: u64,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<ResourceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessIdentity>,
    /// Absent for rejected flows and for responses whose query was not tracked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<PolicyVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ParseErrorKind>,
}

impl FlowRecord {
    pub fn is_rejected(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Query => "QUERY",
            Direction::Response => "RESPONSE",
        };
        write!(f, "[{}] #{} {}", format_timestamp(self.timestamp), self.seq, direction)?;

        if let Some(error) = self.error {
            write!(f, " REJECTED ({error:?})")?;
        }
        if let Some(id) = self.id {
            write!(f, " id=0x{id:04x}")?;
        }
        if let Some(q) = &self.question {
            write!(f, " {} {}", q.name, type_name(q.qtype))?;
        }
        if !self.answers.is_empty() {
            let answers: Vec<String> = self.answers.iter().map(answer_summary).collect();
            write!(f, " -> {}", answers.join(", "))?;
        }
        if let Some(verdict) = &self.verdict {
            match (verdict.action, &verdict.rule) {
                (Action::Block, Some(rule)) => write!(f, " BLOCKED ({rule})")?,
                (Action::Block, None) => write!(f, " BLOCKED")?,
                (Action::Allow, _) => write!(f, " ALLOWED")?,
            }
        }
        if let Some(process) = &self.process {
            write!(f, " pid={}", process.pid)?;
            if let Some(name) = &process.name {
                write!(f, " ({name})")?;
            }
        }

        Ok(())
    }
}

fn answer_summary(rr: &ResourceRecord) -> String {
    match &rr.data {
        RData::A(ip) => ip.to_string(),
        RData::Aaaa(ip) => ip.to_string(),
        RData::Name(name) => format!("{} {name}", type_name(rr.rtype)),
        RData::Other(bytes) => format!("{} ({} bytes)", type_name(rr.rtype), bytes.len()),
    }
}

/// Consumer of emitted records.
pub trait RecordSink: Send + Sync + 'static {
    fn emit(&self, record: &FlowRecord);
}

/// Serialization used for emitted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    PrettyJson,
}

impl OutputFormat {
    pub fn render(self, record: &FlowRecord) -> String {
        let json = match self {
            OutputFormat::Text => return record.to_string(),
            OutputFormat::Json => serde_json::to_string(record),
            OutputFormat::PrettyJson => serde_json::to_string_pretty(record),
        };
        json.unwrap_or_else(|e| format!("{{\"seq\":{},\"error\":\"{e}\"}}", record.seq))
    }
}

/// Writes records to stdout, one per line (or block, when pretty).
pub struct StdoutSink {
    format: OutputFormat,
}

impl StdoutSink {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

impl RecordSink for StdoutSink {
    fn emit(&self, record: &FlowRecord) {
        let rendered = self.format.render(record);
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{rendered}");
    }
}

/// Sends records through `tracing`, for daemon mode.
pub struct LogSink {
    format: OutputFormat,
}

impl LogSink {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

impl RecordSink for LogSink {
    fn emit(&self, record: &FlowRecord) {
        info!(target: "dnsmonitor::record", "{}", self.format.render(record));
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<FlowRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FlowRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, record: &FlowRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

fn serialize_timestamp<S: Serializer>(ts: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(*ts))
}

/// Format as `YYYY-MM-DDTHH:MM:SS.mmmZ` (UTC).
pub fn format_timestamp(ts: SystemTime) -> String {
    let since_epoch = ts
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let time_of_day = secs % 86_400;

    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        time_of_day / 3600,
        time_of_day / 60 % 60,
        time_of_day % 60,
        since_epoch.subsec_millis()
    )
}

/// Gregorian date of a day count since 1970-01-01, in constant time.
///
/// Works in 400-year eras whose years start on March 1, so the leap day is
/// the last day of its year.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097);
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * month_index + 2) / 5 + 1) as u32;
    let month = (if month_index < 10 { month_index + 3 } else { month_index - 9 }) as u32;
    let year = year_of_era + era * 400 + i64::from(month <= 2);

    (year, month, day)
}
