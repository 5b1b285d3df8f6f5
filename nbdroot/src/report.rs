//! Boot outcome reporting.
//!
//! Diagnostics accumulate across stages in [`Diagnostics`] (mirrored into
//! `tracing` as they are recorded). Once the sequence finishes,
//! [`BootOutcomeReporter`] writes them to the kernel message buffer and turns
//! the outcome into the process exit status the early-boot framework acts on.
//!
//! The kernel rate limits userspace kmsg writes, so errors and the summary
//! go out first and the lower-severity tail is cut to fit the burst.

use nbdroot_shared::constants::log::{KMSG_BURST, KMSG_RECORD_MAX, TAG};
use nbdroot_shared::errors::{NbdrootError, NbdrootResult};
use nbdroot_shared::{ConnectionAttempt, Variant};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::outcome::Stage;
use crate::state::SessionState;

// ============================================================================
// DIAGNOSTICS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    /// syslog priority used in the kmsg record prefix.
    pub fn kmsg_priority(&self) -> u8 {
        match self {
            Severity::Info => 6,
            Severity::Warn => 4,
            Severity::Error => 3,
        }
    }
}

/// One diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub stage: Stage,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}

/// Ordered diagnostics accumulated across stages.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    lines: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn info(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(stage = %stage, "{}", message);
        self.push(Severity::Info, stage, message);
    }

    pub fn warn(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(stage = %stage, "{}", message);
        self.push(Severity::Warn, stage, message);
    }

    pub fn error(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(stage = %stage, "{}", message);
        self.push(Severity::Error, stage, message);
    }

    fn push(&mut self, severity: Severity, stage: Stage, message: String) {
        self.lines.push(Diagnostic {
            severity,
            stage,
            message,
        });
    }

    pub fn lines(&self) -> &[Diagnostic] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<Diagnostic> {
        self.lines
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.lines.iter().filter(|d| d.severity == severity).count()
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// No usable `nbdroot=`; the default root-mount path is left alone.
    Skipped,
    /// Target recorded in the state file for a later stage to attach.
    Deferred,
    /// Device attached and readable.
    Succeeded,
    /// A fatal stage failed.
    Failed,
}

/// Final result of one run, consumed by the surrounding boot framework.
#[derive(Debug, Clone, Serialize)]
pub struct BootOutcome {
    pub status: OutcomeStatus,
    /// Raw `<host>:<port>` the run worked with, if any.
    pub target: Option<String>,
    /// Device node handed to the root mount; only set on success.
    pub device: Option<PathBuf>,
    /// Variant that produced the working session.
    pub variant: Option<Variant>,
    pub attempts: Vec<ConnectionAttempt>,
    pub states: Vec<SessionState>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BootOutcome {
    pub fn skipped(diag: Diagnostics) -> Self {
        Self::with_status(OutcomeStatus::Skipped, diag)
    }

    pub fn with_status(status: OutcomeStatus, diag: Diagnostics) -> Self {
        Self {
            status,
            target: None,
            device: None,
            variant: None,
            attempts: Vec::new(),
            states: Vec::new(),
            diagnostics: diag.into_lines(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }

    /// 0 unless a fatal stage failed.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            OutcomeStatus::Failed => 1,
            _ => 0,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    fn summary(&self) -> String {
        match self.status {
            OutcomeStatus::Skipped => "no nbdroot target; leaving root mount to the boot framework"
                .to_string(),
            OutcomeStatus::Deferred => format!(
                "target {} recorded for the mount stage",
                self.target.as_deref().unwrap_or("-")
            ),
            OutcomeStatus::Succeeded => format!(
                "root device {} attached from {} via {}",
                self.device
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                self.target.as_deref().unwrap_or("-"),
                self.variant.map(|v| v.as_str()).unwrap_or("-")
            ),
            OutcomeStatus::Failed => format!(
                "failed to attach root from {}; falling back to the boot framework",
                self.target.as_deref().unwrap_or("-")
            ),
        }
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Destination for diagnostic lines.
pub trait DiagnosticSink: Send {
    /// Write one line; the sink adds the subsystem tag.
    fn emit(&mut self, severity: Severity, line: &str) -> io::Result<()>;
}

/// Kernel message buffer sink.
///
/// Each line becomes one kmsg record `<prio>nbdroot: <line>`.
pub struct KmsgSink {
    path: PathBuf,
    file: Option<std::fs::File>,
}

impl KmsgSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn file(&mut self) -> io::Result<&mut std::fs::File> {
        if self.file.is_none() {
            // No create: a missing /dev/kmsg must not turn into a regular file
            let file = OpenOptions::new().append(true).open(&self.path)?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("kmsg file not open"))
    }
}

impl DiagnosticSink for KmsgSink {
    fn emit(&mut self, severity: Severity, line: &str) -> io::Result<()> {
        let mut record = format!("<{}>{}: {}", severity.kmsg_priority(), TAG, line);
        truncate_record(&mut record, KMSG_RECORD_MAX - 1);
        record.push('\n');
        // kmsg takes one record per write call
        self.file()?.write_all(record.as_bytes())
    }
}

/// Cut `record` to at most `max` bytes on a char boundary.
fn truncate_record(record: &mut String, max: usize) {
    if record.len() <= max {
        return;
    }
    let mut end = max;
    while !record.is_char_boundary(end) {
        end -= 1;
    }
    record.truncate(end);
}

// ============================================================================
// REPORTER
// ============================================================================

/// Writes the outcome to the boot log and produces the exit status.
pub struct BootOutcomeReporter {
    sink: Box<dyn DiagnosticSink>,
    report_file: Option<PathBuf>,
}

impl BootOutcomeReporter {
    pub fn new(sink: Box<dyn DiagnosticSink>) -> Self {
        Self {
            sink,
            report_file: None,
        }
    }

    /// Also write the outcome as JSON to `path`.
    pub fn with_report_file(mut self, path: Option<PathBuf>) -> Self {
        self.report_file = path;
        self
    }

    /// Emit the diagnostics plus a summary line and return the exit status.
    ///
    /// Error lines come first, then the summary, then warnings and info in
    /// recorded order. At most [`KMSG_BURST`] records are written; when lines
    /// are left over the last record says how many (all of them are already
    /// on stderr).
    pub fn report(&mut self, outcome: &BootOutcome) -> u8 {
        let mut sink_failed = false;
        for (severity, line) in kmsg_records(outcome) {
            if let Err(e) = self.sink.emit(severity, &line) {
                if !sink_failed {
                    tracing::warn!("Failed to write boot diagnostics: {}", e);
                    sink_failed = true;
                }
            }
        }

        match outcome.status {
            OutcomeStatus::Failed => tracing::error!("{}", outcome.summary()),
            _ => tracing::info!("{}", outcome.summary()),
        }

        if let Some(path) = &self.report_file {
            if let Err(e) = write_report(path, outcome) {
                tracing::warn!("{}", e);
            }
        }

        outcome.exit_code()
    }
}

fn kmsg_records(outcome: &BootOutcome) -> Vec<(Severity, String)> {
    let summary_severity = match outcome.status {
        OutcomeStatus::Failed => Severity::Error,
        _ => Severity::Info,
    };
    let summary = format!("[{}] {}", Stage::Outcome, outcome.summary());

    let mut records: Vec<(Severity, String)> = outcome
        .errors()
        .map(|d| (d.severity, d.to_string()))
        .collect();
    records.push((summary_severity, summary));

    let mut rest: Vec<&Diagnostic> = outcome
        .diagnostics
        .iter()
        .filter(|d| d.severity != Severity::Error)
        .collect();
    // Stable: warnings before info, each in recorded order
    rest.sort_by_key(|d| d.severity.kmsg_priority());

    let room = KMSG_BURST.saturating_sub(records.len());
    if rest.len() <= room {
        records.extend(rest.iter().map(|d| (d.severity, d.to_string())));
    } else if room > 0 {
        let kept = room - 1;
        records.extend(rest[..kept].iter().map(|d| (d.severity, d.to_string())));
        records.push((
            Severity::Info,
            format!(
                "[{}] {} more line(s) omitted from kmsg",
                Stage::Outcome,
                rest.len() - kept
            ),
        ));
    }
    records
}

fn write_report(path: &Path, outcome: &BootOutcome) -> NbdrootResult<()> {
    let json = serde_json::to_string_pretty(outcome)
        .map_err(|e| NbdrootError::Internal(format!("Failed to serialize outcome: {}", e)))?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| {
            NbdrootError::Storage(format!("Failed to create {}: {}", dir.display(), e))
        })?;
    }
    std::fs::write(path, json).map_err(|e| {
        NbdrootError::Storage(format!(
            "Failed to write outcome report {}: {}",
            path.display(),
            e
        ))
    })
}
