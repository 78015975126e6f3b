// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run report
//!
//! Every directive and handler that was considered leaves one record. The
//! report decides the overall status and the process exit code.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Serialize;

use crate::gate::GatePhase;
use crate::host::CommandOutput;

/// Exit code of a successful run
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for configuration and usage errors
pub const EXIT_ERROR: u8 = 1;
/// Exit code when a validator rejected a staged file
pub const EXIT_VALIDATION_FAILED: u8 = 2;
/// Exit code when a directive failed
pub const EXIT_DIRECTIVE_FAILED: u8 = 3;
/// Exit code when a handler failed
pub const EXIT_HANDLER_FAILED: u8 = 4;
/// Exit code when the host became unreachable
pub const EXIT_CONNECTION_LOST: u8 = 5;
/// Exit code when the operator interrupted the run
pub const EXIT_INTERRUPTED: u8 = 130;

/// Outcome of one directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Guard was false
    Skipped,
    /// Succeeded without changing anything
    OkUnchanged,
    /// Succeeded and changed state
    OkChanged,
    /// Failed under an `ignored` policy
    FailedIgnored,
    /// Failed and aborted the run
    FailedFatal,
}

impl Outcome {
    /// Whether the directive failed in any way
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::FailedIgnored | Outcome::FailedFatal)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Skipped => write!(formatter, "skipped"),
            Outcome::OkUnchanged => write!(formatter, "ok"),
            Outcome::OkChanged => write!(formatter, "changed"),
            Outcome::FailedIgnored => write!(formatter, "failed (ignored)"),
            Outcome::FailedFatal => write!(formatter, "FAILED"),
        }
    }
}

/// Why something failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Validator refused the staged file; nothing live was touched
    ValidationFailed,
    /// The action itself failed; the host may be partially changed
    CommitFailed,
    /// The action ran past its timeout
    TimedOut,
    /// The host stopped answering
    ConnectionLost,
    /// A handler failed after the directives ran
    HandlerFailed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ValidationFailed => write!(formatter, "validation failed"),
            FailureKind::CommitFailed => write!(formatter, "commit failed"),
            FailureKind::TimedOut => write!(formatter, "timed out"),
            FailureKind::ConnectionLost => write!(formatter, "connection lost"),
            FailureKind::HandlerFailed => write!(formatter, "handler failed"),
        }
    }
}

/// Record of one directive
#[derive(Debug, Clone, Serialize)]
pub struct DirectiveRecord {
    /// Directive id
    pub id: String,
    /// Outcome
    pub outcome: Outcome,
    /// Output of the last command the directive ran
    pub output: Option<CommandOutput>,
    /// Failure classification
    pub failure: Option<FailureKind>,
    /// Diagnostic or skip reason
    pub message: Option<String>,
    /// Furthest validation gate phase, for gated directives
    pub gate: Option<GatePhase>,
    /// Handlers newly queued by this directive
    pub notified: Vec<String>,
    /// Wall time
    pub duration_ms: u64,
}

impl DirectiveRecord {
    /// A record with only an id and outcome
    pub fn new(id: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            id: id.into(),
            outcome,
            output: None,
            failure: None,
            message: None,
            gate: None,
            notified: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Record of one handler execution
#[derive(Debug, Clone, Serialize)]
pub struct HandlerRecord {
    /// Handler name
    pub name: String,
    /// Whether the handler succeeded
    pub succeeded: bool,
    /// Whether the handler changed state
    pub changed: bool,
    /// Output of the last command
    pub output: Option<CommandOutput>,
    /// `handler_failed`, or `connection_lost` when the host went away
    pub failure: Option<FailureKind>,
    /// Error message when it failed
    pub message: Option<String>,
    /// Wall time
    pub duration_ms: u64,
}

/// How the directive section of a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// Every runnable directive was considered
    Completed,
    /// A fatal failure stopped the run
    Aborted {
        /// Directive that failed
        directive: String,
    },
    /// The operator interrupted the run between directives
    Interrupted,
}

/// Aggregate status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing failed outside the allow-list
    Success,
    /// Something failed
    Failure,
}

/// Outcome of a whole run against one target
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Target name
    pub target: String,
    /// Manifest name
    pub manifest: String,
    /// Whether nothing was committed
    pub dry_run: bool,
    /// Directive records in execution order
    pub directives: Vec<DirectiveRecord>,
    /// Handler records in firing order
    pub handlers: Vec<HandlerRecord>,
    /// Handlers that were notified but not fired
    pub unfired_handlers: Vec<String>,
    /// How the directive section ended
    pub termination: Termination,
    /// Directive ids whose ignored failures do not fail the run
    pub allowed_failures: BTreeSet<String>,
    /// Total wall time
    pub total_duration_ms: u64,
}

impl RunReport {
    /// Start an empty report
    pub fn new(target: impl Into<String>, manifest: impl Into<String>, dry_run: bool) -> Self {
        Self {
            target: target.into(),
            manifest: manifest.into(),
            dry_run,
            directives: Vec::new(),
            handlers: Vec::new(),
            unfired_handlers: Vec::new(),
            termination: Termination::Completed,
            allowed_failures: BTreeSet::new(),
            total_duration_ms: 0,
        }
    }

    /// Record a directive outcome
    pub fn record(&mut self, record: DirectiveRecord) {
        self.directives.push(record);
    }

    /// Record a handler execution
    pub fn record_handler(&mut self, record: HandlerRecord) {
        self.handlers.push(record);
    }

    /// Look up a directive record
    pub fn directive(&self, id: &str) -> Option<&DirectiveRecord> {
        self.directives.iter().find(|record| record.id == id)
    }

    /// Number of directives that changed state
    pub fn changed_count(&self) -> usize {
        self.count(Outcome::OkChanged)
    }

    /// Number of directives with the given outcome
    pub fn count(&self, outcome: Outcome) -> usize {
        self.directives
            .iter()
            .filter(|record| record.outcome == outcome)
            .count()
    }

    /// Ids of skipped directives
    pub fn skipped(&self) -> Vec<&str> {
        self.directives
            .iter()
            .filter(|record| record.outcome == Outcome::Skipped)
            .map(|record| record.id.as_str())
            .collect()
    }

    /// First directive that failed fatally
    pub fn first_fatal(&self) -> Option<&DirectiveRecord> {
        self.directives
            .iter()
            .find(|record| record.outcome == Outcome::FailedFatal)
    }

    /// Directives that reached a definitive non-fatal outcome
    pub fn completed(&self) -> Vec<&DirectiveRecord> {
        self.directives
            .iter()
            .filter(|record| record.outcome != Outcome::FailedFatal)
            .collect()
    }

    /// Ignored failures not covered by the allow-list
    pub fn unallowed_failures(&self) -> Vec<&DirectiveRecord> {
        self.directives
            .iter()
            .filter(|record| {
                record.outcome == Outcome::FailedIgnored
                    && !self.allowed_failures.contains(&record.id)
            })
            .collect()
    }

    /// Handlers that failed
    pub fn failed_handlers(&self) -> Vec<&HandlerRecord> {
        self.handlers.iter().filter(|record| !record.succeeded).collect()
    }

    /// Aggregate status
    pub fn status(&self) -> RunStatus {
        if self.first_fatal().is_some()
            || !self.unallowed_failures().is_empty()
            || !self.failed_handlers().is_empty()
        {
            RunStatus::Failure
        } else {
            RunStatus::Success
        }
    }

    /// Process exit code for this run
    pub fn exit_code(&self) -> u8 {
        if let Some(fatal) = self.first_fatal() {
            return match fatal.failure {
                Some(FailureKind::ValidationFailed) => EXIT_VALIDATION_FAILED,
                Some(FailureKind::ConnectionLost) => EXIT_CONNECTION_LOST,
                _ => EXIT_DIRECTIVE_FAILED,
            };
        }
        if !self.unallowed_failures().is_empty() {
            return EXIT_DIRECTIVE_FAILED;
        }
        let failed_handlers = self.failed_handlers();
        if failed_handlers
            .iter()
            .any(|handler| handler.failure == Some(FailureKind::ConnectionLost))
        {
            return EXIT_CONNECTION_LOST;
        }
        if !failed_handlers.is_empty() {
            return EXIT_HANDLER_FAILED;
        }
        if self.termination == Termination::Interrupted {
            return EXIT_INTERRUPTED;
        }
        EXIT_SUCCESS
    }

    /// Human-readable summary
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " [DRY RUN]" } else { "" };
        let _ = writeln!(
            out,
            "Target '{}' / manifest '{}'{}",
            self.target, self.manifest, mode
        );

        for record in &self.directives {
            let _ = write!(out, "  {:<18} {}", record.outcome.to_string(), record.id);
            if let Some(message) = &record.message {
                let _ = write!(out, " ({})", message);
            }
            let _ = writeln!(out);
        }

        for record in &self.handlers {
            let state = if record.succeeded { "handler ok" } else { "handler FAILED" };
            let _ = write!(out, "  {:<18} {}", state, record.name);
            if let Some(message) = &record.message {
                let _ = write!(out, " ({})", message);
            }
            let _ = writeln!(out);
        }

        if !self.unfired_handlers.is_empty() {
            let _ = writeln!(
                out,
                "  Handlers not fired: {}",
                self.unfired_handlers.join(", ")
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "  Changed: {}  Unchanged: {}  Skipped: {}  Failed: {} ({} ignored)",
            self.changed_count(),
            self.count(Outcome::OkUnchanged),
            self.count(Outcome::Skipped),
            self.count(Outcome::FailedFatal) + self.count(Outcome::FailedIgnored),
            self.count(Outcome::FailedIgnored),
        );
        let _ = writeln!(out, "  Duration: {} ms", self.total_duration_ms);

        if self.termination == Termination::Interrupted {
            let _ = writeln!(out, "  Run interrupted before all directives ran");
        }

        if let Some(fatal) = self.first_fatal() {
            let kind = fatal
                .failure
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "failed".to_string());
            let _ = writeln!(out);
            let _ = writeln!(out, "Run aborted at '{}': {}", fatal.id, kind);
            if let Some(output) = &fatal.output {
                if !output.stderr.trim().is_empty() {
                    let _ = writeln!(out, "stderr:");
                    for line in output.stderr.trim_end().lines() {
                        let _ = writeln!(out, "  {}", line);
                    }
                }
            }
            let applied: Vec<&str> = self
                .completed()
                .iter()
                .map(|record| record.id.as_str())
                .collect();
            if applied.is_empty() {
                let _ = writeln!(out, "No directives were applied before the failure");
            } else {
                let _ = writeln!(out, "Already applied: {}", applied.join(", "));
            }
        }

        let status = match self.status() {
            RunStatus::Success => "succeeded",
            RunStatus::Failure => "failed",
        };
        let _ = writeln!(out, "Run {}", status);
        out
    }
}

/// Combine per-target exit codes into one process exit code
///
/// The most specific failure wins: validation, connection, directive,
/// handler, interruption, then success.
pub fn combine_exit_codes<I: IntoIterator<Item = u8>>(codes: I) -> u8 {
    fn rank(code: u8) -> u8 {
        match code {
            EXIT_VALIDATION_FAILED => 7,
            EXIT_CONNECTION_LOST => 6,
            EXIT_DIRECTIVE_FAILED => 5,
            EXIT_ERROR => 4,
            EXIT_HANDLER_FAILED => 3,
            EXIT_INTERRUPTED => 2,
            EXIT_SUCCESS => 0,
            _ => 1,
        }
    }

    codes
        .into_iter()
        .max_by_key(|code| rank(*code))
        .unwrap_or(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(records: Vec<DirectiveRecord>) -> RunReport {
        let mut report = RunReport::new("local", "baseline", false);
        for record in records {
            report.record(record);
        }
        report
    }

    fn failed(id: &str, outcome: Outcome, kind: FailureKind) -> DirectiveRecord {
        let mut record = DirectiveRecord::new(id, outcome);
        record.failure = Some(kind);
        record
    }

    #[test]
    fn test_success_report() {
        let report = report(vec![
            DirectiveRecord::new("a", Outcome::OkChanged),
            DirectiveRecord::new("b", Outcome::OkUnchanged),
            DirectiveRecord::new("c", Outcome::Skipped),
        ]);
        assert_eq!(report.status(), RunStatus::Success);
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert_eq!(report.changed_count(), 1);
        assert_eq!(report.skipped(), vec!["c"]);
        assert!(report.first_fatal().is_none());
        assert!(report.render_text().contains("Run succeeded"));
    }

    #[test]
    fn test_ignored_failure_fails_unless_allowed() {
        let mut report = report(vec![
            failed("swap", Outcome::FailedIgnored, FailureKind::CommitFailed),
            DirectiveRecord::new("docker", Outcome::OkChanged),
        ]);
        assert_eq!(report.status(), RunStatus::Failure);
        assert_eq!(report.exit_code(), EXIT_DIRECTIVE_FAILED);

        report.allowed_failures.insert("swap".to_string());
        assert_eq!(report.status(), RunStatus::Success);
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
    }

    #[test]
    fn test_validation_failure_exit_code() {
        let mut fatal = failed("sshd-config", Outcome::FailedFatal, FailureKind::ValidationFailed);
        fatal.output = Some(CommandOutput {
            stdout: String::new(),
            stderr: "Bad configuration option: Prot\n".to_string(),
            exit_code: 255,
        });
        let mut report = report(vec![DirectiveRecord::new("create-user", Outcome::OkChanged), fatal]);
        report.termination = Termination::Aborted {
            directive: "sshd-config".to_string(),
        };

        assert_eq!(report.status(), RunStatus::Failure);
        assert_eq!(report.exit_code(), EXIT_VALIDATION_FAILED);
        assert_eq!(report.first_fatal().unwrap().id, "sshd-config");
        assert_eq!(report.completed().len(), 1);

        let text = report.render_text();
        assert!(text.contains("Run aborted at 'sshd-config': validation failed"));
        assert!(text.contains("Bad configuration option"));
        assert!(text.contains("Already applied: create-user"));
    }

    #[test]
    fn test_exit_codes_by_failure_kind() {
        let report_for = |kind| report(vec![failed("x", Outcome::FailedFatal, kind)]).exit_code();
        assert_eq!(report_for(FailureKind::CommitFailed), EXIT_DIRECTIVE_FAILED);
        assert_eq!(report_for(FailureKind::TimedOut), EXIT_DIRECTIVE_FAILED);
        assert_eq!(report_for(FailureKind::ConnectionLost), EXIT_CONNECTION_LOST);
    }

    #[test]
    fn test_handler_failure() {
        let mut report = report(vec![DirectiveRecord::new("a", Outcome::OkChanged)]);
        report.record_handler(HandlerRecord {
            name: "restart-ssh".to_string(),
            succeeded: false,
            changed: false,
            output: None,
            failure: Some(FailureKind::HandlerFailed),
            message: Some("exit 1".to_string()),
            duration_ms: 3,
        });
        assert_eq!(report.status(), RunStatus::Failure);
        assert_eq!(report.exit_code(), EXIT_HANDLER_FAILED);
        assert_eq!(report.directive("a").unwrap().outcome, Outcome::OkChanged);
    }

    #[test]
    fn test_handler_lost_connection_exit_code() {
        let mut report = report(vec![DirectiveRecord::new("a", Outcome::OkChanged)]);
        report.record_handler(HandlerRecord {
            name: "restart-ssh".to_string(),
            succeeded: false,
            changed: false,
            output: None,
            failure: Some(FailureKind::ConnectionLost),
            message: Some("connection reset by peer".to_string()),
            duration_ms: 3,
        });
        assert_eq!(report.exit_code(), EXIT_CONNECTION_LOST);
    }

    #[test]
    fn test_interrupted_exit_code() {
        let mut report = report(vec![DirectiveRecord::new("a", Outcome::OkChanged)]);
        report.termination = Termination::Interrupted;
        assert_eq!(report.status(), RunStatus::Success);
        assert_eq!(report.exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_combine_exit_codes() {
        assert_eq!(combine_exit_codes(Vec::new()), EXIT_SUCCESS);
        assert_eq!(combine_exit_codes([EXIT_SUCCESS, EXIT_HANDLER_FAILED]), EXIT_HANDLER_FAILED);
        assert_eq!(
            combine_exit_codes([EXIT_DIRECTIVE_FAILED, EXIT_VALIDATION_FAILED, EXIT_SUCCESS]),
            EXIT_VALIDATION_FAILED
        );
        assert_eq!(
            combine_exit_codes([EXIT_INTERRUPTED, EXIT_CONNECTION_LOST]),
            EXIT_CONNECTION_LOST
        );
    }

    #[test]
    fn test_json_shape() {
        let report = report(vec![DirectiveRecord::new("a", Outcome::FailedIgnored)]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["directives"][0]["outcome"], "failed_ignored");
        assert_eq!(json["termination"]["kind"], "completed");
    }
}
