// SPDX-License-Identifier: AGPL-3.0-or-later
//! Directive executor
//!
//! Runs one rendered directive against the host, then classifies the result
//! through the directive's change and failure policies. Lockout-risky files
//! go through the [validation gate](crate::gate) before they are committed.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::directive::{
    ChangePolicy, CompiledPredicate, ConcreteAction, Directive, FailurePolicy, FileSpec,
    PackageState, Rendered, ServiceState,
};
use crate::error::PerchError;
use crate::gate::{GatePhase, StagingArea, ValidationGate, Verdict};
use crate::handlers::{Handler, HandlerQueue};
use crate::host::{apply_attributes, quote, read_file, CommandOutput, Host};
use crate::report::{DirectiveRecord, FailureKind, HandlerRecord, Outcome};
use crate::run::Interrupt;

/// Settings shared by every directive of a run
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Evaluate guards and report what would change, without committing
    pub dry_run: bool,
    /// Timeout for commands that do not set their own
    pub command_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// Result of executing one directive
#[derive(Debug)]
pub enum Step {
    /// The directive reached an outcome
    Recorded(DirectiveRecord),
    /// The operator interrupted the run before a risky commit; nothing was applied
    Interrupted,
}

/// What an action did, before policies are applied
#[derive(Debug, Default)]
struct Attempt {
    changed: bool,
    output: Option<CommandOutput>,
    gate: Option<GatePhase>,
    /// Set when the action ran but did not succeed
    failure: Option<(FailureKind, String)>,
    message: Option<String>,
    interrupted: bool,
}

impl Attempt {
    fn unchanged(output: Option<CommandOutput>) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    fn changed(output: Option<CommandOutput>) -> Self {
        Self {
            changed: true,
            output,
            ..Self::default()
        }
    }

    fn failed(kind: FailureKind, message: impl Into<String>, output: Option<CommandOutput>) -> Self {
        Self {
            output,
            failure: Some((kind, message.into())),
            ..Self::default()
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Executes directives and handlers against one host
pub struct DirectiveExecutor<'a> {
    host: &'a dyn Host,
    staging: &'a StagingArea,
    interrupt: &'a Interrupt,
    options: ExecutorOptions,
}

impl<'a> DirectiveExecutor<'a> {
    /// Create an executor
    pub fn new(
        host: &'a dyn Host,
        staging: &'a StagingArea,
        interrupt: &'a Interrupt,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            host,
            staging,
            interrupt,
            options,
        }
    }

    /// Execute one directive whose static guard already passed
    ///
    /// Changed directives enqueue their handlers into `queue`.
    pub async fn execute(
        &self,
        directive: &Directive,
        rendered: &Rendered,
        queue: &mut HandlerQueue,
    ) -> Step {
        let start_time = Instant::now();
        let limit = self.timeout_for(directive.timeout_secs);

        debug!(directive = %directive.id, kind = directive.body.kind(), "Executing directive");

        let attempt = match self.check_probes(rendered, limit).await {
            Ok(Some(reason)) => {
                info!(directive = %directive.id, reason = %reason, "Directive skipped");
                let mut record = DirectiveRecord::new(&directive.id, Outcome::Skipped);
                record.message = Some(reason);
                record.duration_ms = elapsed_ms(start_time);
                return Step::Recorded(record);
            }
            Ok(None) => self.perform(directive, rendered, limit).await,
            Err(e) => Err(e),
        };

        let attempt = match attempt {
            Ok(attempt) => attempt,
            Err(e) => Attempt::failed(failure_kind(&e), e.to_string(), None),
        };

        if attempt.interrupted {
            warn!(directive = %directive.id, "Interrupted before commit; staged change discarded");
            return Step::Interrupted;
        }

        let mut record = classify(directive, rendered.predicate.as_ref(), attempt);
        record.duration_ms = elapsed_ms(start_time);

        if record.outcome == Outcome::OkChanged {
            for handler in &directive.notifies {
                if queue.notify(handler) {
                    record.notified.push(handler.clone());
                }
            }
        }

        match record.outcome {
            Outcome::FailedFatal => error!(
                directive = %directive.id,
                failure = ?record.failure,
                message = ?record.message,
                "Directive failed"
            ),
            Outcome::FailedIgnored => warn!(
                directive = %directive.id,
                message = ?record.message,
                "Directive failed; continuing"
            ),
            outcome => info!(directive = %directive.id, outcome = %outcome, "Directive finished"),
        }

        Step::Recorded(record)
    }

    /// Fire one handler
    pub async fn execute_handler(&self, handler: &Handler, action: &ConcreteAction) -> HandlerRecord {
        let start_time = Instant::now();
        let limit = self.timeout_for(handler.timeout_secs);

        info!(handler = %handler.name, "Running handler");
        let attempt = match self.perform_action(&handler.name, action, None, limit).await {
            Ok(attempt) => attempt,
            Err(e) => Attempt::failed(failure_kind(&e), e.to_string(), None),
        };

        let (failure, message) = match attempt.failure {
            Some((kind, message)) => {
                error!(handler = %handler.name, message = %message, "Handler failed");
                let kind = match kind {
                    FailureKind::ConnectionLost => FailureKind::ConnectionLost,
                    _ => FailureKind::HandlerFailed,
                };
                (Some(kind), Some(message))
            }
            None => (None, attempt.message),
        };
        let succeeded = failure.is_none();

        HandlerRecord {
            name: handler.name.clone(),
            succeeded,
            changed: succeeded && attempt.changed,
            output: attempt.output,
            failure,
            message,
            duration_ms: elapsed_ms(start_time),
        }
    }

    fn timeout_for(&self, secs: Option<u64>) -> Duration {
        secs.map(Duration::from_secs)
            .unwrap_or(self.options.command_timeout)
    }

    /// Evaluate guard probes; `Some(reason)` means skip
    async fn check_probes(
        &self,
        rendered: &Rendered,
        limit: Duration,
    ) -> crate::error::Result<Option<String>> {
        if let Some(probe) = &rendered.probe {
            let output = self.host.run_command(probe, limit).await?;
            if !output.success() {
                return Ok(Some(format!("probe exited {}", output.exit_code)));
            }
        }
        if let Some(unless) = &rendered.unless {
            let output = self.host.run_command(unless, limit).await?;
            if output.success() {
                return Ok(Some("unless probe succeeded".to_string()));
            }
        }
        Ok(None)
    }

    async fn perform(
        &self,
        directive: &Directive,
        rendered: &Rendered,
        limit: Duration,
    ) -> crate::error::Result<Attempt> {
        match (&rendered.action, &rendered.validator) {
            (ConcreteAction::File(file), Some(validator)) if directive.requires_gate() => {
                self.gated_file(file, validator, limit).await
            }
            _ if directive.requires_gate() => Ok(Attempt::failed(
                FailureKind::ValidationFailed,
                "directive needs the validation gate but has no file body and validator".to_string(),
                None,
            )),
            (action, _) => {
                self.perform_action(&directive.id, action, rendered.predicate.as_ref(), limit)
                    .await
            }
        }
    }

    async fn perform_action(
        &self,
        owner: &str,
        action: &ConcreteAction,
        predicate: Option<&CompiledPredicate>,
        limit: Duration,
    ) -> crate::error::Result<Attempt> {
        match action {
            ConcreteAction::Command { cmd, changed_when } => {
                if self.options.dry_run {
                    return Ok(Attempt::changed(None).with_message(format!("would run: {}", cmd)));
                }

                let output = self.host.run_command(cmd, limit).await?;
                let succeeded = match predicate {
                    Some(predicate) => predicate.accepts(output.exit_code, &output.stdout),
                    None => output.success(),
                };
                if !succeeded {
                    let message = format!("command exited {}: {}", output.exit_code, output.stderr.trim());
                    return Ok(Attempt::failed(FailureKind::CommitFailed, message, Some(output)));
                }

                let changed = changed_when
                    .as_ref()
                    .map_or(true, |pattern| pattern.is_match(&output.stdout));
                Ok(Attempt {
                    changed,
                    output: Some(output),
                    ..Attempt::default()
                })
            }
            ConcreteAction::Probe { cmd } => match self.host.run_command(cmd, limit).await {
                Ok(output) => Ok(Attempt::unchanged(Some(output))),
                Err(e) if e.is_connection_lost() => Err(e),
                Err(e) => Ok(Attempt::unchanged(None).with_message(e.to_string())),
            },
            ConcreteAction::File(file) => self.plain_file(owner, file, limit).await,
            ConcreteAction::Service {
                name,
                state,
                enabled,
            } => self.service(name, *state, *enabled, limit).await,
            ConcreteAction::Package { names, state } => self.package(names, *state, limit).await,
        }
    }

    /// Whether the live file already matches; `(content_matches, attributes_match)`
    async fn file_drift(&self, file: &FileSpec, limit: Duration) -> crate::error::Result<(bool, bool)> {
        let live = read_file(self.host, &file.path, limit).await?;
        let Some(live) = live else {
            return Ok((false, false));
        };

        let content_matches = live == file.content;
        if file.mode.is_none() && file.owner.is_none() {
            return Ok((content_matches, true));
        }

        let output = self
            .host
            .run_command(&format!("stat -c '%a %U:%G' -- {}", quote(&file.path)?), limit)
            .await?;
        Ok((content_matches, output.success() && attributes_match(file, &output.stdout)))
    }

    async fn plain_file(
        &self,
        owner: &str,
        file: &FileSpec,
        limit: Duration,
    ) -> crate::error::Result<Attempt> {
        let (content_matches, attributes_match) = self.file_drift(file, limit).await?;
        if content_matches && attributes_match {
            return Ok(Attempt::unchanged(None));
        }

        if self.options.dry_run {
            return Ok(Attempt::changed(None).with_message(format!("would write {}", file.path)));
        }

        let written = if content_matches {
            apply_attributes(self.host, &file.path, file.mode, file.owner.as_deref(), limit).await
        } else {
            self.host
                .write_file(&file.path, &file.content, file.mode, file.owner.as_deref(), limit)
                .await
        };

        match written {
            Ok(()) => {
                debug!(directive = %owner, path = %file.path, "File converged");
                Ok(Attempt::changed(None))
            }
            Err(e @ PerchError::WriteFailed { .. }) => {
                Ok(Attempt::failed(FailureKind::CommitFailed, e.to_string(), None))
            }
            Err(e) => Err(e),
        }
    }

    async fn gated_file(
        &self,
        file: &FileSpec,
        validator: &str,
        limit: Duration,
    ) -> crate::error::Result<Attempt> {
        let (content_matches, attributes_match) = self.file_drift(file, limit).await?;
        if content_matches && attributes_match {
            return Ok(Attempt::unchanged(None));
        }

        let gate = ValidationGate::new(self.host, self.staging, limit);
        let staged = match gate.stage(file).await {
            Ok(staged) => staged,
            Err(e @ PerchError::WriteFailed { .. }) => {
                let mut attempt = Attempt::failed(FailureKind::CommitFailed, e.to_string(), None);
                attempt.gate = Some(GatePhase::Staged);
                return Ok(attempt);
            }
            Err(e) => return Err(e),
        };

        let validated = match staged.validate(validator).await? {
            Verdict::Validated(validated) => validated,
            Verdict::Rejected(rejected) => {
                let mut attempt =
                    Attempt::failed(FailureKind::ValidationFailed, rejected.reason, rejected.output);
                attempt.gate = Some(GatePhase::Rejected);
                return Ok(attempt);
            }
        };

        if self.options.dry_run || self.interrupt.is_set() {
            let interrupted = !self.options.dry_run;
            validated.discard().await?;
            return Ok(Attempt {
                changed: true,
                gate: Some(GatePhase::Validated),
                interrupted,
                message: Some(format!("would replace {}", file.path)),
                ..Attempt::default()
            });
        }

        match validated.commit().await {
            Ok(committed) => {
                let mut attempt = Attempt::changed(Some(committed.output));
                attempt.gate = Some(GatePhase::Committed);
                if let Some(backup) = committed.backup {
                    attempt.message = Some(format!("previous file kept at {}", backup));
                }
                Ok(attempt)
            }
            Err(e @ PerchError::WriteFailed { .. }) => {
                let mut attempt = Attempt::failed(FailureKind::CommitFailed, e.to_string(), None);
                attempt.gate = Some(GatePhase::Validated);
                Ok(attempt)
            }
            Err(e) => Err(e),
        }
    }

    async fn service(
        &self,
        name: &str,
        state: ServiceState,
        enabled: Option<bool>,
        limit: Duration,
    ) -> crate::error::Result<Attempt> {
        let unit = quote(name)?;
        let mut steps = Vec::new();

        match state {
            ServiceState::Started | ServiceState::Stopped => {
                let active = self
                    .host
                    .run_command(&format!("systemctl is-active --quiet {}", unit), limit)
                    .await?
                    .success();
                if state == ServiceState::Started && !active {
                    steps.push(format!("systemctl start {}", unit));
                } else if state == ServiceState::Stopped && active {
                    steps.push(format!("systemctl stop {}", unit));
                }
            }
            ServiceState::Restarted => steps.push(format!("systemctl restart {}", unit)),
            ServiceState::Reloaded => steps.push(format!("systemctl reload {}", unit)),
        }

        if let Some(want_enabled) = enabled {
            let is_enabled = self
                .host
                .run_command(&format!("systemctl is-enabled --quiet {}", unit), limit)
                .await?
                .success();
            if want_enabled && !is_enabled {
                steps.push(format!("systemctl enable {}", unit));
            } else if !want_enabled && is_enabled {
                steps.push(format!("systemctl disable {}", unit));
            }
        }

        self.run_steps(steps, limit).await
    }

    async fn package(
        &self,
        names: &[String],
        state: PackageState,
        limit: Duration,
    ) -> crate::error::Result<Attempt> {
        let mut pending = Vec::new();
        for name in names {
            let output = self
                .host
                .run_command(&format!("dpkg-query -W -f='${{Status}}' {}", quote(name)?), limit)
                .await?;
            let installed = output.success() && output.stdout.contains("install ok installed");
            let needs_action = match state {
                PackageState::Present => !installed,
                PackageState::Absent => installed,
            };
            if needs_action {
                pending.push(quote(name)?);
            }
        }

        if pending.is_empty() {
            return Ok(Attempt::unchanged(None));
        }

        let verb = match state {
            PackageState::Present => "install",
            PackageState::Absent => "remove",
        };
        let step = format!(
            "DEBIAN_FRONTEND=noninteractive apt-get {} -y -q {}",
            verb,
            pending.join(" ")
        );
        self.run_steps(vec![step], limit).await
    }

    /// Run mutating steps in order, stopping at the first failure
    async fn run_steps(&self, steps: Vec<String>, limit: Duration) -> crate::error::Result<Attempt> {
        if steps.is_empty() {
            return Ok(Attempt::unchanged(None));
        }

        if self.options.dry_run {
            return Ok(Attempt::changed(None).with_message(format!("would run: {}", steps.join("; "))));
        }

        let mut last = None;
        for step in steps {
            let output = self.host.run_command(&step, limit).await?;
            if !output.success() {
                let message = format!("'{}' exited {}: {}", step, output.exit_code, output.stderr.trim());
                return Ok(Attempt::failed(FailureKind::CommitFailed, message, Some(output)));
            }
            last = Some(output);
        }
        Ok(Attempt::changed(last))
    }
}

/// Apply change and failure policies to an attempt
fn classify(
    directive: &Directive,
    predicate: Option<&CompiledPredicate>,
    attempt: Attempt,
) -> DirectiveRecord {
    let mut record = DirectiveRecord::new(&directive.id, Outcome::OkUnchanged);
    record.output = attempt.output;
    record.gate = attempt.gate;
    record.message = attempt.message;

    if let Some((kind, message)) = attempt.failure {
        let fatal = match kind {
            FailureKind::ValidationFailed | FailureKind::ConnectionLost => true,
            _ => match &directive.failure_policy {
                FailurePolicy::Fatal => true,
                FailurePolicy::Ignored => false,
                FailurePolicy::CustomPredicate(_) => predicate.map_or(true, |p| p.fatal),
            },
        };
        record.outcome = if fatal {
            Outcome::FailedFatal
        } else {
            Outcome::FailedIgnored
        };
        record.failure = Some(kind);
        record.message = Some(message);
        return record;
    }

    let changed = match directive.effective_change_policy() {
        ChangePolicy::AlwaysChanged => true,
        ChangePolicy::NeverChanged => false,
        ChangePolicy::DetectByOutput => attempt.changed,
    };
    if changed {
        record.outcome = Outcome::OkChanged;
    }
    record
}

fn failure_kind(error: &PerchError) -> FailureKind {
    match error {
        PerchError::ConnectionLost { .. } => FailureKind::ConnectionLost,
        PerchError::Timeout { .. } => FailureKind::TimedOut,
        _ => FailureKind::CommitFailed,
    }
}

/// Compare `stat -c '%a %U:%G'` output with the wanted mode and owner
fn attributes_match(file: &FileSpec, stat: &str) -> bool {
    let mut fields = stat.split_whitespace();
    let (Some(mode), Some(owner)) = (fields.next(), fields.next()) else {
        return false;
    };

    let mode_ok = file
        .mode
        .map_or(true, |wanted| u32::from_str_radix(mode, 8).ok() == Some(wanted));
    let owner_ok = file.owner.as_deref().map_or(true, |wanted| {
        if wanted.contains(':') {
            owner == wanted
        } else {
            owner.split(':').next() == Some(wanted)
        }
    });
    mode_ok && owner_ok
}

fn elapsed_ms(start_time: Instant) -> u64 {
    start_time.elapsed().as_millis() as u64
}
