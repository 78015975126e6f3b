// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle
//!
//! A [`Run`] applies one manifest to one host: plan, render, open the
//! connection, execute directive by directive, fire handlers, clean up.
//! The connection is closed and staged files are removed on every exit path
//! once the connection has been opened.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{Config, TargetConfig};
use crate::directive::{ConcreteAction, Context, Manifest, Rendered};
use crate::error::Result;
use crate::executor::{DirectiveExecutor, ExecutorOptions, Step};
use crate::gate::StagingArea;
use crate::handlers::{Handler, HandlerQueue};
use crate::host::Host;
use crate::plan::{Plan, TagFilter};
use crate::report::{DirectiveRecord, Outcome, RunReport, Termination};

/// Cooperative cancellation flag shared with the signal handler
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Report what would change without committing
    pub dry_run: bool,
    /// Default timeout for external commands
    pub command_timeout: Duration,
    /// Tag filter
    pub filter: TagFilter,
    /// Directive ids whose ignored failures do not fail the run
    pub allowed_failures: BTreeSet<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            command_timeout: ExecutorOptions::default().command_timeout,
            filter: TagFilter::default(),
            allowed_failures: BTreeSet::new(),
        }
    }
}

/// Directive state after the static guard and rendering
enum Prepared {
    Skip(String),
    Ready(Rendered),
}

/// One manifest applied to one host
pub struct Run<'m> {
    manifest: &'m Manifest,
    host: Box<dyn Host>,
    context: Context,
    options: RunOptions,
    interrupt: Interrupt,
}

impl<'m> Run<'m> {
    /// Create a run; nothing touches the host until [`Run::execute`]
    pub fn new(manifest: &'m Manifest, host: Box<dyn Host>, context: Context, options: RunOptions) -> Self {
        Self {
            manifest,
            host,
            context,
            options,
            interrupt: Interrupt::new(),
        }
    }

    /// Share a cancellation flag with the caller
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Runnable directives under the configured tag filter
    pub fn plan(&self) -> Plan<'m> {
        Plan::build(&self.manifest.directives, &self.options.filter)
    }

    /// Execute the run
    ///
    /// Returns `Err` only when the run could not start: a template failed to
    /// render or the host could not be reached. Everything after that is
    /// captured in the report.
    pub async fn execute(self) -> Result<RunReport> {
        self.manifest.validate()?;

        let start_time = Instant::now();
        let plan = self.plan();
        let mut report = RunReport::new(self.host.name(), &self.manifest.name, self.options.dry_run);
        report.allowed_failures = self.options.allowed_failures.clone();

        let prepared = self.prepare(&plan)?;
        let handlers = self.render_handlers()?;

        info!(
            target_host = %self.host.name(),
            manifest = %self.manifest.name,
            runnable = plan.len(),
            omitted = plan.omitted().len(),
            dry_run = self.options.dry_run,
            "Starting run"
        );
        self.host.open().await?;

        let staging = StagingArea::new();
        let executor = DirectiveExecutor::new(
            self.host.as_ref(),
            &staging,
            &self.interrupt,
            ExecutorOptions {
                dry_run: self.options.dry_run,
                command_timeout: self.options.command_timeout,
            },
        );
        let mut queue = HandlerQueue::new();

        for (directive, prepared) in plan.runnable().iter().zip(prepared) {
            if self.interrupt.is_set() {
                warn!(directive = %directive.id, "Interrupted; stopping before directive");
                report.termination = Termination::Interrupted;
                break;
            }

            let rendered = match prepared {
                Prepared::Skip(reason) => {
                    debug!(directive = %directive.id, reason = %reason, "Guard not met");
                    let mut record = DirectiveRecord::new(&directive.id, Outcome::Skipped);
                    record.message = Some(reason);
                    report.record(record);
                    continue;
                }
                Prepared::Ready(rendered) => rendered,
            };

            match executor.execute(directive, &rendered, &mut queue).await {
                Step::Interrupted => {
                    report.termination = Termination::Interrupted;
                    break;
                }
                Step::Recorded(record) => {
                    let fatal = record.outcome == Outcome::FailedFatal;
                    report.record(record);
                    if fatal {
                        report.termination = Termination::Aborted {
                            directive: directive.id.clone(),
                        };
                        break;
                    }
                }
            }
        }

        let notified = queue.drain();
        if matches!(report.termination, Termination::Aborted { .. }) || self.options.dry_run {
            if !notified.is_empty() {
                info!(handlers = ?notified, "Handlers not fired");
            }
            report.unfired_handlers = notified;
        } else {
            for name in notified {
                let Some((handler, action)) = handlers.get(name.as_str()) else {
                    continue;
                };
                let record = executor.execute_handler(handler, action).await;
                report.record_handler(record);
            }
        }

        staging.cleanup(self.host.as_ref(), self.options.command_timeout).await;
        if let Err(e) = self.host.close().await {
            warn!(target_host = %self.host.name(), error = %e, "Failed to close connection");
        }

        report.total_duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            target_host = %report.target,
            changed = report.changed_count(),
            status = ?report.status(),
            duration_ms = report.total_duration_ms,
            "Run finished"
        );
        Ok(report)
    }

    /// Evaluate static guards and render every directive that may run
    fn prepare(&self, plan: &Plan<'m>) -> Result<Vec<Prepared>> {
        plan.runnable()
            .iter()
            .map(|directive| {
                if !directive.evaluate_guard(&self.context) {
                    let var = directive.guard.when.as_deref().unwrap_or_default();
                    return Ok(Prepared::Skip(format!("guard '{}' not met", var)));
                }
                directive.render(&self.context).map(Prepared::Ready)
            })
            .collect()
    }

    fn render_handlers(&self) -> Result<HashMap<&'m str, (&'m Handler, ConcreteAction)>> {
        self.manifest
            .handlers
            .iter()
            .map(|handler| {
                let action = handler.body.render(&handler.name, &self.context)?;
                Ok((handler.name.as_str(), (handler, action)))
            })
            .collect()
    }
}

/// Build the variable snapshot for one target
///
/// Later layers win: manifest vars, config vars, target vars, command-line
/// assignments, then the built-in `target` name.
pub fn target_context(
    manifest: &Manifest,
    config: &Config,
    target: &TargetConfig,
    assignments: &[String],
) -> Result<Context> {
    Ok(Context::builder()
        .layer(&manifest.vars)
        .layer(&config.vars)
        .layer(&target.vars)
        .assignments(assignments)?
        .set("target", target.name.as_str())
        .build())
}
