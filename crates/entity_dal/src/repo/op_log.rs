//! Injected operation logging for repositories.
//!
//! # Responsibility
//! - Bracket repository operations with start/end trace records.
//! - Record failures before they propagate, without altering them.
//!
//! # Invariants
//! - The end record is emitted on every exit path (drop of `OpSpan`).
//! - Logging never changes control flow or the error being returned.
//! - The process-wide `log` facade is only used when no sink is injected;
//!   its lifecycle belongs to the host (`crate::logging::init_logging`).

use log::{Level, Log, Metadata, Record};
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Instant;

const LOG_TARGET: &str = "entity_dal::repo";

#[derive(Clone)]
enum Sink {
    Facade,
    Injected(Arc<dyn Log>),
}

/// Logging capability handed to a repository at construction.
#[derive(Clone)]
pub struct OpLog {
    sink: Sink,
}

impl Default for OpLog {
    fn default() -> Self {
        Self::facade()
    }
}

impl fmt::Debug for OpLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sink = match self.sink {
            Sink::Facade => "facade",
            Sink::Injected(_) => "injected",
        };
        f.debug_struct("OpLog").field("sink", &sink).finish()
    }
}

impl OpLog {
    /// Routes records through the global `log` facade.
    pub fn facade() -> Self {
        Self { sink: Sink::Facade }
    }

    /// Routes records to `sink` only.
    pub fn with_sink(sink: Arc<dyn Log>) -> Self {
        Self {
            sink: Sink::Injected(sink),
        }
    }

    /// Emits the start record and returns the guard that emits the end one.
    pub fn span(&self, op: &'static str, entity: &'static str) -> OpSpan {
        self.emit(
            Level::Trace,
            format_args!("event=repo_op module=repo op={op} entity={entity} status=start"),
        );
        OpSpan {
            log: self.clone(),
            op,
            entity,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Debug, args);
    }

    pub(crate) fn warn(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Warn, args);
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        let metadata = Metadata::builder().level(level).target(LOG_TARGET).build();
        match &self.sink {
            Sink::Facade => {
                if level > log::max_level() {
                    return;
                }
                let logger = log::logger();
                if logger.enabled(&metadata) {
                    logger.log(&build_record(&metadata, args));
                }
            }
            Sink::Injected(sink) => {
                if sink.enabled(&metadata) {
                    sink.log(&build_record(&metadata, args));
                }
            }
        }
    }
}

fn build_record<'a>(metadata: &Metadata<'a>, args: fmt::Arguments<'a>) -> Record<'a> {
    Record::builder()
        .metadata(metadata.clone())
        .args(args)
        .module_path_static(Some(module_path!()))
        .file_static(Some(file!()))
        .build()
}

/// Guard for one bracketed repository operation.
pub struct OpSpan {
    log: OpLog,
    op: &'static str,
    entity: &'static str,
    started_at: Instant,
}

impl OpSpan {
    /// Logs `result` when it is an error and hands it back unchanged.
    pub fn observe<T, E: Display>(&self, result: Result<T, E>) -> Result<T, E> {
        if let Err(err) = &result {
            self.log.emit(
                Level::Error,
                format_args!(
                    "event=repo_op module=repo op={} entity={} status=error error={}",
                    self.op, self.entity, err
                ),
            );
        }
        result
    }
}

impl Drop for OpSpan {
    fn drop(&mut self) {
        self.log.emit(
            Level::Trace,
            format_args!(
                "event=repo_op module=repo op={} entity={} status=end duration_ms={}",
                self.op,
                self.entity,
                self.started_at.elapsed().as_millis()
            ),
        );
    }
}
