//! Diagnostics reporting for warmstartd
//!
//! Everything in the workspace logs through `tracing`. This module owns the
//! sink those events end up in: the console (stdout) or the system log.
//! The sink can be switched at runtime and never reports a failure back to
//! the caller, so a broken sink cannot change the outcome of a launch.

use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Where diagnostics are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutput {
    #[default]
    Console,
    Syslog,
}

impl ReportOutput {
    fn to_raw(self) -> u8 {
        match self {
            ReportOutput::Console => 0,
            ReportOutput::Syslog => 1,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ReportOutput::Syslog,
            _ => ReportOutput::Console,
        }
    }
}

struct SinkState {
    output: AtomicU8,
    /// Identity passed to openlog; syslog keeps the pointer, so it lives here
    ident: CString,
    /// Serializes openlog/closelog transitions
    switch_lock: Mutex<()>,
}

impl Drop for SinkState {
    fn drop(&mut self) {
        if ReportOutput::from_raw(self.output.load(Ordering::SeqCst)) == ReportOutput::Syslog {
            // SAFETY: closelog has no preconditions
            unsafe { libc::closelog() };
        }
    }
}

/// Switchable diagnostics sink, usable as a `tracing_subscriber` writer
#[derive(Clone)]
pub struct ReportSink {
    state: Arc<SinkState>,
}

impl ReportSink {
    pub fn new(program: &str, output: ReportOutput) -> Self {
        let ident = CString::new(program.replace('\0', ""))
            .unwrap_or_else(|_| CString::from(c"warmstart"));

        let sink = Self {
            state: Arc::new(SinkState {
                output: AtomicU8::new(ReportOutput::Console.to_raw()),
                ident,
                switch_lock: Mutex::new(()),
            }),
        };
        sink.set_output(output);
        sink
    }

    /// Current output
    pub fn output(&self) -> ReportOutput {
        ReportOutput::from_raw(self.state.output.load(Ordering::SeqCst))
    }

    /// Switch the output, opening or closing the system log as needed
    pub fn set_output(&self, output: ReportOutput) {
        let _guard = self
            .state
            .switch_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self.output();
        if current == output {
            return;
        }

        if current == ReportOutput::Syslog {
            // SAFETY: closelog has no preconditions
            unsafe { libc::closelog() };
        }

        if output == ReportOutput::Syslog {
            // SAFETY: ident is owned by the shared state and outlives the open log
            unsafe {
                libc::openlog(self.state.ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON)
            };
        }

        self.state.output.store(output.to_raw(), Ordering::SeqCst);
    }

    fn writer(&self, level: Level) -> ReportWriter {
        ReportWriter {
            state: self.state.clone(),
            output: self.output(),
            priority: syslog_priority(level),
            buf: Vec::new(),
        }
    }
}

impl<'a> MakeWriter<'a> for ReportSink {
    type Writer = ReportWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(*meta.level())
    }
}

/// Buffers one formatted event and emits it on drop
pub struct ReportWriter {
    state: Arc<SinkState>,
    output: ReportOutput,
    priority: libc::c_int,
    buf: Vec<u8>,
}

impl ReportWriter {
    fn emit(&mut self) {
        if self.buf.is_empty() {
            return;
        }

        match self.output {
            ReportOutput::Console => {
                let mut stdout = io::stdout().lock();
                let _ = stdout.write_all(self.state.ident.as_bytes());
                let _ = stdout.write_all(b": ");
                let _ = stdout.write_all(&self.buf);
                let _ = stdout.flush();
            }
            ReportOutput::Syslog => {
                let text: Vec<u8> = self
                    .buf
                    .iter()
                    .copied()
                    .filter(|b| *b != 0)
                    .collect();
                let text = String::from_utf8_lossy(&text);
                if let Ok(message) = CString::new(text.trim_end()) {
                    // SAFETY: both pointers are valid NUL-terminated strings and
                    // the format consumes exactly one string argument
                    unsafe { libc::syslog(self.priority, c"%s".as_ptr(), message.as_ptr()) };
                }
            }
        }

        self.buf.clear();
    }
}

impl Write for ReportWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit();
        Ok(())
    }
}

impl Drop for ReportWriter {
    fn drop(&mut self) {
        self.emit();
    }
}

fn syslog_priority(level: Level) -> libc::c_int {
    match level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

/// Install the global tracing subscriber writing into a new sink.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_reporting(program: &str, output: ReportOutput, level: &str) -> ReportSink {
    let sink = ReportSink::new(program, output);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(sink.clone())
        .init();

    sink
}

/// Report a fatal condition and terminate the process with `status`
pub fn die(status: i32, message: impl std::fmt::Display) -> ! {
    tracing::error!("died: {}", message);
    std::process::exit(status)
}
