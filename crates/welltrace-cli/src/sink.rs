//! Interactive sink decorator.

use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use welltrace_core::log::{LogEntry, LogSink};

/// Forwards every entry to `S`, then waits for the operator to press Enter
/// after each ERROR entry.
///
/// While it waits, later entries queue for the sinks, but tracker reads and
/// bookkeeping on other threads keep going.
pub struct PauseOnError<S> {
    inner: S,
    input: Mutex<Box<dyn BufRead + Send>>,
}

impl<S: LogSink> PauseOnError<S> {
    /// Reads acknowledgements from stdin.
    pub fn new(inner: S) -> Self {
        Self::with_input(inner, Box::new(io::BufReader::new(io::stdin())))
    }

    pub fn with_input(inner: S, input: Box<dyn BufRead + Send>) -> Self {
        Self {
            inner,
            input: Mutex::new(input),
        }
    }
}

impl<S: LogSink> LogSink for PauseOnError<S> {
    fn emit(&self, entry: &LogEntry) {
        self.inner.emit(entry);
        if !entry.is_error() {
            return;
        }
        eprint!("Anomaly detected. Press Enter to continue...");
        io::stderr().flush().ok();
        let mut input = match self.input.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut line = String::new();
        // EOF (closed stdin) continues immediately
        if let Err(e) = input.read_line(&mut line) {
            tracing::warn!(error = %e, "failed to read operator acknowledgement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use welltrace_core::error::TrackingError;
    use welltrace_core::log::{LogLevel, MemorySink};

    #[test]
    fn consumes_one_line_per_error() {
        let memory = Arc::new(MemorySink::new());
        let input = io::Cursor::new(b"\n\nleftover\n".to_vec());
        let sink = PauseOnError::with_input(memory.clone(), Box::new(input));

        sink.emit(&LogEntry::new(LogLevel::Action, "ok"));
        sink.emit(&LogEntry::anomaly(&TrackingError::UnresolvedInstrument {
            operation: "mix".to_string(),
        }));
        sink.emit(&LogEntry::anomaly(&TrackingError::UnresolvedInstrument {
            operation: "mix".to_string(),
        }));

        assert_eq!(memory.entries().len(), 3);
        let mut rest = String::new();
        sink.input.lock().unwrap().read_line(&mut rest).unwrap();
        assert_eq!(rest, "leftover\n");
    }
}
