use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

pub(crate) const TAIL_LINES: usize = 500;

/// The last few hundred log lines, kept for the `/logs` command.
#[derive(Clone)]
pub(crate) struct LogTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, chunk: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
    }

    /// Up to `n` most recent lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().skip(lines.len().saturating_sub(n)).cloned().collect()
    }
}

#[derive(Clone)]
pub(crate) struct TailMakeWriter {
    pub tail: LogTail,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for TailMakeWriter {
    type Writer = TailWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TailWriter {
            tail: self.tail.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct TailWriter {
    tail: LogTail,
    suppress_stdout: bool,
}

impl std::io::Write for TailWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tail.push(&String::from_utf8_lossy(buf));
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

pub(crate) fn parse_level(level: &str) -> Level {
    level.parse().unwrap_or(Level::INFO)
}

/// Install the global subscriber. Returns the tail it writes into.
pub(crate) fn init(level: &str) -> LogTail {
    let tail = LogTail::new(TAIL_LINES);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_ansi(false)
        .with_writer(TailMakeWriter {
            tail: tail.clone(),
            suppress_stdout: false,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    tail
}
