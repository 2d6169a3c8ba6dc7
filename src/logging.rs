//! Log output.
//!
//! Formatted lines go through a bounded queue to a single writer thread,
//! which owns stdout or the configured log file. A full queue blocks the
//! task that is logging until the writer catches up. The [`LogGuard`]
//! returned by [`init`] waits for the queue to drain when dropped.

use crate::config::{Config, LogLevel};
use anyhow::{Context, Result, anyhow};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

/// LogTimer stamps lines as `DD.MM.YYYY HH:MM:SS` in local time
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTimer;

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%d.%m.%Y %H:%M:%S"))
    }
}

/// Upper bound on how long a flush waits for the writer thread
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum Message {
    Line(Vec<u8>),
    /// Acknowledged once every earlier line has been written
    Flush(SyncSender<()>),
}

/// QueueWriter hands every formatted line to the writer thread
#[derive(Debug, Clone)]
pub struct QueueWriter {
    tx: SyncSender<Message>,
}

impl QueueWriter {
    /// guard returns a handle that flushes this queue on drop
    pub fn guard(&self) -> LogGuard {
        LogGuard {
            tx: Some(self.tx.clone()),
        }
    }
}

impl Write for QueueWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Message::Line(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log writer stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for QueueWriter {
    type Writer = QueueWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// LogGuard drains the log queue when dropped. Keep it alive in `main`.
#[derive(Debug, Default)]
#[must_use]
pub struct LogGuard {
    tx: Option<SyncSender<Message>>,
}

impl LogGuard {
    /// flush blocks until every line queued so far has been written, or
    /// the writer thread is gone, or `timeout` passes
    pub fn flush(&self, timeout: Duration) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if tx.send(Message::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(timeout);
        }
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        self.flush(FLUSH_TIMEOUT);
    }
}

/// init installs the global subscriber for the configured level.
/// With logging off nothing is installed and every event is dropped.
pub fn init(config: &Config) -> Result<LogGuard> {
    let level = match config.log_level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Quiet => LevelFilter::INFO,
        LogLevel::Off => return Ok(LogGuard::default()),
    };

    let sink = open_sink(config)?;
    let writer = spawn_writer(config.log_buffer_size, sink)?;
    let guard = writer.guard();

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .with_timer(LogTimer)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow!("[ERR] failed to install logger: {e}"))?;
    Ok(guard)
}

/// open_sink picks the configured log file (appending) or stdout
fn open_sink(config: &Config) -> Result<Box<dyn Write + Send>> {
    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

/// spawn_writer starts the consumer thread behind a queue of `capacity` lines
pub fn spawn_writer(capacity: usize, sink: Box<dyn Write + Send>) -> Result<QueueWriter> {
    let (tx, rx) = mpsc::sync_channel(capacity);
    thread::Builder::new()
        .name("ggproxy-log".to_string())
        .spawn(move || drain(rx, sink))
        .context("failed to start log writer thread")?;
    Ok(QueueWriter { tx })
}

fn drain(rx: Receiver<Message>, mut sink: Box<dyn Write + Send>) {
    for message in rx {
        match message {
            Message::Line(line) => {
                // Nowhere left to report a failing sink
                if sink.write_all(&line).and_then(|_| sink.flush()).is_err() {
                    break;
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
