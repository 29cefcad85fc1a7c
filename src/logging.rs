use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How much goes to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// Install the global subscriber: a stderr layer filtered by `verbosity`
/// (and `RUST_LOG` in normal mode), plus a file layer that stays silent until
/// [`LogFileHandle::set_file`] is called.
///
/// Returns the handle used to activate the file layer once the log path is
/// known from configuration.
pub fn init(verbosity: Verbosity) -> LogFileHandle {
    let terminal_filter = match verbosity {
        Verbosity::Quiet => EnvFilter::new("off"),
        Verbosity::Verbose => EnvFilter::new("hostkit=debug"),
        Verbosity::Normal => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hostkit=info"))
        }
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter);

    // File layer: always hostkit=debug, discards until activated
    let (file_writer, handle) = file_sink();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("hostkit=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    handle
}

// ── file sink ────────────────────────────────────────────

/// Where the file layer writes. Records are dropped while the slot is
/// empty, so events from before config loading never reach disk.
#[derive(Clone, Default)]
pub struct LogSlot(Arc<Mutex<Option<File>>>);

/// Fills the [`LogSlot`] shared with the file layer.
#[derive(Clone)]
pub struct LogFileHandle {
    slot: LogSlot,
}

/// A fresh, empty slot and the handle that fills it.
pub fn file_sink() -> (LogSlot, LogFileHandle) {
    let slot = LogSlot::default();
    (slot.clone(), LogFileHandle { slot })
}

impl LogSlot {
    fn with<T>(&self, idle: T, f: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(file) => f(file),
            None => Ok(idle),
        }
    }
}

impl LogFileHandle {
    /// Open `path` for appending (creating parent directories) and start
    /// writing log records to it.
    pub fn set_file(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.slot.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(file);
        Ok(())
    }
}

impl io::Write for LogSlot {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(buf.len(), |file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with((), File::flush)
    }
}

impl<'a> MakeWriter<'a> for LogSlot {
    type Writer = LogSlot;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discards_until_activated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("hostkit.log");
        let (writer, handle) = file_sink();

        writer.make_writer().write_all(b"dropped\n").unwrap();
        assert!(!path.exists());

        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"kept\n").unwrap();
        writer.make_writer().flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept\n");
    }

    #[test]
    fn appends_across_activations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostkit.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let (writer, handle) = file_sink();
        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"this run\n").unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "earlier run\nthis run\n"
        );
    }
}
