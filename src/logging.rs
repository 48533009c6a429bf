// SPDX-License-Identifier: GPL-2.0-or-later

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Shared sink behind the tracing subscriber and the raw console dump.
///
/// Before a session attaches its `qemu-compose.log` everything goes to
/// stderr; afterwards both formatted log lines and raw guest traffic land in
/// the same file, so the log reads as one interleaved session transcript.
#[derive(Clone)]
pub struct SessionLog {
    file: Arc<Mutex<Option<File>>>,
}

static SESSION_LOG: OnceLock<SessionLog> = OnceLock::new();

impl SessionLog {
    pub fn global() -> &'static SessionLog {
        SESSION_LOG.get_or_init(|| SessionLog {
            file: Arc::new(Mutex::new(None)),
        })
    }

    /// Redirect logging into the session log file.
    pub fn attach(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let file = File::create(path)?;
        if let Ok(mut slot) = self.file.lock() {
            *slot = Some(file);
        }
        Ok(())
    }

    /// Append raw bytes (guest console traffic) to the session log, if
    /// attached. Best-effort.
    pub fn write_raw(&self, data: &[u8]) {
        if let Ok(mut slot) = self.file.lock() {
            if let Some(file) = slot.as_mut() {
                let _ = file.write_all(data);
                let _ = file.flush();
            }
        }
    }
}

pub struct SessionLogWriter {
    log: SessionLog,
}

impl Write for SessionLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut slot) = self.log.file.lock() {
            if let Some(file) = slot.as_mut() {
                return file.write(buf);
            }
        }
        io::stderr().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut slot) = self.log.file.lock() {
            if let Some(file) = slot.as_mut() {
                return file.flush();
            }
        }
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for SessionLog {
    type Writer = SessionLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SessionLogWriter { log: self.clone() }
    }
}

/// Install the process-wide subscriber. `RUST_LOG` filters as usual; the
/// default level is `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(SessionLog::global().clone())
        .init();
}
