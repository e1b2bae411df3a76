// ============================================================================
// LOGGING: stderr plus the current year's `{year}info.log`
// ============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{DcrnnError, Result};

/// Log sink that copies every record to stderr and, once a year is opened,
/// to that year's log file. Clones share the same file slot.
#[derive(Clone, Default)]
pub struct YearLog {
    file: Arc<Mutex<Option<File>>>,
}

impl YearLog {
    pub fn new() -> Self { Self::default() }

    /// Redirects the file copy to `{log_dir}/{year}info.log`, appending.
    pub fn open_year(&self, log_dir: &Path, year: u32) -> Result<PathBuf> {
        fs::create_dir_all(log_dir).map_err(|e| DcrnnError::io(log_dir, e))?;
        let path = log_dir.join(format!("{}info.log", year));
        let file = OpenOptions::new().create(true).append(true).open(&path)
            .map_err(|e| DcrnnError::io(&path, e))?;
        let mut slot = self.file.lock()
            .map_err(|_| DcrnnError::Config("log file lock poisoned".into()))?;
        *slot = Some(file);
        Ok(path)
    }

    pub fn close_year(&self) {
        if let Ok(mut slot) = self.file.lock() { *slot = None; }
    }
}

impl Write for YearLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        let mut slot = self.file.lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        if let Some(f) = slot.as_mut() { f.write_all(buf)?; }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        let mut slot = self.file.lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        if let Some(f) = slot.as_mut() { f.flush()?; }
        Ok(())
    }
}

/// Installs the global logger. `RUST_LOG` overrides `level`.
pub fn init(level: &str, sink: YearLog) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .target(env_logger::Target::Pipe(Box::new(sink)))
        .try_init();
}
