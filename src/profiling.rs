//! Runtime profiling session.
//!
//! A [`ProfilingSession`] is an ordinary value: the binary starts one when
//! profiling is enabled, hands it to the [`Server`](crate::Server), and the
//! server finishes it while draining. Components that want to add samples get
//! a reference to it; there is no process-wide profiler.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Sample file for one process run, `<dir>/<pid>-runtime.prof`.
pub struct ProfilingSession {
    path: PathBuf,
    started: Instant,
    out: Mutex<BufWriter<File>>,
}

impl ProfilingSession {
    /// Creates `dir` if needed and opens the sample file.
    pub fn start(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-runtime.prof", std::process::id()));
        let mut out = BufWriter::new(File::create(&path)?);

        let started_unix = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        writeln!(out, "# applyd runtime profile")?;
        writeln!(out, "pid {}", std::process::id())?;
        writeln!(out, "started_unix {started_unix}")?;

        tracing::info!(path = %path.display(), "profiling session started");
        Ok(Self { path, started: Instant::now(), out: Mutex::new(out) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one `name value` sample line.
    pub fn record(&self, name: &str, value: impl fmt::Display) -> Result<(), Error> {
        let mut out = self.out.lock().map_err(|_| Error::Io(std::io::Error::other("profiling writer poisoned")))?;
        writeln!(out, "{name} {value}")?;
        Ok(())
    }

    /// Writes the closing samples, flushes and closes the file.
    pub fn finish(self) -> Result<PathBuf, Error> {
        let mut out = self.out.into_inner().map_err(|_| Error::Io(std::io::Error::other("profiling writer poisoned")))?;
        writeln!(out, "uptime_seconds {:.3}", self.started.elapsed().as_secs_f64())?;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let metrics = handle.metrics();
            writeln!(out, "runtime_workers {}", metrics.num_workers())?;
            writeln!(out, "runtime_alive_tasks {}", metrics.num_alive_tasks())?;
        }
        out.flush()?;
        tracing::info!(path = %self.path.display(), "profiling session saved");
        Ok(self.path)
    }
}

impl fmt::Debug for ProfilingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilingSession").field("path", &self.path).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn samples_are_persisted_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let session = ProfilingSession::start(dir.path().join("pprof")).unwrap();
        session.record("connections_accepted", 3).unwrap();
        let path = session.finish().unwrap();

        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("connections_accepted 3"));
        assert!(text.contains("uptime_seconds"));
        assert!(text.contains("runtime_workers"));
    }
}
