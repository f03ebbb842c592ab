//! Shared logging setup for Watchkeeper binaries.
//!
//! Two layers: a size-capped segment file under the watchkeeper home dir and
//! a stderr layer. Filters honor `RUST_LOG`.
//!
//! Log files are write-once segments named `<app>-<epoch_millis>.log`. When
//! the active segment reaches the size cap a fresh segment is opened and the
//! oldest segments beyond the keep count are deleted; nothing is ever
//! renamed, so a `tail -f` on a segment stays valid for that segment's
//! lifetime. On startup the newest segment is resumed if it still has room.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "watchkeeper=info,watchkeeper_db=info,watchkeeper_policy=info";
const SEGMENT_KEEP: usize = 6;
const SEGMENT_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Logging configuration for a Watchkeeper binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a segmented file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("failed to ensure log directory")?;
    let sink = SegmentedLog::open(log_dir, config.app_name, SEGMENT_MAX_BYTES, SEGMENT_KEEP)
        .with_context(|| format!("failed to open log segment for {}", config.app_name))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(sink))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Watchkeeper home directory: `$WATCHKEEPER_HOME` or `~/.watchkeeper`.
pub fn watchkeeper_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("WATCHKEEPER_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".watchkeeper")
}

pub fn logs_dir() -> PathBuf {
    watchkeeper_home().join("logs")
}

pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    std::fs::create_dir_all(&logs)
        .with_context(|| format!("failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Append-only log split into timestamped segments.
struct SegmentedLog {
    dir: PathBuf,
    stem: String,
    max_bytes: u64,
    keep: usize,
    file: File,
    written: u64,
}

impl SegmentedLog {
    fn open(dir: PathBuf, app_name: &str, max_bytes: u64, keep: usize) -> io::Result<Self> {
        let stem = sanitize_name(app_name);

        // Resume the newest segment when it still has room; otherwise start
        // a fresh one.
        let resumable = newest_segment(&dir, &stem)?
            .filter(|(_, size)| *size < max_bytes);
        let (file, written) = match resumable {
            Some((path, size)) => {
                let file = OpenOptions::new().append(true).open(&path)?;
                (file, size)
            }
            None => fresh_segment(&dir, &stem)?,
        };

        let log = Self {
            dir,
            stem,
            max_bytes,
            keep: keep.max(1),
            file,
            written,
        };
        log.prune();
        Ok(log)
    }

    fn roll(&mut self) -> io::Result<()> {
        let _ = self.file.flush();
        let (file, written) = fresh_segment(&self.dir, &self.stem)?;
        self.file = file;
        self.written = written;
        self.prune();
        Ok(())
    }

    /// Delete the oldest segments beyond the keep count. Segment names sort
    /// chronologically, so lexicographic order is age order.
    fn prune(&self) {
        let Ok(mut segments) = list_segments(&self.dir, &self.stem) else {
            return;
        };
        if segments.len() <= self.keep {
            return;
        }
        segments.sort();
        let excess = segments.len() - self.keep;
        for path in segments.into_iter().take(excess) {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Write for SegmentedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= self.max_bytes {
            self.roll()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Create a new segment file named after the current epoch milliseconds,
/// bumping the timestamp if a segment with that name already exists.
fn fresh_segment(dir: &Path, stem: &str) -> io::Result<(File, u64)> {
    let mut millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    loop {
        let path = dir.join(format!("{stem}-{millis:013}.log"));
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((file, 0)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                millis += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn list_segments(dir: &Path, stem: &str) -> io::Result<Vec<PathBuf>> {
    let prefix = format!("{stem}-");
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".log") {
            segments.push(entry.path());
        }
    }
    Ok(segments)
}

fn newest_segment(dir: &Path, stem: &str) -> io::Result<Option<(PathBuf, u64)>> {
    let mut segments = list_segments(dir, stem)?;
    segments.sort();
    let Some(path) = segments.pop() else {
        return Ok(None);
    };
    let size = std::fs::metadata(&path)?.len();
    Ok(Some((path, size)))
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn segment_count(dir: &Path) -> usize {
        list_segments(dir, "test").unwrap().len()
    }

    #[test]
    fn rolls_into_new_segment_at_size_cap() {
        let tmp = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(tmp.path().to_path_buf(), "test", 64, 4).unwrap();

        log.write_all(&[b'x'; 64]).unwrap();
        assert_eq!(segment_count(tmp.path()), 1);

        // The next write crosses the cap and lands in a second segment.
        log.write_all(&[b'y'; 8]).unwrap();
        log.flush().unwrap();
        assert_eq!(segment_count(tmp.path()), 2);
    }

    #[test]
    fn prunes_oldest_segments_beyond_keep() {
        let tmp = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(tmp.path().to_path_buf(), "test", 16, 2).unwrap();
        for _ in 0..6 {
            log.write_all(&[b'x'; 16]).unwrap();
        }
        log.flush().unwrap();
        assert!(segment_count(tmp.path()) <= 2);
    }

    #[test]
    fn resumes_newest_segment_with_room() {
        let tmp = TempDir::new().unwrap();
        {
            let mut log = SegmentedLog::open(tmp.path().to_path_buf(), "test", 1024, 4).unwrap();
            log.write_all(b"first run\n").unwrap();
            log.flush().unwrap();
        }
        {
            let mut log = SegmentedLog::open(tmp.path().to_path_buf(), "test", 1024, 4).unwrap();
            log.write_all(b"second run\n").unwrap();
            log.flush().unwrap();
        }
        // Both runs share one segment.
        assert_eq!(segment_count(tmp.path()), 1);
        let path = list_segments(tmp.path(), "test").unwrap().pop().unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("first run"));
        assert!(content.contains("second run"));
    }

    #[test]
    fn name_sanitization() {
        assert_eq!(sanitize_name("watch keeper/1"), "watch_keeper_1");
    }
}
