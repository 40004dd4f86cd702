use std::io::Write;
use std::path::PathBuf;

use once_cell::sync::OnceCell;

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB

struct LocalTimestamp;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        // Local wall-clock time with timezone offset, e.g. 2026-02-15T14:08:12.345678+01:00
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f%:z")
        )
    }
}

struct SizeLimitedWriter {
    file: std::fs::File,
    path: PathBuf,
    max_bytes: u64,
}

impl SizeLimitedWriter {
    fn new(path: PathBuf, max_bytes: u64) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            max_bytes,
        })
    }

    fn rotate_if_needed(&mut self) {
        if let Ok(meta) = self.file.metadata() {
            if meta.len() < self.max_bytes {
                return;
            }
        }
        let _ = self.file.flush();
        let rotated = self.path.with_extension("log.1");
        let _ = std::fs::remove_file(&rotated);
        let _ = std::fs::rename(&self.path, &rotated);
        if let Ok(new_file) = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = new_file;
        }
    }
}

impl std::io::Write for SizeLimitedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rotate_if_needed();
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Initializes the global tracing subscriber with a size-rotated log file in
/// `log_dir`. Safe to call once per process; the embedding application owns
/// the decision of where logs live. Errors are reported to stderr, never
/// propagated: a browser without a log file still has to browse.
pub fn init(log_dir: PathBuf) {
    static GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log dir {:?}: {}", log_dir, e);
        return;
    }
    let writer = match SizeLimitedWriter::new(log_dir.join("proofsheet.log"), MAX_LOG_BYTES) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Failed to open log file: {e}");
            return;
        }
    };
    let (non_blocking, guard) =
        tracing_appender::non_blocking::NonBlockingBuilder::default().finish(writer);
    let _ = GUARD.set(guard);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_timer(LocalTimestamp)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(non_blocking);
    if let Err(e) = subscriber.try_init() {
        eprintln!("Failed to init tracing subscriber: {e}");
    }
}
