use std::backtrace::{Backtrace, BacktraceStatus};
use std::io::{Error, Write};
use std::panic::PanicHookInfo;
use std::sync::{Once, OnceLock};

use replica_config::Environment;
use thiserror::Error;
use tracing::field::display;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{self, InitError},
};
use tracing_log::{LogTracer, log_tracer::SetLoggerError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber, Registry, fmt, layer::SubscriberExt};

/// JSON field name of the replicated queue in logs.
const QUEUE_KEY_IN_LOG: &str = "queue";
/// JSON field name of the queue consumer in logs.
const CONSUMER_KEY_IN_LOG: &str = "consumer";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to build rolling file appender: {0}")]
    InitAppender(#[from] InitError),

    #[error("failed to init log tracer: {0}")]
    InitLogTracer(#[from] SetLoggerError),

    #[error("failed to set global default subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),

    #[error("an io error occurred: {0}")]
    Io(#[from] Error),
}

/// Keeps buffered log lines alive until the worker exits.
///
/// Production mode holds the [`WorkerGuard`] of the non-blocking file appender, dropping
/// it flushes what is left.
#[must_use]
pub enum LogFlusher {
    Flusher(WorkerGuard),
    NullFlusher,
}

static INIT_TEST_TRACING: Once = Once::new();

/// Call this function once at the beginning of a test and set `ENABLE_TRACING=1` to see
/// the logs in the terminal:
///
/// ```bash
/// ENABLE_TRACING=1 cargo test test_name
/// ```
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_ok() {
            // Without an environment the worker defaults to prod, which logs to files.
            Environment::Dev.set();
            let _log_flusher =
                init_tracing("test").expect("Failed to initialize tracing for tests");
        }
    });
}

/// Identity of the replication worker, added to every JSON log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogIdentity {
    pub queue: String,
    pub consumer: String,
}

static LOG_IDENTITY: OnceLock<LogIdentity> = OnceLock::new();

/// Sets the identity injected into structured logs. Only the first call has an effect.
pub fn set_global_log_identity(identity: LogIdentity) {
    let _ = LOG_IDENTITY.set(identity);
}

pub fn get_global_log_identity() -> Option<&'static LogIdentity> {
    LOG_IDENTITY.get()
}

/// Adds the queue and consumer fields to a JSON log line.
///
/// Returns `None` when the line is not a JSON object or already carries both fields.
fn inject_identity(line: &str, identity: &LogIdentity) -> Option<String> {
    let serde_json::Value::Object(mut map) = serde_json::from_str::<serde_json::Value>(line).ok()? else {
        return None;
    };

    let mut modified = false;
    for (key, value) in [
        (QUEUE_KEY_IN_LOG, &identity.queue),
        (CONSUMER_KEY_IN_LOG, &identity.consumer),
    ] {
        if !map.contains_key(key) {
            map.insert(key.to_owned(), serde_json::Value::String(value.clone()));
            modified = true;
        }
    }
    if !modified {
        return None;
    }

    let injected = serde_json::to_string(&map).ok()?;
    if line.ends_with('\n') {
        Some(format!("{injected}\n"))
    } else {
        Some(injected)
    }
}

/// Writer adding the [`LogIdentity`] to every JSON log line it writes.
struct IdentityInjectingWriter<W> {
    inner: W,
}

impl<W> IdentityInjectingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W> Write for IdentityInjectingWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(identity) = get_global_log_identity()
            && let Ok(line) = std::str::from_utf8(buf)
            && let Some(injected) = inject_identity(line, identity)
        {
            // The caller wrote `buf`, not the longer injected line.
            self.inner.write_all(injected.as_bytes())?;
            return Ok(buf.len());
        }

        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Initializes tracing for the application.
///
/// Production environments log JSON to daily rotated files, other environments log
/// pretty printed lines to the terminal.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    init_tracing_with_identity(app_name, None)
}

/// Like [`init_tracing`], additionally tagging every JSON log line with `identity`.
pub fn init_tracing_with_identity(
    app_name: &str,
    identity: Option<LogIdentity>,
) -> Result<LogFlusher, TracingError> {
    if let Some(identity) = identity {
        set_global_log_identity(identity);
    }

    // Forwards records of crates logging through `log` to the subscriber.
    LogTracer::init()?;

    let is_prod = Environment::load()?.is_prod();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_flusher = if is_prod {
        configure_prod_tracing(filter, app_name)?
    } else {
        configure_dev_tracing(filter)?
    };

    set_tracing_panic_hook();

    Ok(log_flusher)
}

fn configure_prod_tracing(filter: EnvFilter, app_name: &str) -> Result<LogFlusher, TracingError> {
    let file_appender = rolling::Builder::new()
        .filename_prefix(app_name)
        .filename_suffix("log")
        .rotation(rolling::Rotation::DAILY)
        .max_log_files(5)
        .build("logs")?;

    let (file_appender, guard) = tracing_appender::non_blocking(file_appender);

    let format = fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_target(false);

    let subscriber = Registry::default().with(filter).with(
        fmt::layer()
            .event_format(format)
            .with_writer(move || IdentityInjectingWriter::new(file_appender.make_writer()))
            .json()
            .with_current_span(true)
            .with_span_list(true),
    );

    set_global_default(subscriber)?;

    Ok(LogFlusher::Flusher(guard))
}

fn configure_dev_tracing(filter: EnvFilter) -> Result<LogFlusher, TracingError> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .pretty()
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let subscriber = FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .finish();

    set_global_default(subscriber)?;

    Ok(LogFlusher::NullFlusher)
}

/// Routes panics through `tracing` before running the previous hook, so that panics of
/// copy workers end up in the log files.
fn set_tracing_panic_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        panic_hook(info);
        prev_hook(info);
    }));
}

fn panic_hook(panic_info: &PanicHookInfo) {
    let backtrace = Backtrace::capture();
    let (backtrace, note) = match backtrace.status() {
        BacktraceStatus::Captured => (Some(backtrace), None),
        BacktraceStatus::Disabled => (
            None,
            Some("run with RUST_BACKTRACE=1 to display backtraces"),
        ),
        BacktraceStatus::Unsupported => {
            (None, Some("backtraces are not supported on this platform"))
        }
        _ => (None, Some("backtrace status is unknown")),
    };

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    };

    let location = panic_info.location().map(|location| location.to_string());

    tracing::error!(
        panic.payload = payload,
        payload.location = location,
        panic.backtrace = backtrace.map(display),
        panic.note = note,
        "a panic occurred",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LogIdentity {
        LogIdentity {
            queue: "replika".to_owned(),
            consumer: "leaf".to_owned(),
        }
    }

    #[test]
    fn identity_is_added_to_json_lines() {
        let injected = inject_identity("{\"message\":\"batch applied\"}\n", &identity()).unwrap();
        assert!(injected.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&injected).unwrap();
        assert_eq!(value["queue"], "replika");
        assert_eq!(value["consumer"], "leaf");
        assert_eq!(value["message"], "batch applied");
    }

    #[test]
    fn existing_fields_and_plain_lines_are_kept() {
        assert!(inject_identity("{\"queue\":\"other\",\"consumer\":\"c\"}", &identity()).is_none());
        assert!(inject_identity("batch applied", &identity()).is_none());

        let injected = inject_identity("{\"queue\":\"other\"}", &identity()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&injected).unwrap();
        assert_eq!(value["queue"], "other");
        assert_eq!(value["consumer"], "leaf");
    }
}
