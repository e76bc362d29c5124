use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;
use std::fmt::Write as _;

use pg_stream::error::CdcError;

/// Returns whether terminal output should include backtraces.
fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Backtrace captured when a non-connector error is created.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type of the replicator binary.
#[derive(Debug)]
pub enum ReplicatorError {
    /// Failure reported by the connector.
    Cdc(CdcError),
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    /// Failure writing to stdout or building the runtime.
    Io(std::io::Error, CapturedBacktrace),
}

impl ReplicatorError {
    pub fn category(&self) -> &'static str {
        match self {
            ReplicatorError::Cdc(_) => "connector error",
            ReplicatorError::Config(_, _) => "configuration error",
            ReplicatorError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            ReplicatorError::Cdc(err) => err.backtrace(),
            ReplicatorError::Config(_, backtrace) => Some(&backtrace.0),
            ReplicatorError::Io(_, backtrace) => Some(&backtrace.0),
        }
    }

    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ReplicatorError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Renders the error, its causes and, with `RUST_BACKTRACE` set, its backtrace.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "replicator failed");
        let _ = writeln!(out, "category: {}", self.category());
        let _ = writeln!(out, "error: {self}");

        // Aggregated connector errors already print every member.
        if !matches!(self, ReplicatorError::Cdc(err) if err.errors().is_some()) {
            let mut source = Error::source(self);
            let mut idx = 1usize;
            while let Some(err) = source {
                let _ = writeln!(out, "cause {idx}: {err}");
                source = err.source();
                idx += 1;
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            let _ = writeln!(out, "backtrace:\n{backtrace}");
        }

        out
    }
}

impl fmt::Display for ReplicatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicatorError::Cdc(err) => write!(f, "{err}"),
            ReplicatorError::Config(source, _) => write!(f, "configuration error: {source}"),
            ReplicatorError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for ReplicatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplicatorError::Cdc(err) => err.source(),
            ReplicatorError::Config(source, _) => Some(source.as_ref()),
            ReplicatorError::Io(source, _) => Some(source),
        }
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(err: std::io::Error) -> Self {
        ReplicatorError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<CdcError> for ReplicatorError {
    fn from(err: CdcError) -> Self {
        ReplicatorError::Cdc(err)
    }
}
