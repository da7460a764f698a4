//! Error Types
//!
//! The reactivity core distinguishes two failure classes:
//!
//! - Internal evaluation failures surface to the caller as `Result`s.
//! - Failures inside user-supplied watcher expressions are isolated per
//!   node: they are routed to a pluggable error hook so one broken watch
//!   cannot prevent sibling watches from flushing.
//!
//! The hook is the integration point for a host framework's error
//! reporting. When no hook is installed, errors are logged via `tracing`.

use parking_lot::Mutex;
use thiserror::Error;

/// Errors produced by the reactivity core.
#[derive(Debug, Error)]
pub enum Error {
    /// A watcher expression failed during evaluation.
    #[error("watcher evaluation failed in {context}")]
    Eval {
        /// Which expression failed, for diagnostics.
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A dotted watch path could not be parsed.
    #[error("invalid watch path: {0:?}")]
    InvalidPath(String),

    /// A free-form error raised by user code inside a watcher expression.
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Wrap an arbitrary error as an evaluation failure.
    pub fn eval(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Eval {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Create a free-form error from a message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

/// Callback type for the external error-reporting collaborator.
///
/// Receives the error and an info string describing where it occurred.
pub type ErrorHook = dyn Fn(&Error, &str) + Send + Sync;

static ERROR_HOOK: Mutex<Option<Box<ErrorHook>>> = Mutex::new(None);

/// Install the error hook used for user-watcher failures.
///
/// Replaces any previously installed hook.
pub fn set_error_hook<F>(hook: F)
where
    F: Fn(&Error, &str) + Send + Sync + 'static,
{
    *ERROR_HOOK.lock() = Some(Box::new(hook));
}

/// Remove the installed error hook, reverting to `tracing` output.
pub fn clear_error_hook() {
    *ERROR_HOOK.lock() = None;
}

/// Route an isolated error to the hook, or log it if none is installed.
pub(crate) fn handle_error(err: &Error, info: &str) {
    let hook = ERROR_HOOK.lock();
    match hook.as_ref() {
        Some(hook) => hook(err, info),
        None => tracing::error!(error = %err, info, "unhandled watcher error"),
    }
}
