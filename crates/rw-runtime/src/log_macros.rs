/// Domain-aware logging macros.
///
/// Each macro injects a `domain` field automatically so callers never need
/// to remember the string literal. Domains: `sys` (lifecycle), `lang`
/// (frontend), `flow` (workflow state machine), `task` (task runtime),
/// `conf` (configuration).
///
/// # Usage
///
/// ```ignore
/// use crate::log_macros::*;
///
/// rw_info!(sys, nodes = 12, "workflow graph ready");
/// rw_warn!(task, error = %e, "output collection error");
/// rw_debug!(flow, instance = %key, "instance succeeded");
/// ```

#[doc(hidden)]
macro_rules! rw_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

/// Log at ERROR level with an automatic `domain` field.
macro_rules! rw_error {
    ($domain:ident, $($rest:tt)*) => {
        rw_log!(error, $domain, $($rest)*)
    };
}

/// Log at WARN level with an automatic `domain` field.
macro_rules! rw_warn {
    ($domain:ident, $($rest:tt)*) => {
        rw_log!(warn, $domain, $($rest)*)
    };
}

/// Log at INFO level with an automatic `domain` field.
macro_rules! rw_info {
    ($domain:ident, $($rest:tt)*) => {
        rw_log!(info, $domain, $($rest)*)
    };
}

/// Log at DEBUG level with an automatic `domain` field.
macro_rules! rw_debug {
    ($domain:ident, $($rest:tt)*) => {
        rw_log!(debug, $domain, $($rest)*)
    };
}

/// Log at TRACE level with an automatic `domain` field.
#[allow(unused_macros)]
macro_rules! rw_trace {
    ($domain:ident, $($rest:tt)*) => {
        rw_log!(trace, $domain, $($rest)*)
    };
}
