//! ---
//! relay_section: "03-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Structured logging context and macros."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __relay_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            channel = ctx.channel.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            uid = ctx.uid.unwrap_or(""),
            command = ctx.command.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with messaging context.
#[macro_export]
macro_rules! relay_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__relay_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__relay_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with messaging context.
#[macro_export]
macro_rules! relay_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__relay_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__relay_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with messaging context.
#[macro_export]
macro_rules! relay_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__relay_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__relay_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with messaging context.
#[macro_export]
macro_rules! relay_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__relay_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__relay_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
