// Replay-safe trace macros; thin sugar over OrchestrationContext::trace_*.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.trace_info(format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.trace_warn(format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.trace_error(format!($($arg)+));
    }};
}
