use std::env;
use std::fmt::Arguments;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// How much of the scheduler's work is printed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum TraceLevel {
    Off,
    /// Build, registration and run boundaries.
    Set,
    /// Additionally every actor firing.
    Actor,
}

const COLOR_WARNING: &str = "33";
const COLOR_ERROR: &str = "91";
const COLOR_SET: &str = "34";
const COLOR_ACTOR: &str = "36";

/// Environment variable selecting the log level (`1`/`set` or `full`/`actor`).
pub const TRACE_ENV: &str = "OPENACTOR_TRACE";

static TRACE_LEVEL: OnceLock<TraceLevel> = OnceLock::new();

fn parse_trace_level(value: &str) -> TraceLevel {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "set" => TraceLevel::Set,
        "full" | "actor" => TraceLevel::Actor,
        _ => TraceLevel::Off,
    }
}

fn trace_level() -> TraceLevel {
    *TRACE_LEVEL.get_or_init(|| {
        env::var(TRACE_ENV)
            .ok()
            .as_deref()
            .map(parse_trace_level)
            .unwrap_or(TraceLevel::Off)
    })
}

fn timestamp_hms() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3_600, (secs % 3_600) / 60, secs % 60)
}

fn format_line(kind: &str, color: &str, thread: &str, args: Arguments) -> String {
    format!(
        "{} [\u{001b}[{color}m{kind}\u{001b}[0m] <{thread}> -- {args}",
        timestamp_hms()
    )
}

fn emit(kind: &str, color: &str, args: Arguments) {
    let current = std::thread::current();
    let thread = match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    };
    println!("{}", format_line(kind, color, &thread, args));
}

/// Emit a set-level message (build, link, registration, run boundaries).
pub fn emit_trace(args: Arguments) {
    if trace_level() >= TraceLevel::Set {
        emit("TRACE", COLOR_SET, args);
    }
}

/// Emit a per-actor message; only printed at the `full` level.
pub fn emit_actor(args: Arguments) {
    if trace_level() >= TraceLevel::Actor {
        emit("ACTOR", COLOR_ACTOR, args);
    }
}

/// Emit a warning whenever tracing is on at all.
pub fn emit_warning(args: Arguments) {
    if trace_level() > TraceLevel::Off {
        emit("WARNING", COLOR_WARNING, args);
    }
}

/// Emit an actor failure whenever tracing is on at all.
pub fn emit_error(args: Arguments) {
    if trace_level() > TraceLevel::Off {
        emit("ERROR", COLOR_ERROR, args);
    }
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::logging::emit_trace(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! trace_actor {
    ($($arg:tt)*) => {
        $crate::logging::emit_actor(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        $crate::logging::emit_warning(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logging::emit_error(format_args!($($arg)*))
    };
}
