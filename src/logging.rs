use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_str(s: &str) -> LogLevel {
        match s.to_uppercase().as_str() {
            "ERROR" => LogLevel::Error,
            "WARN" | "WARNING" => LogLevel::Warn,
            "INFO" => LogLevel::Info,
            "DEBUG" => LogLevel::Debug,
            "TRACE" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn current() -> LogLevel {
        env::var("FEDTAB_LOG_LEVEL")
            .map(|s| LogLevel::from_str(&s))
            .unwrap_or(LogLevel::Info)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

/// Stderr logger categorized by engine subsystem (CONN, POOL, SCAN, DML,
/// SAVEPOINT, META). Metadata and reconnect paths are allowed to fail soft
/// (spec §7): they log instead of propagating.
pub struct FedLogger;

impl FedLogger {
    pub fn log(level: LogLevel, category: &str, message: &str) {
        if level <= LogLevel::current() {
            eprintln!("[{}] {} {}", level.as_str(), category, message);
        }
    }
    pub fn error(category: &str, message: &str) {
        Self::log(LogLevel::Error, category, message);
    }
    pub fn warn(category: &str, message: &str) {
        Self::log(LogLevel::Warn, category, message);
    }
    pub fn info(category: &str, message: &str) {
        Self::log(LogLevel::Info, category, message);
    }
    pub fn debug(category: &str, message: &str) {
        Self::log(LogLevel::Debug, category, message);
    }
    pub fn trace(category: &str, message: &str) {
        Self::log(LogLevel::Trace, category, message);
    }
}

macro_rules! fed_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::FedLogger::warn($category, &format!($($arg)*))
    };
}
macro_rules! fed_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::FedLogger::debug($category, &format!($($arg)*))
    };
}

pub(crate) use fed_debug;
pub(crate) use fed_warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_case_insensitively() {
        assert_eq!(LogLevel::from_str("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("nonsense"), LogLevel::Info);
    }

    #[test]
    fn level_ordering_is_severity_ascending() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }
}
