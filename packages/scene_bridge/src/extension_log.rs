//! Console output of extension scripts.
//!
//! Scripts get a `log` namespace with `info`, `warn` and `error`. Every line is
//! tagged `[extension_id/instance_id]` and goes through the `log` facade under
//! the `extension` target. Each instance has its own per-tick budget; once it
//! is spent further lines are dropped and a single warning says so.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use serde::Serialize;

/// Lines kept per instance for inspection.
const HISTORY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug)]
pub struct ExtensionLogger {
    tag: String,
    limit: u32,
    count: Cell<u32>,
    warned: Cell<bool>,
    history: RefCell<VecDeque<LogLine>>,
}

impl ExtensionLogger {
    pub fn new(extension_id: &str, instance_id: &str, limit: u32) -> Self {
        Self {
            tag: format!("{extension_id}/{instance_id}"),
            limit,
            count: Cell::new(0),
            warned: Cell::new(false),
            history: RefCell::new(VecDeque::new()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Reset the budget. Called once per tick.
    pub fn reset_budget(&self) {
        self.count.set(0);
        self.warned.set(false);
    }

    fn can_log(&self) -> bool {
        let count = self.count.get();
        self.count.set(count.saturating_add(1));
        if count < self.limit {
            return true;
        }
        if !self.warned.replace(true) {
            log::warn!(
                target: "extension",
                "[{}] log limit exceeded ({} messages/tick). Further logs dropped.",
                self.tag,
                self.limit
            );
        }
        false
    }

    /// Log `value` at `level` if the budget allows. Returns whether it was
    /// emitted.
    pub fn log(&self, level: LogLevel, value: &rhai::Dynamic) -> bool {
        if !self.can_log() {
            return false;
        }
        let message = stringify_dynamic(value);
        log::log!(target: "extension", level.as_log_level(), "[{}] {}", self.tag, message);

        let mut history = self.history.borrow_mut();
        history.push_back(LogLine { level, message });
        if history.len() > HISTORY_LEN {
            history.pop_front();
        }
        true
    }

    pub fn history(&self) -> Vec<LogLine> {
        self.history.borrow().iter().cloned().collect()
    }
}

/// Convert a Rhai value to a display string. Never fails.
pub fn stringify_dynamic(value: &rhai::Dynamic) -> String {
    if value.is_string() {
        if let Ok(s) = value.clone().into_string() {
            return s;
        }
    }

    if let Some(arr) = value.read_lock::<rhai::Array>() {
        let parts: Vec<String> = arr.iter().map(stringify_dynamic).collect();
        return parts.join(" ");
    }

    if let Some(map) = value.read_lock::<rhai::Map>() {
        let parts: Vec<String> = map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, stringify_dynamic(v)))
            .collect();
        return format!("{{{}}}", parts.join(", "));
    }

    if let Ok(i) = value.as_int() {
        return i.to_string();
    }
    if let Ok(f) = value.as_float() {
        return f.to_string();
    }
    if let Ok(b) = value.as_bool() {
        return b.to_string();
    }
    if value.is_unit() {
        return "()".to_string();
    }

    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Dynamic;

    #[test]
    fn test_stringify_scalars() {
        assert_eq!(stringify_dynamic(&Dynamic::from("hello")), "hello");
        assert_eq!(stringify_dynamic(&Dynamic::from(42_i64)), "42");
        assert_eq!(stringify_dynamic(&Dynamic::from(0.25_f64)), "0.25");
        assert_eq!(stringify_dynamic(&Dynamic::from(true)), "true");
        assert_eq!(stringify_dynamic(&Dynamic::UNIT), "()");
    }

    #[test]
    fn test_stringify_array() {
        let arr: rhai::Array = vec![Dynamic::from("camera"), Dynamic::from(2_i64)];
        assert_eq!(stringify_dynamic(&Dynamic::from(arr)), "camera 2");
    }

    #[test]
    fn test_budget_is_per_instance() {
        let a = ExtensionLogger::new("ext", "a", 3);
        let b = ExtensionLogger::new("ext", "b", 3);
        let msg = Dynamic::from("x");
        for _ in 0..3 {
            assert!(a.log(LogLevel::Info, &msg));
        }
        assert!(!a.log(LogLevel::Warn, &msg));
        assert!(b.log(LogLevel::Info, &msg));

        a.reset_budget();
        assert!(a.log(LogLevel::Error, &msg));
        assert_eq!(a.history().len(), 4);
        assert_eq!(a.tag(), "ext/a");
    }
}
