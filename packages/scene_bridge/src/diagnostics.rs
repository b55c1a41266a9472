//! Structured extension diagnostics.
//!
//! Rhai reports parse and runtime errors with positions. These are wrapped
//! into a stable, JSON-serializable record tagged with the owning instance, so
//! a host can surface extension failures without reading Rust logs.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::BridgeError;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Syntax/parse errors (compile time).
    ParseError,
    /// Runtime errors in extension code.
    RuntimeError,
    /// Extension used the bridge API incorrectly (unknown member, wrong type).
    HostApiMisuse,
    /// A value the extension tried to hand over cannot cross the boundary.
    NonMarshalable,
    /// A message recipient failed while handling a message.
    RecipientFailure,
    /// Bridge-side failure (e.g. the injected prelude did not run).
    HostError,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticPhase {
    Compile,
    /// Top-level script run on mount or reload.
    Load,
    Event,
    Message,
    Command,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScriptLocation {
    /// 1-based line number in the extension source (not the injected prelude).
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDiagnostic {
    pub instance_id: String,
    pub kind: DiagnosticKind,
    pub phase: DiagnosticPhase,
    pub message: String,
    pub location: Option<ScriptLocation>,
    /// Raw engine error string (useful for bug reports).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl ExtensionDiagnostic {
    /// Diagnostic for a bridge-level error raised on behalf of an instance.
    pub fn from_bridge_error(
        instance_id: &str,
        phase: DiagnosticPhase,
        err: &BridgeError,
    ) -> Self {
        let kind = match err {
            BridgeError::NotMarshalable { .. } => DiagnosticKind::NonMarshalable,
            BridgeError::RecipientFailure { .. } | BridgeError::RecipientBusy(_) => {
                DiagnosticKind::RecipientFailure
            }
            BridgeError::Compile { .. } => DiagnosticKind::ParseError,
            BridgeError::Script { message, .. } => classify_message(message),
            _ => DiagnosticKind::HostError,
        };
        Self {
            instance_id: instance_id.to_string(),
            kind,
            phase,
            message: err.to_string(),
            location: None,
            raw: None,
        }
    }
}

fn classify_message(message: &str) -> DiagnosticKind {
    // Rhai's error strings are stable enough to classify on.
    let lower = message.to_ascii_lowercase();

    if lower.contains("property not found")
        || lower.contains("variable not found")
        || lower.contains("function not found")
        || lower.contains("array index")
        || lower.contains("map key")
        || lower.contains("mismatched types")
    {
        return DiagnosticKind::HostApiMisuse;
    }

    DiagnosticKind::RuntimeError
}

fn map_position_to_user(line: u32, column: u32, user_line_offset: usize) -> Option<ScriptLocation> {
    let offset = user_line_offset as u32;
    if line == 0 || line <= offset {
        return None;
    }
    Some(ScriptLocation {
        line: line - offset,
        column: column.max(1),
    })
}

pub fn from_parse_error(
    instance_id: &str,
    err: &rhai::ParseError,
    user_line_offset: usize,
) -> ExtensionDiagnostic {
    let raw = err.to_string();
    let pos = err.position();
    let line = pos.line().unwrap_or(0) as u32;
    let column = pos.position().unwrap_or(0) as u32;

    ExtensionDiagnostic {
        instance_id: instance_id.to_string(),
        kind: DiagnosticKind::ParseError,
        phase: DiagnosticPhase::Compile,
        message: raw.clone(),
        location: map_position_to_user(line, column, user_line_offset),
        raw: Some(raw),
    }
}

pub fn from_eval_error(
    instance_id: &str,
    phase: DiagnosticPhase,
    err: &rhai::EvalAltResult,
    user_line_offset: usize,
) -> ExtensionDiagnostic {
    let raw = err.to_string();
    let pos = err.position();
    let line = pos.line().unwrap_or(0) as u32;
    let column = pos.position().unwrap_or(0) as u32;

    ExtensionDiagnostic {
        instance_id: instance_id.to_string(),
        kind: classify_message(&raw),
        phase,
        message: raw.clone(),
        location: map_position_to_user(line, column, user_line_offset),
        raw: Some(raw),
    }
}

/// Bounded queue; the oldest entries go first when full.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    entries: VecDeque<ExtensionDiagnostic>,
    capacity: usize,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, diagnostic: ExtensionDiagnostic) {
        self.entries.push_back(diagnostic);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtensionDiagnostic> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&ExtensionDiagnostic> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
