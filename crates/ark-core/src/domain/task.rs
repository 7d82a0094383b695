//! Task definitions, task instances, and the task queue.
//!
//! A [`TaskDefinition`] is the immutable template the service publishes
//! (`get_default_tasks`).  A [`TaskInstance`] binds concrete variable values
//! and a repeat count to one definition.  The [`TaskQueue`] is the ordered
//! list the automation engine walks, plus its cursor and the global number
//! of passes over the whole queue.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by task and queue operations.
#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    /// An override names a variable the definition does not declare.
    #[error("task '{task}' has no variable named '{name}'")]
    UnknownVariable { task: String, name: String },

    /// An override value does not satisfy the variable's type or bounds.
    #[error("invalid value for variable '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    /// A queue index is past the end.
    #[error("queue index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Repeat counts must be at least 1.
    #[error("repeat count must be at least 1")]
    ZeroRepeat,
}

// ── Variables ─────────────────────────────────────────────────────────────────

/// Value type of a task variable.  Unknown types are treated as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VariableType {
    #[default]
    String,
    Int,
    Bool,
    Select,
}

impl From<String> for VariableType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "int" | "integer" => Self::Int,
            "bool" | "boolean" => Self::Bool,
            "select" => Self::Select,
            _ => Self::String,
        }
    }
}

impl From<VariableType> for String {
    fn from(t: VariableType) -> Self {
        match t {
            VariableType::String => "string",
            VariableType::Int => "int",
            VariableType::Bool => "bool",
            VariableType::Select => "select",
        }
        .to_string()
    }
}

/// Declaration of one task variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: VariableType,
    #[serde(default)]
    pub default: Value,
    #[serde(rename = "desc", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Allowed values for `select` variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

impl VariableSpec {
    /// Checks `value` against the declared type and bounds.
    pub fn validate(&self, value: &Value) -> Result<(), TaskError> {
        let invalid = |reason: String| TaskError::InvalidValue {
            name: self.name.clone(),
            reason,
        };
        match self.kind {
            VariableType::String => value
                .is_string()
                .then_some(())
                .ok_or_else(|| invalid(format!("expected a string, got {value}"))),
            VariableType::Bool => value
                .is_boolean()
                .then_some(())
                .ok_or_else(|| invalid(format!("expected a boolean, got {value}"))),
            VariableType::Int => {
                let n = value
                    .as_i64()
                    .ok_or_else(|| invalid(format!("expected an integer, got {value}")))?;
                if let Some(min) = self.min.filter(|m| n < *m) {
                    return Err(invalid(format!("{n} is below the minimum {min}")));
                }
                if let Some(max) = self.max.filter(|m| n > *m) {
                    return Err(invalid(format!("{n} is above the maximum {max}")));
                }
                Ok(())
            }
            VariableType::Select => {
                let s = value
                    .as_str()
                    .ok_or_else(|| invalid(format!("expected one of the options, got {value}")))?;
                if self.options.is_empty() || self.options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    Err(invalid(format!("'{s}' is not one of {:?}", self.options)))
                }
            }
        }
    }
}

// ── Definitions and instances ─────────────────────────────────────────────────

/// Immutable task template published by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            variables: Vec::new(),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }
}

fn default_repeat() -> u32 {
    1
}

/// A definition bound to concrete variable values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(flatten)]
    pub definition: TaskDefinition,
    /// Values chosen for this instance; they win over definition defaults.
    #[serde(rename = "custom_variables", default)]
    pub overrides: Map<String, Value>,
    /// Times the task must report completion before the queue moves on.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Run only in the first pass of a multi-pass run.
    #[serde(default)]
    pub execute_once: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

impl TaskInstance {
    pub fn new(definition: TaskDefinition) -> Self {
        Self {
            definition,
            overrides: Map::new(),
            repeat: 1,
            execute_once: false,
            custom_name: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Name shown in progress events.
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.definition.name)
    }

    /// Sets one override after validating it against the definition.
    pub fn set_override(&mut self, name: &str, value: Value) -> Result<(), TaskError> {
        let spec = self
            .definition
            .variable(name)
            .ok_or_else(|| TaskError::UnknownVariable {
                task: self.definition.id.clone(),
                name: name.to_string(),
            })?;
        spec.validate(&value)?;
        self.overrides.insert(name.to_string(), value);
        Ok(())
    }

    /// Applies every known, valid entry of `values` and returns the names
    /// that were skipped.
    ///
    /// Used for stored preferences, which may predate the current definition.
    pub fn apply_preferences(&mut self, values: &Map<String, Value>) -> Vec<String> {
        let mut skipped = Vec::new();
        for (name, value) in values {
            if self.set_override(name, value.clone()).is_err() {
                skipped.push(name.clone());
            }
        }
        skipped
    }

    pub fn set_repeat(&mut self, repeat: u32) -> Result<(), TaskError> {
        if repeat == 0 {
            return Err(TaskError::ZeroRepeat);
        }
        self.repeat = repeat;
        Ok(())
    }

    /// Definition defaults overlaid with this instance's overrides.
    pub fn variables(&self) -> Map<String, Value> {
        let mut merged: Map<String, Value> = self
            .definition
            .variables
            .iter()
            .filter(|v| !v.default.is_null())
            .map(|v| (v.name.clone(), v.default.clone()))
            .collect();
        for (k, v) in &self.overrides {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Ordered task instances, a cursor, and the number of passes per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueue {
    #[serde(default)]
    items: Vec<TaskInstance>,
    #[serde(default)]
    cursor: usize,
    #[serde(default = "default_repeat")]
    repeat_count: u32,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cursor: 0,
            repeat_count: 1,
        }
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskInstance) {
        self.items.push(task);
    }

    /// Removes the instance at `index`.
    ///
    /// A removal before the cursor shifts it back by one so it keeps pointing
    /// at the same task; removing the current task moves the cursor to the
    /// previous one (or stays at 0).
    pub fn remove(&mut self, index: usize) -> Result<TaskInstance, TaskError> {
        if index >= self.items.len() {
            return Err(TaskError::IndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        let removed = self.items.remove(index);
        if index < self.cursor || (index == self.cursor && self.cursor > 0) {
            self.cursor -= 1;
        }
        Ok(removed)
    }

    /// Swaps two entries; the cursor stays on its index.
    pub fn swap(&mut self, a: usize, b: usize) -> Result<(), TaskError> {
        let len = self.items.len();
        for index in [a, b] {
            if index >= len {
                return Err(TaskError::IndexOutOfRange { index, len });
            }
        }
        self.items.swap(a, b);
        Ok(())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TaskInstance> {
        self.items.get_mut(index)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskInstance> {
        self.items.iter()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Task under the cursor, `None` once the cursor has run off the end.
    pub fn current(&self) -> Option<&TaskInstance> {
        self.items.get(self.cursor)
    }

    /// Moves the cursor forward; returns `true` while it still points at a task.
    pub fn advance(&mut self) -> bool {
        if self.cursor < self.items.len() {
            self.cursor += 1;
        }
        self.cursor < self.items.len()
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn set_repeat_count(&mut self, count: u32) -> Result<(), TaskError> {
        if count == 0 {
            return Err(TaskError::ZeroRepeat);
        }
        self.repeat_count = count;
        Ok(())
    }
}
