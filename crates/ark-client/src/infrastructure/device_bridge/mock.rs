//! Scripted device bridge for tests.
//!
//! # Why a scripted bridge?
//!
//! The real bridge needs an `adb` binary and an attached phone.  The
//! `ScriptedBridge` answers commands from rules registered by the test and
//! records every command line, so tests can assert exactly what would have
//! been sent to the device and in what order.
//!
//! # Usage in tests
//!
//! ```ignore
//! let bridge = ScriptedBridge::new()
//!     .on("getprop ro.build.version.sdk", CommandOutput::ok("28"))
//!     .on("wm size", CommandOutput::ok("Physical size: 1080x1920"));
//!
//! // ... exercise code using `Arc::new(bridge)` ...
//!
//! assert_eq!(bridge.count("forward tcp:"), 1);
//! ```
//!
//! Rules match when the command line (arguments joined by spaces, without
//! the `-s serial` prefix) contains the rule's pattern.  Later rules win over
//! earlier ones.  Unmatched commands succeed with empty output.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{BridgeError, CommandOutput, DeviceBridge};

type Responder = Arc<dyn Fn(&str) -> CommandOutput + Send + Sync>;

/// One command seen by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub serial: Option<String>,
    pub line: String,
}

/// A bridge that answers from test-provided rules.
#[derive(Default)]
pub struct ScriptedBridge {
    /// Every command received, in order.
    pub commands: Mutex<Vec<RecordedCommand>>,
    rules: Vec<(String, Responder)>,
    raw: Vec<(String, Vec<u8>)>,
    /// When `true`, every command fails with a timeout.
    pub should_fail: bool,
}

impl ScriptedBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands containing `pattern` with a fixed output.
    pub fn on(self, pattern: &str, output: CommandOutput) -> Self {
        self.on_with(pattern, move |_| output.clone())
    }

    /// Answers commands containing `pattern` by calling `responder` with the
    /// full command line.
    pub fn on_with(
        mut self,
        pattern: &str,
        responder: impl Fn(&str) -> CommandOutput + Send + Sync + 'static,
    ) -> Self {
        self.rules.push((pattern.to_string(), Arc::new(responder)));
        self
    }

    /// Answers raw-output commands containing `pattern` with `bytes`.
    pub fn on_raw(mut self, pattern: &str, bytes: Vec<u8>) -> Self {
        self.raw.push((pattern.to_string(), bytes));
        self
    }

    /// Recorded command lines, without serials.
    pub fn lines(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|c| c.line.clone())
            .collect()
    }

    /// Number of recorded commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(pattern)).count()
    }

    fn record(&self, serial: Option<&str>, args: &[&str]) -> Result<String, BridgeError> {
        let line = args.join(" ");
        self.commands
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedCommand {
                serial: serial.map(str::to_string),
                line: line.clone(),
            });
        if self.should_fail {
            return Err(BridgeError::Timeout {
                command: line,
                timeout: std::time::Duration::ZERO,
            });
        }
        Ok(line)
    }
}

#[async_trait]
impl DeviceBridge for ScriptedBridge {
    async fn run(&self, serial: Option<&str>, args: &[&str]) -> Result<CommandOutput, BridgeError> {
        let line = self.record(serial, args)?;
        let reply = self
            .rules
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, responder)| responder(&line))
            .unwrap_or_else(|| CommandOutput::ok(""));
        Ok(reply)
    }

    async fn run_raw(&self, serial: Option<&str>, args: &[&str]) -> Result<Vec<u8>, BridgeError> {
        let line = self.record(serial, args)?;
        Ok(self
            .raw
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, bytes)| bytes.clone())
            .unwrap_or_default())
    }
}
