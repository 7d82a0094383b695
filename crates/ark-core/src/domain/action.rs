//! Touch actions issued by the remote service.
//!
//! The service answers each `process_image` request with a `touch_actions`
//! list.  Each entry looks like:
//!
//! ```json
//! {"action": "swipe",
//!  "coordinates": [0.5, 0.8],
//!  "parameters": {"end_coordinates": [0.5, 0.2], "duration": 300}}
//! ```
//!
//! Positions are normalized to `[0, 1]` of the screen so the service never
//! needs to know the device resolution.

use serde_json::Value;
use thiserror::Error;

/// Swipe duration when the action does not carry one.
pub const DEFAULT_SWIPE_DURATION_MS: u64 = 300;

/// Hold duration for `long_press` when the action does not carry one.
pub const DEFAULT_LONG_PRESS_MS: u64 = 1000;

/// Errors produced when an action object cannot be understood.
#[derive(Debug, Error, PartialEq)]
pub enum ActionError {
    /// The `action` field is missing or not a string.
    #[error("action object has no 'action' field")]
    MissingKind,

    /// The `action` value is not one this client can perform.
    #[error("unsupported action '{0}'")]
    Unsupported(String),

    /// A required parameter is missing or has the wrong type.
    #[error("action '{action}' is missing parameter '{field}'")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },

    /// A coordinate is not a finite number inside `[0, 1]`.
    #[error("coordinate {0} is outside the normalized range 0..=1")]
    OutOfRange(f64),

    /// `touch_actions` is present but not a list.
    #[error("touch_actions must be an array")]
    NotAList,
}

/// A normalized screen position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormPoint {
    pub x: f64,
    pub y: f64,
}

impl NormPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One action to perform on the device.
#[derive(Debug, Clone, PartialEq)]
pub enum TouchAction {
    Tap {
        at: NormPoint,
        duration_ms: Option<u64>,
    },
    LongPress {
        at: NormPoint,
        duration_ms: u64,
    },
    Swipe {
        from: NormPoint,
        to: NormPoint,
        duration_ms: u64,
        steps: Option<u32>,
    },
    MultiTouch {
        points: Vec<NormPoint>,
        duration_ms: Option<u64>,
    },
    /// Typed through the device's input method rather than the touch daemon.
    Text(String),
    /// Android key event code, e.g. `4` or `KEYCODE_BACK`.
    Key(String),
    Wait(u64),
}

impl TouchAction {
    /// Parses one action object.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError`] for unknown kinds, missing parameters, or
    /// coordinates outside `[0, 1]`.
    pub fn from_value(value: &Value) -> Result<Self, ActionError> {
        let kind = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(ActionError::MissingKind)?;
        let params = value.get("parameters").unwrap_or(&Value::Null);
        let duration = params.get("duration").and_then(Value::as_u64);

        match kind {
            "click" | "tap" => Ok(Self::Tap {
                at: point(value.get("coordinates"), "click", "coordinates")?,
                duration_ms: duration,
            }),
            "long_press" => Ok(Self::LongPress {
                at: point(value.get("coordinates"), "long_press", "coordinates")?,
                duration_ms: duration.unwrap_or(DEFAULT_LONG_PRESS_MS),
            }),
            "swipe" => Ok(Self::Swipe {
                from: point(value.get("coordinates"), "swipe", "coordinates")?,
                to: point(params.get("end_coordinates"), "swipe", "end_coordinates")?,
                duration_ms: duration.unwrap_or(DEFAULT_SWIPE_DURATION_MS),
                steps: params
                    .get("steps")
                    .and_then(Value::as_u64)
                    .and_then(|s| u32::try_from(s).ok()),
            }),
            "multi_touch" => {
                let raw = params
                    .get("points")
                    .or_else(|| value.get("coordinates"))
                    .and_then(Value::as_array)
                    .ok_or(ActionError::MissingField {
                        action: "multi_touch",
                        field: "points",
                    })?;
                let points = raw
                    .iter()
                    .map(|p| point(Some(p), "multi_touch", "points"))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::MultiTouch {
                    points,
                    duration_ms: duration,
                })
            }
            "input" | "text" => params
                .get("text")
                .and_then(Value::as_str)
                .map(|t| Self::Text(t.to_string()))
                .ok_or(ActionError::MissingField {
                    action: "input",
                    field: "text",
                }),
            "key" => match params.get("key_code") {
                Some(Value::String(s)) if !s.is_empty() => Ok(Self::Key(s.clone())),
                Some(Value::Number(n)) => Ok(Self::Key(n.to_string())),
                _ => Err(ActionError::MissingField {
                    action: "key",
                    field: "key_code",
                }),
            },
            "wait" => duration.map(Self::Wait).ok_or(ActionError::MissingField {
                action: "wait",
                field: "duration",
            }),
            other => Err(ActionError::Unsupported(other.to_string())),
        }
    }
}

/// Parses a `touch_actions` value; `null` or absent means no actions.
pub fn parse_actions(value: Option<&Value>) -> Result<Vec<TouchAction>, ActionError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(TouchAction::from_value).collect(),
        Some(_) => Err(ActionError::NotAList),
    }
}

fn point(
    value: Option<&Value>,
    action: &'static str,
    field: &'static str,
) -> Result<NormPoint, ActionError> {
    let missing = ActionError::MissingField { action, field };
    let pair = value.and_then(Value::as_array).ok_or(missing)?;
    if pair.len() != 2 {
        return Err(ActionError::MissingField { action, field });
    }
    let x = pair[0]
        .as_f64()
        .ok_or(ActionError::MissingField { action, field })?;
    let y = pair[1]
        .as_f64()
        .ok_or(ActionError::MissingField { action, field })?;
    for v in [x, y] {
        if !(0.0..=1.0).contains(&v) {
            return Err(ActionError::OutOfRange(v));
        }
    }
    Ok(NormPoint::new(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_click() {
        let action = TouchAction::from_value(&json!({
            "action": "click",
            "coordinates": [0.5, 0.25]
        }))
        .unwrap();

        assert_eq!(
            action,
            TouchAction::Tap {
                at: NormPoint::new(0.5, 0.25),
                duration_ms: None
            }
        );
    }

    #[test]
    fn test_parse_swipe_defaults_duration() {
        let action = TouchAction::from_value(&json!({
            "action": "swipe",
            "coordinates": [0.5, 0.8],
            "parameters": {"end_coordinates": [0.5, 0.2]}
        }))
        .unwrap();

        assert_eq!(
            action,
            TouchAction::Swipe {
                from: NormPoint::new(0.5, 0.8),
                to: NormPoint::new(0.5, 0.2),
                duration_ms: DEFAULT_SWIPE_DURATION_MS,
                steps: None
            }
        );
    }

    #[test]
    fn test_parse_input_and_key() {
        let text = TouchAction::from_value(&json!({
            "action": "input",
            "coordinates": [0.1, 0.1],
            "parameters": {"text": "hello world"}
        }))
        .unwrap();
        let key = TouchAction::from_value(&json!({
            "action": "key",
            "parameters": {"key_code": 4}
        }))
        .unwrap();

        assert_eq!(text, TouchAction::Text("hello world".into()));
        assert_eq!(key, TouchAction::Key("4".into()));
    }

    #[test]
    fn test_parse_multi_touch_points() {
        let action = TouchAction::from_value(&json!({
            "action": "multi_touch",
            "parameters": {"points": [[0.1, 0.1], [0.9, 0.9]], "duration": 80}
        }))
        .unwrap();

        assert_eq!(
            action,
            TouchAction::MultiTouch {
                points: vec![NormPoint::new(0.1, 0.1), NormPoint::new(0.9, 0.9)],
                duration_ms: Some(80)
            }
        );
    }

    #[test]
    fn test_rejects_unknown_action_and_bad_coordinates() {
        assert_eq!(
            TouchAction::from_value(&json!({"action": "pinch"})),
            Err(ActionError::Unsupported("pinch".into()))
        );
        assert_eq!(
            TouchAction::from_value(&json!({"action": "click", "coordinates": [1.5, 0.5]})),
            Err(ActionError::OutOfRange(1.5))
        );
        assert!(matches!(
            TouchAction::from_value(&json!({"action": "click", "coordinates": [0.5]})),
            Err(ActionError::MissingField { .. })
        ));
        assert_eq!(
            TouchAction::from_value(&json!({"coordinates": [0.5, 0.5]})),
            Err(ActionError::MissingKind)
        );
    }

    #[test]
    fn test_parse_actions_handles_absent_and_non_list() {
        assert!(parse_actions(None).unwrap().is_empty());
        assert!(parse_actions(Some(&Value::Null)).unwrap().is_empty());
        assert_eq!(parse_actions(Some(&json!({}))), Err(ActionError::NotAList));
    }
}
