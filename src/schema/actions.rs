//! Canonical action sum type.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Mouse button for click/drag actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Wheel,
    Back,
    Forward,
}

/// A point on the screen, in pixels from the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

/// An action the model asks the computer to perform.
///
/// The `left_mouse_down`/`left_mouse_up` pair exists for Anthropic-style
/// models that split presses from releases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        #[serde(default)]
        button: MouseButton,
        x: i64,
        y: i64,
    },
    DoubleClick {
        #[serde(default)]
        button: MouseButton,
        x: i64,
        y: i64,
    },
    Drag {
        #[serde(default)]
        button: MouseButton,
        path: Vec<Point>,
    },
    #[serde(rename = "move")]
    Move { x: i64, y: i64 },
    Scroll {
        x: i64,
        y: i64,
        scroll_x: i64,
        scroll_y: i64,
    },
    Keypress { keys: Vec<String> },
    #[serde(rename = "type")]
    TypeText { text: String },
    Screenshot,
    Wait,
    LeftMouseDown { x: i64, y: i64 },
    LeftMouseUp { x: i64, y: i64 },
}

impl Action {
    /// Validate per-variant required shapes beyond what serde enforces.
    pub fn validate(&self) -> Result<(), AgentError> {
        match self {
            Action::Drag { path, .. } if path.len() < 2 => Err(AgentError::Target(
                "drag action requires a path of at least 2 points".to_string(),
            )),
            Action::Keypress { keys } if keys.is_empty() => Err(AgentError::Target(
                "keypress action requires at least one key".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// A short name for logs and trajectory entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::Drag { .. } => "drag",
            Action::Move { .. } => "move",
            Action::Scroll { .. } => "scroll",
            Action::Keypress { .. } => "keypress",
            Action::TypeText { .. } => "type",
            Action::Screenshot => "screenshot",
            Action::Wait => "wait",
            Action::LeftMouseDown { .. } => "left_mouse_down",
            Action::LeftMouseUp { .. } => "left_mouse_up",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_defaults_button_to_left() {
        let action: Action = serde_json::from_str(r#"{"type":"click","x":100,"y":200}"#).unwrap();
        assert_eq!(
            action,
            Action::Click {
                button: MouseButton::Left,
                x: 100,
                y: 200
            }
        );
    }

    #[test]
    fn type_and_move_use_wire_names() {
        let typed = Action::TypeText {
            text: "hello".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&typed).unwrap()["type"],
            serde_json::json!("type")
        );
        let moved = Action::Move { x: 1, y: 2 };
        assert_eq!(
            serde_json::to_value(&moved).unwrap()["type"],
            serde_json::json!("move")
        );
    }

    #[test]
    fn validate_rejects_short_drag_and_empty_keypress() {
        let drag = Action::Drag {
            button: MouseButton::Left,
            path: vec![Point { x: 0, y: 0 }],
        };
        assert!(drag.validate().is_err());

        let keypress = Action::Keypress { keys: vec![] };
        assert!(keypress.validate().is_err());

        let ok = Action::Keypress {
            keys: vec!["ctrl".to_string(), "c".to_string()],
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let action: Action =
            serde_json::from_str(r#"{"type":"wait","duration_hint":5}"#).unwrap();
        assert_eq!(action, Action::Wait);
    }
}
