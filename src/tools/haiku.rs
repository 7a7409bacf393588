use serde_json::json;

use crate::tools::{ToolOutcome, ToolSpec};

pub const HAIKU_TOOL: &str = "check_haiku_lines";
pub const HAIKU_PROMPT: &str = "You are a sport poet who writes Poets.

Guidelines:
- Always check your work";

const HAIKU_LINES: usize = 3;

/// Counts lines after trimming surrounding whitespace; blank lines inside the
/// poem still count. Any count other than three gets the same correction.
pub fn check_haiku_lines(text: &str) -> &'static str {
    if text.trim().lines().count() == HAIKU_LINES {
        "Correct. Haiku has 3 lines."
    } else {
        "Incorrect. Haiku has more than 3 lines."
    }
}

pub fn haiku_tool() -> ToolSpec {
    ToolSpec::new(HAIKU_TOOL, "Check haiku lines if it is equal to 3")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"}
            },
            "required": ["text"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_handler(|args, _deps| {
            let text = args
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            async move {
                tracing::debug!(lines = text.trim().lines().count(), "checking haiku");
                Ok(ToolOutcome::Text(check_haiku_lines(&text).to_string()))
            }
        })
}
