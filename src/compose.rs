//! Response composition: fold the turn's outputs into the single structure
//! callers receive.
//!
//! [`compose`] is pure and deterministic. Given the same inputs it always
//! yields the same [`TurnResponse`], which is what makes idempotent replay
//! from the cache indistinguishable from a live turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolResult;

/// Final shape of one completed (or interrupted) turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnResponse {
    /// Assistant-facing text for the turn.
    pub message: String,
    /// Widget types to render, in tool-call order, successes only.
    pub widgets: Vec<String>,
    pub tool_results: Vec<ToolResult>,
    pub has_errors: bool,
    /// Messages of the failed tool calls, in call order.
    pub errors: Vec<String>,
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_data: Option<Value>,
}

/// Build the turn response from the assistant text and tool outcomes.
///
/// Widgets are emitted only for successful results that declare one.
/// Failure results contribute their message to `errors` and flip
/// `has_errors`; they never suppress the assistant text.
#[must_use]
pub fn compose(
    assistant_text: &str,
    tool_results: &[ToolResult],
    requires_confirmation: bool,
    confirmation_data: Option<Value>,
) -> TurnResponse {
    let widgets = tool_results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.widget.clone())
        .collect();

    let errors: Vec<String> = tool_results
        .iter()
        .filter(|r| !r.success)
        .map(|r| {
            r.error
                .clone()
                .unwrap_or_else(|| format!("{} failed", r.tool_name))
        })
        .collect();

    TurnResponse {
        message: assistant_text.to_string(),
        widgets,
        has_errors: !errors.is_empty(),
        errors,
        tool_results: tool_results.to_vec(),
        requires_confirmation,
        confirmation_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_turn_has_no_errors_or_widgets() {
        let resp = compose("4", &[], false, None);
        assert_eq!(resp.message, "4");
        assert!(resp.widgets.is_empty());
        assert!(resp.tool_results.is_empty());
        assert!(!resp.has_errors);
        assert!(!resp.requires_confirmation);
    }

    #[test]
    fn widgets_come_only_from_successful_results() {
        let results = vec![
            ToolResult::success("create_study_task", json!({"id": "t1"})).with_widget("task_card"),
            ToolResult::failure("send_email", "smtp down").with_suggestion("retry later"),
        ];
        let resp = compose("done", &results, false, None);
        assert_eq!(resp.widgets, vec!["task_card"]);
        assert!(resp.has_errors);
        assert_eq!(resp.errors, vec!["smtp down"]);
        assert_eq!(resp.tool_results.len(), 2);
    }

    #[test]
    fn failed_result_without_message_gets_a_default() {
        let mut r = ToolResult::failure("t", "x");
        r.error = None;
        let resp = compose("", &[r], false, None);
        assert_eq!(resp.errors, vec!["t failed"]);
    }

    #[test]
    fn confirmation_data_passes_through() {
        let resp = compose(
            "please confirm",
            &[],
            true,
            Some(json!({"tool": "delete_account"})),
        );
        assert!(resp.requires_confirmation);
        assert_eq!(
            resp.confirmation_data,
            Some(json!({"tool": "delete_account"}))
        );
    }

    #[test]
    fn composition_is_deterministic() {
        let results = vec![ToolResult::success("a", json!(1)).with_widget("w")];
        let first = compose("text", &results, false, None);
        let second = compose("text", &results, false, None);
        assert_eq!(first, second);
    }
}
