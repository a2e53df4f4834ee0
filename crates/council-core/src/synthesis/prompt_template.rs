//! Renders the negotiation prompt sent to council members in rounds ≥ 1.

use crate::types::NegotiationResponse;

use super::sanitize::{sanitize, sanitize_query, MAX_EXAMPLES, MAX_SANITIZED_QUERY_LEN};

/// Render a negotiation prompt: sanitized query, attributed prior responses,
/// identified disagreements and agreements, and up to [`MAX_EXAMPLES`]
/// representative disagreement examples.
#[must_use]
pub fn build_negotiation_prompt(
    query: &str,
    responses: &[NegotiationResponse],
    disagreements: &[String],
    agreements: &[String],
    examples: &[String],
) -> String {
    let sanitized_query = sanitize_query(query);

    let responses_block = responses
        .iter()
        .map(|r| format!("[{}]: {}", r.member_id, sanitize(&r.content, MAX_SANITIZED_QUERY_LEN)))
        .collect::<Vec<_>>()
        .join("\n");

    let disagreements_block = if disagreements.is_empty() {
        "None identified.".to_string()
    } else {
        disagreements.iter().map(|d| format!("- {d}")).collect::<Vec<_>>().join("\n")
    };

    let agreements_block = if agreements.is_empty() {
        "None identified.".to_string()
    } else {
        agreements.iter().map(|a| format!("- {a}")).collect::<Vec<_>>().join("\n")
    };

    let examples_block = if examples.is_empty() {
        "None.".to_string()
    } else {
        examples
            .iter()
            .take(MAX_EXAMPLES)
            .enumerate()
            .map(|(i, e)| format!("{}. {e}", i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Query: {sanitized_query}\n\n\
         Prior responses:\n{responses_block}\n\n\
         Disagreements:\n{disagreements_block}\n\n\
         Agreements:\n{agreements_block}\n\n\
         Examples:\n{examples_block}\n\n\
         Revise your position, addressing the disagreements above where you can \
         narrow them, and state where you still differ."
    )
}
