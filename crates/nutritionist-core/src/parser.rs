use std::collections::BTreeSet;

use tracing::warn;

use crate::{NutritionalSummary, NutritionistResponse, SelectionError};

/// Upper bound on a well-formed structured answer.
pub const MAX_SELECTED: usize = 6;

/// Upper bound on selections recovered from free text.
pub const FALLBACK_MAX_SELECTED: usize = 4;

const FALLBACK_REASONING: &str = "AI-selected balanced combination";

/// Turn raw model output into a selection whose indices are all in
/// `[0, max_index)`.
///
/// Strict JSON decoding is attempted first; anything that fails to decode or
/// validate goes through [`fallback_parse_response`].
///
/// # Errors
/// Returns [`SelectionError::Parsing`] when neither path yields an index.
pub fn parse_structured_response(
    content: &str,
    max_index: usize,
) -> Result<NutritionistResponse, SelectionError> {
    let cleaned = clean_markdown_code_blocks(content);

    if let Ok(response) = serde_json::from_str::<NutritionistResponse>(&cleaned) {
        if validate_indices(&response.selected_indices, max_index) {
            return Ok(response);
        }
        warn!(indices = ?response.selected_indices, max_index, "invalid indices in JSON response");
    }

    warn!("JSON parsing failed, attempting fallback parsing");
    fallback_parse_response(&cleaned, max_index)
}

#[must_use]
pub fn clean_markdown_code_blocks(content: &str) -> String {
    content.replace("```json", "").replace("```", "").trim().to_string()
}

#[must_use]
pub fn validate_indices(indices: &[usize], max_index: usize) -> bool {
    !indices.is_empty()
        && indices.len() <= MAX_SELECTED
        && indices.iter().all(|index| *index < max_index)
}

/// Scrape indices out of free text.
///
/// Only lines mentioning `selected`, `indices`, or `[` are considered. Integer
/// tokens in range are kept in first-seen order without duplicates, capped at
/// [`FALLBACK_MAX_SELECTED`].
///
/// # Errors
/// Returns [`SelectionError::Parsing`] when no usable index is found.
pub fn fallback_parse_response(
    content: &str,
    max_index: usize,
) -> Result<NutritionistResponse, SelectionError> {
    let mut seen = BTreeSet::new();
    let mut indices = Vec::new();

    for line in content.lines().map(str::trim) {
        if !(line.contains("selected") || line.contains("indices") || line.contains('[')) {
            continue;
        }
        for number in extract_numbers(line) {
            let Ok(index) = usize::try_from(number) else {
                continue;
            };
            if index < max_index && seen.insert(index) {
                indices.push(index);
            }
        }
    }

    if indices.is_empty() {
        return Err(SelectionError::Parsing);
    }
    indices.truncate(FALLBACK_MAX_SELECTED);

    Ok(NutritionistResponse {
        selected_indices: indices,
        reasoning: FALLBACK_REASONING.to_string(),
        nutritional_summary: NutritionalSummary::fallback(),
    })
}

/// Whitespace tokens that parse as integers once bracket, paren, and comma
/// punctuation is trimmed from both ends.
#[must_use]
pub fn extract_numbers(text: &str) -> Vec<i64> {
    text.split_whitespace()
        .map(|word| word.trim_matches(|ch| matches!(ch, '[' | ']' | '(' | ')' | ',')))
        .filter_map(|word| word.parse::<i64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_support::BALANCED_JSON;

    fn parsed(content: &str, max_index: usize) -> NutritionistResponse {
        match parse_structured_response(content, max_index) {
            Ok(response) => response,
            Err(err) => panic!("expected {content:?} to parse: {err}"),
        }
    }

    #[test]
    fn strict_json_is_returned_unchanged() {
        let response = parsed(BALANCED_JSON, 5);
        assert_eq!(response.selected_indices, vec![0, 2, 3]);
        assert_eq!(response.reasoning, "balanced");
        assert_eq!(response.nutritional_summary.protein, "high");
    }

    #[test]
    fn null_summary_fields_keep_the_structured_answer() {
        let raw = r#"{"selected_menu_items":[0,1,2,3,4],"reasoning":"five items","nutritional_summary":{"protein":"high","vegetables":null,"carbohydrates":"moderate","overall_rating":"good"}}"#;
        let response = parsed(raw, 5);
        assert_eq!(response.selected_indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(response.reasoning, "five items");
        assert_eq!(response.nutritional_summary.protein, "high");
        assert_eq!(response.nutritional_summary.vegetables, "");
    }

    #[test]
    fn code_fences_are_stripped_before_decoding() {
        let fenced = format!("```json\n{BALANCED_JSON}\n```\n");
        assert_eq!(parsed(&fenced, 5).reasoning, "balanced");

        let bare = format!("```\n{BALANCED_JSON}\n```");
        assert_eq!(parsed(&bare, 5).selected_indices, vec![0, 2, 3]);
    }

    #[test]
    fn clean_markdown_code_blocks_trims_whitespace() {
        assert_eq!(clean_markdown_code_blocks("  ```json\n{}\n```  "), "{}");
        assert_eq!(clean_markdown_code_blocks("plain"), "plain");
    }

    #[test]
    fn validate_indices_enforces_count_and_range() {
        assert!(validate_indices(&[0, 1, 2], 5));
        assert!(validate_indices(&[0, 4], 5));
        assert!(!validate_indices(&[0, 5], 5));
        assert!(!validate_indices(&[], 5));
        assert!(!validate_indices(&[0, 1, 2, 3, 4, 5, 6], 10));
        assert!(validate_indices(&[0, 1, 2, 3, 4, 5], 10));
    }

    #[test]
    fn prose_with_selected_indices_uses_fallback() {
        let response = parsed("Here you go.\nselected indices: [1, 3]\nEnjoy!", 5);
        assert_eq!(response.selected_indices, vec![1, 3]);
        assert_eq!(response.reasoning, FALLBACK_REASONING);
        assert_eq!(response.nutritional_summary, NutritionalSummary::fallback());
    }

    #[test]
    fn out_of_range_json_indices_fall_back_to_in_range_tokens() {
        let content = r#"{
  "selected_menu_items": [0, 7, 2],
  "reasoning": "too eager",
  "nutritional_summary": {"protein": "high"}
}"#;
        let response = parsed(content, 5);
        assert_eq!(response.selected_indices, vec![0, 2]);
        assert_eq!(response.reasoning, FALLBACK_REASONING);
    }

    #[test]
    fn fallback_deduplicates_and_caps_at_four() {
        let response = parsed("selected: 3 3 1 0 2 4\nindices [1]", 9);
        assert_eq!(response.selected_indices, vec![3, 1, 0, 2]);
    }

    #[test]
    fn fallback_ignores_lines_without_trigger_tokens() {
        let result = parse_structured_response("I recommend items 1 and 2.\nThey are tasty.", 5);
        assert_eq!(result, Err(SelectionError::Parsing));
    }

    #[test]
    fn fallback_drops_negative_tokens() {
        let response = parsed("selected -1 2", 5);
        assert_eq!(response.selected_indices, vec![2]);
    }

    #[test]
    fn empty_input_is_a_parsing_error() {
        assert_eq!(parse_structured_response("", 5), Err(SelectionError::Parsing));
        assert_eq!(parse_structured_response("```json\n```", 5), Err(SelectionError::Parsing));
    }

    #[test]
    fn empty_json_selection_with_nothing_to_scrape_fails() {
        let result = parse_structured_response(r#"{"selected_menu_items": []}"#, 5);
        assert_eq!(result, Err(SelectionError::Parsing));
    }

    #[test]
    fn extract_numbers_trims_punctuation() {
        assert_eq!(extract_numbers("[1, (2), 3]"), vec![1, 2, 3]);
        assert_eq!(extract_numbers("selected: none"), Vec::<i64>::new());
        assert_eq!(extract_numbers("-4 +5"), vec![-4, 5]);
    }

    proptest! {
        #[test]
        fn property_parser_never_returns_out_of_range_indices(
            content in "(selected|indices|\\[|[0-9]{1,2}|,|\\]| |\n|[a-z]{1,5}){0,40}",
            max_index in 1_usize..12,
        ) {
            if let Ok(response) = parse_structured_response(&content, max_index) {
                prop_assert!(!response.selected_indices.is_empty());
                prop_assert!(response.selected_indices.len() <= MAX_SELECTED);
                prop_assert!(response.selected_indices.iter().all(|index| *index < max_index));
            }
        }

        #[test]
        fn property_strict_json_with_valid_indices_round_trips(
            indices in proptest::collection::vec(0_usize..8, 1..=6),
        ) {
            let content = serde_json::json!({
                "selected_menu_items": indices,
                "reasoning": "ok",
                "nutritional_summary": {
                    "protein": "high",
                    "vegetables": "low",
                    "carbohydrates": "moderate",
                    "overall_rating": "good"
                }
            })
            .to_string();
            let response = parse_structured_response(&content, 8);
            prop_assert!(response.is_ok());
            prop_assert_eq!(
                response.map(|response| response.selected_indices).unwrap_or_default(),
                indices
            );
        }
    }
}
