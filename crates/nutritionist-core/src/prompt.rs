use std::fmt::Write as _;

use crate::MenuItem;

pub const TEMPERATURE: &str = "0.7";

pub const SYSTEM_PROMPT: &str = r#"You are a highly experienced nutritionist. Your task is to select the most healthy and balanced meal combination from the available menu items.

CRITICAL REQUIREMENTS:
1. You MUST respond with ONLY a valid JSON object in this exact format:
{
  "selected_menu_items": [0, 2, 4],
  "reasoning": "Brief explanation of why these items provide balanced nutrition",
  "nutritional_summary": {
    "protein": "high|moderate|low",
    "vegetables": "high|moderate|low|none",
    "carbohydrates": "high|moderate|low",
    "overall_rating": "excellent|good|balanced|adequate"
  }
}

2. The "selected_menu_items" array MUST contain INDICES (0-based) of menu items, not IDs
3. Select 2-4 items that provide the most balanced nutrition
4. Prioritize: protein sources, vegetables, whole grains, balanced portions
5. Avoid: excessive fried foods, too much sugar, unbalanced combinations

Available menu items (with their indices):"#;

/// One line per item, numbered by position in `items`.
#[must_use]
pub fn build_menu_description(items: &[MenuItem]) -> String {
    let mut description = String::new();
    for (index, item) in items.iter().enumerate() {
        let _ = write!(description, "\nIndex {index}: {} (Rp {})", item.name, item.price_minor_units);
    }
    description
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::item;

    #[test]
    fn menu_description_lists_index_name_and_price() {
        let description =
            build_menu_description(&[item(10, "Item 1", 10_000), item(20, "Item 2", 20_000)]);

        assert_eq!(description, "\nIndex 0: Item 1 (Rp 10000)\nIndex 1: Item 2 (Rp 20000)");
    }

    #[test]
    fn menu_description_uses_positions_not_ids() {
        let description = build_menu_description(&[item(42, "Tofu", 10_000)]);
        assert!(description.contains("Index 0: Tofu"));
        assert!(!description.contains("42"));
    }

    #[test]
    fn system_prompt_demands_index_based_json() {
        assert!(SYSTEM_PROMPT.contains("\"selected_menu_items\""));
        assert!(SYSTEM_PROMPT.contains("INDICES (0-based)"));
    }
}
