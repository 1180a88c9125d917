use std::collections::BTreeMap;

use crate::{MenuItem, MenuItemId, NutritionistResponse};

/// Re-express `indices` (positions in `source_ids`) as positions in
/// `target_ids`, matching on item id.
///
/// Order is preserved. Indices outside `source_ids` and ids missing from
/// `target_ids` are dropped.
#[must_use]
pub fn map_indices(indices: &[usize], source_ids: &[MenuItemId], target_ids: &[MenuItemId]) -> Vec<usize> {
    let mut target_position_by_id = BTreeMap::new();
    for (position, id) in target_ids.iter().enumerate() {
        target_position_by_id.entry(*id).or_insert(position);
    }

    indices
        .iter()
        .filter_map(|index| source_ids.get(*index))
        .filter_map(|id| target_position_by_id.get(id).copied())
        .collect()
}

/// Translate a response computed against `source` into one relative to
/// `target`. Reasoning and summary are carried over unchanged.
#[must_use]
pub fn map_response(
    response: &NutritionistResponse,
    source: &[MenuItem],
    target: &[MenuItem],
) -> NutritionistResponse {
    let source_ids = source.iter().map(|item| item.id).collect::<Vec<_>>();
    let target_ids = target.iter().map(|item| item.id).collect::<Vec<_>>();

    NutritionistResponse {
        selected_indices: map_indices(&response.selected_indices, &source_ids, &target_ids),
        reasoning: response.reasoning.clone(),
        nutritional_summary: response.nutritional_summary.clone(),
    }
}
