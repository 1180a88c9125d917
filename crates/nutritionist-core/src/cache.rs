use std::collections::BTreeSet;

use time::{Date, OffsetDateTime};
use tracing::{error, info, warn};

use crate::{
    format_date, map_indices, validate_indices, CacheWriteError, MenuItem, MenuItemId,
    NutritionalSummary, NutritionistRepository, NutritionistResponse, RepositoryError,
    SelectionCacheEntry,
};

/// Date-keyed recommendation cache over a [`NutritionistRepository`].
///
/// Entries are only ever replaced wholesale. Concurrent writers for the same
/// date race, and the last one wins.
pub struct SelectionCache<'a> {
    repository: &'a dyn NutritionistRepository,
}

impl<'a> SelectionCache<'a> {
    #[must_use]
    pub fn new(repository: &'a dyn NutritionistRepository) -> Self {
        Self { repository }
    }

    /// The stored entry for `date`. Read failures count as a miss.
    #[must_use]
    pub fn read(&self, date: Date) -> Option<SelectionCacheEntry> {
        match self.repository.selection_by_date(date) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(date = %format_date(date), error = %err, "failed to read nutritionist selection");
                None
            }
        }
    }

    /// Whether `entry` was computed for the same set of items as `menu`.
    #[must_use]
    pub fn identity_matches(entry: &SelectionCacheEntry, menu: &[MenuItem]) -> bool {
        menu_items_match(&entry.menu_item_ids, menu)
    }

    /// Decode `entry` into a response whose indices are positions in `menu`.
    ///
    /// Stored indices point into the entry's own snapshot, so they are
    /// translated by item id. An undecodable summary is replaced with
    /// [`NutritionalSummary::unknown`]. Returns `None` when the stored indices
    /// do not form a valid selection over the snapshot, or none of them
    /// survive translation to `menu`.
    #[must_use]
    pub fn decode(entry: &SelectionCacheEntry, menu: &[MenuItem]) -> Option<NutritionistResponse> {
        if !validate_indices(&entry.selected_indices, entry.menu_item_ids.len()) {
            warn!(
                date = %format_date(entry.date),
                indices = ?entry.selected_indices,
                "cached selection has invalid indices"
            );
            return None;
        }
        let menu_ids = menu.iter().map(|item| item.id).collect::<Vec<_>>();
        let selected_indices = map_indices(&entry.selected_indices, &entry.menu_item_ids, &menu_ids);
        if selected_indices.is_empty() {
            return None;
        }

        let nutritional_summary = serde_json::from_str(&entry.nutritional_summary)
            .unwrap_or_else(|err| {
                warn!(date = %format_date(entry.date), error = %err, "failed to parse cached nutritional summary");
                NutritionalSummary::unknown()
            });

        Some(NutritionistResponse {
            selected_indices,
            reasoning: entry.reasoning.clone(),
            nutritional_summary,
        })
    }

    /// Persist `response` (indices relative to `menu`) as the entry for `date`.
    ///
    /// # Errors
    /// Returns [`CacheWriteError`] when the summary cannot be encoded or the
    /// repository rejects the write.
    pub fn try_write(
        &self,
        date: Date,
        menu: &[MenuItem],
        response: &NutritionistResponse,
    ) -> Result<(), CacheWriteError> {
        let write_error = |source: RepositoryError| CacheWriteError { date: format_date(date), source };
        let nutritional_summary = serde_json::to_string(&response.nutritional_summary).map_err(|err| {
            write_error(RepositoryError::new(format!("failed to marshal nutritional summary: {err}")))
        })?;

        let entry = SelectionCacheEntry {
            date,
            menu_item_ids: menu.iter().map(|item| item.id).collect(),
            selected_indices: response.selected_indices.clone(),
            reasoning: response.reasoning.clone(),
            nutritional_summary,
            created_at: OffsetDateTime::now_utc(),
        };
        self.repository.save_selection(&entry).map_err(write_error)
    }

    /// Best-effort [`Self::try_write`]: failures are logged and dropped.
    pub fn write(&self, date: Date, menu: &[MenuItem], response: &NutritionistResponse) {
        if let Err(err) = self.try_write(date, menu, response) {
            error!(error = %err, "failed to save to cache");
        }
    }

    pub fn invalidate(&self, date: Date) {
        if let Err(err) = self.repository.delete_selection(date) {
            warn!(date = %format_date(date), error = %err, "failed to delete nutritionist selection");
        }
    }

    /// Drop the entry for `date` if an external menu change armed the reset
    /// flag, and disarm it. Returns whether the flag was consumed.
    pub fn consume_reset_flag(&self, date: Date) -> bool {
        match self.repository.reset_flag(date) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                warn!(date = %format_date(date), error = %err, "failed to read daily menu reset flag");
                return false;
            }
        }

        info!(date = %format_date(date), "reset flag detected - invalidating cache and clearing flag");
        self.invalidate(date);
        if let Err(err) = self.repository.set_reset_flag(date, false) {
            warn!(date = %format_date(date), error = %err, "failed to clear daily menu reset flag");
        }
        true
    }
}

/// Same number of ids, and every cached id still on the menu.
#[must_use]
pub fn menu_items_match(cached_ids: &[MenuItemId], menu: &[MenuItem]) -> bool {
    if cached_ids.len() != menu.len() {
        return false;
    }
    let menu_ids = menu.iter().map(|item| item.id).collect::<BTreeSet<_>>();
    let cached = cached_ids.iter().copied().collect::<BTreeSet<_>>();
    cached == menu_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_date, item, scenario_menu, MemoryRepository};

    fn entry(ids: &[i64], selected: Vec<usize>, summary: &str) -> SelectionCacheEntry {
        SelectionCacheEntry {
            date: fixture_date(),
            menu_item_ids: ids.iter().copied().map(MenuItemId).collect(),
            selected_indices: selected,
            reasoning: "Cached balanced selection".to_string(),
            nutritional_summary: summary.to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    const SUMMARY: &str =
        r#"{"protein": "high", "vegetables": "moderate", "carbohydrates": "balanced", "overall_rating": "good"}"#;

    #[test]
    fn menu_items_match_ignores_order() {
        let menu = vec![item(1, "a", 1), item(2, "b", 1), item(3, "c", 1)];
        assert!(menu_items_match(&[MenuItemId(3), MenuItemId(1), MenuItemId(2)], &menu));
    }

    #[test]
    fn menu_items_match_rejects_drift_and_length_changes() {
        let menu = vec![item(1, "a", 1), item(2, "b", 1), item(4, "d", 1)];
        assert!(!menu_items_match(&[MenuItemId(1), MenuItemId(2), MenuItemId(3)], &menu));
        assert!(!menu_items_match(&[MenuItemId(1), MenuItemId(2)], &menu));
    }

    #[test]
    fn menu_items_match_rejects_duplicate_padding() {
        let menu = vec![item(1, "a", 1), item(2, "b", 1), item(3, "c", 1)];
        assert!(!menu_items_match(&[MenuItemId(1), MenuItemId(1), MenuItemId(2)], &menu));
    }

    fn decoded(entry: &SelectionCacheEntry, menu: &[MenuItem]) -> NutritionistResponse {
        SelectionCache::decode(entry, menu)
            .unwrap_or_else(|| panic!("entry should decode: {entry:?}"))
    }

    #[test]
    fn decode_keeps_stored_summary_and_reasoning() {
        let menu = scenario_menu();
        let response = decoded(&entry(&[1, 2, 3, 4, 5], vec![0, 2, 4], SUMMARY), &menu);
        assert_eq!(response.selected_indices, vec![0, 2, 4]);
        assert_eq!(response.reasoning, "Cached balanced selection");
        assert_eq!(response.nutritional_summary.protein, "high");
    }

    #[test]
    fn decode_substitutes_unknown_summary_when_corrupt() {
        let response = decoded(&entry(&[1, 2, 3, 4, 5], vec![1], "not json"), &scenario_menu());
        assert_eq!(response.nutritional_summary, NutritionalSummary::unknown());
        assert_eq!(response.selected_indices, vec![1]);
    }

    #[test]
    fn decode_translates_snapshot_order_to_current_menu_order() {
        let menu = scenario_menu();
        let response = decoded(&entry(&[5, 4, 3, 2, 1], vec![0, 1], SUMMARY), &menu);
        assert_eq!(response.selected_item_ids(&menu), vec![MenuItemId(5), MenuItemId(4)]);
    }

    #[test]
    fn decode_rejects_empty_or_out_of_range_selections() {
        let menu = scenario_menu();
        assert_eq!(SelectionCache::decode(&entry(&[1, 2, 3, 4, 5], vec![], SUMMARY), &menu), None);
        assert_eq!(SelectionCache::decode(&entry(&[1, 2, 3, 4, 5], vec![9], SUMMARY), &menu), None);
        assert_eq!(
            SelectionCache::decode(&entry(&[1, 2, 3, 4, 5], vec![0, 1, 2, 3, 4, 0, 1], SUMMARY), &menu),
            None
        );
    }

    #[test]
    fn write_snapshots_full_menu_ids() {
        let repository = MemoryRepository::default();
        let cache = SelectionCache::new(&repository);
        let response = NutritionistResponse {
            selected_indices: vec![0, 2, 3],
            reasoning: "balanced".to_string(),
            nutritional_summary: NutritionalSummary::fallback(),
        };

        cache.write(fixture_date(), &scenario_menu(), &response);

        let stored = match repository.cached(fixture_date()) {
            Some(stored) => stored,
            None => panic!("entry should have been written"),
        };
        assert_eq!(stored.menu_item_ids, (1..=5).map(MenuItemId).collect::<Vec<_>>());
        assert_eq!(stored.selected_indices, vec![0, 2, 3]);
        let summary: NutritionalSummary = match serde_json::from_str(&stored.nutritional_summary) {
            Ok(summary) => summary,
            Err(err) => panic!("stored summary should be JSON: {err}"),
        };
        assert_eq!(summary, NutritionalSummary::fallback());
    }

    #[test]
    fn write_failures_are_reported_by_try_write_and_swallowed_by_write() {
        let repository = MemoryRepository::default();
        repository.fail_saves.set(true);
        let cache = SelectionCache::new(&repository);
        let response = NutritionistResponse {
            selected_indices: vec![0],
            reasoning: String::new(),
            nutritional_summary: NutritionalSummary::default(),
        };

        let result = cache.try_write(fixture_date(), &scenario_menu(), &response);
        assert!(matches!(result, Err(CacheWriteError { ref date, .. }) if date == "2026-03-09"));

        cache.write(fixture_date(), &scenario_menu(), &response);
        assert!(repository.cached(fixture_date()).is_none());
    }

    #[test]
    fn consume_reset_flag_invalidates_and_clears_once() {
        let repository = MemoryRepository::default();
        let date = fixture_date();
        repository.selections.borrow_mut().insert(date, entry(&[1, 2, 3, 4, 5], vec![0], SUMMARY));
        repository.reset_flags.borrow_mut().insert(date, true);
        let cache = SelectionCache::new(&repository);

        assert!(cache.consume_reset_flag(date));
        assert!(cache.read(date).is_none());
        assert_eq!(repository.reset_flags.borrow().get(&date), Some(&false));

        assert!(!cache.consume_reset_flag(date));
        assert_eq!(repository.deletes.get(), 1);
    }

    #[test]
    fn read_failures_count_as_miss() {
        let repository = MemoryRepository::default();
        repository.selections.borrow_mut().insert(fixture_date(), entry(&[1], vec![0], SUMMARY));
        repository.fail_selection_reads.set(true);
        assert!(SelectionCache::new(&repository).read(fixture_date()).is_none());
    }
}
