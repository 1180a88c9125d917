use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use nutritionist_core::{
    format_date, EmployeeId, GenerationClient, MenuItem, MenuItemId, NutritionistRepository,
    NutritionistResponse, NutritionistService, OrderId, UserSelection,
};
use nutritionist_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::Date;
use tracing::info;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyMenuResult {
    pub date: String,
    pub items: Vec<MenuItem>,
    pub reset_armed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockMarkResult {
    pub employee_id: EmployeeId,
    pub date: String,
    pub menu_item_id: MenuItemId,
    pub stock_empty: bool,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderResult {
    pub order_id: OrderId,
    pub paid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetFlagResult {
    pub date: String,
    pub reset: bool,
}

/// A recommendation with its indices resolved against the day's menu.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recommendation {
    pub date: String,
    pub employee_id: EmployeeId,
    #[serde(flatten)]
    pub response: NutritionistResponse,
    pub selected_items: Vec<MenuItem>,
}

/// Entry point for embedding applications and the `nk` CLI.
///
/// Every call opens the database, brings the schema up to date, and closes it
/// again.
#[derive(Clone)]
pub struct NutritionistApi {
    db_path: PathBuf,
    generator: Option<Arc<dyn GenerationClient + Send + Sync>>,
}

impl NutritionistApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, generator: None }
    }

    /// Attach the text-generation backend used by [`Self::recommend`].
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn GenerationClient + Send + Sync>) -> Self {
        self.generator = Some(generator);
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_menu_item(&self, name: &str, price_minor_units: i64) -> Result<MenuItem> {
        let store = self.open_migrated_store()?;
        store.add_menu_item(name, price_minor_units)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_menu_items(&self) -> Result<Vec<MenuItem>> {
        let store = self.open_migrated_store()?;
        store.list_menu_items()
    }

    /// Replace the canonical menu for `date`.
    ///
    /// # Errors
    /// Returns an error when the item list is invalid or persistence fails.
    pub fn set_daily_menu(&self, date: Date, menu_item_ids: &[MenuItemId]) -> Result<DailyMenuResult> {
        let mut store = self.open_migrated_store()?;
        let reset_armed = store.set_daily_menu(date, menu_item_ids)?;
        Ok(DailyMenuResult {
            date: format_date(date),
            items: store.load_daily_menu(date)?,
            reset_armed,
        })
    }

    /// # Errors
    /// Returns an error when the menu cannot be read.
    pub fn daily_menu(&self, date: Date) -> Result<Vec<MenuItem>> {
        let store = self.open_migrated_store()?;
        store.load_daily_menu(date)
    }

    /// # Errors
    /// Returns an error when the item is unknown or persistence fails.
    pub fn mark_stock_empty(
        &self,
        employee_id: EmployeeId,
        date: Date,
        menu_item_id: MenuItemId,
    ) -> Result<StockMarkResult> {
        let store = self.open_migrated_store()?;
        let already = store.stock_empty_items_for(employee_id, date)?.contains(&menu_item_id);
        store.mark_stock_empty(employee_id, date, menu_item_id)?;
        Ok(StockMarkResult {
            employee_id,
            date: format_date(date),
            menu_item_id,
            stock_empty: true,
            changed: !already,
        })
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn unmark_stock_empty(
        &self,
        employee_id: EmployeeId,
        date: Date,
        menu_item_id: MenuItemId,
    ) -> Result<StockMarkResult> {
        let store = self.open_migrated_store()?;
        let changed = store.unmark_stock_empty(employee_id, date, menu_item_id)?;
        Ok(StockMarkResult {
            employee_id,
            date: format_date(date),
            menu_item_id,
            stock_empty: false,
            changed,
        })
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn record_order(&self, employee_id: EmployeeId, date: Date) -> Result<OrderResult> {
        let store = self.open_migrated_store()?;
        let order_id = store.record_order(employee_id, date)?;
        Ok(OrderResult { order_id, paid: false })
    }

    /// # Errors
    /// Returns an error when the order does not exist or persistence fails.
    pub fn mark_order_paid(&self, order_id: OrderId) -> Result<OrderResult> {
        let store = self.open_migrated_store()?;
        store.mark_order_paid(order_id)?;
        Ok(OrderResult { order_id, paid: true })
    }

    /// Arm or clear the nutritionist reset flag for `date` by hand.
    ///
    /// # Errors
    /// Returns an error when no menu exists for `date` or persistence fails.
    pub fn set_reset_flag(&self, date: Date, reset: bool) -> Result<ResetFlagResult> {
        let store = self.open_migrated_store()?;
        if store.load_daily_menu(date)?.is_empty() {
            return Err(anyhow!("no daily menu for {}", format_date(date)));
        }
        store.write_reset_flag(date, reset)?;
        Ok(ResetFlagResult { date: format_date(date), reset: store.read_reset_flag(date)? })
    }

    /// Recommend a combination from the stored menu for `date`.
    ///
    /// # Errors
    /// Returns an error when no generation backend is attached, or when the
    /// recommendation itself fails (empty menu, everything out of stock,
    /// backend failure, unusable model output).
    pub fn recommend(&self, date: Date, employee_id: EmployeeId) -> Result<Recommendation> {
        let generator = self
            .generator
            .as_deref()
            .ok_or_else(|| anyhow!("no generation backend configured"))?;
        let store = self.open_migrated_store()?;
        let menu = NutritionistRepository::daily_menu_items(&store, date)
            .with_context(|| format!("failed to load daily menu for {}", format_date(date)))?;

        let service = NutritionistService::new(generator, &store);
        let response = service
            .get_nutritionist_selection(date, &menu, employee_id)
            .with_context(|| {
                format!("failed to recommend for employee {employee_id} on {}", format_date(date))
            })?;
        info!(
            %employee_id,
            date = %format_date(date),
            selected = response.selected_indices.len(),
            "nutritionist recommendation ready"
        );

        let selected_items = response
            .selected_indices
            .iter()
            .filter_map(|index| menu.get(*index))
            .cloned()
            .collect();
        Ok(Recommendation { date: format_date(date), employee_id, response, selected_items })
    }

    /// Record that `employee_id` used a recommendation on `date`.
    ///
    /// # Errors
    /// Returns an error when the order is unknown or persistence fails.
    pub fn track_user_selection(
        &self,
        employee_id: EmployeeId,
        date: Date,
        order_id: Option<OrderId>,
    ) -> Result<UserSelection> {
        let store = self.open_migrated_store()?;
        store.upsert_user_selection(employee_id, date, order_id)
    }

    /// Employees to notify after a menu reset on `date`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn users_needing_notification(&self, date: Date) -> Result<Vec<UserSelection>> {
        let store = self.open_migrated_store()?;
        store.unpaid_user_selections(date)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use nutritionist_core::GenerationError;
    use time::Month;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("nutritionist-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn day(value: u8) -> Result<Date> {
        Date::from_calendar_date(2026, Month::March, value).context("invalid fixture date")
    }

    struct CannedGenerator {
        replies: Mutex<VecDeque<String>>,
        calls: AtomicUsize,
    }

    impl CannedGenerator {
        fn replying(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|reply| (*reply).to_string()).collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GenerationClient for CannedGenerator {
        fn generate(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _temperature: &str,
        ) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Ok(mut replies) = self.replies.lock() else {
                return Err(GenerationError::Transport("reply queue poisoned".to_string()));
            };
            replies
                .pop_front()
                .ok_or_else(|| GenerationError::Transport("no canned reply".to_string()))
        }
    }

    fn selection(indices: &str) -> String {
        format!(
            r#"{{"selected_menu_items":{indices},"reasoning":"balanced","nutritional_summary":{{"protein":"high","vegetables":"high","carbohydrates":"moderate","overall_rating":"excellent"}}}}"#
        )
    }

    fn seed_scenario_menu(api: &NutritionistApi, date: Date) -> Result<Vec<MenuItem>> {
        let menu = [
            ("Rice", 5_000),
            ("Chicken", 30_000),
            ("Salad", 15_000),
            ("Tofu", 10_000),
            ("Tea", 5_000),
        ];
        let items = menu
            .into_iter()
            .map(|(name, price)| api.add_menu_item(name, price))
            .collect::<Result<Vec<_>>>()?;
        api.set_daily_menu(date, &items.iter().map(|item| item.id).collect::<Vec<_>>())?;
        Ok(items)
    }

    fn names(recommendation: &Recommendation) -> Vec<&str> {
        recommendation.selected_items.iter().map(|item| item.name.as_str()).collect()
    }

    #[test]
    fn migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = NutritionistApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn recommend_filters_per_employee_and_reuses_the_shared_cache() -> Result<()> {
        let db_path = unique_temp_db_path();
        let generator = CannedGenerator::replying(&[&selection("[0, 1, 2]")]);
        let api = NutritionistApi::new(db_path.clone()).with_generator(generator.clone());
        let date = day(9)?;
        let items = seed_scenario_menu(&api, date)?;
        api.mark_stock_empty(EmployeeId(1), date, items[1].id)?;

        let first = api.recommend(date, EmployeeId(1))?;
        assert_eq!(first.response.selected_indices, vec![0, 2, 3]);
        assert_eq!(names(&first), vec!["Rice", "Salad", "Tofu"]);

        let second = api.recommend(date, EmployeeId(2))?;
        assert_eq!(second.response.selected_indices, vec![0, 2, 3]);
        assert_eq!(generator.calls(), 1);

        let encoded = serde_json::to_value(&second)?;
        assert_eq!(encoded["selected_menu_items"], serde_json::json!([0, 2, 3]));
        assert_eq!(encoded["selected_items"][1]["name"], "Salad");

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn changing_the_menu_forces_a_fresh_recommendation() -> Result<()> {
        let db_path = unique_temp_db_path();
        let generator = CannedGenerator::replying(&[&selection("[0, 2]"), &selection("[1]")]);
        let api = NutritionistApi::new(db_path.clone()).with_generator(generator.clone());
        let date = day(9)?;
        let items = seed_scenario_menu(&api, date)?;

        api.recommend(date, EmployeeId(1))?;
        let updated = api.set_daily_menu(date, &[items[0].id, items[2].id, items[4].id])?;
        assert!(updated.reset_armed);

        let fresh = api.recommend(date, EmployeeId(1))?;
        assert_eq!(names(&fresh), vec!["Salad"]);
        assert_eq!(generator.calls(), 2);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn recommend_reports_empty_menu_and_missing_backend() -> Result<()> {
        let db_path = unique_temp_db_path();
        let date = day(9)?;

        let without_backend = NutritionistApi::new(db_path.clone()).recommend(date, EmployeeId(1));
        assert!(without_backend.is_err());

        let api = NutritionistApi::new(db_path.clone()).with_generator(CannedGenerator::replying(&[]));
        let Err(err) = api.recommend(date, EmployeeId(1)) else {
            return Err(anyhow!("recommendation without a menu should fail"));
        };
        assert!(format!("{err:#}").contains("no menu items available"));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn reset_flag_requires_a_menu() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = NutritionistApi::new(db_path.clone());
        let date = day(9)?;
        assert!(api.set_reset_flag(date, true).is_err());

        seed_scenario_menu(&api, date)?;
        assert!(api.set_reset_flag(date, true)?.reset);
        assert!(!api.set_reset_flag(date, false)?.reset);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn tracked_unpaid_orders_need_notification() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = NutritionistApi::new(db_path.clone());
        let date = day(9)?;
        let open = api.record_order(EmployeeId(1), date)?;
        let settled = api.record_order(EmployeeId(2), date)?;

        api.track_user_selection(EmployeeId(1), date, None)?;
        api.track_user_selection(EmployeeId(1), date, Some(open.order_id))?;
        api.track_user_selection(EmployeeId(2), date, Some(settled.order_id))?;
        assert!(api.mark_order_paid(settled.order_id)?.paid);

        let pending = api.users_needing_notification(date)?;
        assert_eq!(
            pending.iter().map(|selection| selection.employee_id).collect::<Vec<_>>(),
            vec![EmployeeId(1)]
        );

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn stock_marks_report_whether_anything_changed() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = NutritionistApi::new(db_path.clone());
        let date = day(9)?;
        let items = seed_scenario_menu(&api, date)?;

        assert!(api.mark_stock_empty(EmployeeId(1), date, items[0].id)?.changed);
        assert!(!api.mark_stock_empty(EmployeeId(1), date, items[0].id)?.changed);
        assert!(api.unmark_stock_empty(EmployeeId(1), date, items[0].id)?.changed);
        assert!(!api.unmark_stock_empty(EmployeeId(1), date, items[0].id)?.changed);

        cleanup(&db_path);
        Ok(())
    }
}
