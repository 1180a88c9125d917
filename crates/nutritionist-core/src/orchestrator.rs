use time::Date;
use tracing::{debug, info, warn};

use crate::{
    build_menu_description, format_date, map_response, parse_structured_response, Availability,
    AvailableMenu, EmployeeId, GenerationClient, MenuItem, NutritionistRepository,
    NutritionistResponse, OrderId, SelectionCache, SelectionError, UserSelection, SYSTEM_PROMPT,
    TEMPERATURE,
};

/// Per-date, per-employee menu recommendations backed by a shared cache.
pub struct NutritionistService<'a> {
    generator: &'a dyn GenerationClient,
    repository: &'a dyn NutritionistRepository,
}

impl<'a> NutritionistService<'a> {
    #[must_use]
    pub fn new(
        generator: &'a dyn GenerationClient,
        repository: &'a dyn NutritionistRepository,
    ) -> Self {
        Self { generator, repository }
    }

    /// Recommend a combination from `menu_items` (the canonical menu for
    /// `date`) for `employee_id`.
    ///
    /// Returned indices are positions in `menu_items` and never name an item
    /// that is out of stock for the employee.
    ///
    /// # Errors
    /// Returns [`SelectionError::NoMenuItems`] for an empty menu,
    /// [`SelectionError::NoAvailableItems`] when everything is out of stock for
    /// the employee, and [`SelectionError::Generation`] or
    /// [`SelectionError::Parsing`] when a fresh recommendation cannot be made.
    pub fn get_nutritionist_selection(
        &self,
        date: Date,
        menu_items: &[MenuItem],
        employee_id: EmployeeId,
    ) -> Result<NutritionistResponse, SelectionError> {
        if menu_items.is_empty() {
            return Err(SelectionError::NoMenuItems);
        }

        let availability = Availability::load(self.repository, employee_id, date);
        let available = availability.filter(menu_items);
        if available.is_empty() {
            return Err(SelectionError::NoAvailableItems);
        }
        info!(
            %employee_id,
            date = %format_date(date),
            total = menu_items.len(),
            available = available.len(),
            "filtered menu items for user"
        );

        let cache = SelectionCache::new(self.repository);
        cache.consume_reset_flag(date);

        let entry = cache.read(date);
        let cached = entry
            .as_ref()
            .filter(|entry| SelectionCache::identity_matches(entry, menu_items))
            .and_then(|entry| SelectionCache::decode(entry, menu_items));

        if let Some(cached) = cached {
            if !availability.conflicts_with(&cached.selected_indices, menu_items) {
                info!(date = %format_date(date), "returning cached nutritionist selection");
                return Ok(cached);
            }

            info!(
                %employee_id,
                date = %format_date(date),
                "cached selection contains out-of-stock items for user, regenerating"
            );
            let response = self.generate_for(&available, menu_items)?;
            cache.invalidate(date);
            cache.write(date, menu_items, &response);
            return Ok(response);
        }

        if let Some(stale) = &entry {
            if SelectionCache::identity_matches(stale, menu_items) {
                info!(date = %format_date(date), "cached selection is unusable, invalidating cache");
            } else {
                info!(date = %format_date(date), "menu items changed, invalidating cache");
            }
            cache.invalidate(date);
        }
        let response = self.generate_for(&available, menu_items)?;
        cache.write(date, menu_items, &response);
        Ok(response)
    }

    /// Record that `employee_id` received a recommendation on `date`.
    ///
    /// # Errors
    /// Returns [`SelectionError::Repository`] when the write fails.
    pub fn track_user_selection(
        &self,
        employee_id: EmployeeId,
        date: Date,
        order_id: Option<OrderId>,
    ) -> Result<UserSelection, SelectionError> {
        Ok(self.repository.track_user_selection(employee_id, date, order_id)?)
    }

    /// Employees tracked on `date` whose order is still unpaid.
    ///
    /// # Errors
    /// Returns [`SelectionError::Repository`] when the query fails.
    pub fn users_needing_notification(
        &self,
        date: Date,
    ) -> Result<Vec<UserSelection>, SelectionError> {
        Ok(self.repository.users_needing_notification(date)?)
    }

    fn generate_for(
        &self,
        available: &AvailableMenu,
        menu_items: &[MenuItem],
    ) -> Result<NutritionistResponse, SelectionError> {
        let prompt = build_menu_description(available.items());
        let raw = self.generator.generate(SYSTEM_PROMPT, &prompt, TEMPERATURE)?;
        debug!(response = %raw, "raw nutritionist response");

        let parsed = parse_structured_response(&raw, available.len())?;
        let mapped = map_response(&parsed, available.items(), menu_items);
        if mapped.selected_indices.is_empty() {
            warn!(indices = ?parsed.selected_indices, "no selection survived mapping to the full menu");
            return Err(SelectionError::Parsing);
        }
        Ok(mapped)
    }
}
