use std::collections::BTreeSet;

use time::Date;
use tracing::warn;

use crate::{format_date, EmployeeId, MenuItem, MenuItemId, NutritionistRepository};

/// One employee's stock constraints for one date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    unavailable: BTreeSet<MenuItemId>,
}

/// The per-employee view of a canonical menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableMenu {
    items: Vec<MenuItem>,
    original_indices: Vec<usize>,
}

impl Availability {
    #[must_use]
    pub fn new(unavailable: impl IntoIterator<Item = MenuItemId>) -> Self {
        Self { unavailable: unavailable.into_iter().collect() }
    }

    /// Load the employee's stock-empty items. A failed read is treated as
    /// "nothing is unavailable".
    pub fn load(repository: &dyn NutritionistRepository, employee_id: EmployeeId, date: Date) -> Self {
        match repository.stock_empty_item_ids(employee_id, date) {
            Ok(ids) => Self::new(ids),
            Err(err) => {
                warn!(
                    %employee_id,
                    date = %format_date(date),
                    error = %err,
                    "failed to get stock empty items for user, continuing without filtering"
                );
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn is_available(&self, id: MenuItemId) -> bool {
        !self.unavailable.contains(&id)
    }

    /// Items from `menu` still available, in their original relative order.
    #[must_use]
    pub fn filter(&self, menu: &[MenuItem]) -> AvailableMenu {
        let (original_indices, items): (Vec<usize>, Vec<MenuItem>) = menu
            .iter()
            .enumerate()
            .filter(|(_, item)| self.is_available(item.id))
            .map(|(index, item)| (index, item.clone()))
            .unzip();
        AvailableMenu { items, original_indices }
    }

    /// Whether any of `indices`, read against `menu`, names an unavailable item.
    #[must_use]
    pub fn conflicts_with(&self, indices: &[usize], menu: &[MenuItem]) -> bool {
        indices.iter().filter_map(|index| menu.get(*index)).any(|item| !self.is_available(item.id))
    }
}

impl AvailableMenu {
    #[must_use]
    pub fn items(&self) -> &[MenuItem] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Position in the canonical menu of the item at `available_index`.
    ///
    /// Positional view of the available-to-canonical correspondence. The
    /// recommendation path translates by item id through [`crate::map_response`]
    /// instead, which agrees with this whenever the target is the menu this
    /// view was filtered from.
    #[must_use]
    pub fn original_index(&self, available_index: usize) -> Option<usize> {
        self.original_indices.get(available_index).copied()
    }
}
