use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

mod availability;
mod cache;
mod mapping;
mod orchestrator;
mod parser;
mod prompt;

pub use availability::{Availability, AvailableMenu};
pub use cache::{menu_items_match, SelectionCache};
pub use mapping::{map_indices, map_response};
pub use orchestrator::NutritionistService;
pub use parser::{
    clean_markdown_code_blocks, extract_numbers, fallback_parse_response,
    parse_structured_response, validate_indices, FALLBACK_MAX_SELECTED, MAX_SELECTED,
};
pub use prompt::{build_menu_description, SYSTEM_PROMPT, TEMPERATURE};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GenerationError {
    #[error("generation backend is not configured: {0}")]
    NotConfigured(String),
    #[error("generation request failed: {0}")]
    Transport(String),
    #[error("generation backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("repository error: {message}")]
pub struct RepositoryError {
    message: String,
}

impl RepositoryError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Persisting a freshly computed recommendation failed. Never surfaced to
/// callers of [`NutritionistService::get_nutritionist_selection`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("failed to persist nutritionist selection for {date}: {source}")]
pub struct CacheWriteError {
    pub date: String,
    pub source: RepositoryError,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SelectionError {
    #[error("no menu items available")]
    NoMenuItems,
    #[error("no menu items available for this user (all items are out of stock)")]
    NoAvailableItems,
    #[error("LLM call failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("could not extract valid indices from LLM response")]
    Parsing,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MenuItemId(pub i64);

impl Display for MenuItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EmployeeId(pub i64);

impl Display for EmployeeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct OrderId(pub i64);

impl Display for OrderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MenuItem {
    pub id: MenuItemId,
    pub name: String,
    /// Price in minor currency units (rupiah).
    pub price_minor_units: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NutritionalSummary {
    #[serde(default, deserialize_with = "null_as_default")]
    pub protein: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub vegetables: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub carbohydrates: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub overall_rating: String,
}

impl NutritionalSummary {
    /// Summary attached to selections recovered by the heuristic parser.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            protein: "balanced".to_string(),
            vegetables: "adequate".to_string(),
            carbohydrates: "balanced".to_string(),
            overall_rating: "good".to_string(),
        }
    }

    /// Summary used when a cached summary can no longer be decoded.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            protein: "unknown".to_string(),
            vegetables: "unknown".to_string(),
            carbohydrates: "unknown".to_string(),
            overall_rating: "balanced".to_string(),
        }
    }
}

/// A menu selection. Indices are always relative to some ordered item list;
/// which one depends on where the value came from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NutritionistResponse {
    #[serde(rename = "selected_menu_items", default, deserialize_with = "null_as_default")]
    pub selected_indices: Vec<usize>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reasoning: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub nutritional_summary: NutritionalSummary,
}

impl NutritionistResponse {
    /// Item ids named by this response when read against `items`.
    /// Out-of-range indices are skipped.
    #[must_use]
    pub fn selected_item_ids(&self, items: &[MenuItem]) -> Vec<MenuItemId> {
        self.selected_indices.iter().filter_map(|index| items.get(*index)).map(|item| item.id).collect()
    }
}

/// The persisted per-date recommendation.
///
/// `selected_indices` index `menu_item_ids`, the full canonical menu as it was
/// when the selection was computed. `nutritional_summary` is kept as the raw
/// JSON text it was stored with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SelectionCacheEntry {
    pub date: Date,
    pub menu_item_ids: Vec<MenuItemId>,
    pub selected_indices: Vec<usize>,
    pub reasoning: String,
    pub nutritional_summary: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserSelection {
    pub employee_id: EmployeeId,
    #[serde(with = "date_serde")]
    pub date: Date,
    pub order_id: Option<OrderId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Text-generation backend.
pub trait GenerationClient {
    /// Send one system instruction plus one user prompt and return the raw text.
    ///
    /// # Errors
    /// Returns [`GenerationError`] when the backend is unreachable, times out,
    /// rejects the request, or answers with an undecodable body.
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: &str,
    ) -> Result<String, GenerationError>;
}

/// Narrow persistence contract consumed by the recommendation engine.
///
/// # Errors
/// Every method returns [`RepositoryError`] when the backing store fails.
pub trait NutritionistRepository {
    /// Full canonical menu for `date`, in canonical order.
    fn daily_menu_items(&self, date: Date) -> Result<Vec<MenuItem>, RepositoryError>;

    fn stock_empty_item_ids(
        &self,
        employee_id: EmployeeId,
        date: Date,
    ) -> Result<Vec<MenuItemId>, RepositoryError>;

    fn reset_flag(&self, date: Date) -> Result<bool, RepositoryError>;

    fn set_reset_flag(&self, date: Date, value: bool) -> Result<(), RepositoryError>;

    fn selection_by_date(&self, date: Date) -> Result<Option<SelectionCacheEntry>, RepositoryError>;

    /// Persist `entry`, replacing whatever is stored for its date.
    fn save_selection(&self, entry: &SelectionCacheEntry) -> Result<(), RepositoryError>;

    fn delete_selection(&self, date: Date) -> Result<(), RepositoryError>;

    /// Idempotent per `(employee_id, date)`.
    fn track_user_selection(
        &self,
        employee_id: EmployeeId,
        date: Date,
        order_id: Option<OrderId>,
    ) -> Result<UserSelection, RepositoryError>;

    /// Tracked selections for `date` whose order exists and is unpaid.
    fn users_needing_notification(&self, date: Date) -> Result<Vec<UserSelection>, RepositoryError>;
}

#[must_use]
pub fn format_date(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Parse a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns the underlying parse error when `value` is not a valid date.
pub fn parse_date(value: &str) -> Result<Date, time::error::Parse> {
    Date::parse(value, time::macros::format_description!("[year]-[month]-[day]"))
}

/// Model output sometimes spells an absent field as `null`; read it as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod date_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}
