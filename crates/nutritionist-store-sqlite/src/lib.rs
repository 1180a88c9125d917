use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nutritionist_core::{
    format_date, parse_date, EmployeeId, MenuItem, MenuItemId, NutritionistRepository, OrderId,
    RepositoryError, SelectionCacheEntry, UserSelection,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::info;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS menu_items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  price INTEGER NOT NULL CHECK (price >= 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_menus (
  date TEXT PRIMARY KEY,
  menu_item_ids_json TEXT NOT NULL,
  nutritionist_reset INTEGER NOT NULL DEFAULT 0 CHECK (nutritionist_reset IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stock_empty_items (
  employee_id INTEGER NOT NULL,
  date TEXT NOT NULL,
  menu_item_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (employee_id, date, menu_item_id),
  FOREIGN KEY (menu_item_id) REFERENCES menu_items(id)
);

CREATE TABLE IF NOT EXISTS orders (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  employee_id INTEGER NOT NULL,
  date TEXT NOT NULL,
  paid INTEGER NOT NULL DEFAULT 0 CHECK (paid IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nutritionist_selections (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  date TEXT NOT NULL UNIQUE,
  menu_item_ids_json TEXT NOT NULL,
  selected_indices_json TEXT NOT NULL,
  reasoning TEXT NOT NULL,
  nutritional_summary TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nutritionist_user_selections (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  employee_id INTEGER NOT NULL,
  date TEXT NOT NULL,
  order_id INTEGER,
  created_at TEXT NOT NULL,
  UNIQUE(employee_id, date),
  FOREIGN KEY (order_id) REFERENCES orders(id)
);

CREATE INDEX IF NOT EXISTS idx_stock_empty_items_date ON stock_empty_items(date);
CREATE INDEX IF NOT EXISTS idx_orders_date ON orders(date);
CREATE INDEX IF NOT EXISTS idx_nutritionist_user_selections_date ON nutritionist_user_selections(date);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

struct SelectionRow {
    date: String,
    menu_item_ids_json: String,
    selected_indices_json: String,
    reasoning: String,
    nutritional_summary: String,
    created_at: String,
}

type UserSelectionRow = (i64, String, Option<i64>, String);

impl SqliteStore {
    /// Open a SQLite-backed nutritionist store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to create v1 tables")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Register a dish that daily menus can reference.
    ///
    /// # Errors
    /// Returns an error when the name is blank, the price is negative, or the insert fails.
    pub fn add_menu_item(&self, name: &str, price_minor_units: i64) -> Result<MenuItem> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("menu item name MUST NOT be empty"));
        }
        if price_minor_units < 0 {
            return Err(anyhow!("menu item price MUST NOT be negative"));
        }

        self.conn
            .execute(
                "INSERT INTO menu_items(name, price, created_at) VALUES (?1, ?2, ?3)",
                params![name, price_minor_units, now_rfc3339()?],
            )
            .context("failed to insert menu item")?;

        Ok(MenuItem {
            id: MenuItemId(self.conn.last_insert_rowid()),
            name: name.to_string(),
            price_minor_units,
        })
    }

    /// All registered dishes ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_menu_items(&self) -> Result<Vec<MenuItem>> {
        let mut stmt = self.conn.prepare("SELECT id, name, price FROM menu_items ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(MenuItem {
                id: MenuItemId(row.get(0)?),
                name: row.get(1)?,
                price_minor_units: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read menu items")
    }

    /// Set the canonical menu for `date`.
    ///
    /// Replacing an existing menu with a different item list arms the
    /// nutritionist reset flag so the next recommendation drops the stale
    /// cache entry. Returns whether the flag was armed.
    ///
    /// # Errors
    /// Returns an error when `menu_item_ids` is empty, repeats an id, names an
    /// unknown item, or the write fails.
    pub fn set_daily_menu(&mut self, date: Date, menu_item_ids: &[MenuItemId]) -> Result<bool> {
        if menu_item_ids.is_empty() {
            return Err(anyhow!("daily menu MUST contain at least one item"));
        }
        if menu_item_ids.iter().collect::<BTreeSet<_>>().len() != menu_item_ids.len() {
            return Err(anyhow!("daily menu MUST NOT repeat a menu item"));
        }

        let date_key = format_date(date);
        let ids_json =
            serde_json::to_string(menu_item_ids).context("failed to serialize daily menu ids")?;
        let tx = self.conn.transaction().context("failed to start transaction")?;

        for id in menu_item_ids {
            let exists = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM menu_items WHERE id = ?1)",
                    params![id.0],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to check menu item")?;
            if exists != 1 {
                return Err(anyhow!("unknown menu item {id}"));
            }
        }

        let existing = tx
            .query_row(
                "SELECT menu_item_ids_json FROM daily_menus WHERE date = ?1",
                params![date_key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read daily menu")?;

        let reset_armed = match existing {
            None => {
                tx.execute(
                    "INSERT INTO daily_menus(date, menu_item_ids_json, nutritionist_reset, updated_at)
                     VALUES (?1, ?2, 0, ?3)",
                    params![date_key, ids_json, now_rfc3339()?],
                )
                .context("failed to insert daily menu")?;
                false
            }
            Some(stored) => {
                let stored_ids: Vec<MenuItemId> = serde_json::from_str(&stored)
                    .context("failed to deserialize stored daily menu ids")?;
                if stored_ids == menu_item_ids {
                    false
                } else {
                    tx.execute(
                        "UPDATE daily_menus
                         SET menu_item_ids_json = ?2, nutritionist_reset = 1, updated_at = ?3
                         WHERE date = ?1",
                        params![date_key, ids_json, now_rfc3339()?],
                    )
                    .context("failed to update daily menu")?;
                    true
                }
            }
        };

        tx.commit().context("failed to commit daily menu transaction")?;
        if reset_armed {
            info!(date = %date_key, items = menu_item_ids.len(), "daily menu changed, nutritionist reset armed");
        }
        Ok(reset_armed)
    }

    /// The canonical menu for `date` in stored order; empty when no menu is set.
    ///
    /// # Errors
    /// Returns an error when the menu cannot be read or references a missing item.
    pub fn load_daily_menu(&self, date: Date) -> Result<Vec<MenuItem>> {
        let date_key = format_date(date);
        let Some(ids_json) = self
            .conn
            .query_row(
                "SELECT menu_item_ids_json FROM daily_menus WHERE date = ?1",
                params![date_key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read daily menu")?
        else {
            return Ok(Vec::new());
        };
        let ids: Vec<MenuItemId> =
            serde_json::from_str(&ids_json).context("failed to deserialize daily menu ids")?;

        let mut stmt = self.conn.prepare("SELECT name, price FROM menu_items WHERE id = ?1")?;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let (name, price_minor_units) = stmt
                .query_row(params![id.0], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .optional()?
                .ok_or_else(|| anyhow!("daily menu for {date_key} references missing menu item {id}"))?;
            items.push(MenuItem { id, name, price_minor_units });
        }
        Ok(items)
    }

    /// Record that `menu_item_id` ran out for `employee_id` on `date`.
    ///
    /// # Errors
    /// Returns an error when the item is unknown or the write fails.
    pub fn mark_stock_empty(
        &self,
        employee_id: EmployeeId,
        date: Date,
        menu_item_id: MenuItemId,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO stock_empty_items(employee_id, date, menu_item_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![employee_id.0, format_date(date), menu_item_id.0, now_rfc3339()?],
            )
            .with_context(|| format!("failed to mark menu item {menu_item_id} stock empty"))?;
        Ok(())
    }

    /// Returns whether a mark was removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn unmark_stock_empty(
        &self,
        employee_id: EmployeeId,
        date: Date,
        menu_item_id: MenuItemId,
    ) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM stock_empty_items
                 WHERE employee_id = ?1 AND date = ?2 AND menu_item_id = ?3",
                params![employee_id.0, format_date(date), menu_item_id.0],
            )
            .context("failed to unmark stock empty item")?;
        Ok(removed > 0)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn stock_empty_items_for(&self, employee_id: EmployeeId, date: Date) -> Result<Vec<MenuItemId>> {
        let mut stmt = self.conn.prepare(
            "SELECT menu_item_id FROM stock_empty_items
             WHERE employee_id = ?1 AND date = ?2
             ORDER BY menu_item_id ASC",
        )?;
        let rows = stmt.query_map(params![employee_id.0, format_date(date)], |row| {
            Ok(MenuItemId(row.get(0)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read stock empty items")
    }

    /// Open an unpaid order for `employee_id` on `date`.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn record_order(&self, employee_id: EmployeeId, date: Date) -> Result<OrderId> {
        self.conn
            .execute(
                "INSERT INTO orders(employee_id, date, paid, created_at) VALUES (?1, ?2, 0, ?3)",
                params![employee_id.0, format_date(date), now_rfc3339()?],
            )
            .context("failed to insert order")?;
        Ok(OrderId(self.conn.last_insert_rowid()))
    }

    /// # Errors
    /// Returns an error when the order does not exist or the update fails.
    pub fn mark_order_paid(&self, order_id: OrderId) -> Result<()> {
        let updated = self
            .conn
            .execute("UPDATE orders SET paid = 1 WHERE id = ?1", params![order_id.0])
            .context("failed to mark order paid")?;
        if updated == 0 {
            return Err(anyhow!("order {order_id} not found"));
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the flag cannot be read.
    pub fn read_reset_flag(&self, date: Date) -> Result<bool> {
        let flag = self
            .conn
            .query_row(
                "SELECT nutritionist_reset FROM daily_menus WHERE date = ?1",
                params![format_date(date)],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .context("failed to read nutritionist reset flag")?;
        Ok(flag.unwrap_or(false))
    }

    /// No-op when `date` has no daily menu.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn write_reset_flag(&self, date: Date, value: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE daily_menus SET nutritionist_reset = ?2 WHERE date = ?1",
                params![format_date(date), value],
            )
            .context("failed to write nutritionist reset flag")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn load_selection(&self, date: Date) -> Result<Option<SelectionCacheEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT date, menu_item_ids_json, selected_indices_json, reasoning,
                        nutritional_summary, created_at
                 FROM nutritionist_selections WHERE date = ?1",
                params![format_date(date)],
                |row| {
                    Ok(SelectionRow {
                        date: row.get(0)?,
                        menu_item_ids_json: row.get(1)?,
                        selected_indices_json: row.get(2)?,
                        reasoning: row.get(3)?,
                        nutritional_summary: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("failed to read nutritionist selection")?;

        row.map(selection_from_row).transpose()
    }

    /// Insert or replace the cache row for `entry.date`.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn store_selection(&self, entry: &SelectionCacheEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO nutritionist_selections(
                    date, menu_item_ids_json, selected_indices_json, reasoning,
                    nutritional_summary, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(date) DO UPDATE SET
                    menu_item_ids_json = excluded.menu_item_ids_json,
                    selected_indices_json = excluded.selected_indices_json,
                    reasoning = excluded.reasoning,
                    nutritional_summary = excluded.nutritional_summary,
                    created_at = excluded.created_at",
                params![
                    format_date(entry.date),
                    serde_json::to_string(&entry.menu_item_ids)
                        .context("failed to serialize menu item ids")?,
                    serde_json::to_string(&entry.selected_indices)
                        .context("failed to serialize selected indices")?,
                    entry.reasoning,
                    entry.nutritional_summary,
                    rfc3339(entry.created_at)?,
                ],
            )
            .context("failed to save nutritionist selection")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove_selection(&self, date: Date) -> Result<()> {
        self.conn
            .execute("DELETE FROM nutritionist_selections WHERE date = ?1", params![format_date(date)])
            .context("failed to delete nutritionist selection")?;
        Ok(())
    }

    /// Track `employee_id` for `date`. A repeat call attaches `order_id` when
    /// none was recorded yet and otherwise leaves the row as it was.
    ///
    /// # Errors
    /// Returns an error when the order is unknown or the write fails.
    pub fn upsert_user_selection(
        &self,
        employee_id: EmployeeId,
        date: Date,
        order_id: Option<OrderId>,
    ) -> Result<UserSelection> {
        let date_key = format_date(date);
        self.conn
            .execute(
                "INSERT INTO nutritionist_user_selections(employee_id, date, order_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(employee_id, date) DO UPDATE SET
                    order_id = COALESCE(nutritionist_user_selections.order_id, excluded.order_id)",
                params![employee_id.0, date_key, order_id.map(|id| id.0), now_rfc3339()?],
            )
            .context("failed to track nutritionist user selection")?;

        let row: UserSelectionRow = self
            .conn
            .query_row(
                "SELECT employee_id, date, order_id, created_at
                 FROM nutritionist_user_selections
                 WHERE employee_id = ?1 AND date = ?2",
                params![employee_id.0, date_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .context("failed to read tracked nutritionist user selection")?;
        user_selection_from_row(row)
    }

    /// Tracked selections on `date` linked to an order that is still unpaid.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn unpaid_user_selections(&self, date: Date) -> Result<Vec<UserSelection>> {
        let mut stmt = self.conn.prepare(
            "SELECT nus.employee_id, nus.date, nus.order_id, nus.created_at
             FROM nutritionist_user_selections nus
             JOIN orders o ON nus.order_id = o.id
             WHERE nus.date = ?1 AND o.paid = 0
             ORDER BY nus.employee_id ASC",
        )?;
        let rows = stmt
            .query_map(params![format_date(date)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<UserSelectionRow>>>()
            .context("failed to read nutritionist user selections")?;
        rows.into_iter().map(user_selection_from_row).collect()
    }
}

impl NutritionistRepository for SqliteStore {
    fn daily_menu_items(&self, date: Date) -> Result<Vec<MenuItem>, RepositoryError> {
        self.load_daily_menu(date).map_err(|err| repository_error(&err))
    }

    fn stock_empty_item_ids(
        &self,
        employee_id: EmployeeId,
        date: Date,
    ) -> Result<Vec<MenuItemId>, RepositoryError> {
        self.stock_empty_items_for(employee_id, date).map_err(|err| repository_error(&err))
    }

    fn reset_flag(&self, date: Date) -> Result<bool, RepositoryError> {
        self.read_reset_flag(date).map_err(|err| repository_error(&err))
    }

    fn set_reset_flag(&self, date: Date, value: bool) -> Result<(), RepositoryError> {
        self.write_reset_flag(date, value).map_err(|err| repository_error(&err))
    }

    fn selection_by_date(&self, date: Date) -> Result<Option<SelectionCacheEntry>, RepositoryError> {
        self.load_selection(date).map_err(|err| repository_error(&err))
    }

    fn save_selection(&self, entry: &SelectionCacheEntry) -> Result<(), RepositoryError> {
        self.store_selection(entry).map_err(|err| repository_error(&err))
    }

    fn delete_selection(&self, date: Date) -> Result<(), RepositoryError> {
        self.remove_selection(date).map_err(|err| repository_error(&err))
    }

    fn track_user_selection(
        &self,
        employee_id: EmployeeId,
        date: Date,
        order_id: Option<OrderId>,
    ) -> Result<UserSelection, RepositoryError> {
        self.upsert_user_selection(employee_id, date, order_id).map_err(|err| repository_error(&err))
    }

    fn users_needing_notification(&self, date: Date) -> Result<Vec<UserSelection>, RepositoryError> {
        self.unpaid_user_selections(date).map_err(|err| repository_error(&err))
    }
}

fn repository_error(err: &anyhow::Error) -> RepositoryError {
    RepositoryError::new(format!("{err:#}"))
}

fn selection_from_row(row: SelectionRow) -> Result<SelectionCacheEntry> {
    Ok(SelectionCacheEntry {
        date: parse_stored_date(&row.date)?,
        menu_item_ids: serde_json::from_str(&row.menu_item_ids_json)
            .context("failed to deserialize cached menu item ids")?,
        selected_indices: serde_json::from_str(&row.selected_indices_json)
            .context("failed to deserialize cached selected indices")?,
        reasoning: row.reasoning,
        nutritional_summary: row.nutritional_summary,
        created_at: parse_rfc3339(&row.created_at)?,
    })
}

fn user_selection_from_row(row: UserSelectionRow) -> Result<UserSelection> {
    let (employee_id, date, order_id, created_at) = row;
    Ok(UserSelection {
        employee_id: EmployeeId(employee_id),
        date: parse_stored_date(&date)?,
        order_id: order_id.map(OrderId),
        created_at: parse_rfc3339(&created_at)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_stored_date(value: &str) -> Result<Date> {
    parse_date(value).with_context(|| format!("invalid stored date: {value}"))
}
