//! Persistence layer.
//!
//! A thin sqlx/SQLite store with one table per entity and a versioned
//! migration runner. The store is the single source of truth; the in-memory
//! caches in [`crate::services`] are populated from it at startup and write
//! through (or flush dirty sets) back into it.

pub mod entities;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{info, warn};

use crate::core::error::Result;
use entities::*;

/// Database handle. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

// ============================================================================
// Migrations
// ============================================================================

const MIGRATION_STATUS_SUCCESS: i64 = 1;
const MIGRATION_STATUS_FAILED: i64 = 2;

/// One schema migration: SQL run before the schema statements (data fixups),
/// the schema statements themselves, and SQL run after.
struct Migration {
    version: i64,
    before_schema: &'static [&'static str],
    statements: &'static [&'static str],
    after_schema: &'static [&'static str],
}

const SCHEMA_V1: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        kind INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        base_urls TEXT NOT NULL DEFAULT '[]',
        model TEXT NOT NULL DEFAULT '',
        custom_model TEXT NOT NULL DEFAULT '',
        proxy INTEGER NOT NULL DEFAULT 0,
        auto_sync INTEGER NOT NULL DEFAULT 0,
        auto_group INTEGER NOT NULL DEFAULT 0,
        custom_header TEXT NOT NULL DEFAULT '[]',
        param_override TEXT,
        channel_proxy TEXT,
        match_regex TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel_id INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        channel_key TEXT NOT NULL DEFAULT '',
        status_code INTEGER NOT NULL DEFAULT 0,
        last_use_time_stamp INTEGER NOT NULL DEFAULT 0,
        total_cost REAL NOT NULL DEFAULT 0,
        remark TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "groups" (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        mode INTEGER NOT NULL,
        match_regex TEXT NOT NULL DEFAULT '',
        first_token_time_out INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS group_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        model_name TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        weight INTEGER NOT NULL DEFAULT 0,
        UNIQUE(group_id, channel_id, model_name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS api_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        api_key TEXT NOT NULL UNIQUE,
        enabled INTEGER NOT NULL DEFAULT 1,
        expire_at INTEGER NOT NULL DEFAULT 0,
        max_cost REAL NOT NULL DEFAULT 0,
        supported_models TEXT NOT NULL DEFAULT '',
        auto_reset_quota INTEGER NOT NULL DEFAULT 0,
        reset_duration INTEGER NOT NULL DEFAULT 0,
        reset_unit TEXT NOT NULL DEFAULT 'minute',
        next_reset_time INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS llm_infos (
        name TEXT PRIMARY KEY,
        billing TEXT NOT NULL DEFAULT 'token',
        input REAL NOT NULL DEFAULT 0,
        output REAL NOT NULL DEFAULT 0,
        cache_read REAL NOT NULL DEFAULT 0,
        cache_write REAL NOT NULL DEFAULT 0,
        request REAL NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stats_total (
        id INTEGER PRIMARY KEY,
        input_token INTEGER NOT NULL DEFAULT 0,
        output_token INTEGER NOT NULL DEFAULT 0,
        input_cost REAL NOT NULL DEFAULT 0,
        output_cost REAL NOT NULL DEFAULT 0,
        wait_time INTEGER NOT NULL DEFAULT 0,
        request_success INTEGER NOT NULL DEFAULT 0,
        request_failed INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stats_hourly (
        hour INTEGER PRIMARY KEY,
        date TEXT NOT NULL,
        input_token INTEGER NOT NULL DEFAULT 0,
        output_token INTEGER NOT NULL DEFAULT 0,
        input_cost REAL NOT NULL DEFAULT 0,
        output_cost REAL NOT NULL DEFAULT 0,
        wait_time INTEGER NOT NULL DEFAULT 0,
        request_success INTEGER NOT NULL DEFAULT 0,
        request_failed INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stats_daily (
        date TEXT PRIMARY KEY,
        input_token INTEGER NOT NULL DEFAULT 0,
        output_token INTEGER NOT NULL DEFAULT 0,
        input_cost REAL NOT NULL DEFAULT 0,
        output_cost REAL NOT NULL DEFAULT 0,
        wait_time INTEGER NOT NULL DEFAULT 0,
        request_success INTEGER NOT NULL DEFAULT 0,
        request_failed INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stats_channel (
        channel_id INTEGER PRIMARY KEY,
        input_token INTEGER NOT NULL DEFAULT 0,
        output_token INTEGER NOT NULL DEFAULT 0,
        input_cost REAL NOT NULL DEFAULT 0,
        output_cost REAL NOT NULL DEFAULT 0,
        wait_time INTEGER NOT NULL DEFAULT 0,
        request_success INTEGER NOT NULL DEFAULT 0,
        request_failed INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stats_model (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        channel_id INTEGER NOT NULL,
        input_token INTEGER NOT NULL DEFAULT 0,
        output_token INTEGER NOT NULL DEFAULT 0,
        input_cost REAL NOT NULL DEFAULT 0,
        output_cost REAL NOT NULL DEFAULT 0,
        wait_time INTEGER NOT NULL DEFAULT 0,
        request_success INTEGER NOT NULL DEFAULT 0,
        request_failed INTEGER NOT NULL DEFAULT 0,
        UNIQUE(name, channel_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stats_api_key (
        api_key_id INTEGER PRIMARY KEY,
        input_token INTEGER NOT NULL DEFAULT 0,
        output_token INTEGER NOT NULL DEFAULT 0,
        input_cost REAL NOT NULL DEFAULT 0,
        output_cost REAL NOT NULL DEFAULT 0,
        wait_time INTEGER NOT NULL DEFAULT 0,
        request_success INTEGER NOT NULL DEFAULT 0,
        request_failed INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS relay_logs (
        id INTEGER PRIMARY KEY,
        time INTEGER NOT NULL,
        request_model_name TEXT NOT NULL DEFAULT '',
        channel_id INTEGER NOT NULL DEFAULT 0,
        channel_name TEXT NOT NULL DEFAULT '',
        actual_model_name TEXT NOT NULL DEFAULT '',
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        ftut INTEGER NOT NULL DEFAULT 0,
        use_time INTEGER NOT NULL DEFAULT 0,
        cost REAL NOT NULL DEFAULT 0,
        request_content TEXT NOT NULL DEFAULT '',
        response_content TEXT NOT NULL DEFAULT '',
        error TEXT NOT NULL DEFAULT '',
        attempts TEXT NOT NULL DEFAULT '[]',
        total_attempts INTEGER NOT NULL DEFAULT 0,
        successful_round INTEGER NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_channel_keys_channel ON channel_keys(channel_id)",
    "CREATE INDEX IF NOT EXISTS idx_group_items_group ON group_items(group_id)",
    "CREATE INDEX IF NOT EXISTS idx_relay_logs_time ON relay_logs(time)",
];

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    before_schema: &[],
    statements: SCHEMA_V1,
    after_schema: &[],
}];

impl Store {
    /// Open (creating if missing) the database and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run migrations in version order, skipping recorded successes.
    /// Re-running the full set is a no-op.
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS migration_records (
                version INTEGER PRIMARY KEY,
                status INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        let mut ordered: Vec<&Migration> = MIGRATIONS.iter().collect();
        ordered.sort_by_key(|m| m.version);

        for migration in ordered {
            let recorded: Option<i64> = sqlx::query_scalar(
                "SELECT status FROM migration_records WHERE version = ?",
            )
            .bind(migration.version)
            .fetch_optional(&self.pool)
            .await?;

            if recorded == Some(MIGRATION_STATUS_SUCCESS) {
                continue;
            }

            info!("running migration {}", migration.version);
            let mut failed = false;
            for phase in [
                migration.before_schema,
                migration.statements,
                migration.after_schema,
            ] {
                for stmt in phase {
                    if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                        warn!("migration {} failed: {e}", migration.version);
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }

            let status = if failed {
                MIGRATION_STATUS_FAILED
            } else {
                MIGRATION_STATUS_SUCCESS
            };
            sqlx::query(
                "INSERT INTO migration_records (version, status) VALUES (?, ?)
                 ON CONFLICT(version) DO UPDATE SET status = excluded.status",
            )
            .bind(migration.version)
            .bind(status)
            .execute(&self.pool)
            .await?;

            if failed {
                return Err(crate::core::AppError::Internal(format!(
                    "migration {} failed",
                    migration.version
                )));
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Settings
// ============================================================================

impl Store {
    pub async fn list_settings(&self) -> Result<Vec<Setting>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Setting {
                key: r.get("key"),
                value: r.get("value"),
            })
            .collect())
    }

    pub async fn insert_settings(&self, settings: &[Setting]) -> Result<()> {
        for setting in settings {
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
                .bind(&setting.key)
                .bind(&setting.value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn update_setting(&self, key: &str, value: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(value)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Channels
// ============================================================================

fn channel_from_row(row: &SqliteRow) -> Channel {
    let base_urls: String = row.get("base_urls");
    let custom_header: String = row.get("custom_header");
    Channel {
        id: row.get("id"),
        name: row.get("name"),
        kind: ProviderKind::try_from(row.get::<i64, _>("kind"))
            .unwrap_or(ProviderKind::OpenAiChat),
        enabled: row.get::<i64, _>("enabled") != 0,
        base_urls: serde_json::from_str(&base_urls).unwrap_or_default(),
        keys: Vec::new(),
        model: row.get("model"),
        custom_model: row.get("custom_model"),
        proxy: row.get::<i64, _>("proxy") != 0,
        auto_sync: row.get::<i64, _>("auto_sync") != 0,
        auto_group: AutoGroupPolicy::try_from(row.get::<i64, _>("auto_group"))
            .unwrap_or_default(),
        custom_header: serde_json::from_str(&custom_header).unwrap_or_default(),
        param_override: row.get("param_override"),
        channel_proxy: row.get("channel_proxy"),
        match_regex: row.get("match_regex"),
    }
}

fn channel_key_from_row(row: &SqliteRow) -> ChannelKey {
    ChannelKey {
        id: row.get("id"),
        channel_id: row.get("channel_id"),
        enabled: row.get::<i64, _>("enabled") != 0,
        key: row.get("channel_key"),
        status_code: row.get("status_code"),
        last_use_time_stamp: row.get("last_use_time_stamp"),
        total_cost: row.get("total_cost"),
        remark: row.get("remark"),
    }
}

impl Store {
    /// Load every channel with its keys preloaded.
    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query("SELECT * FROM channels")
            .fetch_all(&self.pool)
            .await?;
        let mut channels: Vec<Channel> = rows.iter().map(channel_from_row).collect();

        let key_rows = sqlx::query("SELECT * FROM channel_keys")
            .fetch_all(&self.pool)
            .await?;
        for row in &key_rows {
            let key = channel_key_from_row(row);
            if let Some(channel) = channels.iter_mut().find(|c| c.id == key.channel_id) {
                channel.keys.push(key);
            }
        }
        Ok(channels)
    }

    /// Load one channel with its keys preloaded.
    pub async fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut channel = channel_from_row(&row);

        let key_rows = sqlx::query("SELECT * FROM channel_keys WHERE channel_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        channel.keys = key_rows.iter().map(channel_key_from_row).collect();
        Ok(Some(channel))
    }

    /// Persist a channel's synced model list.
    pub async fn update_channel_models(&self, id: i64, model: &str) -> Result<()> {
        sqlx::query("UPDATE channels SET model = ? WHERE id = ?")
            .bind(model)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flush a runtime-updated key row (hot fields included) back to the DB.
    /// The secret is written as-is; partial updates that omit it never reach
    /// this path.
    pub async fn save_channel_key(&self, key: &ChannelKey) -> Result<()> {
        sqlx::query(
            "UPDATE channel_keys SET enabled = ?, channel_key = ?, status_code = ?,
             last_use_time_stamp = ?, total_cost = ?, remark = ? WHERE id = ?",
        )
        .bind(key.enabled as i64)
        .bind(&key.key)
        .bind(key.status_code)
        .bind(key.last_use_time_stamp)
        .bind(key.total_cost)
        .bind(&key.remark)
        .bind(key.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a channel and cascade: its group items, its keys, its stats
    /// row. Returns the ids of groups that referenced it.
    pub async fn delete_channel(&self, id: i64) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;

        let affected: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT group_id FROM group_items WHERE channel_id = ?")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM group_items WHERE channel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM channel_keys WHERE channel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM stats_channel WHERE channel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(affected)
    }
}

// ============================================================================
// Groups
// ============================================================================

fn group_from_row(row: &SqliteRow) -> Group {
    Group {
        id: row.get("id"),
        name: row.get("name"),
        mode: GroupMode::try_from(row.get::<i64, _>("mode")).unwrap_or(GroupMode::RoundRobin),
        match_regex: row.get("match_regex"),
        first_token_time_out: row.get("first_token_time_out"),
        items: Vec::new(),
    }
}

fn group_item_from_row(row: &SqliteRow) -> GroupItem {
    GroupItem {
        id: row.get("id"),
        group_id: row.get("group_id"),
        channel_id: row.get("channel_id"),
        model_name: row.get("model_name"),
        priority: row.get("priority"),
        weight: row.get("weight"),
    }
}

impl Store {
    /// Load every group with its items preloaded.
    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query(r#"SELECT * FROM "groups""#)
            .fetch_all(&self.pool)
            .await?;
        let mut groups: Vec<Group> = rows.iter().map(group_from_row).collect();

        let item_rows = sqlx::query("SELECT * FROM group_items ORDER BY priority ASC")
            .fetch_all(&self.pool)
            .await?;
        for row in &item_rows {
            let item = group_item_from_row(row);
            if let Some(group) = groups.iter_mut().find(|g| g.id == item.group_id) {
                group.items.push(item);
            }
        }
        Ok(groups)
    }

    /// Load one group with its items preloaded.
    pub async fn get_group(&self, id: i64) -> Result<Option<Group>> {
        let row = sqlx::query(r#"SELECT * FROM "groups" WHERE id = ?"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut group = group_from_row(&row);

        let item_rows =
            sqlx::query("SELECT * FROM group_items WHERE group_id = ? ORDER BY priority ASC")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        group.items = item_rows.iter().map(group_item_from_row).collect();
        Ok(Some(group))
    }

    /// Batch-insert items with insert-or-ignore semantics on the
    /// (group, channel, model) unique index.
    pub async fn insert_group_items(&self, items: &[GroupItem]) -> Result<()> {
        for item in items {
            sqlx::query(
                "INSERT OR IGNORE INTO group_items
                 (group_id, channel_id, model_name, priority, weight)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(item.group_id)
            .bind(item.channel_id)
            .bind(&item.model_name)
            .bind(item.priority)
            .bind(item.weight)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Delete items matching any of the given (channel, model) pairs across
    /// all groups. Returns the affected group ids.
    pub async fn delete_group_items_by_channel_models(
        &self,
        pairs: &[(i64, String)],
    ) -> Result<Vec<i64>> {
        let mut affected = std::collections::HashSet::new();
        for (channel_id, model_name) in pairs {
            let ids: Vec<i64> = sqlx::query_scalar(
                "SELECT DISTINCT group_id FROM group_items WHERE channel_id = ? AND model_name = ?",
            )
            .bind(channel_id)
            .bind(model_name)
            .fetch_all(&self.pool)
            .await?;
            affected.extend(ids);

            sqlx::query("DELETE FROM group_items WHERE channel_id = ? AND model_name = ?")
                .bind(channel_id)
                .bind(model_name)
                .execute(&self.pool)
                .await?;
        }
        Ok(affected.into_iter().collect())
    }
}

// ============================================================================
// API keys
// ============================================================================

fn api_key_from_row(row: &SqliteRow) -> ApiKey {
    ApiKey {
        id: row.get("id"),
        name: row.get("name"),
        api_key: row.get("api_key"),
        enabled: row.get::<i64, _>("enabled") != 0,
        expire_at: row.get("expire_at"),
        max_cost: row.get("max_cost"),
        supported_models: row.get("supported_models"),
        auto_reset_quota: row.get::<i64, _>("auto_reset_quota") != 0,
        reset_duration: row.get("reset_duration"),
        reset_unit: row.get("reset_unit"),
        next_reset_time: row.get("next_reset_time"),
    }
}

impl Store {
    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(api_key_from_row).collect())
    }

    /// Save an API key row. The secret column is deliberately not written:
    /// updates never overwrite it.
    pub async fn update_api_key(&self, key: &ApiKey) -> Result<()> {
        sqlx::query(
            "UPDATE api_keys SET name = ?, enabled = ?, expire_at = ?, max_cost = ?,
             supported_models = ?, auto_reset_quota = ?, reset_duration = ?,
             reset_unit = ?, next_reset_time = ? WHERE id = ?",
        )
        .bind(&key.name)
        .bind(key.enabled as i64)
        .bind(key.expire_at)
        .bind(key.max_cost)
        .bind(&key.supported_models)
        .bind(key.auto_reset_quota as i64)
        .bind(key.reset_duration)
        .bind(&key.reset_unit)
        .bind(key.next_reset_time)
        .bind(key.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// LLM prices
// ============================================================================

fn llm_info_from_row(row: &SqliteRow) -> LlmInfo {
    LlmInfo {
        name: row.get("name"),
        price: LlmPrice {
            billing: row.get("billing"),
            input: row.get("input"),
            output: row.get("output"),
            cache_read: row.get("cache_read"),
            cache_write: row.get("cache_write"),
            request: row.get("request"),
        },
    }
}

impl Store {
    pub async fn list_llm_infos(&self) -> Result<Vec<LlmInfo>> {
        let rows = sqlx::query("SELECT * FROM llm_infos")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(llm_info_from_row).collect())
    }

    pub async fn insert_llm_infos(&self, infos: &[LlmInfo]) -> Result<()> {
        for info in infos {
            sqlx::query(
                "INSERT OR IGNORE INTO llm_infos
                 (name, billing, input, output, cache_read, cache_write, request)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&info.name)
            .bind(&info.price.billing)
            .bind(info.price.input)
            .bind(info.price.output)
            .bind(info.price.cache_read)
            .bind(info.price.cache_write)
            .bind(info.price.request)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_llm_infos(&self, names: &[String]) -> Result<()> {
        for name in names {
            sqlx::query("DELETE FROM llm_infos WHERE name = ?")
                .bind(name)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

// ============================================================================
// Stats
// ============================================================================

fn metrics_from_row(row: &SqliteRow) -> StatsMetrics {
    StatsMetrics {
        input_token: row.get("input_token"),
        output_token: row.get("output_token"),
        input_cost: row.get("input_cost"),
        output_cost: row.get("output_cost"),
        wait_time: row.get("wait_time"),
        request_success: row.get("request_success"),
        request_failed: row.get("request_failed"),
    }
}

macro_rules! upsert_stats {
    ($self:expr, $table:literal, $key_col:literal, $key:expr, $metrics:expr) => {
        sqlx::query(concat!(
            "INSERT INTO ",
            $table,
            " (",
            $key_col,
            ", input_token, output_token, input_cost, output_cost, wait_time,
             request_success, request_failed) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(",
            $key_col,
            ") DO UPDATE SET
             input_token = excluded.input_token,
             output_token = excluded.output_token,
             input_cost = excluded.input_cost,
             output_cost = excluded.output_cost,
             wait_time = excluded.wait_time,
             request_success = excluded.request_success,
             request_failed = excluded.request_failed"
        ))
        .bind($key)
        .bind($metrics.input_token)
        .bind($metrics.output_token)
        .bind($metrics.input_cost)
        .bind($metrics.output_cost)
        .bind($metrics.wait_time)
        .bind($metrics.request_success)
        .bind($metrics.request_failed)
        .execute(&$self.pool)
    };
}

impl Store {
    pub async fn get_stats_total(&self) -> Result<Option<StatsTotal>> {
        let row = sqlx::query("SELECT * FROM stats_total WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StatsTotal {
            id: r.get("id"),
            metrics: metrics_from_row(&r),
        }))
    }

    pub async fn save_stats_total(&self, total: &StatsTotal) -> Result<()> {
        let id = if total.id == 0 { 1 } else { total.id };
        upsert_stats!(self, "stats_total", "id", id, total.metrics).await?;
        Ok(())
    }

    pub async fn get_latest_stats_daily(&self) -> Result<Option<StatsDaily>> {
        let row = sqlx::query("SELECT * FROM stats_daily ORDER BY date DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StatsDaily {
            date: r.get("date"),
            metrics: metrics_from_row(&r),
        }))
    }

    pub async fn save_stats_daily(&self, daily: &StatsDaily) -> Result<()> {
        if daily.date.is_empty() {
            return Ok(());
        }
        upsert_stats!(self, "stats_daily", "date", &daily.date, daily.metrics).await?;
        Ok(())
    }

    pub async fn list_stats_hourly(&self) -> Result<Vec<StatsHourly>> {
        let rows = sqlx::query("SELECT * FROM stats_hourly")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| StatsHourly {
                hour: r.get("hour"),
                date: r.get("date"),
                metrics: metrics_from_row(r),
            })
            .collect())
    }

    pub async fn save_stats_hourly(&self, slots: &[StatsHourly]) -> Result<()> {
        for slot in slots {
            sqlx::query(
                "INSERT INTO stats_hourly
                 (hour, date, input_token, output_token, input_cost, output_cost,
                  wait_time, request_success, request_failed)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(hour) DO UPDATE SET
                 date = excluded.date,
                 input_token = excluded.input_token,
                 output_token = excluded.output_token,
                 input_cost = excluded.input_cost,
                 output_cost = excluded.output_cost,
                 wait_time = excluded.wait_time,
                 request_success = excluded.request_success,
                 request_failed = excluded.request_failed",
            )
            .bind(slot.hour)
            .bind(&slot.date)
            .bind(slot.metrics.input_token)
            .bind(slot.metrics.output_token)
            .bind(slot.metrics.input_cost)
            .bind(slot.metrics.output_cost)
            .bind(slot.metrics.wait_time)
            .bind(slot.metrics.request_success)
            .bind(slot.metrics.request_failed)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn list_stats_channel(&self) -> Result<Vec<StatsChannel>> {
        let rows = sqlx::query("SELECT * FROM stats_channel")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| StatsChannel {
                channel_id: r.get("channel_id"),
                metrics: metrics_from_row(r),
            })
            .collect())
    }

    pub async fn save_stats_channel(&self, stats: &StatsChannel) -> Result<()> {
        upsert_stats!(self, "stats_channel", "channel_id", stats.channel_id, stats.metrics)
            .await?;
        Ok(())
    }

    pub async fn list_stats_model(&self) -> Result<Vec<StatsModel>> {
        let rows = sqlx::query("SELECT * FROM stats_model")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| StatsModel {
                id: r.get("id"),
                name: r.get("name"),
                channel_id: r.get("channel_id"),
                metrics: metrics_from_row(r),
            })
            .collect())
    }

    pub async fn save_stats_model(&self, stats: &StatsModel) -> Result<()> {
        sqlx::query(
            "INSERT INTO stats_model
             (name, channel_id, input_token, output_token, input_cost, output_cost,
              wait_time, request_success, request_failed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name, channel_id) DO UPDATE SET
             input_token = excluded.input_token,
             output_token = excluded.output_token,
             input_cost = excluded.input_cost,
             output_cost = excluded.output_cost,
             wait_time = excluded.wait_time,
             request_success = excluded.request_success,
             request_failed = excluded.request_failed",
        )
        .bind(&stats.name)
        .bind(stats.channel_id)
        .bind(stats.metrics.input_token)
        .bind(stats.metrics.output_token)
        .bind(stats.metrics.input_cost)
        .bind(stats.metrics.output_cost)
        .bind(stats.metrics.wait_time)
        .bind(stats.metrics.request_success)
        .bind(stats.metrics.request_failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_stats_api_key(&self) -> Result<Vec<StatsApiKey>> {
        let rows = sqlx::query("SELECT * FROM stats_api_key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| StatsApiKey {
                api_key_id: r.get("api_key_id"),
                metrics: metrics_from_row(r),
            })
            .collect())
    }

    pub async fn save_stats_api_key(&self, stats: &StatsApiKey) -> Result<()> {
        upsert_stats!(self, "stats_api_key", "api_key_id", stats.api_key_id, stats.metrics)
            .await?;
        Ok(())
    }

    pub async fn delete_stats_channel(&self, channel_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM stats_channel WHERE channel_id = ?")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_stats_api_key(&self, api_key_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM stats_api_key WHERE api_key_id = ?")
            .bind(api_key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Relay logs
// ============================================================================

fn relay_log_from_row(row: &SqliteRow) -> RelayLog {
    let attempts: String = row.get("attempts");
    RelayLog {
        id: row.get("id"),
        time: row.get("time"),
        request_model_name: row.get("request_model_name"),
        channel_id: row.get("channel_id"),
        channel_name: row.get("channel_name"),
        actual_model_name: row.get("actual_model_name"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        ftut: row.get("ftut"),
        use_time: row.get("use_time"),
        cost: row.get("cost"),
        request_content: row.get("request_content"),
        response_content: row.get("response_content"),
        error: row.get("error"),
        attempts: serde_json::from_str(&attempts).unwrap_or_default(),
        total_attempts: row.get("total_attempts"),
        successful_round: row.get("successful_round"),
    }
}

impl Store {
    pub async fn insert_relay_logs(&self, logs: &[RelayLog]) -> Result<()> {
        for log in logs {
            let attempts = serde_json::to_string(&log.attempts)?;
            sqlx::query(
                "INSERT OR IGNORE INTO relay_logs
                 (id, time, request_model_name, channel_id, channel_name,
                  actual_model_name, input_tokens, output_tokens, ftut, use_time,
                  cost, request_content, response_content, error, attempts,
                  total_attempts, successful_round)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(log.id)
            .bind(log.time)
            .bind(&log.request_model_name)
            .bind(log.channel_id)
            .bind(&log.channel_name)
            .bind(&log.actual_model_name)
            .bind(log.input_tokens)
            .bind(log.output_tokens)
            .bind(log.ftut)
            .bind(log.use_time)
            .bind(log.cost)
            .bind(&log.request_content)
            .bind(&log.response_content)
            .bind(&log.error)
            .bind(attempts)
            .bind(log.total_attempts)
            .bind(log.successful_round)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Page of persisted logs, newest first, with an optional
    /// second-precision time range.
    pub async fn list_relay_logs(
        &self,
        time_range: Option<(i64, i64)>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<RelayLog>> {
        let rows = match time_range {
            Some((start, end)) => {
                sqlx::query(
                    "SELECT * FROM relay_logs WHERE time >= ? AND time <= ?
                     ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(start)
                .bind(end)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM relay_logs ORDER BY id DESC LIMIT ? OFFSET ?")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(relay_log_from_row).collect())
    }

    pub async fn delete_relay_logs_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM relay_logs WHERE time < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn clear_relay_logs(&self) -> Result<()> {
        sqlx::query("DELETE FROM relay_logs").execute(&self.pool).await?;
        Ok(())
    }
}
