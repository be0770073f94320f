//! Cached key/value store.
//!
//! Settings, user levels and aliases are read on every command dispatch, so
//! they are mirrored in memory. Reads never touch SQLite; every mutation
//! writes the row first and then updates the mirror before returning.
//! Per-module storage is not cached.

use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use kote_migration::{Migrator, MigratorTrait};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};

use crate::entities::{alias, module_storage, setting, user};
use crate::DatabaseConfig;

/// Command prefix setting.
pub const SETTING_PREFIX: &str = "prefix";
/// Kill-switch setting, `"True"` or `"False"`.
pub const SETTING_ENABLED: &str = "userbot_enabled";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ─── Permission levels ──────────────────────────────────────────────────

/// Caller access level. Ordering follows privilege: `User < Trusted < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PermissionLevel {
    User,
    Trusted,
    Owner,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::User => "USER",
            PermissionLevel::Trusted => "TRUSTED",
            PermissionLevel::Owner => "OWNER",
        }
    }

    /// Parse a stored level, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "USER" => Some(PermissionLevel::User),
            "TRUSTED" => Some(PermissionLevel::Trusted),
            "OWNER" => Some(PermissionLevel::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Aliases & module storage types ─────────────────────────────────────

/// A persisted alias: `alias` runs `real_command` of `module_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub alias: String,
    pub real_command: String,
    pub module_name: String,
}

impl From<alias::Model> for AliasRecord {
    fn from(model: alias::Model) -> Self {
        Self {
            alias: model.alias,
            real_command: model.real_command,
            module_name: model.module_name,
        }
    }
}

/// Which half of a module's storage a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Config,
    Data,
}

impl StorageKind {
    fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Config => "config",
            StorageKind::Data => "data",
        }
    }
}

/// Per-user / per-chat scoping of module storage. `0` means global.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageScope {
    pub user_id: i64,
    pub chat_id: i64,
}

// ─── Store ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Cache {
    settings: HashMap<String, String>,
    users: HashMap<i64, PermissionLevel>,
    aliases: Vec<AliasRecord>,
}

/// Shared store handle. One per process.
pub struct Store {
    db: DatabaseConnection,
    cache: RwLock<Cache>,
}

impl Store {
    /// Connect, apply migrations and warm the caches.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let db = crate::connect(config).await?;
        Migrator::up(&db, None).await?;
        Self::from_connection(db).await
    }

    /// Fresh private database, used by tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open(&DatabaseConfig::in_memory()).await
    }

    /// Wrap an already migrated connection.
    pub async fn from_connection(db: DatabaseConnection) -> Result<Self, StoreError> {
        let store = Self {
            db,
            cache: RwLock::new(Cache::default()),
        };
        store.warmup().await?;
        Ok(store)
    }

    async fn warmup(&self) -> Result<(), StoreError> {
        let settings = setting::Entity::find().all(&self.db).await?;
        let users = user::Entity::find().all(&self.db).await?;
        let aliases = alias::Entity::find().all(&self.db).await?;

        let mut cache = self.write_cache();
        cache.settings = settings.into_iter().map(|s| (s.key, s.value)).collect();
        cache.users = users
            .into_iter()
            .filter_map(|u| PermissionLevel::parse(&u.level).map(|level| (u.user_id, level)))
            .collect();
        cache.aliases = aliases.into_iter().map(AliasRecord::from).collect();

        tracing::debug!(
            settings = cache.settings.len(),
            users = cache.users.len(),
            aliases = cache.aliases.len(),
            "store cache warmed"
        );
        Ok(())
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, Cache> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, Cache> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the database connection.
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub fn setting(&self, key: &str) -> Option<String> {
        self.read_cache().settings.get(key).cloned()
    }

    pub fn setting_or(&self, key: &str, default: &str) -> String {
        self.setting(key).unwrap_or_else(|| default.to_string())
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let model = setting::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
        };
        setting::Entity::insert(model)
            .on_conflict(
                OnConflict::column(setting::Column::Key)
                    .update_column(setting::Column::Value)
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        self.write_cache()
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Configured command prefix, `.` by default.
    pub fn prefix(&self) -> String {
        self.setting_or(SETTING_PREFIX, ".")
    }

    /// Kill-switch state. Anything but `"False"` counts as enabled.
    pub fn is_enabled(&self) -> bool {
        self.setting(SETTING_ENABLED)
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true)
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.set_setting(SETTING_ENABLED, if enabled { "True" } else { "False" })
            .await
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Level of a chat user; unknown users are [`PermissionLevel::User`].
    pub fn user_level(&self, user_id: i64) -> PermissionLevel {
        self.read_cache()
            .users
            .get(&user_id)
            .copied()
            .unwrap_or(PermissionLevel::User)
    }

    pub fn users_by_level(&self, level: PermissionLevel) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .read_cache()
            .users
            .iter()
            .filter(|(_, l)| **l == level)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn set_user_level(
        &self,
        user_id: i64,
        level: PermissionLevel,
    ) -> Result<(), StoreError> {
        let model = user::ActiveModel {
            user_id: Set(user_id),
            level: Set(level.as_str().to_string()),
        };
        user::Entity::insert(model)
            .on_conflict(
                OnConflict::column(user::Column::UserId)
                    .update_column(user::Column::Level)
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        self.write_cache().users.insert(user_id, level);
        Ok(())
    }

    pub async fn remove_user(&self, user_id: i64) -> Result<(), StoreError> {
        user::Entity::delete_by_id(user_id).exec(&self.db).await?;
        self.write_cache().users.remove(&user_id);
        Ok(())
    }

    // ── Aliases ──────────────────────────────────────────────────────

    pub fn aliases(&self) -> Vec<AliasRecord> {
        self.read_cache().aliases.clone()
    }

    pub fn alias(&self, name: &str) -> Option<AliasRecord> {
        self.read_cache()
            .aliases
            .iter()
            .find(|a| a.alias == name)
            .cloned()
    }

    /// Insert or replace an alias row, then refresh the alias mirror.
    pub async fn add_alias(&self, record: &AliasRecord) -> Result<(), StoreError> {
        let model = alias::ActiveModel {
            alias: Set(record.alias.clone()),
            real_command: Set(record.real_command.clone()),
            module_name: Set(record.module_name.clone()),
            created_at: Set(chrono::Utc::now().naive_utc()),
        };
        alias::Entity::insert(model)
            .on_conflict(
                OnConflict::column(alias::Column::Alias)
                    .update_columns([alias::Column::RealCommand, alias::Column::ModuleName])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        self.refresh_aliases().await
    }

    /// Delete an alias. Returns whether a row existed.
    pub async fn remove_alias(&self, name: &str) -> Result<bool, StoreError> {
        let result = alias::Entity::delete_by_id(name.to_string())
            .exec(&self.db)
            .await?;
        self.refresh_aliases().await?;
        Ok(result.rows_affected > 0)
    }

    async fn refresh_aliases(&self) -> Result<(), StoreError> {
        let rows = alias::Entity::find().all(&self.db).await?;
        self.write_cache().aliases = rows.into_iter().map(AliasRecord::from).collect();
        Ok(())
    }

    // ── Module storage ───────────────────────────────────────────────

    async fn find_module_row(
        &self,
        module: &str,
        key: &str,
        kind: StorageKind,
        scope: StorageScope,
    ) -> Result<Option<module_storage::Model>, StoreError> {
        let row = module_storage::Entity::find()
            .filter(module_storage::Column::ModuleName.eq(module))
            .filter(module_storage::Column::StorageKey.eq(key))
            .filter(module_storage::Column::StorageType.eq(kind.as_str()))
            .filter(module_storage::Column::UserId.eq(scope.user_id))
            .filter(module_storage::Column::ChatId.eq(scope.chat_id))
            .one(&self.db)
            .await?;
        Ok(row)
    }

    /// Read one stored value. Values that are not JSON come back as strings.
    pub async fn module_value(
        &self,
        module: &str,
        key: &str,
        kind: StorageKind,
        scope: StorageScope,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row = self.find_module_row(module, key, kind, scope).await?;
        Ok(row.map(|r| decode_value(&r.storage_value)))
    }

    pub async fn set_module_value(
        &self,
        module: &str,
        key: &str,
        value: &serde_json::Value,
        kind: StorageKind,
        scope: StorageScope,
    ) -> Result<(), StoreError> {
        let encoded = match value {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        let now = chrono::Utc::now().naive_utc();

        match self.find_module_row(module, key, kind, scope).await? {
            Some(existing) => {
                let mut active: module_storage::ActiveModel = existing.into();
                active.storage_value = Set(encoded);
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = module_storage::ActiveModel {
                    module_name: Set(module.to_string()),
                    storage_key: Set(key.to_string()),
                    storage_value: Set(encoded),
                    storage_type: Set(kind.as_str().to_string()),
                    user_id: Set(scope.user_id),
                    chat_id: Set(scope.chat_id),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                active.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    /// All values of one kind for a module within a scope.
    pub async fn module_values(
        &self,
        module: &str,
        kind: StorageKind,
        scope: StorageScope,
    ) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        let rows = module_storage::Entity::find()
            .filter(module_storage::Column::ModuleName.eq(module))
            .filter(module_storage::Column::StorageType.eq(kind.as_str()))
            .filter(module_storage::Column::UserId.eq(scope.user_id))
            .filter(module_storage::Column::ChatId.eq(scope.chat_id))
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let value = decode_value(&r.storage_value);
                (r.storage_key, value)
            })
            .collect())
    }

    /// Delete one key, or every key of that kind when `key` is `None`.
    pub async fn delete_module_values(
        &self,
        module: &str,
        key: Option<&str>,
        kind: StorageKind,
        scope: StorageScope,
    ) -> Result<u64, StoreError> {
        let mut query = module_storage::Entity::delete_many()
            .filter(module_storage::Column::ModuleName.eq(module))
            .filter(module_storage::Column::StorageType.eq(kind.as_str()))
            .filter(module_storage::Column::UserId.eq(scope.user_id))
            .filter(module_storage::Column::ChatId.eq(scope.chat_id));
        if let Some(key) = key {
            query = query.filter(module_storage::Column::StorageKey.eq(key));
        }
        let result = query.exec(&self.db).await?;
        Ok(result.rows_affected)
    }
}

fn decode_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
