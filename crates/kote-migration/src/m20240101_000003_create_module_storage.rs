use sea_orm_migration::prelude::*;

/// Migration 3: per-module storage.
///
/// Rows are scoped by `(module_name, storage_key, storage_type, user_id, chat_id)`;
/// `storage_type` is either `config` or `data`.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ModuleStorage::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ModuleStorage::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ModuleStorage::ModuleName).string_len(255).not_null())
                    .col(ColumnDef::new(ModuleStorage::StorageKey).string_len(255).not_null())
                    .col(ColumnDef::new(ModuleStorage::StorageValue).text().not_null())
                    .col(
                        ColumnDef::new(ModuleStorage::StorageType)
                            .string_len(16)
                            .not_null()
                            .default("data"),
                    )
                    .col(
                        ColumnDef::new(ModuleStorage::UserId)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ModuleStorage::ChatId)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ModuleStorage::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ModuleStorage::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ── lookup index ──────────────────────────────────────────────
        manager
            .create_index(
                Index::create()
                    .name("idx_module_storage_lookup")
                    .table(ModuleStorage::Table)
                    .col(ModuleStorage::ModuleName)
                    .col(ModuleStorage::StorageKey)
                    .col(ModuleStorage::StorageType)
                    .col(ModuleStorage::UserId)
                    .col(ModuleStorage::ChatId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ModuleStorage::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
pub enum ModuleStorage {
    Table,
    Id,
    ModuleName,
    StorageKey,
    StorageValue,
    StorageType,
    UserId,
    ChatId,
    CreatedAt,
    UpdatedAt,
}
