use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "module_storage")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub module_name: String,
    pub storage_key: String,
    #[sea_orm(column_type = "Text")]
    pub storage_value: String,
    pub storage_type: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
