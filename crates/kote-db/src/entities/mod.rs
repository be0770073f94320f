pub mod alias;
pub mod module_storage;
pub mod setting;
pub mod user;
