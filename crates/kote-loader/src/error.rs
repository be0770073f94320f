//! Loader error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("invalid handler descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("chat client error: {0}")]
    Client(String),

    #[error("command queue is closed")]
    QueueClosed,

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("store error: {0}")]
    Store(#[from] kote_db::StoreError),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl From<Box<rhai::EvalAltResult>> for LoaderError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        LoaderError::Script(err.to_string())
    }
}

impl From<rhai::ParseError> for LoaderError {
    fn from(err: rhai::ParseError) -> Self {
        LoaderError::Compile(err.to_string())
    }
}

/// Render an error and its source chain, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
