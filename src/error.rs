use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("invalid monitor configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
