use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Config error: {0}")]
    Config(String),
}
