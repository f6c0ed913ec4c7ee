//! Error types for the streaming engine

use thiserror::Error;

use crate::streaming::cache::CacheError;
use crate::streaming::catalog::CatalogError;
use crate::streaming::config::ConfigError;
use crate::streaming::disk_io::DecodeError;
use crate::streaming::upload::TransferError;
use vdbstream_debug::ServerError;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Debug server error: {0}")]
    Debug(#[from] ServerError),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Streaming error: {0}")]
    Streaming(String),
}
