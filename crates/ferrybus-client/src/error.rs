//! Client error types

use ferrybus_core::ContextKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("fabric not initialized")]
    NotInitialized,

    #[error("fabric already initialized")]
    AlreadyInitialized,

    #[error("{0} has no {1}")]
    Unsupported(ContextKind, &'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Address, delivery and handler failures all surface through the router
    #[error(transparent)]
    Router(#[from] ferrybus_router::RouterError),
}
