//! Ferrybus Client
//!
//! One [`Fabric`] per execution context. Initialize it for the context it
//! runs in, then send requests, register handlers, emit and listen for events.
//!
//! # Example
//!
//! ```ignore
//! use ferrybus_client::prelude::*;
//! use serde_json::json;
//!
//! async fn popup(connector: Arc<dyn Connector>) -> ferrybus_client::Result<()> {
//!     let fabric = Fabric::builder().reconnect_interval(250).build();
//!     fabric.init_popup(connector)?;
//!
//!     fabric.on("ping", |msg| async move {
//!         Ok(json!(msg.data["n"].as_i64().unwrap_or(0) + 1))
//!     })?;
//!
//!     let n = fabric.request("ping", json!({"n": 1}), "content-script@12").await?;
//!     assert_eq!(n, json!(2));
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod builder;
pub mod config;
pub mod error;
pub mod fabric;

pub use adapters::{PageBridge, PageLink};
pub use builder::FabricBuilder;
pub use config::FabricConfig;
pub use error::{ClientError, Result};
pub use fabric::Fabric;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::FabricBuilder;
    pub use crate::config::FabricConfig;
    pub use crate::error::{ClientError, Result};
    pub use crate::fabric::Fabric;
    pub use ferrybus_core::{ContextKind, Endpoint, IncomingMessage, Value};
    pub use ferrybus_router::{HandlerError, HandlerHandle, ListenerHandle, PendingReply, RouterError};
    pub use ferrybus_transport::Connector;
    pub use std::sync::Arc;
}
