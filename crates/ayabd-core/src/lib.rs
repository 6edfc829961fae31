//! # ayabd Core Library
//!
//! Core functionality of the ayabd knitting machine daemon.
//!
//! This library provides:
//! - The AYAB shield serial protocol (framing, CRC, messages, session engine)
//! - Serial, TCP and simulated transports
//! - The pattern queue with its global knitting cursor and persisted state
//! - The JSON control API used by the web front end
//! - The knitting service tying these together
//!
//! ## Example
//!
//! ```rust,ignore
//! use ayabd_core::{config::ServiceConfig, service::KnitService};
//!
//! let config = ServiceConfig {
//!     connection: "simulation".to_string(),
//!     ..ServiceConfig::default()
//! };
//! let (service, handle) = KnitService::new(config)?;
//! tokio::spawn(ayabd_core::api::serve(listener, handle));
//! service.run().await;
//! ```

pub mod api;
pub mod config;
pub mod pattern;
pub mod protocol;
pub mod service;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{ApiCommand, ApiError, ApiRequest, ApiResponse};
    pub use crate::config::ServiceConfig;
    pub use crate::pattern::{PatternContainer, PatternQueue, PatternSource, QueueError};
    pub use crate::protocol::{
        AyabEngine, ConnectionSpec, EngineOutput, KnitRow, ProtocolError, SessionState, Transport,
    };
    pub use crate::service::{KnitService, ServiceHandle};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
