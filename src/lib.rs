//! # postage-gateway
//!
//! Reverse-proxy gateway for a content-addressed storage node that pays for
//! writes with postage stamps it manages on its own.
//!
//! ## Architecture
//!
//! - [`stamp::StampManager`] keeps a usable stamp available: it periodically
//!   lists the node's stamps, then buys, tops up or dilutes them depending
//!   on the configured [`stamp::ManagerMode`]
//! - [`gateway::Gateway`] forwards uploads and downloads to the node and
//!   attaches the current stamp to every write
//! - [`config::GatewayConfig`] is the TOML settings file
//!
//! ## Example
//!
//! ```rust,no_run
//! use postage_gateway::stamp::{BeeStampRepository, StampManager, StampMetrics};
//! use postage_gateway::GatewayConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let repository = Arc::new(BeeStampRepository::new(&config.bee.api_url)?);
//!     let manager = Arc::new(StampManager::new(repository, StampMetrics::new()));
//!
//!     if let Some(mode) = config.stamp.to_mode()? {
//!         manager.start(mode).await?;
//!     }
//!     println!("{}", manager.current_stamp()?);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod gateway;
pub mod stamp;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use stamp::{
    Amount, BatchId, ManagerMode, RefreshOutcome, Stamp, StampManager, StampRepository,
};
