//! # stowaway-core
//!
//! Core library for stowaway - a store-and-forward telemetry dispatcher.
//!
//! This library provides:
//! - The dispatch pipeline: queueing, batching, delivery and retry
//! - An offline disk cache with age and size retention
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Records flow through three stages:
//! - **Queue:** In-memory FIFO, spilled to disk while offline
//! - **Packets:** Batches of up to 20 records (GET for one, bulk POST for more)
//! - **Delivery:** A background worker sends packets, requeueing on failure
//!
//! ## Example
//!
//! ```rust,no_run
//! use stowaway_core::{Config, Dispatcher};
//!
//! # #[tokio::main]
//! # async fn main() -> stowaway_core::Result<()> {
//! // Load configuration
//! let config = Config::load()?;
//!
//! // Queue a record; the worker delivers it in the background
//! let dispatcher = Dispatcher::new(config)?;
//! dispatcher.submit("?idsite=1&rec=1&action_name=Home");
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use dispatch::{
    CacheAge, Connectivity, DispatchMode, DispatchStats, Dispatcher, DispatcherBuilder,
    DryRunTarget, EventCache, EventDiskCache, HttpPacketSender, ManualConnectivity, Packet,
    PacketFactory, PacketSender, Record, StatsSnapshot, Transport,
};
pub use error::{Error, Result};

// Public modules
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
