//! Store-and-forward dispatch pipeline
//!
//! Records submitted by the application are queued in memory, batched into
//! packets, and delivered to the collector by a background worker. While the
//! device is offline (or the dispatch mode forbids sending) the queue is
//! spilled to a host-scoped directory on disk and restored ahead of newer
//! records once delivery is possible again.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stowaway_core::{Config, Dispatcher};
//!
//! # async fn run() -> stowaway_core::Result<()> {
//! let mut config = Config::load()?;
//! config.dispatch.endpoint = Some("https://analytics.example.com/matomo.php".into());
//!
//! let dispatcher = Dispatcher::new(config)?;
//! dispatcher.submit("?idsite=1&rec=1&action_name=Home");
//! dispatcher.dispatch_pending().await;
//! # Ok(())
//! # }
//! ```

mod connectivity;
mod disk_cache;
mod dispatcher;
mod event_cache;
mod mode;
mod packet;
mod record;
mod sender;
mod stats;

pub use connectivity::{Connectivity, ManualConnectivity, Transport};
pub use disk_cache::{CacheAge, EventDiskCache};
pub use dispatcher::{backoff_wait, Dispatcher, DispatcherBuilder, DryRunTarget, Transform};
pub use event_cache::EventCache;
pub use mode::DispatchMode;
pub use packet::{Packet, PacketFactory, PAGE_SIZE};
pub use record::Record;
pub use sender::{HttpPacketSender, PacketSender};
pub use stats::{DispatchStats, StatsSnapshot};
