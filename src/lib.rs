//! chanstore - channel persistence synchronization engine.
//!
//! Sits between a live, frequently-mutated in-memory channel model and a
//! slower durable backing store. Mutation calls queue intents and return
//! immediately; contradictory pending operations cancel each other out;
//! an externally scheduled commit cycle flushes what remains in a fixed,
//! failure-isolated phase order. Read queries bypass the queues and hit
//! the store (or a bounded identity cache) directly.
//!
//! ```no_run
//! use chanstore::{ChannelDetails, ChannelSynchronizer, Config, open_store};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("chanstore.toml")?;
//! let store = open_store(&config).await?;
//! let sync = ChannelSynchronizer::new(store);
//!
//! let id = sync
//!     .create_channel(&ChannelDetails {
//!         name: "General".into(),
//!         owner: 42,
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! sync.add_member(id, 102); // queued, returns immediately
//! sync.commit_changes().await; // invoked periodically by a scheduler
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod store;
pub mod sync;

pub use config::{CacheConfig, Config, ConfigError, StorageConfig};
pub use error::{CodecError, StoreError};
pub use index::ChannelIndex;
pub use model::{
    ChannelDetails, ChannelGroup, ChannelId, ChannelSummary, GroupId, GroupType, Permission,
    UserId,
};
pub use store::{ChannelStore, SearchType, open_store};
pub use sync::ChannelSynchronizer;
