//! STRATA Stream - Sequenced Update Broker
//!
//! Per-key ordered update streams with bounded replay. Writers publish
//! [`Update`](strata_core::Update)s (directly or through a [`WritePath`]);
//! the broker assigns each a sequence number, retains it for the data TTL
//! and wakes live subscribers. A [`Subscription`] replays retained records
//! from a requested sequence, then follows the live stream until the stream
//! is closed.
//!
//! All durable state lives behind [`KeyValueWithExpiry`]. Broker instances
//! sharing a store agree on sequence numbers; live wake-ups are delivered
//! to subscribers of the same broker instance.

pub mod broker;
pub mod store;
pub mod subscription;
pub mod write_path;

pub use broker::UpdateBroker;
pub use store::{decode_counter, InMemoryKvStore, KeyValueWithExpiry};
pub use subscription::Subscription;
pub use write_path::{WriteObserver, WritePath};
