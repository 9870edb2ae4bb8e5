//! Peer presence events for presentation layers.
//!
//! Both node types feed this surface: an ultrapeer reports registry joins
//! and leaves (local or gossiped), a leaf reports its query outcomes.
//! Subscribers that fall behind lose the oldest events, never block senders.

use grove_core::LeafInfo;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Found(LeafInfo),
    Lost { public_key: String },
}

pub type EventSender = broadcast::Sender<PeerEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
