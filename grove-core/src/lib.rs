//! Grove directory protocol reference implementation.
//! Host-driven: no I/O; the node crate passes bytes and events in and gets
//! values and frames out.

pub mod identity;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use identity::{derive_port, Identity, IdentityError};
pub use protocol::{AckStatus, LeafInfo, Message, QueryStatus};
pub use registry::Registry;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
