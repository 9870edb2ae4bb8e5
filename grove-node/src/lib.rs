//! Grove node runtime: TLS channels, framed connection I/O, the ultrapeer
//! directory node and the leaf client.

pub mod config;
pub mod events;
pub mod framing;
pub mod leaf;
pub mod tls;
pub mod ultrapeer;
