//! L2CAP Protocol Implementation
//!
//! The responder-side L2CAP engine run by emulated peer devices: one
//! instance per ACL link multiplexes dynamically allocated channels over the
//! link, runs the signalling-channel command protocol and hands complete
//! SDUs to the service bound to each channel.

pub mod channel;
pub mod engine;
pub mod packet;
pub mod signaling;

pub use channel::{Channel, ChannelMode, ConfigFlags};
pub use engine::{L2capPeer, PsmService};
pub use packet::{BasicHeader, ChannelId, L2capError, ProtocolServiceMultiplexer};
