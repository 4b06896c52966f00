//! Peer protocol: wire framing, handshake and per-message dispatch, and the
//! initial block download controller.

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod housekeeping;
pub mod ibd;
pub mod message;
pub mod params;

pub use codec::{Builder as CodecBuilder, MessageCodec};
pub use connection::PeerConnection;
pub use dispatcher::{with_chain_lock, Dispatcher, PeerTable};
pub use ibd::{IbdController, IbdPhase, Range};
pub use message::{random_node_nonce, Envelope};
