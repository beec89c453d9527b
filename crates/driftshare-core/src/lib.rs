pub mod codec;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod net;
pub mod node;
pub mod peers;
pub mod pin;
pub mod preview;
pub mod relay;
pub mod search;
pub mod security;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use codec::{ChunkRecord, DIRECT_CHUNK_SIZE, RELAY_CHUNK_SIZE, decode_chunk, encode_chunk};
pub use config::{NodeConfig, RelayConfig};
pub use discovery::{Announcement, AnnouncementKind, DiscoveryService, DiscoverySettings};
pub use engine::{
    DownloadOutcome, ServeContext, TransferCommand, TransferEngine, TransferHandle,
    serve_connection,
};
pub use error::{ErrorKind, NodeError, error_kind};
pub use events::{EventBus, NodeEvent};
pub use identity::{FileHash, PeerIdentity, RELAY_HOST_SENTINEL, SharedFile, SharedFileSummary};
pub use net::{RequestTransport, TlsRequestTransport};
pub use node::{Node, NodeHandle};
pub use peers::{PeerLiveness, PeerRecord, PeerRegistry};
pub use pin::{PinRelay, PinService, PinSession};
pub use preview::{
    PreviewContent, PreviewKind, PreviewManifest, PreviewService, PreviewSettings,
    generate_preview, verify_content,
};
pub use relay::{RelayClient, RelayDownloadOptions, RelayFileRef, RelayUploadRequest};
pub use search::{RequestDedup, SearchOutcome, SearchService, ShareIndex};
pub use security::SecurityContext;
pub use transfer::{ChunkBitset, PartFile, PersistedTransfer, TransferState, TransferStatus};
pub use transport::{
    ChannelSession, NonceTracker, accept_channel, connect_channel, handshake_initiator,
    handshake_responder,
};
pub use wire::{Message, read_message, write_message};

#[cfg(test)]
mod conformance;
