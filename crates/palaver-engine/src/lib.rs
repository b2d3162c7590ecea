//! Non-blocking protocol engine.
//!
//! This crate runs the client side of the chat protocol on a single
//! thread:
//! - a `poll(2)` event loop with read timeouts and alarms
//! - signaling connections with stream management
//! - bytestream relay discovery and SOCKS5 probing
//! - the entity capabilities cache
//!
//! # Example
//!
//! ```rust,no_run
//! use std::os::unix::net::UnixStream;
//!
//! use palaver_engine::{Engine, EngineConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::new(EngineConfig::default().with_relays(["proxy.example.com"]))?;
//!     let id = engine.add_connection("example.com");
//!
//!     let stream = UnixStream::connect("/run/palaver/example.sock")?;
//!     stream.set_nonblocking(true)?;
//!     engine.attach_transport(id, Box::new(stream))?;
//!     engine.resolve_configured_relays(id)?;
//!
//!     engine.run(async { tokio::signal::ctrl_c().await.unwrap_or(()) }).await?;
//!     Ok(())
//! }
//! ```

mod caps;
mod config;
mod connection;
mod driver;
mod engine;
mod error;
mod event_queue;
mod handoff;
mod relay;
mod socks5;

pub use caps::{
    CapabilityCache, CapsEntry, CapsKey, CapsQuery, CapsStatus, CapsStore, ClaimedCaps,
    DEFAULT_FEATURE_BLACKLIST, DataForm, DiscoInfo, HashAlgorithm, Identity, MemoryCapsStore, StoredCaps, Verification,
    compute_caps_hash, disco_info_request, parse_disco_info,
};
pub use config::{CapsSettings, EngineConfig, StreamManagementSettings};
pub use connection::{Connection, ConnectionId, ConnectionReport, ConnectionState, Transport};
pub use driver::{PROCESS_INTERVAL, Pump, drive};
pub use engine::{Engine, EngineEvent, EngineState};
pub use error::{EngineError, EngineResult};
pub use event_queue::{
    AlarmHandle, EventQueue, IdleObject, Interest, PollPoller, Poller, Readiness, SharedObject,
};
pub use handoff::{PendingResolution, resolve_in_background};
pub use relay::{
    DEFAULT_STREAMHOST_PORT, ProbeRequest, ProxyRecord, RelayAction, RelayEvent, RelayManager,
    ResolveState, Streamhost, discovery_request, parse_streamhost,
};
pub use socks5::{
    EstablishedStream, GREETING, HandshakeSink, ProbeInbox, ProbeReport, Socks5Client,
    Socks5Connector, Socks5Error, Socks5Event, Socks5Handshake, Socks5Prober, Socks5State,
    Socks5Step, TransferInbox, TransferReport, destination_hash,
};
