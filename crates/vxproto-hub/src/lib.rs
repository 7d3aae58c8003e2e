//! The vxproto hub.
//!
//! [`VxProto`] connects remote agents to in-process modules. Agent
//! connections are [`AgentSocket`]s over any [`Transport`]; modules are
//! [`ModuleSocket`]s consumed through their [`Router`]. Packets flow
//!
//! ```text
//! transport -> AgentSocket -> VxProto::recv_packet -> ModuleSocket -> Router
//! ModuleSocket::send_packet -> (IMC | VxProto::send_packet -> AgentSocket -> transport)
//! ```
//!
//! Packets for destinations that are not connected yet are deferred and
//! replayed every tick for up to the configured TTL.

pub mod agent;
pub mod app;
pub mod config;
pub mod crypto;
pub mod error;
pub mod file;
pub mod hub;
pub mod imc;
pub mod module;
pub mod pinger;
mod queue;
pub mod router;
pub mod transport;

pub use agent::AgentSocket;
pub use app::{HubApp, LoggingApp};
pub use config::HubConfig;
pub use crypto::{ChaChaEncryptor, CryptoError, PackEncryptor, PlainEncryptor};
pub use error::{HubError, TransportError};
pub use file::{FileAssembler, FILE_CHUNK_SIZE, MAX_FILE_CHUNKS};
pub use hub::{CloserHandle, VxProto};
pub use module::ModuleSocket;
pub use pinger::{IntervalPinger, Pinger};
pub use router::{RecvFilter, RecvTimeout, Router};
pub use transport::{Inbound, MemoryTransport, Transport};
