// Subscription protocol, registry and fan-out

pub mod filter;
pub mod manager;
pub mod protocol;
pub mod registry;

pub use filter::{Filter, FilterTable};
pub use manager::{
    ConnectionPhase, InitHook, InitRejection, Outbound, Outgoing, RegistrationError,
    SubscriptionManager,
};
pub use protocol::{ClientMessage, ControlMessage, DataPayload, ProtocolError, ServerMessage};
pub use registry::{ConnectionId, ConnectionRegistry, RegistryError, Subscription};
