//! A client for the Tuya-family LAN protocol spoken by consumer IoT
//! devices: wire framing across protocol versions 3.3/3.4/3.5, the
//! session-key handshake, UDP discovery, and a typed device session.

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod dps;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod payload;
pub mod session;

pub use config::{load_config, ProtocolVersion, SessionConfig};
pub use discovery::Discovery;
pub use dps::{DpsAccessError, DpsMap};
pub use error::SessionError;
pub use payload::{CommandKind, Dialect};
pub use session::{ChildHandle, DeviceSession};
