// Client side of the authentication handshake.
//
// The authenticating stage sits in front of the caller's stages while the
// connection is classified, optionally upgraded to TLS and authenticated.
// Once the peer accepts, the caller's stages are spliced in and the stage
// removes itself.

mod authenticating_stage;
mod settings;
pub mod write_gate;

pub use authenticating_stage::{AuthenticatingStage, HandshakeState, is_benign_transport_error};
pub use settings::{
    DEFAULT_API_KEY, DEFAULT_HOST_SUFFIXES, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_SSL_PORTS,
    HandshakeSettings,
};

pub const HANDSHAKE_STAGE_NAME: &str = "authgate-handshake";
pub const TLS_STAGE_NAME: &str = "tls";
pub const HEARTBEAT_STAGE_NAME: &str = "connection-keep-alive";
