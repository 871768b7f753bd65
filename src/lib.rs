//! authgate - client side connection shim for authenticated cluster transports.
//!
//! Before a freshly opened outbound connection reaches the caller's protocol
//! stages, the shim:
//!
//! - decides whether the destination needs the authentication handshake,
//!   based on its host suffix,
//! - upgrades the connection to TLS when the destination port asks for it,
//! - sends an auth frame naming the cluster and API key,
//! - waits for the response frame, however it is fragmented,
//! - on success splices the caller's stages onto the connection, replaying
//!   held writes and any bytes that arrived right after the response,
//! - optionally keeps the connection alive with an idle-write heartbeat.
//!
//! # Usage
//!
//! ```no_run
//! use authgate::{channel_endpoint, HandshakeSettings, ShimConnector, StageChain, Target};
//!
//! # async fn run() -> std::io::Result<()> {
//! let connector = ShimConnector::new(HandshakeSettings::new("my-cluster"));
//! let (endpoint, mut events) = channel_endpoint();
//! let connection = connector
//!     .connect(
//!         Target::parse("abc.foundcluster.com:9343", None)?,
//!         StageChain::new().with("app", endpoint),
//!     )
//!     .await?;
//! connection.write(bytes::Bytes::from_static(b"hello"))?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod connector;
pub mod handshake;
pub mod heartbeat;
pub mod option_util;
pub mod pipeline;
pub mod target;
pub mod tls;
pub mod trust;

pub use codec::ModuleVersion;
pub use connection::{Connection, WeakConnection};
pub use connector::{ChannelEndpoint, ConnectionEvent, ShimConnector, channel_endpoint};
pub use handshake::{AuthenticatingStage, HandshakeSettings};
pub use heartbeat::HeartbeatStage;
pub use pipeline::{MemorySink, Pipeline, Stage, StageChain, StageContext, WireSink};
pub use target::Target;
pub use tls::TlsStage;
