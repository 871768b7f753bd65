//! Wire framing for the authentication handshake.
//!
//! Outbound auth frame, all integers 32-bit big endian:
//! ```text
//! ┌───────────┬────────┬──────────┬────────┬──────────┬──────────┬─────────┬─────────┬────────┬────────┐
//! │ total len │ rev len│ revision │ ver len│ proto ver│ module   │ name len│ name    │ key len│ key    │
//! │ 4 bytes   │ (=4)   │ (=1)     │ (=8)   │ 4 bytes  │ 4 bytes  │ 4 bytes │ N bytes │ 4 bytes│ M bytes│
//! └───────────┴────────┴──────────┴────────┴──────────┴──────────┴─────────┴─────────┴────────┴────────┘
//! ```
//! `total len` counts every byte after itself.
//!
//! Inbound response frame:
//! ```text
//! ┌───────────┬──────────┬─────────────┬──────────┬─────────────┐
//! │ length    │ revision │ status code │ desc len │ description │
//! │ 4 bytes   │ 4 bytes  │ 4 bytes     │ 4 bytes  │ D bytes     │
//! └───────────┴──────────┴─────────────┴──────────┴─────────────┘
//! ```
//! Peers count the revision field in `length`, so a complete frame spans at
//! least `4 + length` bytes, and exactly `16 + desc len` bytes of it are
//! meaningful.

use bytes::{BufMut, Bytes, BytesMut};

/// Revision of the handshake spoken by this client.
pub const PROTOCOL_REVISION: i32 = 1;

/// Legacy failure revision; shares the revision 1 payload layout.
pub const LEGACY_REVISION: i32 = -1;

/// Application protocol version announced when none is configured.
pub const DEFAULT_PROTOCOL_VERSION_ID: i32 = 1_000_099;

/// Length prefix + revision.
pub const RESPONSE_HEADER_SIZE: usize = 8;

/// Status code + description length.
const RESPONSE_STATUS_SIZE: usize = 8;

/// Upper bound for any length field in a response frame.
pub const MAX_RESPONSE_PAYLOAD: usize = 1024 * 1024;

/// Keep-alive marker written on idle connections. Not length prefixed; the
/// peer discards it.
pub const HEARTBEAT_PROBE: [u8; 6] = [b'F', b'K', 0, 0, 0, 0];

/// Module version identifier packed as decimal digits `MMmmrrbb`: two each for
/// major, minor, revision and build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleVersion {
    id: i32,
}

impl ModuleVersion {
    pub const CURRENT: ModuleVersion = ModuleVersion::new(8_051_000);

    pub const fn new(id: i32) -> Self {
        Self { id }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn major(&self) -> u8 {
        ((self.id / 1_000_000) % 100) as u8
    }

    pub fn minor(&self) -> u8 {
        ((self.id / 10_000) % 100) as u8
    }

    pub fn revision(&self) -> u8 {
        ((self.id / 100) % 100) as u8
    }

    pub fn build(&self) -> u8 {
        (self.id % 100) as u8
    }
}

impl std::fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major(),
            self.minor(),
            self.revision(),
            self.build()
        )
    }
}

/// Builds the auth frame identifying this client to the peer.
pub fn encode_auth_frame(
    cluster_name: &str,
    api_key: &str,
    protocol_version_id: i32,
    module_version_id: i32,
) -> Bytes {
    let cluster_name = cluster_name.as_bytes();
    let api_key = api_key.as_bytes();

    let body_len = 4 + 4 + 4 + 4 + 4 + 4 + cluster_name.len() + 4 + api_key.len();
    let mut frame = BytesMut::with_capacity(4 + body_len);

    frame.put_i32(body_len as i32);

    frame.put_i32(4);
    frame.put_i32(PROTOCOL_REVISION);

    frame.put_i32(8);
    frame.put_i32(protocol_version_id);
    frame.put_i32(module_version_id);

    frame.put_i32(cluster_name.len() as i32);
    frame.put_slice(cluster_name);

    frame.put_i32(api_key.len() as i32);
    frame.put_slice(api_key);

    frame.freeze()
}

/// A fully buffered response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub revision: i32,
    pub status_code: i32,
    pub description: String,
    /// Bytes of the input taken up by this frame.
    pub consumed: usize,
}

impl ResponseFrame {
    /// Revision 1 accepts on a 2xx status; the legacy revision never accepts.
    pub fn is_accepted(&self) -> bool {
        self.revision == PROTOCOL_REVISION && (200..=299).contains(&self.status_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// More bytes are needed before anything can be decided.
    Incomplete,
    Decoded(ResponseFrame),
    /// The buffered bytes can never form a valid frame.
    ProtocolError(String),
}

#[inline]
fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn checked_length(value: i32, field: &str) -> Result<usize, String> {
    if value < 0 || value as usize > MAX_RESPONSE_PAYLOAD {
        return Err(format!("invalid {field} {value} in response frame"));
    }
    Ok(value as usize)
}

/// Attempts to decode one response frame from the front of `buf`.
///
/// Waits until both the declared length and the description are buffered, but
/// only the header, status and description count towards `consumed`. Padding
/// the peer declared beyond the description stays in `buf`.
///
/// Never consumes anything; the caller drops `consumed` bytes on `Decoded`.
pub fn try_decode_response(buf: &[u8]) -> DecodeResult {
    if buf.len() < RESPONSE_HEADER_SIZE {
        return DecodeResult::Incomplete;
    }

    let payload_length = read_i32(buf, 0);
    let revision = read_i32(buf, 4);

    if revision != PROTOCOL_REVISION && revision != LEGACY_REVISION {
        return DecodeResult::ProtocolError(format!("unknown response revision {revision}"));
    }

    let payload_length = match checked_length(payload_length, "payload length") {
        Ok(n) => n,
        Err(e) => return DecodeResult::ProtocolError(e),
    };
    let declared_end = 4 + payload_length;

    let status_end = RESPONSE_HEADER_SIZE + RESPONSE_STATUS_SIZE;
    if buf.len() < status_end.max(declared_end) {
        return DecodeResult::Incomplete;
    }

    let status_code = read_i32(buf, 8);
    let description_length = match checked_length(read_i32(buf, 12), "description length") {
        Ok(n) => n,
        Err(e) => return DecodeResult::ProtocolError(e),
    };

    let description_end = status_end + description_length;
    if buf.len() < description_end.max(declared_end) {
        return DecodeResult::Incomplete;
    }

    let description = String::from_utf8_lossy(&buf[status_end..description_end]).into_owned();

    DecodeResult::Decoded(ResponseFrame {
        revision,
        status_code,
        description,
        consumed: description_end,
    })
}
