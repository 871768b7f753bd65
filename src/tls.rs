use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;

use crate::pipeline::{Stage, StageContext};

/// Client side TLS, driven entirely by pipeline events.
///
/// Plaintext written before the TLS handshake completes is buffered by rustls
/// and flushed as soon as the session is established.
pub struct TlsStage {
    connection: rustls::ClientConnection,
}

impl TlsStage {
    pub fn new(
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> io::Result<Self> {
        let connection = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| io::Error::other(format!("Failed to create TLS session: {e}")))?;
        Ok(Self { connection })
    }

    pub fn is_handshaking(&self) -> bool {
        self.connection.is_handshaking()
    }

    fn flush(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        while self.connection.wants_write() {
            let mut buf = Vec::new();
            self.connection.write_tls(&mut buf)?;
            if buf.is_empty() {
                break;
            }
            ctx.write(Bytes::from(buf))?;
        }
        Ok(())
    }

    /// Feeds ciphertext into the session, returning the decrypted plaintext and
    /// whether the peer sent close_notify.
    fn decrypt(&mut self, data: &[u8]) -> Result<(BytesMut, bool), rustls::Error> {
        let mut cursor = Cursor::new(data);
        let mut plaintext = BytesMut::new();
        let mut peer_closed = false;

        while (cursor.position() as usize) < data.len() {
            let n = self
                .connection
                .read_tls(&mut cursor)
                .map_err(|e| rustls::Error::General(format!("failed to feed TLS data: {e}")))?;
            if n == 0 {
                break;
            }

            let io_state = self.connection.process_new_packets()?;

            let available = io_state.plaintext_bytes_to_read();
            if available > 0 {
                let start = plaintext.len();
                plaintext.resize(start + available, 0);
                self.connection
                    .reader()
                    .read_exact(&mut plaintext[start..])
                    .map_err(|e| {
                        rustls::Error::General(format!("failed to read TLS plaintext: {e}"))
                    })?;
            }

            if io_state.peer_has_closed() {
                peer_closed = true;
            }
        }

        Ok((plaintext, peer_closed))
    }
}

impl Stage for TlsStage {
    fn on_added(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        // ClientHello
        self.flush(ctx)
    }

    fn on_read(&mut self, ctx: &mut StageContext<'_>, data: Bytes) -> io::Result<()> {
        match self.decrypt(&data) {
            Ok((plaintext, peer_closed)) => {
                self.flush(ctx)?;
                if !plaintext.is_empty() {
                    ctx.fire_read(plaintext.freeze())?;
                }
                if peer_closed {
                    log::debug!("TLS peer sent close_notify");
                    ctx.close()?;
                }
                Ok(())
            }
            Err(e) => {
                // send the alert if there is one
                let _ = self.flush(ctx);
                match ctx.target() {
                    Some(target) => log::warn!("TLS failure on connection to {target}: {e}"),
                    None => log::warn!("TLS failure: {e}"),
                }
                ctx.close()
            }
        }
    }

    fn on_write(&mut self, ctx: &mut StageContext<'_>, data: Bytes) -> io::Result<()> {
        self.connection.writer().write_all(&data)?;
        self.flush(ctx)
    }

    fn on_close(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        if ctx.is_open() {
            self.connection.send_close_notify();
            let _ = self.flush(ctx);
        }
        ctx.close()
    }
}
