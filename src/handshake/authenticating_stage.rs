use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::settings::HandshakeSettings;
use super::write_gate::PendingWrites;
use super::{HEARTBEAT_STAGE_NAME, TLS_STAGE_NAME};
use crate::codec::{self, DecodeResult};
use crate::heartbeat::HeartbeatStage;
use crate::pipeline::{Stage, StageChain, StageContext};
use crate::target::Target;
use crate::tls::TlsStage;
use crate::trust;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the transport to connect.
    Idle,
    /// Handshake host on a plain port.
    Classified,
    /// Handshake host, TLS installed below this stage.
    TlsPending,
    /// Auth frame sent, waiting for the response.
    AwaitingDecision,
    Spliced,
    Closed,
}

/// Holds the caller's stages back until the peer has accepted the auth frame,
/// then splices them in and removes itself.
pub struct AuthenticatingStage {
    settings: Arc<HandshakeSettings>,
    state: HandshakeState,
    chain: Option<StageChain>,
    buffered: BytesMut,
    pending: PendingWrites,
    target: Option<Target>,
}

impl AuthenticatingStage {
    pub fn new(settings: Arc<HandshakeSettings>, chain: StageChain) -> Self {
        Self {
            settings,
            state: HandshakeState::Idle,
            chain: Some(chain),
            buffered: BytesMut::new(),
            pending: PendingWrites::new(),
            target: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn target_display(&self) -> String {
        self.target
            .as_ref()
            .map_or_else(|| "<unconnected>".to_string(), |t| t.to_string())
    }

    fn install_tls(&mut self, ctx: &mut StageContext<'_>, target: &Target) -> io::Result<()> {
        if ctx.contains(TLS_STAGE_NAME) {
            log::debug!("TLS already installed for {target}");
            return Ok(());
        }
        log::info!("Enabling TLS for {target}");
        let config = trust::build_tls_config(self.settings.allow_self_signed, target.host())?;
        let server_name = trust::server_name_for(target.host())?;
        let tls = TlsStage::new(config, server_name)?;
        ctx.insert_first(TLS_STAGE_NAME, Box::new(tls))?;
        Ok(())
    }

    fn send_auth_frame(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        log::info!(
            "Authenticating to {} as cluster {}",
            self.target_display(),
            self.settings.cluster_name
        );
        let frame = codec::encode_auth_frame(
            &self.settings.cluster_name,
            &self.settings.api_key,
            self.settings.protocol_version,
            self.settings.module_version.id(),
        );
        self.state = HandshakeState::AwaitingDecision;
        ctx.write(frame)
    }

    fn decide(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        match codec::try_decode_response(&self.buffered) {
            DecodeResult::Incomplete => Ok(()),
            DecodeResult::ProtocolError(reason) => {
                log::error!(
                    "Invalid handshake response from {}: {reason}",
                    self.target_display()
                );
                self.fail(ctx)
            }
            DecodeResult::Decoded(frame) => {
                log::debug!(
                    "Handshake response from {}: revision {}, status {} ({})",
                    self.target_display(),
                    frame.revision,
                    frame.status_code,
                    frame.description
                );
                if frame.is_accepted() {
                    self.accept(ctx, frame.consumed)
                } else {
                    log::error!(
                        "Connection to {} rejected: {} {}",
                        self.target_display(),
                        frame.status_code,
                        frame.description
                    );
                    self.fail(ctx)
                }
            }
        }
    }

    fn accept(&mut self, ctx: &mut StageContext<'_>, consumed: usize) -> io::Result<()> {
        let _ = self.buffered.split_to(consumed);
        let leftover = std::mem::take(&mut self.buffered).freeze();

        let interval = self.settings.keepalive_interval;
        if !interval.is_zero() && !ctx.contains(HEARTBEAT_STAGE_NAME) {
            let heartbeat =
                HeartbeatStage::new(interval).with_check_interval(self.settings.heartbeat_check_interval);
            ctx.insert_before_self(HEARTBEAT_STAGE_NAME, Box::new(heartbeat))?;
        }

        self.splice(ctx, leftover)
    }

    /// Attaches the caller's stages after this one, releases held writes, replays
    /// the connect and any bytes that followed the response, then detaches.
    fn splice(&mut self, ctx: &mut StageContext<'_>, leftover: Bytes) -> io::Result<()> {
        self.state = HandshakeState::Spliced;
        let result = self.attach_chain(ctx, leftover);
        ctx.remove_self();
        result
    }

    fn attach_chain(&mut self, ctx: &mut StageContext<'_>, leftover: Bytes) -> io::Result<()> {
        if let Some(chain) = self.chain.take() {
            ctx.append_chain(chain)?;
        }

        for data in self.pending.drain() {
            ctx.write(data)?;
        }

        if let Some(target) = self.target.clone() {
            ctx.fire_connected(target)?;
        }

        if !leftover.is_empty() {
            ctx.fire_read(leftover)?;
        }

        Ok(())
    }

    fn discard(&mut self) {
        self.state = HandshakeState::Closed;
        self.buffered.clear();
        self.pending.discard();
        self.chain = None;
    }

    fn fail(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        self.discard();
        ctx.remove_self();
        ctx.close()
    }
}

/// Transport failures that only mean the peer is unreachable or gone.
pub fn is_benign_transport_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) || error.to_string().contains("Connection reset by peer")
}

fn is_connect_failure(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

impl Stage for AuthenticatingStage {
    fn on_connected(&mut self, ctx: &mut StageContext<'_>, target: Target) -> io::Result<()> {
        if self.state != HandshakeState::Idle {
            return ctx.fire_connected(target);
        }

        self.target = Some(target.clone());

        if !target.matches_host_suffix(&self.settings.host_suffixes) {
            log::debug!("{target} does not need authentication, passing through");
            return self.splice(ctx, Bytes::new());
        }

        if target.is_tls_port(&self.settings.ssl_ports) {
            if let Err(e) = self.install_tls(ctx, &target) {
                log::error!("Failed to enable TLS for {target}: {e}");
                return self.fail(ctx);
            }
            self.state = HandshakeState::TlsPending;
        } else {
            self.state = HandshakeState::Classified;
        }

        // a write may have been queued before the transport connected
        if !self.pending.is_empty() {
            return self.send_auth_frame(ctx);
        }

        Ok(())
    }

    fn on_write(&mut self, ctx: &mut StageContext<'_>, data: Bytes) -> io::Result<()> {
        match self.state {
            HandshakeState::Spliced => ctx.write(data),
            HandshakeState::Closed => {
                log::trace!("Dropping {} byte write after handshake failure", data.len());
                Ok(())
            }
            HandshakeState::Idle | HandshakeState::AwaitingDecision => {
                self.pending.push(data);
                Ok(())
            }
            HandshakeState::Classified | HandshakeState::TlsPending => {
                self.pending.push(data);
                self.send_auth_frame(ctx)
            }
        }
    }

    fn on_read(&mut self, ctx: &mut StageContext<'_>, data: Bytes) -> io::Result<()> {
        match self.state {
            HandshakeState::Spliced => ctx.fire_read(data),
            HandshakeState::Closed => Ok(()),
            _ => {
                self.buffered.extend_from_slice(&data);
                self.decide(ctx)
            }
        }
    }

    fn on_error(&mut self, ctx: &mut StageContext<'_>, error: io::Error) -> io::Result<()> {
        if self.state == HandshakeState::Spliced {
            return ctx.fire_error(error);
        }

        if is_benign_transport_error(&error) {
            if is_connect_failure(&error) {
                log::warn!("Could not connect to {}: {error}", self.target_display());
            } else {
                log::debug!(
                    "Connection to {} lost during handshake: {error}",
                    self.target_display()
                );
            }
            return ctx.close();
        }

        ctx.fire_error(error)
    }

    fn on_closed(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        if self.state != HandshakeState::Spliced {
            self.discard();
        }
        ctx.remove_self();
        ctx.fire_closed()
    }
}
