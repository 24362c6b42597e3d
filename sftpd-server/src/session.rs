//! Per-connection SSH session handling.
//!
//! A [`SessionHandler`] is created for every accepted connection. It checks
//! password credentials, admits channel offers and answers in-band requests.
//! Every admitted channel gets its own task that drains the channel's
//! message queue until the first `sftp` subsystem request hands the channel
//! to the [`SubsystemServer`].

use crate::auth::Authenticator;
use crate::dispatch::{
    admit_channel, ChannelAdmission, ChannelRequest, ChannelSlot, Reply, SESSION_CHANNEL,
    SFTP_SUBSYSTEM,
};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::subsystem::{SubsystemEngine, SubsystemServer};
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, MethodKind, MethodSet, Pty, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

/// SSH event handler for one client connection.
pub struct SessionHandler<E: SubsystemEngine> {
    label: String,
    authenticator: Arc<Authenticator>,
    subsystems: SubsystemServer<E>,
    metrics: Option<Arc<Metrics>>,
    channels: HashMap<ChannelId, ChannelSlot<oneshot::Sender<()>>>,
    user: Option<String>,
    auth_failures: u32,
    started: Instant,
}

impl<E: SubsystemEngine> SessionHandler<E> {
    pub fn new(
        peer: Option<SocketAddr>,
        authenticator: Arc<Authenticator>,
        subsystems: SubsystemServer<E>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let label = match peer {
            Some(addr) => format!("{}/{}", addr, &id[..8]),
            None => id[..8].to_string(),
        };
        Self {
            label,
            authenticator,
            subsystems,
            metrics,
            channels: HashMap::new(),
            user: None,
            auth_failures: 0,
            started: Instant::now(),
        }
    }

    /// Log prefix identifying this session.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the authenticated user, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn offer(&mut self, kind: &str, channel: Channel<Msg>, session: &Session) -> bool {
        match admit_channel(kind) {
            ChannelAdmission::Accept => {
                let id = channel.id();
                tracing::debug!("[{}] accepted {} channel {:?}", self.label, kind, id);
                let (start_tx, start_rx) = oneshot::channel();
                self.channels.insert(id, ChannelSlot::new(start_tx));
                tokio::spawn(run_channel(
                    format!("{}/{:?}", self.label, id),
                    channel,
                    start_rx,
                    self.subsystems.clone(),
                    session.handle(),
                ));
                self.count_channel("accepted");
                true
            }
            ChannelAdmission::Reject { reason } => {
                tracing::info!("[{}] rejected {} channel: {}", self.label, kind, reason);
                self.count_channel("rejected");
                false
            }
        }
    }

    fn count_channel(&self, outcome: &str) {
        if let Some(ref m) = self.metrics {
            m.channels_total.with_label_values(&[outcome]).inc();
        }
    }

    /// Answers one in-band request and releases the channel to the engine on
    /// the first match.
    ///
    /// Reply failures are scoped to the channel: its slot is dropped and the
    /// session carries on.
    fn handle_request(
        &mut self,
        id: ChannelId,
        request: ChannelRequest<'_>,
        session: &mut Session,
    ) -> Result<(), ServerError> {
        let kind = request.kind().to_string();
        let Some(slot) = self.channels.get_mut(&id) else {
            tracing::debug!("[{}] {} request on unknown channel {:?}", self.label, kind, id);
            if let Err(e) = session.channel_failure(id) {
                tracing::debug!("[{}] failed to reply on channel {:?}: {}", self.label, id, e);
            }
            return Ok(());
        };

        let decision = slot.on_request(&request);
        if let Some(ref m) = self.metrics {
            m.requests_total
                .with_label_values(&[kind.as_str(), decision.reply.as_str()])
                .inc();
        }

        let sent = match decision.reply {
            Reply::Success => session.channel_success(id),
            Reply::Failure => session.channel_failure(id),
        };
        if let Err(e) = sent {
            tracing::warn!(
                "[{}] failed to send {} reply to {} request on channel {:?}: {}",
                self.label,
                decision.reply.as_str(),
                kind,
                id,
                e
            );
            self.channels.remove(&id);
            return Ok(());
        }

        tracing::debug!(
            "[{}] {} request on channel {:?}: {}",
            self.label,
            kind,
            id,
            decision.reply.as_str()
        );

        if let Some(start) = decision.start {
            if start.send(()).is_err() {
                tracing::debug!("[{}] channel {:?} ended before the engine started", self.label, id);
            }
        }
        Ok(())
    }
}

/// Drains one channel's messages until its `sftp` subsystem request is
/// granted, then serves the channel's stream with the subsystem engine.
///
/// Replies are sent by the session handler. This task only keeps the
/// channel's queue moving so the session never stalls on an unclaimed
/// channel.
async fn run_channel<E: SubsystemEngine>(
    label: String,
    mut channel: Channel<Msg>,
    mut start: oneshot::Receiver<()>,
    subsystems: SubsystemServer<E>,
    handle: Handle,
) {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::RequestSubsystem { name, .. }) if name == SFTP_SUBSYSTEM => {
                if (&mut start).await.is_err() {
                    tracing::debug!("[{}] subsystem request not granted, channel dropped", label);
                    return;
                }
                break;
            }
            Some(msg) => tracing::trace!("[{}] drained {:?}", label, msg),
            None => {
                tracing::debug!("[{}] channel closed before a subsystem started", label);
                return;
            }
        }
    }

    let id = channel.id();
    let close_label = label.clone();
    let engine = subsystems.spawn(label.clone(), channel.into_stream(), move || async move {
        if handle.close(id).await.is_err() {
            tracing::debug!("[{}] channel already closed", close_label);
        }
    });
    match engine.await {
        Ok(termination) => {
            tracing::debug!("[{}] engine terminated: {}", label, termination.as_str())
        }
        Err(e) => tracing::warn!("[{}] engine task failed: {}", label, e),
    }
}

/// Rejection that keeps password authentication on offer.
fn reject_with_password() -> Auth {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);
    Auth::Reject {
        proceed_with_methods: Some(methods),
        partial_success: false,
    }
}

impl<E: SubsystemEngine> russh::server::Handler for SessionHandler<E> {
    type Error = ServerError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!("[{}] auth none for '{}'", self.label, user);
        Ok(reject_with_password())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.authenticator.verify(user, password) {
            Ok(()) => {
                tracing::info!("[{}] authenticated as '{}'", self.label, user);
                if let Some(ref m) = self.metrics {
                    m.auth_attempts_total.with_label_values(&["accepted"]).inc();
                }
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(e) => {
                self.auth_failures += 1;
                tracing::warn!(
                    "[{}] password rejected ({} so far): {}",
                    self.label,
                    self.auth_failures,
                    e
                );
                if let Some(ref m) = self.metrics {
                    m.auth_attempts_total.with_label_values(&["rejected"]).inc();
                }
                Ok(reject_with_password())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.offer(SESSION_CHANNEL, channel, session))
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.offer("x11", channel, session))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.offer("direct-tcpip", channel, session))
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, ChannelRequest::Subsystem(name), session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, ChannelRequest::Shell, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, ChannelRequest::Exec(data), session)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, ChannelRequest::Pty, session)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(
            channel,
            ChannelRequest::Env {
                name: variable_name,
            },
            session,
        )
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, ChannelRequest::X11, session)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, ChannelRequest::Other("window-change"), session)
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        _signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_request(channel, ChannelRequest::Other("signal"), session)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("[{}] refused tcpip-forward {}:{}", self.label, address, port);
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("[{}] refused cancel-tcpip-forward {}:{}", self.label, address, port);
        Ok(false)
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("[{}] eof on channel {:?}", self.label, channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channels.remove(&channel).is_some() {
            tracing::debug!("[{}] channel {:?} closed", self.label, channel);
        }
        Ok(())
    }
}

impl<E: SubsystemEngine> Drop for SessionHandler<E> {
    fn drop(&mut self) {
        tracing::info!(
            "[{}] session ended after {:.1}s (user: {})",
            self.label,
            self.started.elapsed().as_secs_f64(),
            self.user.as_deref().unwrap_or("-")
        );
    }
}
