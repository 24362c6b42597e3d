//! Channel admission and in-band request filtering.
//!
//! Only interactive `session` channels are admitted, and on those only a
//! `subsystem` request naming `sftp` is answered with success. Each admitted
//! channel is tracked by a [`ChannelSlot`] that holds the handoff for the
//! channel's stream until the subsystem engine claims it, which happens at
//! most once.

/// The only channel type the server accepts.
pub const SESSION_CHANNEL: &str = "session";

/// Request type used to invoke a subsystem.
pub const SUBSYSTEM_REQUEST: &str = "subsystem";

/// The only subsystem the server provides.
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// Reason sent with every channel rejection.
pub const UNKNOWN_CHANNEL_TYPE: &str = "unknown channel type";

/// Decision for a channel offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAdmission {
    Accept,
    Reject { reason: &'static str },
}

impl ChannelAdmission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ChannelAdmission::Accept)
    }
}

/// Decides whether a channel of the given type is accepted.
pub fn admit_channel(channel_type: &str) -> ChannelAdmission {
    if channel_type == SESSION_CHANNEL {
        ChannelAdmission::Accept
    } else {
        ChannelAdmission::Reject {
            reason: UNKNOWN_CHANNEL_TYPE,
        }
    }
}

/// An in-band request received on an accepted channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest<'a> {
    Subsystem(&'a str),
    Shell,
    Exec(&'a [u8]),
    Pty,
    Env { name: &'a str },
    X11,
    Other(&'a str),
}

impl ChannelRequest<'_> {
    /// Returns the SSH request type string.
    pub fn kind(&self) -> &str {
        match self {
            ChannelRequest::Subsystem(_) => SUBSYSTEM_REQUEST,
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec(_) => "exec",
            ChannelRequest::Pty => "pty-req",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::X11 => "x11-req",
            ChannelRequest::Other(kind) => *kind,
        }
    }
}

/// Reply owed to an in-band request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success,
    Failure,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Success => "success",
            Reply::Failure => "failure",
        }
    }
}

/// Computes the reply for a request, independent of channel state.
pub fn reply_for(request: &ChannelRequest<'_>) -> Reply {
    match request {
        ChannelRequest::Subsystem(name) if *name == SFTP_SUBSYSTEM => Reply::Success,
        _ => Reply::Failure,
    }
}

/// Outcome of handling one request on a slot.
#[derive(Debug)]
pub struct RequestDecision<S> {
    /// Reply to send; exactly one per request.
    pub reply: Reply,
    /// Handoff to the subsystem engine, present at most once per slot.
    pub start: Option<S>,
}

/// Per-channel dispatch state.
#[derive(Debug)]
pub struct ChannelSlot<S> {
    stream: Option<S>,
    engine_started: bool,
    requests: u64,
}

impl<S> ChannelSlot<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            engine_started: false,
            requests: 0,
        }
    }

    /// Handles one request, releasing the stream on the first match.
    pub fn on_request(&mut self, request: &ChannelRequest<'_>) -> RequestDecision<S> {
        self.requests += 1;
        let reply = reply_for(request);
        let start = if reply.is_success() && !self.engine_started {
            self.engine_started = true;
            self.stream.take()
        } else {
            None
        };
        RequestDecision { reply, start }
    }

    /// Returns whether a subsystem engine has claimed this channel.
    pub fn engine_started(&self) -> bool {
        self.engine_started
    }

    /// Returns the number of requests handled so far.
    pub fn request_count(&self) -> u64 {
        self.requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_channel_accepted() {
        assert_eq!(admit_channel("session"), ChannelAdmission::Accept);
    }

    #[test]
    fn test_other_channels_rejected_with_reason() {
        for kind in ["exec", "x11", "direct-tcpip", "forwarded-tcpip", "Session", "", "session "] {
            let admission = admit_channel(kind);
            assert!(!admission.is_accepted(), "{} should be rejected", kind);
            assert_eq!(
                admission,
                ChannelAdmission::Reject {
                    reason: UNKNOWN_CHANNEL_TYPE
                }
            );
        }
    }

    #[test]
    fn test_only_sftp_subsystem_succeeds() {
        assert_eq!(reply_for(&ChannelRequest::Subsystem("sftp")), Reply::Success);

        assert_eq!(reply_for(&ChannelRequest::Subsystem("scp")), Reply::Failure);
        assert_eq!(reply_for(&ChannelRequest::Subsystem("SFTP")), Reply::Failure);
        assert_eq!(reply_for(&ChannelRequest::Subsystem("sftp ")), Reply::Failure);
        assert_eq!(reply_for(&ChannelRequest::Subsystem("")), Reply::Failure);
    }

    #[test]
    fn test_non_subsystem_requests_fail() {
        let requests = [
            ChannelRequest::Shell,
            ChannelRequest::Exec(b"sftp"),
            ChannelRequest::Pty,
            ChannelRequest::Env { name: "LANG" },
            ChannelRequest::X11,
            ChannelRequest::Other("sftp"),
        ];
        for request in &requests {
            assert_eq!(reply_for(request), Reply::Failure, "{:?}", request);
        }
    }

    #[test]
    fn test_terminal_requests_fail() {
        for kind in ["window-change", "signal", "break", "auth-agent-req@openssh.com"] {
            let request = ChannelRequest::Other(kind);
            assert_eq!(request.kind(), kind);
            assert_eq!(reply_for(&request), Reply::Failure, "{}", kind);
        }

        let mut slot = ChannelSlot::new(());
        let resize = slot.on_request(&ChannelRequest::Other("window-change"));
        assert_eq!(resize.reply, Reply::Failure);
        assert!(resize.start.is_none());
        assert!(!slot.engine_started());
    }

    #[test]
    fn test_request_kinds() {
        assert_eq!(ChannelRequest::Subsystem("sftp").kind(), "subsystem");
        assert_eq!(ChannelRequest::Shell.kind(), "shell");
        assert_eq!(ChannelRequest::Pty.kind(), "pty-req");
        assert_eq!(ChannelRequest::Other("keepalive@openssh.com").kind(), "keepalive@openssh.com");
    }

    #[test]
    fn test_slot_releases_stream_once() {
        let mut slot = ChannelSlot::new("stream");

        let first = slot.on_request(&ChannelRequest::Subsystem("sftp"));
        assert_eq!(first.reply, Reply::Success);
        assert_eq!(first.start, Some("stream"));
        assert!(slot.engine_started());

        let second = slot.on_request(&ChannelRequest::Subsystem("sftp"));
        assert_eq!(second.reply, Reply::Success);
        assert_eq!(second.start, None);

        assert_eq!(slot.request_count(), 2);
    }

    #[test]
    fn test_slot_failed_requests_keep_stream() {
        let mut slot = ChannelSlot::new(7u32);

        let shell = slot.on_request(&ChannelRequest::Shell);
        assert_eq!(shell.reply, Reply::Failure);
        assert!(shell.start.is_none());
        assert!(!slot.engine_started());

        let pty = slot.on_request(&ChannelRequest::Pty);
        assert_eq!(pty.reply, Reply::Failure);

        let sftp = slot.on_request(&ChannelRequest::Subsystem("sftp"));
        assert_eq!(sftp.reply, Reply::Success);
        assert_eq!(sftp.start, Some(7));
    }

    #[test]
    fn test_every_request_gets_one_reply() {
        let mut slot = ChannelSlot::new(());
        let requests = [
            ChannelRequest::Env { name: "TERM" },
            ChannelRequest::Subsystem("sftp"),
            ChannelRequest::Shell,
            ChannelRequest::Subsystem("sftp"),
            ChannelRequest::Subsystem("other"),
        ];
        let replies: Vec<Reply> = requests.iter().map(|r| slot.on_request(r).reply).collect();
        assert_eq!(
            replies,
            vec![
                Reply::Failure,
                Reply::Success,
                Reply::Failure,
                Reply::Success,
                Reply::Failure
            ]
        );
        assert_eq!(slot.request_count(), requests.len() as u64);
    }
}
