//! Connection handshakes.
//!
//! A handshake is the first exchange on every new connection: the client
//! sends one or more commands and validates each reply before any user
//! payload is allowed onto the wire. The connection manager drives the
//! exchange and tears the connection down on rejection.

use quartz_protocol::Reply;

/// Outcome of validating one handshake reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The reply is wrong; drop the connection.
    Invalid,

    /// The reply is fine, and the handshake has another command to send.
    ValidIncomplete,

    /// The reply is fine and the exchange is over; user traffic may flow.
    ValidComplete,
}

/// A pluggable first-contact exchange.
///
/// The manager calls [`provide_handshake`](Handshake::provide_handshake)
/// for the opening command, then [`validate_response`](Handshake::validate_response)
/// on each reply; `ValidIncomplete` means "call `provide_handshake` again
/// for the next round". [`restart`](Handshake::restart) rewinds internal
/// state when the connection is re-established.
pub trait Handshake: Send {
    /// The argv to send for the current round.
    fn provide_handshake(&mut self) -> Vec<Vec<u8>>;

    /// Validates the reply to the most recent round.
    fn validate_response(&mut self, reply: &Reply) -> HandshakeStatus;

    /// Resets to the first round; called before each reconnect.
    fn restart(&mut self);
}

/// Password (optionally user + password) authentication via `AUTH`,
/// expecting `+OK`.
pub struct AuthHandshake {
    user: Option<String>,
    password: String,
}

impl AuthHandshake {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            user: None,
            password: password.into(),
        }
    }

    pub fn with_user(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: password.into(),
        }
    }
}

impl Handshake for AuthHandshake {
    fn provide_handshake(&mut self) -> Vec<Vec<u8>> {
        let mut argv = vec![b"AUTH".to_vec()];
        if let Some(user) = &self.user {
            argv.push(user.clone().into_bytes());
        }
        argv.push(self.password.clone().into_bytes());
        argv
    }

    fn validate_response(&mut self, reply: &Reply) -> HandshakeStatus {
        match reply {
            Reply::Status(s) if s == "OK" => HandshakeStatus::ValidComplete,
            _ => HandshakeStatus::Invalid,
        }
    }

    fn restart(&mut self) {}
}
