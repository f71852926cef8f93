//! Protocol client abstraction
//!
//! The engine never speaks the wire protocol itself. Sessions are driven
//! through a [`ProtocolClient`], created fresh for every attempt by a
//! [`ClientFactory`].

use std::{fmt::Debug, net::IpAddr};

use async_trait::async_trait;
use courier_common::Domain;
use thiserror::Error;

use crate::{error::TransportError, types::MessageContent};

/// A reply from the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub message: String,
}

impl Response {
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Positive completion or positive intermediate (2xx or 3xx)
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }
}

/// A session could not be established
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SessionOpenError {
    /// Status code the remote host answered with, if it answered at all
    pub code: Option<u16>,
    pub message: String,
}

impl SessionOpenError {
    #[must_use]
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A step of the envelope exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStep<'a> {
    MailFrom(&'a str),
    RcptTo(&'a str),
}

impl EnvelopeStep<'_> {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MailFrom(_) => "mail_from",
            Self::RcptTo(_) => "rcpt_to",
        }
    }
}

/// One outbound protocol session
#[async_trait]
pub trait ProtocolClient: Send {
    /// Connect to `domain` from `source` and complete the greeting.
    async fn open_session(&mut self, domain: &Domain, source: IpAddr)
    -> Result<(), SessionOpenError>;

    /// Whether the session can still carry commands
    fn is_session_valid(&self) -> bool;

    async fn send_envelope_step(
        &mut self,
        step: EnvelopeStep<'_>,
    ) -> Result<Response, TransportError>;

    /// Transfer the message body to every accepted recipient.
    async fn send_payload(&mut self, content: &MessageContent) -> Result<Response, TransportError>;

    /// Abandon the current transaction but keep the session.
    async fn reset(&mut self) -> Result<Response, TransportError>;

    async fn close(&mut self);
}

/// Creates protocol clients
pub trait ClientFactory: Send + Sync + Debug {
    fn create(&self) -> Box<dyn ProtocolClient>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_responses() {
        assert!(Response::new(250, "OK").is_positive());
        assert!(Response::new(354, "Go ahead").is_positive());
        assert!(!Response::new(421, "Closing").is_positive());
        assert!(!Response::new(550, "No such user").is_positive());
        assert!(!Response::new(199, "").is_positive());
    }
}
