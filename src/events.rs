//! Lifecycle notifications surfaced to the embedder.

use std::fmt::{self, Display};

/// Handle identifying a queued message, increasing from 1 in enqueue
/// order. Carried by every per-message notification.
pub type MessageId = u64;

/// Failure cause carried by [`SessionHandler::on_mail_failed`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FailureCode {
    /// client side precheck, the message had no recipients at all
    NoRecipients,
    /// the message could not be composed, e.g. an attachment source
    /// failed to read
    Local,
    /// the smtp status code the server answered with
    Code(u16),
}

impl Display for FailureCode {
    fn fmt(&self, fter: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FailureCode::NoRecipients => write!(fter, "no recipients"),
            FailureCode::Local => write!(fter, "local error"),
            FailureCode::Code(code) => write!(fter, "{}", code),
        }
    }
}

/// Observer for session lifecycle signals.
///
/// Every method defaults to doing nothing, implementors override the
/// ones they care about. The handler is owned by the session and called
/// from whatever task drives it; failure notifications carry the text
/// the server sent along.
pub trait SessionHandler {
    /// transport connected, the greeting has not arrived yet
    fn on_connected(&mut self) {}

    /// the TLS handshake succeeded, either on connect or via STARTTLS
    fn on_encrypted(&mut self) {}

    /// authentication succeeded or was skipped
    fn on_authenticated(&mut self) {}

    /// the server took the complete message
    fn on_mail_sent(&mut self, _id: MessageId) {}

    /// the message was dropped from the queue without being delivered
    fn on_mail_failed(&mut self, _id: MessageId, _code: FailureCode, _text: &str) {}

    /// MAIL FROM was refused
    fn on_sender_rejected(&mut self, _id: MessageId, _sender: &str, _text: &str) {}

    /// one RCPT TO was refused; delivery continues for the accepted
    /// recipients
    fn on_recipient_rejected(&mut self, _id: MessageId, _recipient: &str, _text: &str) {}

    /// connecting failed, the greeting was bad, or the link broke
    fn on_connection_failed(&mut self, _text: &str) {}

    /// the TLS handshake failed
    fn on_encryption_failed(&mut self, _text: &str) {}

    /// the server refused the credentials, or no shared mechanism
    /// was left while credentials were configured
    fn on_authentication_failed(&mut self, _text: &str) {}

    /// the queue drained, the session sits idle
    fn on_finished(&mut self) {}

    /// the transport is gone; queued mail stays queued
    fn on_disconnected(&mut self) {}
}

/// The silent handler.
impl SessionHandler for () {}

/// One handler call in owned form.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    Connected,
    Encrypted,
    Authenticated,
    MailSent(MessageId),
    MailFailed(MessageId, FailureCode, String),
    SenderRejected(MessageId, String, String),
    RecipientRejected(MessageId, String, String),
    ConnectionFailed(String),
    EncryptionFailed(String),
    AuthenticationFailed(String),
    Finished,
    Disconnected,
}

/// Handler recording every event in order.
///
/// Mostly useful for tests and simple embeddings that inspect the
/// outcome after driving the session.
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Default::default()
    }
}

impl SessionHandler for EventLog {
    fn on_connected(&mut self) {
        self.events.push(Event::Connected);
    }

    fn on_encrypted(&mut self) {
        self.events.push(Event::Encrypted);
    }

    fn on_authenticated(&mut self) {
        self.events.push(Event::Authenticated);
    }

    fn on_mail_sent(&mut self, id: MessageId) {
        self.events.push(Event::MailSent(id));
    }

    fn on_mail_failed(&mut self, id: MessageId, code: FailureCode, text: &str) {
        self.events.push(Event::MailFailed(id, code, text.to_owned()));
    }

    fn on_sender_rejected(&mut self, id: MessageId, sender: &str, text: &str) {
        self.events
            .push(Event::SenderRejected(id, sender.to_owned(), text.to_owned()));
    }

    fn on_recipient_rejected(&mut self, id: MessageId, recipient: &str, text: &str) {
        self.events.push(Event::RecipientRejected(
            id,
            recipient.to_owned(),
            text.to_owned(),
        ));
    }

    fn on_connection_failed(&mut self, text: &str) {
        self.events.push(Event::ConnectionFailed(text.to_owned()));
    }

    fn on_encryption_failed(&mut self, text: &str) {
        self.events.push(Event::EncryptionFailed(text.to_owned()));
    }

    fn on_authentication_failed(&mut self, text: &str) {
        self.events
            .push(Event::AuthenticationFailed(text.to_owned()));
    }

    fn on_finished(&mut self) {
        self.events.push(Event::Finished);
    }

    fn on_disconnected(&mut self) {
        self.events.push(Event::Disconnected);
    }
}
