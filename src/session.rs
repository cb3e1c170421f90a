//! The protocol state machine: connection setup, EHLO/STARTTLS/AUTH,
//! the per-message envelope dialog and the pending queue.

use std::collections::{HashMap, VecDeque};
use std::io as std_io;
use std::mem;

use futures::{Async, Future, Poll};
use tokio::net::tcp::ConnectFuture;
use tokio::net::TcpStream;
use tokio_tls::TlsStream;

use crate::auth::{self, AuthKind, AuthSet};
use crate::events::{FailureCode, MessageId, SessionHandler};
use crate::io::{connect_tcp, resolve, start_handshake, Handshake, ReadState, Socket, Transport};
use crate::message::Message;
use crate::mime;
use crate::response::parser::ResponseParser;
use crate::response::Response;

/// Identity announced in EHLO.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ClientId {
    Domain(String),
    /// rendered inside brackets, e.g. `[127.0.0.1]`
    AddressLiteral(String),
}

impl ClientId {
    /// The local hostname, falling back to the loopback address
    /// literal when it cannot be determined.
    pub fn hostname() -> Self {
        match hostname::get_hostname() {
            Some(name) => ClientId::Domain(name),
            None => ClientId::AddressLiteral("127.0.0.1".to_owned()),
        }
    }
}

impl Default for ClientId {
    fn default() -> Self {
        ClientId::hostname()
    }
}

/// Protocol position of the session, drives reply dispatch.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// connected, awaiting the greeting
    Start,
    EhloSent,
    EhloDone,
    HeloSent,
    StartTlsSent,
    AuthRequestSent,
    AuthUsernameSent,
    AuthSent,
    Authenticated,
    /// idle between mail transactions
    Waiting,
    MailFromSent,
    RcptSent,
    /// pipelined, all RCPT lines are out and only acks are counted
    RcptAckPending,
    SendingBody,
    BodySent,
    Resetting,
    Quitting,
}

/// The extension table negotiated via EHLO.
///
/// Names are stored uppercased, the rest of the line is the value.
/// Rebuilt from scratch on every EHLO.
#[derive(Debug, Default)]
pub struct Extensions {
    map: HashMap<String, String>,
}

impl Extensions {
    fn clear(&mut self) {
        self.map.clear();
    }

    fn insert(&mut self, name: String, value: String) {
        self.map.insert(name, value);
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(&name.to_uppercase())
    }

    pub fn data(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_uppercase()).map(String::as_str)
    }
}

/// whether a TLS handshake happened on connect or mid-session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HandshakeKind {
    OnConnect,
    StartTls,
}

enum Link {
    Down,
    Connecting(ConnectFuture),
    Handshaking(HandshakeKind, Handshake),
    Up(Transport),
    /// flushing leftover output, then shutting the socket down
    Closing(Transport),
}

/// What to do with the link after a reply was handled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Next {
    Continue,
    /// STARTTLS was accepted, swap the socket for a TLS one
    Upgrade,
    Close,
}

/// One step of the drive loop.
enum Op {
    NotReady,
    /// the session is idle (or was never connected), resolve
    Done,
    Progress,
    Connected(TcpStream),
    ConnectFailed(String),
    Encrypted(HandshakeKind, TlsStream<TcpStream>),
    HandshakeFailed(String),
    Upgrade,
    Close,
    Closed,
    Eof,
    Broken(String),
}

/// An smtp client session delivering a queue of messages.
///
/// Messages are enqueued with [`send`](Session::send) and delivered in
/// order once the connection is authenticated; outcomes surface
/// through the [`SessionHandler`] the session owns. The session is
/// single-threaded, it is driven by polling the future returned from
/// [`drive`](Session::drive).
pub struct Session<H: SessionHandler> {
    link: Link,
    tls_on_connect: bool,
    sni_domain: String,
    core: Core<H>,
}

struct Core<H> {
    handler: H,
    state: SessionState,
    parser: ResponseParser,
    extensions: Extensions,
    pending: VecDeque<(MessageId, Message)>,
    next_id: MessageId,
    /// merged To/Cc/Bcc of the message currently in transaction
    recipients: Vec<String>,
    rcpt_number: usize,
    rcpt_ack: usize,
    mail_ack: bool,
    /// MAIL FROM was refused; code and text of that reply, kept while
    /// pipelined RCPT replies are still being counted
    sender_rejection: Option<(u16, String)>,
    /// message rendered ahead of the DATA command
    body_buffer: Option<Vec<u8>>,
    auth_kind: Option<AuthKind>,
    allowed_auth: AuthSet,
    username: String,
    password: String,
    client_id: ClientId,
    disable_starttls: bool,
}

impl<H: SessionHandler> Session<H> {
    pub fn new(handler: H) -> Self {
        Session {
            link: Link::Down,
            tls_on_connect: false,
            sni_domain: String::new(),
            core: Core {
                handler,
                state: SessionState::Disconnected,
                parser: ResponseParser::new(),
                extensions: Extensions::default(),
                pending: VecDeque::new(),
                next_id: 0,
                recipients: Vec::new(),
                rcpt_number: 0,
                rcpt_ack: 0,
                mail_ack: false,
                sender_rejection: None,
                body_buffer: None,
                auth_kind: None,
                allowed_auth: AuthSet::default(),
                username: String::new(),
                password: String::new(),
                client_id: ClientId::hostname(),
                disable_starttls: false,
            },
        }
    }

    /// Session over an already established socket awaiting the
    /// greeting; `on_connected` fires immediately.
    pub fn with_transport(handler: H, socket: Socket) -> Self {
        let mut session = Session::new(handler);
        session.link = Link::Up(Transport::new(socket));
        session.core.state = SessionState::Start;
        session.core.handler.on_connected();
        session
    }

    /// Opens a plain TCP connection; STARTTLS may upgrade it later.
    ///
    /// Name resolution happens right here, connecting itself once the
    /// session is driven.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), std_io::Error> {
        self.connect_with(host, port, false)
    }

    /// Opens a connection that is TLS wrapped before any bytes flow.
    pub fn connect_secure(&mut self, host: &str, port: u16) -> Result<(), std_io::Error> {
        self.connect_with(host, port, true)
    }

    fn connect_with(
        &mut self,
        host: &str,
        port: u16,
        tls_on_connect: bool,
    ) -> Result<(), std_io::Error> {
        let addr = resolve((host, port))?;
        self.sni_domain = host.to_owned();
        self.tls_on_connect = tls_on_connect;
        self.core.state = SessionState::Connecting;
        self.link = Link::Connecting(connect_tcp(&addr));
        Ok(())
    }

    /// Queues a message and returns its id.
    ///
    /// An idle session starts the next transaction immediately, the
    /// command goes out on the next drive.
    pub fn send(&mut self, message: Message) -> MessageId {
        self.core.next_id += 1;
        let id = self.core.next_id;
        self.core.pending.push_back((id, message));
        if self.core.state == SessionState::Waiting {
            if let Link::Up(ref mut transport) = self.link {
                self.core.send_next(transport);
            }
        }
        id
    }

    pub fn pending_count(&self) -> usize {
        self.core.pending.len()
    }

    pub fn state(&self) -> SessionState {
        self.core.state
    }

    pub fn is_secure(&self) -> bool {
        match self.link {
            Link::Up(ref transport) | Link::Closing(ref transport) => transport.is_secure(),
            _ => false,
        }
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.core.extensions.has(name)
    }

    pub fn extension_data(&self, name: &str) -> Option<&str> {
        self.core.extensions.data(name)
    }

    pub fn set_username<I: Into<String>>(&mut self, username: I) {
        self.core.username = username.into();
    }

    pub fn set_password<I: Into<String>>(&mut self, password: I) {
        self.core.password = password.into();
    }

    /// Overrides the identity announced in EHLO (default: hostname).
    pub fn set_client_id(&mut self, client_id: ClientId) {
        self.core.client_id = client_id;
    }

    /// Never issue STARTTLS, even when the server advertises it.
    pub fn set_start_tls_disabled(&mut self, disable: bool) {
        self.core.disable_starttls = disable;
    }

    pub fn start_tls_disabled(&self) -> bool {
        self.core.disable_starttls
    }

    pub fn set_auth_enabled(&mut self, kind: AuthKind, enabled: bool) {
        self.core.allowed_auth.set(kind, enabled);
    }

    pub fn is_auth_enabled(&self, kind: AuthKind) -> bool {
        self.core.allowed_auth.contains(kind)
    }

    pub fn handler(&self) -> &H {
        &self.core.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.core.handler
    }

    /// Writes QUIT and closes the connection once it is flushed.
    pub fn quit(&mut self) {
        if let Link::Up(ref mut transport) = self.link {
            transport.write_line(&["QUIT"]);
            self.core.state = SessionState::Quitting;
        }
    }

    /// Drops the connection immediately.
    ///
    /// Queued messages stay queued and no per-message events fire for
    /// them, the embedder decides about retries.
    pub fn disconnect(&mut self) {
        let had_link = !matches!(self.link, Link::Down);
        self.link = Link::Down;
        self.core.state = SessionState::Disconnected;
        if had_link {
            self.core.handler.on_disconnected();
        }
    }

    /// Runs the session until it is idle or disconnected, resolving
    /// back to the session.
    pub fn drive(self) -> Driving<H> {
        Driving {
            session: Some(self),
        }
    }

    fn poll_step(&mut self) -> Poll<(), std_io::Error> {
        loop {
            let op = match self.link {
                Link::Down => Op::Done,
                Link::Connecting(ref mut fut) => match fut.poll() {
                    Ok(Async::NotReady) => Op::NotReady,
                    Ok(Async::Ready(stream)) => Op::Connected(stream),
                    Err(err) => Op::ConnectFailed(err.to_string()),
                },
                Link::Handshaking(kind, ref mut fut) => match fut.poll() {
                    Ok(Async::NotReady) => Op::NotReady,
                    Ok(Async::Ready(stream)) => Op::Encrypted(kind, stream),
                    Err(err) => Op::HandshakeFailed(err.to_string()),
                },
                Link::Closing(ref mut transport) => {
                    // best effort, leftover output is not worth an error
                    let _ = transport.poll_flush();
                    match transport.poll_shutdown() {
                        Ok(Async::NotReady) => Op::NotReady,
                        _ => Op::Closed,
                    }
                }
                Link::Up(ref mut transport) => self.core.poll_up(transport),
            };

            match op {
                Op::NotReady => return Ok(Async::NotReady),
                Op::Done => return Ok(Async::Ready(())),
                Op::Progress => (),
                Op::Connected(stream) => {
                    self.core.handler.on_connected();
                    if self.tls_on_connect {
                        match start_handshake(&self.sni_domain, stream) {
                            Ok(handshake) => {
                                self.link = Link::Handshaking(HandshakeKind::OnConnect, handshake);
                            }
                            Err(err) => return Ok(self.fail_encryption(&err.to_string())),
                        }
                    } else {
                        self.link = Link::Up(Transport::new(Socket::Insecure(stream)));
                        self.core.state = SessionState::Start;
                    }
                }
                Op::ConnectFailed(text) => {
                    self.core.handler.on_connection_failed(&text);
                    self.link = Link::Down;
                    self.core.state = SessionState::Disconnected;
                    return Ok(Async::Ready(()));
                }
                Op::Encrypted(kind, stream) => {
                    let mut transport = Transport::new(Socket::Secure(stream));
                    self.core.handler.on_encrypted();
                    match kind {
                        HandshakeKind::OnConnect => self.core.state = SessionState::Start,
                        HandshakeKind::StartTls => self.core.ehlo(&mut transport),
                    }
                    self.link = Link::Up(transport);
                }
                Op::HandshakeFailed(text) => return Ok(self.fail_encryption(&text)),
                Op::Upgrade => {
                    let link = mem::replace(&mut self.link, Link::Down);
                    let transport = match link {
                        Link::Up(transport) => transport,
                        _ => unreachable!("upgrade without a live transport"),
                    };
                    match transport.into_socket() {
                        Socket::Insecure(stream) => {
                            match start_handshake(&self.sni_domain, stream) {
                                Ok(handshake) => {
                                    self.link =
                                        Link::Handshaking(HandshakeKind::StartTls, handshake);
                                }
                                Err(err) => return Ok(self.fail_encryption(&err.to_string())),
                            }
                        }
                        #[cfg(any(test, feature = "mock-support"))]
                        Socket::Mock(mut mock) => {
                            mock.set_is_secure(true);
                            let mut transport = Transport::new(Socket::Mock(mock));
                            self.core.handler.on_encrypted();
                            self.core.ehlo(&mut transport);
                            self.link = Link::Up(transport);
                        }
                        Socket::Secure(_) => unreachable!("STARTTLS on an encrypted socket"),
                    }
                }
                Op::Close => {
                    let link = mem::replace(&mut self.link, Link::Down);
                    if let Link::Up(transport) = link {
                        self.link = Link::Closing(transport);
                    }
                }
                Op::Closed => {
                    self.link = Link::Down;
                    self.core.state = SessionState::Disconnected;
                    self.core.handler.on_disconnected();
                    return Ok(Async::Ready(()));
                }
                Op::Eof => {
                    self.core
                        .handler
                        .on_connection_failed("connection closed by server");
                    self.link = Link::Down;
                    self.core.state = SessionState::Disconnected;
                    self.core.handler.on_disconnected();
                    return Ok(Async::Ready(()));
                }
                Op::Broken(text) => {
                    self.core.handler.on_connection_failed(&text);
                    self.link = Link::Down;
                    self.core.state = SessionState::Disconnected;
                    self.core.handler.on_disconnected();
                    return Ok(Async::Ready(()));
                }
            }
        }
    }

    fn fail_encryption(&mut self, text: &str) -> Async<()> {
        self.core.handler.on_encryption_failed(text);
        self.link = Link::Down;
        self.core.state = SessionState::Disconnected;
        Async::Ready(())
    }
}

/// Future running a session until it is idle or the link is gone.
///
/// Resolves back to the session so further mail can be queued or
/// [`quit`](Session::quit) can be issued.
#[must_use = "futures do nothing unless polled"]
pub struct Driving<H: SessionHandler> {
    session: Option<Session<H>>,
}

impl<H: SessionHandler> Future for Driving<H> {
    type Item = Session<H>;
    type Error = std_io::Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        {
            let session = self.session.as_mut().expect("poll after completion");
            try_ready!(session.poll_step());
        }
        Ok(Async::Ready(
            self.session.take().expect("poll after completion"),
        ))
    }
}

impl<H: SessionHandler> Core<H> {
    /// One round on a live transport: flush, read, parse, dispatch.
    fn poll_up(&mut self, transport: &mut Transport) -> Op {
        match transport.poll_flush() {
            Ok(Async::NotReady) => return Op::NotReady,
            Ok(Async::Ready(())) => (),
            Err(err) => return Op::Broken(err.to_string()),
        }
        if self.state == SessionState::Quitting {
            return Op::Close;
        }
        if self.state == SessionState::Waiting && self.pending.is_empty() {
            return Op::Done;
        }
        let read = match transport.read_to_buffer() {
            Ok(state) => state,
            Err(err) => return Op::Broken(err.to_string()),
        };
        let data = transport.take_input();
        if data.is_empty() {
            return match read {
                ReadState::SocketClosed => Op::Eof,
                ReadState::NotReady => Op::NotReady,
            };
        }
        if let Err(err) = self.parser.feed(&data) {
            #[cfg(feature = "log")]
            log_facade::debug!("S: unparsable reply: {}", err);
            self.handler.on_connection_failed("response parse error");
            return Op::Close;
        }
        let mut next = Next::Continue;
        while let Some(response) = self.parser.take() {
            next = self.handle_response(transport, &response);
            if next != Next::Continue {
                break;
            }
        }
        match next {
            Next::Continue => Op::Progress,
            Next::Upgrade => Op::Upgrade,
            Next::Close => Op::Close,
        }
    }

    fn handle_response(&mut self, transport: &mut Transport, response: &Response) -> Next {
        #[cfg(feature = "log")]
        log_facade::trace!("S: {} {:?}", response.code(), response.joined());
        use self::SessionState::*;
        match self.state {
            Start => {
                if response.is_positive() {
                    self.ehlo(transport);
                    Next::Continue
                } else {
                    let text = response
                        .lines()
                        .first()
                        .map(String::as_str)
                        .unwrap_or("")
                        .to_owned();
                    self.handler.on_connection_failed(&text);
                    Next::Close
                }
            }
            EhloSent | HeloSent => self.parse_ehlo(transport, response),
            StartTlsSent => {
                if response.code() == 220 {
                    Next::Upgrade
                } else {
                    // no TLS then, proceed unencrypted
                    self.authenticate(transport)
                }
            }
            AuthRequestSent | AuthUsernameSent => self.auth_continue(transport, response),
            AuthSent => {
                if response.is_positive() {
                    self.state = Authenticated;
                    self.handler.on_authenticated();
                    self.send_next(transport);
                    Next::Continue
                } else {
                    self.handler.on_authentication_failed(&response.joined());
                    Next::Close
                }
            }
            MailFromSent | RcptSent | RcptAckPending => {
                self.envelope_reply(transport, response);
                Next::Continue
            }
            SendingBody => {
                self.body_go_ahead(transport, response);
                Next::Continue
            }
            BodySent => {
                self.body_reply(transport, response);
                Next::Continue
            }
            Resetting => {
                if response.is_positive() {
                    self.state = Waiting;
                    self.send_next(transport);
                    Next::Continue
                } else {
                    self.handler.on_connection_failed(&response.joined());
                    Next::Close
                }
            }
            _ => Next::Continue,
        }
    }

    fn ehlo(&mut self, transport: &mut Transport) {
        let identity = match self.client_id {
            ClientId::Domain(ref domain) => domain.clone(),
            ClientId::AddressLiteral(ref addr) => format!("[{}]", addr),
        };
        transport.write_line(&["EHLO ", &identity]);
        self.extensions.clear();
        self.state = SessionState::EhloSent;
    }

    fn parse_ehlo(&mut self, transport: &mut Transport, response: &Response) -> Next {
        if response.code() != 250 {
            if self.state != SessionState::HeloSent {
                // legacy fallback, deliberately without the domain
                // argument RFC 5321 asks for
                transport.write_line(&["HELO"]);
                self.state = SessionState::HeloSent;
                return Next::Continue;
            }
            transport.write_line(&["QUIT"]);
            return Next::Close;
        }
        self.state = SessionState::EhloDone;
        if response.domain().is_empty() {
            transport.write_line(&["QUIT"]);
            return Next::Close;
        }
        for line in response.lines().iter().skip(1) {
            let mut parts = line.splitn(2, ' ');
            let name = match parts.next() {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };
            let value = parts.next().unwrap_or("").to_owned();
            self.extensions.insert(name.to_uppercase(), value);
        }
        self.parser.set_pipelining(self.extensions.has("PIPELINING"));
        if self.extensions.has("STARTTLS") && !self.disable_starttls && !transport.is_secure() {
            transport.write_line(&["starttls"]);
            self.state = SessionState::StartTlsSent;
            Next::Continue
        } else {
            self.authenticate(transport)
        }
    }

    fn authenticate(&mut self, transport: &mut Transport) -> Next {
        let have_credentials = !self.username.is_empty() && !self.password.is_empty();
        if !self.extensions.has("AUTH") || !have_credentials {
            self.state = SessionState::Authenticated;
            self.handler.on_authenticated();
            self.send_next(transport);
            return Next::Continue;
        }
        let advertised = self
            .extensions
            .data("AUTH")
            .unwrap_or("")
            .to_uppercase();
        let chosen = [AuthKind::CramMd5, AuthKind::Plain, AuthKind::Login]
            .iter()
            .cloned()
            .find(|&kind| {
                self.allowed_auth.contains(kind)
                    && advertised.split_whitespace().any(|name| name == kind.name())
            });
        match chosen {
            Some(kind) => {
                let command = match kind {
                    AuthKind::Plain => "auth plain",
                    AuthKind::Login => "auth login",
                    AuthKind::CramMd5 => "auth cram-md5",
                };
                transport.write_line(&[command]);
                self.auth_kind = Some(kind);
                self.state = SessionState::AuthRequestSent;
                Next::Continue
            }
            None => {
                self.handler
                    .on_authentication_failed("no mutually supported authentication mechanism");
                Next::Close
            }
        }
    }

    fn auth_continue(&mut self, transport: &mut Transport, response: &Response) -> Next {
        if !response.is_intermediate() {
            self.handler.on_authentication_failed(&response.joined());
            return Next::Close;
        }
        match self.auth_kind {
            Some(AuthKind::Plain) => {
                let payload = auth::plain_payload(&self.username, &self.password);
                transport.write_secret_line(&[&payload]);
                self.state = SessionState::AuthSent;
            }
            Some(AuthKind::Login) => {
                if self.state == SessionState::AuthRequestSent {
                    transport.write_secret_line(&[&auth::login_username(&self.username)]);
                    self.state = SessionState::AuthUsernameSent;
                } else {
                    transport.write_secret_line(&[&auth::login_password(&self.password)]);
                    self.state = SessionState::AuthSent;
                }
            }
            Some(AuthKind::CramMd5) => {
                match auth::cram_md5_payload(&self.username, &self.password, &response.joined()) {
                    Ok(payload) => {
                        transport.write_secret_line(&[&payload]);
                        self.state = SessionState::AuthSent;
                    }
                    Err(_) => {
                        self.handler
                            .on_authentication_failed("malformed cram-md5 challenge");
                        return Next::Close;
                    }
                }
            }
            None => return Next::Close,
        }
        Next::Continue
    }

    /// Starts the next queued transaction, or reports an idle queue.
    fn send_next(&mut self, transport: &mut Transport) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if self.pending.is_empty() {
            self.state = SessionState::Waiting;
            self.handler.on_finished();
            return;
        }
        if self.state != SessionState::Waiting && self.state != SessionState::Authenticated {
            transport.write_line(&["rset"]);
            self.state = SessionState::Resetting;
            return;
        }
        let (id, sender, recipients) = match self.pending.front() {
            Some(&(id, ref message)) => (
                id,
                message.sender().to_owned(),
                message.envelope_recipients(),
            ),
            None => return,
        };
        self.rcpt_number = 0;
        self.rcpt_ack = 0;
        self.mail_ack = false;
        self.sender_rejection = None;
        self.recipients = recipients;
        if self.recipients.is_empty() {
            self.handler
                .on_mail_failed(id, FailureCode::NoRecipients, "e-mail has no recipients");
            self.pending.pop_front();
            self.send_next(transport);
            return;
        }
        // lowercased verbs: gmail used to read a leading uppercase R
        // after a TLS renegotiation as another renegotiation request
        transport.write_line(&["mail from:<", mime::extract_address(&sender), ">"]);
        if self.extensions.has("PIPELINING") {
            for recipient in &self.recipients {
                transport.write_line(&["rcpt to:<", mime::extract_address(recipient), ">"]);
            }
            self.state = SessionState::RcptAckPending;
        } else {
            self.state = SessionState::MailFromSent;
        }
    }

    /// Accounts one reply of the MAIL FROM / RCPT TO dialog.
    fn envelope_reply(&mut self, transport: &mut Transport, response: &Response) {
        let (id, sender) = match self.pending.front() {
            Some(&(id, ref message)) => (id, message.sender().to_owned()),
            None => return,
        };
        if !response.is_positive() {
            if !self.mail_ack && self.rcpt_number == 0 {
                self.handler
                    .on_sender_rejected(id, &sender, &response.joined());
                if self.state != SessionState::RcptAckPending {
                    // nothing else is in flight, abandon right away
                    self.fail_head(transport, id, response.code(), &response.joined());
                    return;
                }
                // pipelined RCPT replies are still inbound, remember
                // the refusal and keep counting them until the reset
                // can go out
                self.sender_rejection = Some((response.code(), response.joined()));
            } else {
                let rejected = self
                    .recipients
                    .get(self.rcpt_number.saturating_sub(1))
                    .map(String::as_str)
                    .unwrap_or("");
                self.handler
                    .on_recipient_rejected(id, rejected, &response.joined());
            }
        } else if !self.mail_ack && self.sender_rejection.is_none() {
            self.mail_ack = true;
        } else {
            self.rcpt_ack += 1;
        }

        if self.rcpt_number == self.recipients.len() {
            // every reply of the envelope is accounted for
            if let Some((code, text)) = self.sender_rejection.take() {
                // the transaction died with MAIL FROM, no matter how
                // many RCPTs the server acknowledged afterwards
                self.fail_head(transport, id, code, &text);
            } else if self.rcpt_ack == 0 {
                self.fail_head(transport, id, response.code(), &response.joined());
            } else {
                let allow_8bit = self.extensions.has("8BITMIME");
                let rendered = match self.pending.front_mut() {
                    Some(&mut (_, ref mut message)) => message.render(allow_8bit),
                    None => return,
                };
                match rendered {
                    Ok(data) => {
                        self.body_buffer = Some(data);
                        transport.write_line(&["data"]);
                        self.state = SessionState::SendingBody;
                    }
                    Err(err) => {
                        self.handler
                            .on_mail_failed(id, FailureCode::Local, &err.to_string());
                        self.pending.pop_front();
                        transport.write_line(&["rset"]);
                        self.state = SessionState::Resetting;
                    }
                }
            }
        } else if self.state != SessionState::RcptAckPending {
            let recipient = self.recipients[self.rcpt_number].clone();
            transport.write_line(&["rcpt to:<", mime::extract_address(&recipient), ">"]);
            self.rcpt_number += 1;
            self.state = SessionState::RcptSent;
        } else {
            self.rcpt_number += 1;
        }
    }

    /// Drops the head message after an envelope failure and resets the
    /// transaction.
    fn fail_head(&mut self, transport: &mut Transport, id: MessageId, code: u16, text: &str) {
        self.handler
            .on_mail_failed(id, FailureCode::Code(code), text);
        self.pending.pop_front();
        transport.write_line(&["rset"]);
        self.state = SessionState::Resetting;
    }

    fn body_go_ahead(&mut self, transport: &mut Transport, response: &Response) {
        let id = match self.pending.front() {
            Some(&(id, _)) => id,
            None => return,
        };
        if response.code() != 354 {
            self.body_buffer = None;
            self.handler
                .on_mail_failed(id, FailureCode::Code(response.code()), &response.joined());
            self.pending.pop_front();
            self.send_next(transport);
            return;
        }
        let data = self.body_buffer.take().unwrap_or_default();
        transport.write_stashed(&data);
        self.state = SessionState::BodySent;
    }

    fn body_reply(&mut self, transport: &mut Transport, response: &Response) {
        if let Some(&(id, _)) = self.pending.front() {
            if response.is_positive() {
                self.handler.on_mail_sent(id);
            } else {
                self.handler
                    .on_mail_failed(id, FailureCode::Code(response.code()), &response.joined());
            }
            self.pending.pop_front();
        }
        self.send_next(transport);
    }
}
