//! A scripted conversation socket for driving the session in tests.

use std::cmp;
use std::io as std_io;
use std::thread;

use futures::{task, Async, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::io::MockStream;

/// how many fruitless polls count as a stuck conversation
const STALL_LIMIT: usize = 10_000;

/// Who acts next in a scripted conversation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Actor {
    Server,
    Client,
}

/// One step of a scripted conversation.
#[derive(Debug, Clone)]
pub enum ActionData {
    /// CRLF terminated lines, server replies or expected client
    /// commands
    Lines(Vec<&'static str>),
    /// raw bytes
    Blob(Vec<u8>),
    /// an arbitrary client DATA payload up to and including the
    /// `CRLF.CRLF` end-of-data sequence
    Payload,
}

#[derive(Debug)]
enum Step {
    /// server bytes handed out by `read`
    Reply(Vec<u8>),
    /// client bytes `write` has to produce
    Expect(Vec<u8>),
    /// client bytes up to and including `CRLF.CRLF`
    ExpectPayload,
}

/// Socket whose reads and writes follow a fixed script.
///
/// Bytes the session writes are checked against the next client step,
/// a mismatch panics with both byte strings. Server steps become
/// readable once every client step before them was matched. Dropping
/// the socket asserts the script was fully played (see
/// [`new_no_check`](MockSocket::new_no_check)).
#[derive(Debug)]
pub struct MockSocket {
    script: Vec<Step>,
    written: Vec<u8>,
    secure: bool,
    check_script_played: bool,
    stalled_polls: usize,
}

impl MockSocket {
    pub fn new(conversation: Vec<(Actor, ActionData)>) -> Self {
        let script = conversation
            .into_iter()
            .map(|(actor, data)| match (actor, data) {
                (Actor::Server, ActionData::Lines(lines)) => Step::Reply(flatten_lines(&lines)),
                (Actor::Server, ActionData::Blob(bytes)) => Step::Reply(bytes),
                (Actor::Server, ActionData::Payload) => {
                    panic!("Payload is only valid as a client expectation")
                }
                (Actor::Client, ActionData::Lines(lines)) => Step::Expect(flatten_lines(&lines)),
                (Actor::Client, ActionData::Blob(bytes)) => Step::Expect(bytes),
                (Actor::Client, ActionData::Payload) => Step::ExpectPayload,
            })
            .collect();

        MockSocket {
            script,
            written: Vec::new(),
            secure: false,
            check_script_played: true,
            stalled_polls: 0,
        }
    }

    /// Like [`new`](MockSocket::new) but dropping the socket with
    /// unplayed steps left is fine.
    pub fn new_no_check(conversation: Vec<(Actor, ActionData)>) -> Self {
        let mut socket = MockSocket::new(conversation);
        socket.check_script_played = false;
        socket
    }

    /// Matches buffered client bytes against the leading client steps.
    fn match_written(&mut self) {
        loop {
            let matched = match self.script.first_mut() {
                Some(Step::Expect(ref expected)) => {
                    let common = cmp::min(expected.len(), self.written.len());
                    if self.written[..common] != expected[..common] {
                        panic!(
                            "client sent {:?}, the script expects {:?}",
                            String::from_utf8_lossy(&self.written),
                            String::from_utf8_lossy(expected)
                        );
                    }
                    if common < expected.len() {
                        // not everything arrived yet
                        false
                    } else {
                        self.written.drain(..common);
                        true
                    }
                }
                Some(Step::ExpectPayload) => {
                    match find_subslice(&self.written, b"\r\n.\r\n") {
                        Some(index) => {
                            self.written.drain(..index + 5);
                            true
                        }
                        None => false,
                    }
                }
                _ => false,
            };
            if !matched {
                return;
            }
            self.script.remove(0);
            self.stalled_polls = 0;
        }
    }

    fn stall(&mut self) -> std_io::Error {
        self.stalled_polls += 1;
        if self.stalled_polls > STALL_LIMIT {
            panic!(
                "mock conversation stalled, remaining script: {:?}, unmatched client bytes: {:?}",
                self.script,
                String::from_utf8_lossy(&self.written)
            );
        }
        // wake the task right up again, progress comes from the session
        task::current().notify();
        std_io::Error::new(std_io::ErrorKind::WouldBlock, "script waits for the client")
    }
}

impl std_io::Read for MockSocket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std_io::Error> {
        self.match_written();
        match self.script.first_mut() {
            Some(Step::Reply(ref mut bytes)) => {
                let n = cmp::min(buf.len(), bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                bytes.drain(..n);
                let drained = bytes.is_empty();
                if drained {
                    self.script.remove(0);
                }
                self.stalled_polls = 0;
                Ok(n)
            }
            Some(_) => Err(self.stall()),
            // conversation over, the server hangs up
            None => Ok(0),
        }
    }
}

impl std_io::Write for MockSocket {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std_io::Error> {
        self.written.extend_from_slice(buf);
        self.match_written();
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), std_io::Error> {
        Ok(())
    }
}

impl AsyncRead for MockSocket {}

impl AsyncWrite for MockSocket {
    fn shutdown(&mut self) -> Poll<(), std_io::Error> {
        Ok(Async::Ready(()))
    }
}

impl MockStream for MockSocket {
    fn is_secure(&self) -> bool {
        self.secure
    }

    fn set_is_secure(&mut self, secure: bool) {
        self.secure = secure;
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        if self.check_script_played && !thread::panicking() {
            assert!(
                self.script.is_empty(),
                "conversation script not fully played, remaining: {:?}",
                self.script
            );
            assert!(
                self.written.is_empty(),
                "unmatched client bytes: {:?}",
                String::from_utf8_lossy(&self.written)
            );
        }
    }
}

fn flatten_lines(lines: &[&str]) -> Vec<u8> {
    let mut flat = Vec::new();
    for line in lines {
        flat.extend_from_slice(line.as_bytes());
        flat.extend_from_slice(b"\r\n");
    }
    flat
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
