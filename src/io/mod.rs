//! The transport layer: socket abstraction plus the buffered reading
//! and writing the session runs on.

use std::io as std_io;

use bytes::{BufMut, BytesMut};
use futures::{Async, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

mod connect;
pub use self::connect::*;
mod socket;
pub use self::socket::*;
mod stash;

// replies and commands are small, DATA payloads reserve exactly
const INPUT_BUFFER_INC: usize = 256;
const OUTPUT_BUFFER_INC: usize = 1024;

/// Hint whether a read drained the socket or hit its end.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ReadState {
    /// the peer closed the connection
    SocketClosed,
    /// everything available was read, the task is registered for more
    NotReady,
}

/// A socket coupled with its input and output buffers.
///
/// Protocol code appends commands to the output buffer and calls
/// [`poll_flush`](Transport::poll_flush) until it drains; received
/// bytes collect in the input buffer until
/// [`take_input`](Transport::take_input) hands them to the response
/// parser.
#[derive(Debug)]
pub struct Transport {
    socket: Socket,
    input: BytesMut,
    output: BytesMut,
}

impl Transport {
    pub fn new(socket: Socket) -> Self {
        Transport {
            socket,
            input: BytesMut::new(),
            output: BytesMut::new(),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.socket.is_secure()
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    pub fn into_socket(self) -> Socket {
        self.socket
    }

    pub(crate) fn out_buffer(&mut self, need: usize) -> &mut BytesMut {
        reserve_in_steps(&mut self.output, need, OUTPUT_BUFFER_INC);
        &mut self.output
    }

    /// Appends `parts` as one command line terminated by CRLF.
    pub fn write_line(&mut self, parts: &[&str]) {
        #[cfg(feature = "log")]
        log_facade::trace!("C: {}", parts.concat());
        self.write_line_unlogged(parts);
    }

    /// Like [`write_line`](Transport::write_line), but only a
    /// placeholder reaches the log.
    pub fn write_secret_line(&mut self, parts: &[&str]) {
        #[cfg(feature = "log")]
        log_facade::trace!("C: <credentials redacted>");
        self.write_line_unlogged(parts);
    }

    fn write_line_unlogged(&mut self, parts: &[&str]) {
        let len = parts.iter().map(|part| part.len()).sum::<usize>() + 2;
        let out = self.out_buffer(len);
        for part in parts {
            out.put(*part);
        }
        out.put("\r\n");
    }

    /// Writes buffered output to the socket until the buffer is empty,
    /// then flushes the socket itself.
    pub fn poll_flush(&mut self) -> Poll<(), std_io::Error> {
        let output = &mut self.output;
        let socket = &mut self.socket;
        while !output.is_empty() {
            let n = try_ready!(socket.poll_write(output));
            // a write of 0 with a non-empty buffer would loop forever
            assert!(n > 0);
            output.advance(n);
        }
        try_ready!(socket.poll_flush());
        Ok(Async::Ready(()))
    }

    /// Reads everything currently available into the input buffer.
    ///
    /// The buffer grows in `INPUT_BUFFER_INC` steps, replies are
    /// expected to stay small.
    pub fn read_to_buffer(&mut self) -> Result<ReadState, std_io::Error> {
        loop {
            if self.input.remaining_mut() == 0 {
                self.input.reserve(INPUT_BUFFER_INC);
            }
            match self.socket.read_buf(&mut self.input) {
                Ok(Async::NotReady) => return Ok(ReadState::NotReady),
                Ok(Async::Ready(0)) => return Ok(ReadState::SocketClosed),
                Ok(Async::Ready(_)) => (),
                Err(err) => return Err(err),
            }
        }
    }

    /// Hands out the received bytes, leaving the input buffer empty.
    pub fn take_input(&mut self) -> BytesMut {
        self.input.take()
    }

    pub fn poll_shutdown(&mut self) -> Poll<(), std_io::Error> {
        AsyncWrite::shutdown(&mut self.socket)
    }
}

impl From<Socket> for Transport {
    fn from(socket: Socket) -> Self {
        Transport::new(socket)
    }
}

fn reserve_in_steps(buf: &mut BytesMut, need: usize, step: usize) {
    let rem = buf.remaining_mut();
    if rem < need {
        let mut reserve = rem + step;
        while reserve < need {
            reserve += step;
        }
        // keeps the capacity a multiple of the step size
        buf.reserve(reserve);
    }
}
