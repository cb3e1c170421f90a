#[cfg(any(test, feature = "mock-support"))]
use std::fmt::Debug;
use std::io as std_io;

use futures::Poll;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tls::TlsStream;

/// The wire the session talks over.
///
/// Treats plain TCP and TCP-TLS streams the same; with `mock-support`
/// (or in unit tests) a scripted stream can be plugged in instead.
#[derive(Debug)]
pub enum Socket {
    Secure(TlsStream<TcpStream>),
    Insecure(TcpStream),
    #[cfg(any(test, feature = "mock-support"))]
    Mock(Box<dyn MockStream + Send>),
}

impl Socket {
    /// true for a TLS stream (or when the mock claims to be one)
    pub fn is_secure(&self) -> bool {
        match *self {
            Socket::Secure(_) => true,
            Socket::Insecure(_) => false,
            #[cfg(any(test, feature = "mock-support"))]
            Socket::Mock(ref mock) => mock.is_secure(),
        }
    }
}

impl std_io::Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std_io::Error> {
        match *self {
            Socket::Secure(ref mut socket) => socket.read(buf),
            Socket::Insecure(ref mut socket) => socket.read(buf),
            #[cfg(any(test, feature = "mock-support"))]
            Socket::Mock(ref mut socket) => socket.read(buf),
        }
    }
}

impl std_io::Write for Socket {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std_io::Error> {
        match *self {
            Socket::Secure(ref mut socket) => socket.write(buf),
            Socket::Insecure(ref mut socket) => socket.write(buf),
            #[cfg(any(test, feature = "mock-support"))]
            Socket::Mock(ref mut socket) => socket.write(buf),
        }
    }

    fn flush(&mut self) -> Result<(), std_io::Error> {
        match *self {
            Socket::Secure(ref mut socket) => socket.flush(),
            Socket::Insecure(ref mut socket) => socket.flush(),
            #[cfg(any(test, feature = "mock-support"))]
            Socket::Mock(ref mut socket) => socket.flush(),
        }
    }
}

impl AsyncRead for Socket {}

impl AsyncWrite for Socket {
    fn shutdown(&mut self) -> Poll<(), std_io::Error> {
        match *self {
            Socket::Secure(ref mut socket) => AsyncWrite::shutdown(socket),
            Socket::Insecure(ref mut socket) => AsyncWrite::shutdown(socket),
            #[cfg(any(test, feature = "mock-support"))]
            Socket::Mock(ref mut socket) => AsyncWrite::shutdown(&mut **socket),
        }
    }
}

/// Stream a mock socket has to provide to stand in for a real one.
#[cfg(any(test, feature = "mock-support"))]
pub trait MockStream: Debug + AsyncRead + AsyncWrite + 'static {
    fn is_secure(&self) -> bool {
        false
    }

    /// called instead of a real TLS handshake after STARTTLS
    fn set_is_secure(&mut self, secure: bool);
}
