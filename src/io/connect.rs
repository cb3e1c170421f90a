use std::fmt::Debug;
use std::io as std_io;
use std::net::{SocketAddr, ToSocketAddrs};

use native_tls::TlsConnector as NativeTlsConnector;
use tokio::net::tcp::{ConnectFuture, TcpStream};
use tokio_tls::{Connect, TlsConnector};

/// Future of an in-progress TLS handshake.
pub type Handshake = Connect<TcpStream>;

/// Resolves a host/port pair to the first of its socket addresses.
pub fn resolve<A>(target: A) -> Result<SocketAddr, std_io::Error>
where
    A: ToSocketAddrs + Debug,
{
    if let Some(addr) = target.to_socket_addrs()?.next() {
        Ok(addr)
    } else {
        Err(std_io::Error::new(
            std_io::ErrorKind::AddrNotAvailable,
            format!("{:?} is not associated with any socket address", target),
        ))
    }
}

/// Starts the TCP connect to the given address.
pub fn connect_tcp(addr: &SocketAddr) -> ConnectFuture {
    TcpStream::connect(addr)
}

/// Begins the TLS handshake over an established stream.
///
/// `sni_domain` is used for SNI and certificate validation. Connector
/// construction failures are reported as handshake failures.
pub fn start_handshake(sni_domain: &str, stream: TcpStream) -> Result<Handshake, std_io::Error> {
    let connector = NativeTlsConnector::builder().build().map_err(map_tls_err)?;
    let connector = TlsConnector::from(connector);
    Ok(connector.connect(sni_domain, stream))
}

pub(crate) fn map_tls_err(err: native_tls::Error) -> std_io::Error {
    std_io::Error::new(std_io::ErrorKind::Other, err)
}
