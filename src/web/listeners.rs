use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::TcpListener;

const LISTEN_BACKLOG: i32 = 1024;

/// Binds the HTTP listener.
///
/// `*` listens on every interface: an IPv6 dual-stack socket when the system allows it,
/// plain IPv4 otherwise. Any other host is resolved and bound as given.
pub async fn create_listener(host: &str, port: u16) -> io::Result<(SocketAddr, TcpListener)> {
    let listener = if host == "*" {
        bind_wildcard(port)?
    } else {
        tracing::info!("Attempting to bind server to {}:{}...", host, port);
        TcpListener::bind((host, port)).await?
    };

    let addr = listener.local_addr()?;
    Ok((addr, listener))
}

fn bind_wildcard(port: u16) -> io::Result<TcpListener> {
    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    tracing::info!("Attempting to bind server to {}... (IPv6 + IPv4 dual-stack)", v6);
    match bind_socket(v6) {
        Ok(listener) => return Ok(listener),
        Err(e) => tracing::warn!("Failed to bind IPv6 listener: {}. Attempting IPv4 only.", e),
    }

    let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    tracing::info!("Attempting to bind server to {}... (IPv4)", v4);
    bind_socket(v4)
}

fn bind_socket(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if addr.is_ipv6() {
        // Not every system can serve IPv4 through an IPv6 socket; carry on regardless.
        if let Err(e) = socket.set_only_v6(false) {
            tracing::warn!("Failed to enable dual-stack mode: {}. Continuing anyway.", e);
        }
    }

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}
