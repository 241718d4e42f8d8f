//! Socket setup helpers built on socket2
//!
//! tokio does not expose keepalive tuning or listen backlog, so the raw
//! socket options go through `socket2` before the socket is handed to tokio.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::config::KeepaliveParams;

/// Create a listening socket with `SO_REUSEADDR` and the given backlog.
pub fn bind_listener(addr: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.clamp(1, i32::MAX as usize) as i32)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Enable TCP keepalive with the bridge's probe tuning.
pub fn apply_keepalive(stream: &TcpStream, params: &KeepaliveParams) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(params.idle);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "macos",
        target_os = "ios"
    ))]
    let keepalive = keepalive
        .with_interval(params.interval)
        .with_retries(params.probe_count);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bind_listener_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 3).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, _) = server.unwrap();

        let params = KeepaliveParams {
            idle: Duration::from_secs(5),
            interval: Duration::from_secs(3),
            probe_count: 3,
        };
        apply_keepalive(&client, &params).unwrap();
        apply_keepalive(&server, &params).unwrap();
        assert!(SockRef::from(&server).keepalive().unwrap());
    }
}
