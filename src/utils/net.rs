//! Socket helpers: listener binding for the HTTP facade and transient
//! loopback probing for the port allocator.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
    SockaddrIn6,
};

fn socket_addr_family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

/// Create and bind a socket. `reuse_addr` is off for probes so that a port in
/// TIME_WAIT or held by another process is reported as busy.
fn bind_socket(addr: SocketAddr, ty: SockType, reuse_addr: bool) -> io::Result<OwnedFd> {
    let protocol = match ty {
        SockType::Datagram => SockProtocol::Udp,
        _ => SockProtocol::Tcp,
    };
    let fd = socket::socket(socket_addr_family(&addr), ty, SockFlag::SOCK_CLOEXEC, protocol)
        .map_err(io::Error::from)?;

    if reuse_addr {
        socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;
    }

    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = SockaddrIn::from(v4);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
        }
        SocketAddr::V6(v6) => {
            socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
            let sockaddr = SockaddrIn6::from(v6);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
        }
    }

    Ok(fd)
}

/// Bind a TCP listener with IPv6-only set for IPv6 sockets.
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let fd = bind_socket(addr, SockType::Stream, true)?;
    socket::listen(&fd, Backlog::MAXCONN).map_err(io::Error::from)?;

    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Probe whether a loopback port is free for both TCP and UDP.
///
/// The probe sockets are closed before returning, so the answer is only a
/// snapshot: another process may take the port before it is used.
pub fn probe_loopback_port(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

    let tcp = bind_socket(addr, SockType::Stream, false).and_then(|fd| {
        socket::listen(&fd, Backlog::MAXCONN)
            .map_err(io::Error::from)
            .map(|_| fd)
    });
    if tcp.is_err() {
        return false;
    }

    bind_socket(addr, SockType::Datagram, false).is_ok()
}
