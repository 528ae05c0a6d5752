//! TCP listener setup
//!
//! ```ignore
//! let listener = create_listener("tcp", "127.0.0.1:8080")?;
//! evl.serve(listener)?;
//! ```

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use nix::sys::socket::{self, Shutdown};
use tracing::debug;

use ringnet_core::{Error, Result};

/// Pending connections the kernel queues before `accept`
pub const LISTEN_BACKLOG: i32 = 4096;

/// Address families accepted by `create_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6, whichever the address resolves to first
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn parse(network: &str) -> Result<Self> {
        match network {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }

    fn admits(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

/// A listening TCP socket
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    network: Network,
}

/// Bind and listen on `address` (`host:port`) for `tcp`, `tcp4` or `tcp6`
pub fn create_listener(network: &str, address: &str) -> Result<Listener> {
    let network = Network::parse(network)?;
    let addr = address
        .to_socket_addrs()?
        .find(|a| network.admits(a))
        .ok_or(Error::Os(libc::EADDRNOTAVAIL))?;

    let fd = bind_socket(&addr, network)?;
    // Safety: bind_socket returns a fresh, owned, listening fd
    let inner = unsafe { TcpListener::from_raw_fd(fd) };
    debug!(%addr, ?network, "listener: bound");
    Ok(Listener { inner, network })
}

/// Create, configure, bind and listen
fn bind_socket(addr: &SocketAddr, network: Network) -> Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }

    let configure = || -> Result<()> {
        set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        if network == Network::Tcp6 {
            set_flag(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY)?;
        }

        let (storage, len) = sockaddr_of(addr);
        let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        if unsafe { libc::listen(fd, LISTEN_BACKLOG) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    };

    if let Err(e) = configure() {
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }
    Ok(fd)
}

fn set_flag(fd: RawFd, level: libc::c_int, name: libc::c_int) -> Result<()> {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of_val(&on) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

impl Listener {
    /// Block until a client connects; the stream gets `TCP_NODELAY`
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept()?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Wake a blocked `accept` and refuse further connections. The fd
    /// stays open until the listener is dropped.
    pub fn shutdown(&self) -> Result<()> {
        match socket::shutdown(self.inner.as_raw_fd(), Shutdown::Both) {
            Ok(()) | Err(nix::errno::Errno::ENOTCONN) => Ok(()),
            Err(errno) => Err(Error::Os(errno as i32)),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl From<TcpListener> for Listener {
    fn from(inner: TcpListener) -> Self {
        let network = match inner.local_addr() {
            Ok(SocketAddr::V6(_)) => Network::Tcp6,
            Ok(SocketAddr::V4(_)) => Network::Tcp4,
            Err(_) => Network::Tcp,
        };
        Listener { inner, network }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn test_unsupported_network() {
        assert_eq!(
            create_listener("udp", "127.0.0.1:0").unwrap_err(),
            Error::UnsupportedNetwork("udp".into())
        );
        assert!(matches!(Network::parse("unix"), Err(Error::UnsupportedNetwork(_))));
    }

    #[test]
    fn test_tcp4_accepts() {
        let listener = create_listener("tcp4", "127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.is_ipv4());

        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            s.write_all(b"hi").unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        assert!(stream.nodelay().unwrap());
        let mut got = [0u8; 2];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hi");
        client.join().unwrap();
    }

    #[test]
    fn test_tcp4_rejects_v6_address() {
        assert_eq!(
            create_listener("tcp4", "[::1]:0").unwrap_err(),
            Error::Os(libc::EADDRNOTAVAIL)
        );
    }

    #[test]
    fn test_shutdown_wakes_accept() {
        let listener = std::sync::Arc::new(create_listener("tcp", "127.0.0.1:0").unwrap());
        let blocked = {
            let listener = std::sync::Arc::clone(&listener);
            thread::spawn(move || listener.accept().is_err())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        listener.shutdown().unwrap();
        assert!(blocked.join().unwrap());
    }
}
