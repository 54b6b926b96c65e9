use std::net::Ipv4Addr;

use nix::sys::socket::SockaddrStorage;

/// Format a socket address as a printable IP string plus a host-order port.
///
/// An absent address, or one from a family we do not route (for example a
/// unix-domain upstream), formats as an empty string and port 0, which is how
/// the connection dump renders an unknown peer.
pub fn peer_address(addr: Option<&SockaddrStorage>) -> (String, u16) {
    let Some(addr) = addr else {
        return (String::new(), 0);
    };

    if let Some(sin) = addr.as_sockaddr_in() {
        (Ipv4Addr::from(sin.ip()).to_string(), sin.port())
    } else if let Some(sin6) = addr.as_sockaddr_in6() {
        (sin6.ip().to_string(), sin6.port())
    } else {
        (String::new(), 0)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    use nix::sys::socket::getpeername;

    use super::*;

    #[test]
    fn test_inet_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let _accepted = listener.accept().unwrap();

        let addr = getpeername::<SockaddrStorage>(client.as_raw_fd()).unwrap();
        let (ip, peer_port) = peer_address(Some(&addr));

        assert_eq!(ip, "127.0.0.1");
        assert_eq!(peer_port, port);
    }

    #[test]
    fn test_inet6_peer() {
        // skip on hosts without a loopback v6 interface
        let Ok(listener) = TcpListener::bind("[::1]:0") else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("::1", port)).unwrap();
        let _accepted = listener.accept().unwrap();

        let addr = getpeername::<SockaddrStorage>(client.as_raw_fd()).unwrap();
        let (ip, peer_port) = peer_address(Some(&addr));

        assert_eq!(ip, "::1");
        assert_eq!(peer_port, port);
    }

    #[test]
    fn test_absent_address() {
        assert_eq!(peer_address(None), (String::new(), 0));
    }
}
