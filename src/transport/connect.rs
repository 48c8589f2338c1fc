//! Plain-socket dialing with link-local scope rewriting.
//!
//! Addresses handed down from the resolution layer carry no scope
//! information. A link-local IPv6 destination is unroutable without one,
//! so the connect step rewrites such addresses to carry the bound
//! interface's index before dialing.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

/// A network interface eligible for scoping link-local destinations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceBinding {
    name: String,
    index: u32,
}

impl InterfaceBinding {
    /// Look up the OS index of the named interface.
    pub fn from_name(name: &str) -> io::Result<Self> {
        let index = nix::net::if_::if_nametoindex(name).map_err(io::Error::from)?;
        Ok(Self {
            name: name.to_string(),
            index,
        })
    }

    /// Use an explicit (name, index) pair, e.g. from a discovery layer
    /// that already resolved the index.
    pub fn new(name: &str, index: u32) -> Self {
        Self {
            name: name.to_string(),
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Socket factory for the transport client.
///
/// The only operation is dialing a structured socket address. Hostname
/// variants don't exist on purpose: scope rewriting needs to inspect the
/// destination address itself, so resolution must happen above this
/// layer.
pub struct LinkLocalConnector {
    // Index of the bound interface, 0 when unbound. An in-flight connect
    // may observe a stale value across a rebind; rebinding is tied to
    // rare discovery events and any consistent value routes correctly.
    scope: AtomicU32,
}

impl LinkLocalConnector {
    pub fn new() -> Self {
        Self {
            scope: AtomicU32::new(0),
        }
    }

    /// Bind the interface used to scope link-local destinations from now
    /// on. Last write wins.
    pub fn bind(&self, iface: &InterfaceBinding) {
        self.scope.store(iface.index(), Ordering::Release);
        log::debug!(
            "Scoping link-local destinations to {} (index {})",
            iface.name(),
            iface.index()
        );
    }

    /// Given a destination address, return the address to actually
    /// connect to.
    ///
    /// Link-local IPv6 destinations get the bound interface's scope id;
    /// anything else passes through unmodified.
    pub fn scoped(&self, addr: SocketAddr) -> SocketAddr {
        let scope = self.scope.load(Ordering::Acquire);
        if scope == 0 {
            return addr;
        }
        match addr {
            SocketAddr::V6(v6) if is_link_local(v6.ip()) => SocketAddr::V6(SocketAddrV6::new(
                *v6.ip(),
                v6.port(),
                v6.flowinfo(),
                scope,
            )),
            other => other,
        }
    }

    /// Dial the (possibly rewritten) destination.
    pub async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        let target = self.scoped(addr);
        if target != addr {
            log::debug!("Rewrote link-local destination {addr} to {target}");
        }
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {target} timed out"),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Default for LinkLocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// fe80::/10
fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}
