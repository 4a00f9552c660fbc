use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::bail;

/// Settings shared by client and server
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// This is the maximum size of an encoded frame, i.e. of a UDP payload. Frames are never split
    ///  across datagrams, so sending a message that encodes to more bytes than this fails.
    ///
    /// The default of 1472 is the UDP payload of a full Ethernet frame over IPV4 without optional
    ///  IP headers. Bigger values work only if all network hardware on the route supports them.
    pub max_transmit_size: usize,

    /// Default time to wait for an acknowledgment, both for the handshake and for
    ///  [promise](crate::client::Client::promise) calls
    pub timeout: Duration,

    /// Number of workers dispatching inbound messages to handlers concurrently
    pub dispatch_workers: usize,

    /// Capacity of the queue between the receive loop and the dispatch workers. Datagrams
    ///  arriving while the queue is full are dropped.
    pub dispatch_queue_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            max_transmit_size: 1472,
            timeout: Duration::from_secs(1),
            dispatch_workers: 4,
            dispatch_queue_size: 1024,
        }
    }
}

impl ProtocolConfig {
    /// `prt-hello` + token + sequence + a lifetime, with some headroom
    const MIN_TRANSMIT_SIZE: usize = 64;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_transmit_size < Self::MIN_TRANSMIT_SIZE {
            bail!("max transmit size must be at least {} bytes, was {}", Self::MIN_TRANSMIT_SIZE, self.max_transmit_size);
        }
        if self.max_transmit_size > u16::MAX as usize {
            bail!("max transmit size {} does not fit into a UDP datagram", self.max_transmit_size);
        }
        if self.timeout.is_zero() {
            bail!("timeout must be positive");
        }
        if self.dispatch_workers == 0 {
            bail!("at least one dispatch worker is required");
        }
        if self.dispatch_queue_size == 0 {
            bail!("dispatch queue size must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The address that the server's UDP socket is bound to
    pub self_addr: SocketAddr,

    pub protocol: ProtocolConfig,

    /// Sessions without inbound traffic for this long are evicted. The value is advertised to
    ///  clients (in microseconds) as part of the handshake.
    pub max_life_time: Duration,

    pub session_token_length: usize,

    /// Interval for the periodic sweep of idle sessions. `None` disables the periodic sweep,
    ///  leaving it to the application to call [gc](crate::server::Server::gc).
    pub reaper_interval: Option<Duration>,
}

impl ServerConfig {
    pub fn new(self_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            self_addr,
            protocol: ProtocolConfig::default(),
            max_life_time: Duration::from_secs(120),
            session_token_length: 8,
            reaper_interval: Some(Duration::from_secs(10)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.protocol.validate()?;

        if self.max_life_time.is_zero() {
            bail!("max session life time must be positive");
        }
        if self.session_token_length == 0 {
            bail!("session token length must be positive");
        }
        if self.session_token_length + 32 > self.protocol.max_transmit_size {
            bail!("session token length {} leaves no room for payload", self.session_token_length);
        }
        if let Some(interval) = self.reaper_interval {
            if interval.is_zero() {
                bail!("reaper interval must be positive");
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,

    /// The local address to bind to, typically with port 0
    pub self_addr: SocketAddr,

    pub protocol: ProtocolConfig,
}

impl ClientConfig {
    /// Binds to an ephemeral port on the unspecified address of the server address' IP version
    pub fn new(server_addr: SocketAddr) -> ClientConfig {
        let self_addr = if server_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        }
        else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        ClientConfig {
            server_addr,
            self_addr,
            protocol: ProtocolConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.protocol.validate()?;

        if self.server_addr.is_ipv4() != self.self_addr.is_ipv4() {
            bail!("client address {:?} and server address {:?} use different IP versions", self.self_addr, self.server_addr);
        }
        Ok(())
    }
}
