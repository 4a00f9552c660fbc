//! The datagram transport underneath the protocol engines, and the machinery shared by client and
//!  server for sending frames and for receiving and dispatching them.

pub mod dispatch_pool;
pub mod end_point;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for a connectionless datagram socket, introduced to allow running the
///  protocol over something other than UDP - most notably a simulated network for testing.
///
/// Delivery is unreliable: datagrams may be dropped, and an `Ok` from `send_to` does not imply
///  that the peer received anything.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Receives a single datagram into `buf`, returning the number of bytes and the sender
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        UdpSocket::send_to(self, buf, to).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
