use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use burrow_protocol::Message;

/// Logical role of a multicast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Control,
    Backup,
    Restore,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelRole::Control => "MC",
            ChannelRole::Backup => "MDB",
            ChannelRole::Restore => "MDR",
        })
    }
}

/// One multicast group listener plus its fire-and-forget send primitive.
///
/// The socket is bound with reuse-address on the group port and joined to
/// the group, so several peers can share a host. Datagrams sent to the group
/// loop back to our own receive loop; the dispatcher filters those out by
/// sender id.
pub struct MulticastChannel {
    role: ChannelRole,
    group: SocketAddr,
    socket: UdpSocket,
}

impl MulticastChannel {
    pub fn bind(role: ChannelRole, group: SocketAddr) -> Result<Self> {
        let SocketAddr::V4(group_v4) = group else {
            bail!("{} group must be an IPv4 multicast address", role);
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("cannot create UDP socket")?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group_v4.port()).into())
            .with_context(|| format!("cannot bind {} on port {}", role, group_v4.port()))?;
        socket
            .join_multicast_v4(group_v4.ip(), &Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("cannot join {} group {}", role, group))?;
        socket.set_multicast_loop_v4(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!("{} channel joined {}", role, group);
        Ok(Self {
            role,
            group,
            socket,
        })
    }

    /// Encode and transmit one datagram to this channel's group. No
    /// acknowledgment, no retry; repetition is the calling protocol's job.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let wire = msg.encode();
        self.socket
            .send_to(&wire, self.group)
            .await
            .with_context(|| format!("{} send of {} failed", self.role, msg.kind))?;
        debug!(
            "{} sent {} {} ({} bytes)",
            self.role,
            msg.kind,
            msg.chunk_id(),
            wire.len()
        );
        Ok(())
    }

    /// Receive loop for the lifetime of the process: decode each datagram
    /// and forward it to the dispatcher. Malformed datagrams and transient
    /// receive errors are logged and never terminate the loop.
    pub async fn recv_loop(self: Arc<Self>, inbound: mpsc::Sender<Message>) {
        let mut buf = vec![0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match Message::decode(&buf[..len]) {
                    Ok(msg) => {
                        if inbound.send(msg).await.is_err() {
                            // dispatcher gone, we are shutting down
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("{}: dropping malformed datagram from {}: {}", self.role, src, e);
                    }
                },
                Err(e) => {
                    warn!("{} receive error: {}", self.role, e);
                }
            }
        }
    }
}
