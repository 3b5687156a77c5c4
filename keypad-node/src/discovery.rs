//! LAN discovery: multicast announce, passive listener that answers announces
//! and doubles as an inbox for unsolicited control messages.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use keypad_core::wire::{encode_message, MAX_MESSAGE_LEN};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::node::SharedCore;

/// Bind the discovery socket on `port` and join `group`.
///
/// Failing to join the group is not fatal: the socket still receives unicast
/// acknowledgements and can still send.
pub fn make_multicast_socket(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind.into())
        .with_context(|| format!("bind udp {bind}"))?;
    if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
        tracing::warn!(%group, error = %e, "multicast join failed, discovery limited to unicast");
    }
    socket.set_multicast_ttl_v4(1).context("IP_MULTICAST_TTL")?;
    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

/// Send this node's announce twice, `gap` apart. No retry beyond that.
pub async fn announce(socket: &UdpSocket, core: &SharedCore, dest: SocketAddr, gap: Duration) {
    let msg = core.lock().await.announce();
    let frame = match encode_message(&msg) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(error = %e, "cannot encode announce");
            return;
        }
    };
    for attempt in 0..2 {
        if attempt > 0 {
            tokio::time::sleep(gap).await;
        }
        match socket.send_to(&frame, dest).await {
            Ok(_) => tracing::debug!(%dest, attempt, "announce sent"),
            Err(e) => tracing::warn!(%dest, error = %e, "announce send failed"),
        }
    }
    tracing::info!(%dest, "announced");
}

/// Receive datagrams forever. Runs until the socket fails hard.
pub async fn run_listener(socket: Arc<UdpSocket>, core: SharedCore) {
    let mut buf = vec![0u8; MAX_MESSAGE_LEN + 1];
    tracing::info!(addr = ?socket.local_addr().ok(), "discovery listener starting");
    loop {
        if let Err(e) = recv_one(&socket, &core, &mut buf).await {
            tracing::warn!(error = %e, "discovery recv failed");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Handle one datagram: dispatch it and unicast any answer to the sender
/// on the same socket.
pub async fn recv_one(
    socket: &UdpSocket,
    core: &SharedCore,
    buf: &mut [u8],
) -> std::io::Result<()> {
    let (n, from) = socket.recv_from(buf).await?;
    let response = core.lock().await.on_datagram(from.ip(), &buf[..n], Instant::now());
    let Some(response) = response else {
        return Ok(());
    };
    match response.encode() {
        Ok(bytes) => {
            socket.send_to(&bytes, from).await?;
        }
        Err(e) => tracing::warn!(%from, error = %e, "cannot encode datagram reply"),
    }
    Ok(())
}
