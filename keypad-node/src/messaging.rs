//! Request/response messaging over TCP: one connection per call.
//!
//! No framing: the request is whatever one read returns (bounded by
//! `MAX_MESSAGE_LEN`), the reply is everything written before close.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use keypad_core::wire::MAX_MESSAGE_LEN;
use keypad_core::Peer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::node::SharedCore;

/// Accept loop. Each connection is served on its own task so a slow client
/// cannot stall the listener.
pub async fn run_server(listener: TcpListener, core: SharedCore, read_timeout: Duration) {
    tracing::info!(addr = ?listener.local_addr().ok(), "message server starting");
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let core = core.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, from, core, read_timeout).await {
                        tracing::debug!(%from, error = %e, "request failed");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    from: SocketAddr,
    core: SharedCore,
    read_timeout: Duration,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_MESSAGE_LEN];
    let n = tokio::time::timeout(read_timeout, stream.read(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no request"))??;
    if n == 0 {
        return Ok(());
    }
    let response = core.lock().await.on_request(from.ip(), &buf[..n], Instant::now());
    if let Some(response) = response {
        let bytes = response
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        stream.write_all(&bytes).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
    }
    stream.shutdown().await
}

/// Send `payload` to `addr` and wait for the reply, bounded by `timeout`.
///
/// Connect failure, timeout and an empty reply all mean "no reply".
pub async fn call_peer(addr: SocketAddr, payload: &[u8], timeout: Duration) -> Option<Vec<u8>> {
    match tokio::time::timeout(timeout, exchange(addr, payload)).await {
        Ok(Ok(reply)) if !reply.is_empty() => Some(reply),
        Ok(Ok(_)) => {
            tracing::debug!(%addr, "peer closed without reply");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(%addr, error = %e, "call to peer failed");
            None
        }
        Err(_) => {
            tracing::warn!(
                %addr,
                timeout_ms = timeout.as_millis() as u64,
                "timeout talking to peer"
            );
            None
        }
    }
}

async fn exchange(addr: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    let mut reply = Vec::new();
    (&mut stream)
        .take(MAX_MESSAGE_LEN as u64 + 2)
        .read_to_end(&mut reply)
        .await?;
    while matches!(reply.last(), Some(b'\r' | b'\n' | b'\0')) {
        reply.pop();
    }
    Ok(reply)
}

/// Call every peer in turn, one attempt each. Returns the replies received.
pub async fn call_peers(
    targets: &[Peer],
    port: u16,
    payload: &[u8],
    timeout: Duration,
) -> Vec<(String, Vec<u8>)> {
    let mut replies = Vec::new();
    for peer in targets {
        let addr = SocketAddr::new(peer.addr, port);
        if let Some(reply) = call_peer(addr, payload, timeout).await {
            replies.push((peer.name.clone(), reply));
        }
    }
    tracing::debug!(
        peers = targets.len(),
        replied = replies.len(),
        "fan-out complete"
    );
    replies
}
