//! Out-of-band image transfer.
//!
//! Producer: a listener that writes the current image snapshot to whoever
//! connects, then closes. Consumer: connect, read exactly width*height*2 bytes.

use std::io::{Error, ErrorKind};
use std::time::Duration;

use keypad_core::{Image, ImageTicket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Latest rendered image. Writers replace the whole value; readers clone a snapshot.
pub type ImageSlot = watch::Sender<Option<Image>>;

pub fn image_slot() -> (ImageSlot, watch::Receiver<Option<Image>>) {
    watch::channel(None)
}

/// Serve the current snapshot to every connection. Nothing is read from clients.
pub async fn run_image_server(listener: TcpListener, current: watch::Receiver<Option<Image>>) {
    tracing::info!(addr = ?listener.local_addr().ok(), "image server starting");
    loop {
        let (mut stream, from) = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "image accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let snapshot = current.borrow().clone();
        tokio::spawn(async move {
            let Some(image) = snapshot else {
                tracing::debug!(%from, "no image to serve");
                return;
            };
            let result = async {
                stream.write_all(image.pixels()).await?;
                stream.flush().await?;
                stream.shutdown().await
            }
            .await;
            match result {
                Ok(()) => tracing::debug!(%from, bytes = image.pixels().len(), "image served"),
                Err(e) => tracing::warn!(%from, error = %e, "image write failed"),
            }
        });
    }
}

/// Pull the image described by `ticket`.
///
/// Each read waits at most `stall`; `max_stalls` consecutive empty waits abort
/// the pull. A connection closed before the full length is a short read.
pub async fn pull_image(
    ticket: &ImageTicket,
    stall: Duration,
    max_stalls: u32,
) -> std::io::Result<Vec<u8>> {
    if !ticket.is_pullable() {
        return Err(Error::new(ErrorKind::InvalidInput, "empty image announcement"));
    }
    let len = ticket.byte_len();
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| Error::new(ErrorKind::OutOfMemory, e))?;
    buf.resize(len, 0);

    let connect_timeout = stall.saturating_mul(max_stalls.max(1));
    let mut stream = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((ticket.host.as_str(), ticket.port)),
    )
    .await
    .map_err(|_| Error::new(ErrorKind::TimedOut, "connect timed out"))??;

    let mut filled = 0;
    let mut stalls = 0;
    while filled < len {
        match tokio::time::timeout(stall, stream.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("short read: {filled} of {len} bytes"),
                ))
            }
            Ok(Ok(n)) => {
                filled += n;
                stalls = 0;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                stalls += 1;
                if stalls >= max_stalls {
                    return Err(Error::new(
                        ErrorKind::TimedOut,
                        format!("stalled at {filled} of {len} bytes"),
                    ));
                }
            }
        }
    }
    Ok(buf)
}
