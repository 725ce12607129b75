//! Bidirectional relay between an established connection pair
//!
//! Once the instance connection is established, each pair gets two copy
//! tasks: client to instance and instance to client. The directions are
//! independent; when one ends, only its destination is half-closed, and the
//! other keeps flowing until it ends on its own. The sockets fully close
//! once both tasks have finished and dropped their halves.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::pool::BufferPool;

/// Relay bytes in both directions until each stream has ended.
///
/// Returns the byte totals as `(client_to_instance, instance_to_client)`.
/// Stream errors end the affected direction and are logged, never
/// propagated; a clean end of stream is not an error at all.
pub async fn run<C, I>(buffer_pool: BufferPool, client: C, instance: I) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (instance_read, instance_write) = tokio::io::split(instance);

    let forward = tokio::spawn(copy_direction(
        buffer_pool.clone(),
        client_read,
        instance_write,
        "client->instance",
    ));
    let backward = tokio::spawn(copy_direction(
        buffer_pool,
        instance_read,
        client_write,
        "instance->client",
    ));

    // Both directions must finish before the pair is torn down; each socket
    // closes once both of its halves have been dropped by the tasks above.
    let (sent, received) = tokio::join!(forward, backward);
    (sent.unwrap_or_default(), received.unwrap_or_default())
}

/// Copy `src` into `dst` through one pooled buffer until the stream ends,
/// then half-close `dst`.
///
/// The half-close tells the peer no more data will arrive from this side
/// while the opposite direction stays open. On `TcpStream` halves this is a
/// write-side shutdown; a transport without half-close support will tear
/// down the whole stream here instead, forcing the opposite direction to
/// end as well.
async fn copy_direction<R, W>(
    buffer_pool: BufferPool,
    mut src: R,
    mut dst: W,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = buffer_pool.acquire();
    let mut total = 0u64;

    loop {
        let n = match src.read(buffer.as_mut_slice()).await {
            Ok(0) => {
                debug!("{} stream ended after {} bytes", direction, total);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("{} read error after {} bytes: {}", direction, total, e);
                break;
            }
        };
        if let Err(e) = dst.write_all(&buffer[..n]).await {
            warn!("{} write error after {} bytes: {}", direction, total, e);
            break;
        }
        total += n as u64;
    }

    if let Err(e) = dst.shutdown().await {
        debug!("{} half-close failed: {}", direction, e);
    }
    total
}
