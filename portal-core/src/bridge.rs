//! # bridge
//!
//! Bidirectional byte pump between an inbound client socket and a reverse
//! sub-stream. Each direction copies through a pooled 64 KiB buffer and,
//! when the lease carries a rate limit, pays for every chunk out of the
//! lease's token bucket before writing.

use std::{io, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{gate::TokenBucket, metrics::BRIDGED_BYTES};

/// copy buffer per direction
const BUF_SIZE: usize = 64 * 1024;

/// Copy bytes both ways until both sides have half-closed (or either side
/// errors). Returns `(client_to_backend, backend_to_client)` byte counts.
///
/// EOF on one side shuts down the write half of the other, so half-close
/// propagates end to end.
pub async fn copy_bidirectional_limited<A, B>(
    a: A,
    b: B,
    bucket: Option<Arc<TokenBucket>>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    tokio::pin!(a);
    tokio::pin!(b);
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let up = pump(&mut a_read, &mut b_write, bucket.clone());
    let down = pump(&mut b_read, &mut a_write, bucket);
    tokio::try_join!(up, down)
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    bucket: Option<Arc<TokenBucket>>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // chunks never exceed the bucket capacity, so every byte is paid for
    let chunk = match &bucket {
        Some(bucket) => BUF_SIZE.min(bucket.rate() as usize).max(1),
        None => BUF_SIZE,
    };
    let mut buf = vec![0u8; chunk];
    let mut total = 0u64;
    loop {
        eprintln!("DEBUG pump: before read");
        let n = reader.read(&mut buf).await?;
        eprintln!("DEBUG pump: read {n}");
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        if let Some(bucket) = &bucket {
            bucket.take(n as u64).await;
        }
        eprintln!("DEBUG pump: after take");
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        eprintln!("DEBUG pump: after write");
        total += n as u64;
        BRIDGED_BYTES.inc_by(n as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bridges_both_directions() -> anyhow::Result<()> {
        let (client, client_far) = tokio::io::duplex(4096);
        let (backend, backend_far) = tokio::io::duplex(4096);

        let bridge = tokio::spawn(copy_bidirectional_limited(client_far, backend_far, None));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut backend_read, mut backend_write) = tokio::io::split(backend);

        client_write.write_all(b"request").await?;
        client_write.shutdown().await?;
        let mut got = Vec::new();
        backend_read.read_to_end(&mut got).await?;
        assert_eq!(got, b"request");

        backend_write.write_all(b"response").await?;
        backend_write.shutdown().await?;
        let mut got = Vec::new();
        client_read.read_to_end(&mut got).await?;
        assert_eq!(got, b"response");

        let (up, down) = bridge.await??;
        assert_eq!(up, 7);
        assert_eq!(down, 8);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_caps_throughput() -> anyhow::Result<()> {
        let (client, client_far) = tokio::io::duplex(512 * 1024);
        let (backend, backend_far) = tokio::io::duplex(512 * 1024);

        // 8 KiB/s; 32 KiB total must take at least 3 virtual seconds
        let bucket = Arc::new(TokenBucket::new(8 * 1024));
        let bridge = tokio::spawn(copy_bidirectional_limited(
            client_far,
            backend_far,
            Some(bucket),
        ));

        let start = tokio::time::Instant::now();
        let (mut _client_read, mut client_write) = tokio::io::split(client);
        let (mut backend_read, mut _backend_write) = tokio::io::split(backend);

        let payload = vec![0u8; 32 * 1024];
        client_write.write_all(&payload).await?;
        client_write.shutdown().await?;

        let mut got = vec![0u8; 32 * 1024];
        backend_read.read_exact(&mut got).await?;
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed >= 2.9, "elapsed {elapsed}");

        drop(_client_read);
        drop(_backend_write);
        let _ = bridge.await?;
        Ok(())
    }
}
