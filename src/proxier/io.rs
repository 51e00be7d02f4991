//! Bidirectional byte-copy between two halves of a connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Buffer size for TCP proxying, matching the teacher's `tcp::proxy`
/// constant.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Copies from `reader` to `writer` until EOF or an I/O error, then shuts
/// the writer down to unblock a peer copy task waiting on the other half.
/// Exits on EOF from the source, an error on either side, or closure of the
/// paired stream (observed as a read/write error once the peer task closes
/// its end).
pub async fn copy_stream<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    Ok(total)
}
