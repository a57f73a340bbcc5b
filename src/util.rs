use n0_error::{Result, StdResultExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub use self::prebuffered::Prebuffered;

mod prebuffered;

/// Bidirectionally forward bytes between the client and the upstream connection.
///
/// Each direction shuts down its writer once its reader hits EOF, so a half-close
/// propagates through the tunnel. Returns the byte counts `(to_upstream, to_client)`.
pub(crate) async fn forward_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    upstream_recv: &mut (impl AsyncRead + Send + Unpin),
    upstream_send: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<(u64, u64)> {
    let start = n0_future::time::Instant::now();
    let (r1, r2) = tokio::join!(
        async {
            let res = tokio::io::copy(client_recv, upstream_send).await;
            upstream_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "forward client-to-upstream finished");
            res
        },
        async {
            let res = tokio::io::copy(upstream_recv, client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "forward upstream-to-client finished");
            res
        }
    );
    let r1 = r1.std_context("failed to copy client-to-upstream")?;
    let r2 = r2.std_context("failed to copy upstream-to-client")?;
    Ok((r1, r2))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn forward_bidi_relays_both_directions() {
        let (mut client, proxy_client_side) = tokio::io::duplex(1024);
        let (proxy_upstream_side, mut upstream) = tokio::io::duplex(1024);
        let (mut client_recv, mut client_send) = tokio::io::split(proxy_client_side);
        let (mut upstream_recv, mut upstream_send) = tokio::io::split(proxy_upstream_side);

        let relay = tokio::spawn(async move {
            forward_bidi(
                &mut client_recv,
                &mut client_send,
                &mut upstream_recv,
                &mut upstream_send,
            )
            .await
        });

        client.write_all(b"client hello").await.unwrap();
        client.shutdown().await.unwrap();
        let mut seen = Vec::new();
        upstream.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"client hello");

        upstream.write_all(b"server hello!").await.unwrap();
        upstream.shutdown().await.unwrap();
        let mut seen = Vec::new();
        client.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"server hello!");

        let (to_upstream, to_client) = relay.await.unwrap().unwrap();
        assert_eq!((to_upstream, to_client), (12, 13));
    }
}
