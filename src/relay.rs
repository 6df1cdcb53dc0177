use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Tunnels with no traffic in either direction for this long are torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of a finished relay: per-direction byte counters plus whatever
/// ended it. Connection teardown errors are expected here and are the
/// caller's to log at DEBUG.
#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub error: Option<io::Error>,
    pub idle_timeout: bool,
}

impl RelayOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Bidirectional byte relay between a negotiated client connection and the
/// upstream tunnel.
///
/// Both directions are multiplexed in one task: each read is immediately
/// written and flushed to the peer, so bytes within a direction stay in
/// order and backpressure falls through to the source socket. End-of-stream
/// on one side half-closes the peer's write half and the other direction
/// keeps draining; an I/O error or the idle timer ends the relay and closes
/// both sides.
pub async fn relay<C, U>(client: C, upstream: U, buffer_size: usize) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    relay_with_idle(client, upstream, buffer_size, IDLE_TIMEOUT).await
}

pub async fn relay_with_idle<C, U>(
    client: C,
    upstream: U,
    buffer_size: usize,
    idle_timeout: Duration,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let mut client_open = true;
    let mut upstream_open = true;
    let mut client_buf = vec![0u8; buffer_size];
    let mut upstream_buf = vec![0u8; buffer_size];
    let mut outcome = RelayOutcome::default();

    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    while client_open || upstream_open {
        tokio::select! {
            res = client_rd.read(&mut client_buf), if client_open => {
                match res {
                    Ok(0) => {
                        client_open = false;
                        let _ = upstream_wr.shutdown().await;
                    }
                    Ok(n) => {
                        if let Err(e) = write_chunk(&mut upstream_wr, &client_buf[..n]).await {
                            outcome.error = Some(e);
                            break;
                        }
                        outcome.client_to_upstream += n as u64;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    Err(e) => {
                        outcome.error = Some(e);
                        break;
                    }
                }
            }
            res = upstream_rd.read(&mut upstream_buf), if upstream_open => {
                match res {
                    Ok(0) => {
                        upstream_open = false;
                        let _ = client_wr.shutdown().await;
                    }
                    Ok(n) => {
                        if let Err(e) = write_chunk(&mut client_wr, &upstream_buf[..n]).await {
                            outcome.error = Some(e);
                            break;
                        }
                        outcome.upstream_to_client += n as u64;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    Err(e) => {
                        outcome.error = Some(e);
                        break;
                    }
                }
            }
            _ = &mut idle => {
                debug!("relay idle timeout after {idle_timeout:?}");
                outcome.idle_timeout = true;
                break;
            }
        }
    }

    // Dropping the halves closes anything still open.
    let _ = client_wr.shutdown().await;
    let _ = upstream_wr.shutdown().await;
    outcome
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}
