//! Streaming body hand-off with activity-based timeouts.
//!
//! Upstream functions that stream tokens to the client copy chunks through
//! [`copy_stream`], which enforces two deadlines: one for the first chunk
//! (connection establishment plus prompt processing) and a rolling one
//! that resets every time a chunk arrives. A stalled stream times out even
//! though the connection is still nominally alive, while a slow but active
//! stream can run for as long as it keeps producing.

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Timing captured while copying a stream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct StreamingMetrics {
    /// Time from the copy start to the first chunk, in milliseconds.
    pub time_to_first_chunk_ms: f64,
    /// Total copy duration, in milliseconds.
    pub duration_ms: f64,
    /// Chunks forwarded to the client.
    pub chunks: u64,
}

/// Failure while copying a stream.
///
/// `first_chunk_written` distinguishes a retryable connection-phase
/// failure from a mid-stream one: once a chunk reached the client the
/// request must not fail over to another backend.
#[derive(Debug, thiserror::Error)]
pub enum StreamCopyError<E> {
    #[error("Stream timed out (first_chunk_written: {first_chunk_written})")]
    TimedOut { first_chunk_written: bool },

    #[error("Upstream stream failed: {source}")]
    Upstream {
        #[source]
        source: E,
        first_chunk_written: bool,
    },

    #[error("Writing to client failed: {source}")]
    Write {
        #[source]
        source: std::io::Error,
        first_chunk_written: bool,
    },
}

impl<E> StreamCopyError<E> {
    pub fn first_chunk_written(&self) -> bool {
        match self {
            StreamCopyError::TimedOut { first_chunk_written } => *first_chunk_written,
            StreamCopyError::Upstream {
                first_chunk_written, ..
            } => *first_chunk_written,
            StreamCopyError::Write {
                first_chunk_written, ..
            } => *first_chunk_written,
        }
    }
}

/// Copies `stream` to `write` chunk by chunk.
///
/// The first chunk must arrive within `connect_timeout`; every subsequent
/// chunk resets a rolling `activity_timeout`. Returns the captured
/// [`StreamingMetrics`] once the stream ends cleanly.
///
/// # Examples
///
/// ```rust
/// use corral::services::streaming::copy_stream;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let chunks: Vec<Result<&str, std::io::Error>> = vec![Ok("hel"), Ok("lo")];
/// let stream = futures_util::stream::iter(chunks);
///
/// let mut out = String::new();
/// let metrics = copy_stream(
///     stream,
///     |chunk| {
///         out.push_str(chunk);
///         async { Ok(()) }
///     },
///     Duration::from_secs(1),
///     Duration::from_secs(1),
/// )
/// .await
/// .expect("copy succeeds");
///
/// assert_eq!(out, "hello");
/// assert_eq!(metrics.chunks, 2);
/// # }
/// ```
pub async fn copy_stream<S, T, E, W, Fut>(
    mut stream: S,
    mut write: W,
    connect_timeout: Duration,
    activity_timeout: Duration,
) -> Result<StreamingMetrics, StreamCopyError<E>>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    W: FnMut(T) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let started = Instant::now();
    let mut first_chunk_at: Option<Instant> = None;
    let mut chunks = 0u64;

    loop {
        let deadline = if first_chunk_at.is_none() {
            connect_timeout
        } else {
            activity_timeout
        };

        let next = match timeout(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                return Err(StreamCopyError::TimedOut {
                    first_chunk_written: first_chunk_at.is_some(),
                })
            }
        };

        match next {
            Some(Ok(chunk)) => {
                let first_chunk_written = first_chunk_at.is_some();
                write(chunk).await.map_err(|source| StreamCopyError::Write {
                    source,
                    first_chunk_written,
                })?;
                if first_chunk_at.is_none() {
                    first_chunk_at = Some(Instant::now());
                }
                chunks += 1;
            }
            Some(Err(source)) => {
                return Err(StreamCopyError::Upstream {
                    source,
                    first_chunk_written: first_chunk_at.is_some(),
                })
            }
            None => break,
        }
    }

    let time_to_first_chunk = first_chunk_at
        .map(|at| at.duration_since(started))
        .unwrap_or_else(|| started.elapsed());

    Ok(StreamingMetrics {
        time_to_first_chunk_ms: time_to_first_chunk.as_secs_f64() * 1000.0,
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    #[tokio::test]
    async fn copies_all_chunks_and_counts_them() {
        let chunks: Vec<Result<u8, Infallible>> = vec![Ok(1), Ok(2), Ok(3)];
        let mut seen = Vec::new();

        let metrics = copy_stream(
            stream::iter(chunks),
            |c| {
                seen.push(c);
                async { Ok(()) }
            },
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .expect("copy");

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(metrics.chunks, 3);
    }

    #[tokio::test]
    async fn stalled_stream_times_out_before_first_chunk() {
        let pending = stream::pending::<Result<u8, Infallible>>();

        let err = copy_stream(
            pending,
            |_| async { Ok(()) },
            Duration::from_millis(20),
            Duration::from_millis(20),
        )
        .await
        .expect_err("must time out");

        assert!(matches!(
            err,
            StreamCopyError::TimedOut {
                first_chunk_written: false
            }
        ));
    }

    #[tokio::test]
    async fn mid_stream_stall_reports_first_chunk_written() {
        let chunks = stream::iter(vec![Ok::<u8, Infallible>(1)]).chain(stream::pending());

        let err = copy_stream(
            chunks,
            |_| async { Ok(()) },
            Duration::from_millis(50),
            Duration::from_millis(20),
        )
        .await
        .expect_err("must time out");

        assert!(err.first_chunk_written());
    }

    #[tokio::test]
    async fn upstream_error_mid_stream_is_marked() {
        let chunks: Vec<Result<u8, std::io::Error>> = vec![
            Ok(1),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];

        let err = copy_stream(
            stream::iter(chunks),
            |_| async { Ok(()) },
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .expect_err("must fail");

        assert!(err.first_chunk_written());
    }
}
