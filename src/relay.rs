use std::{io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::Direction;

pub const BUFFER_SIZE: usize = 8192;

/// Byte counts and errors of a finished relay. Counts are what was fully
/// written to the far side, partial or not.
#[derive(Debug, Default)]
pub struct RelayReport {
    /// inbound peer -> destination
    pub bytes_in: u64,
    /// destination -> inbound peer
    pub bytes_out: u64,
    pub error_in: Option<io::Error>,
    pub error_out: Option<io::Error>,
}

impl RelayReport {
    #[must_use]
    pub fn bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Inbound => self.bytes_in,
            Direction::Outbound => self.bytes_out,
        }
    }

    #[must_use]
    pub fn error(&self, direction: Direction) -> Option<&io::Error> {
        match direction {
            Direction::Inbound => self.error_in.as_ref(),
            Direction::Outbound => self.error_out.as_ref(),
        }
    }
}

/// Copies bytes both ways between `inbound` and `outbound` until one side
/// finishes, fails, idles past `copy_timeout`, or `shutdown` fires.
///
/// Whichever direction ends first stops the other one; both streams are
/// dropped (and so closed) before this returns.
pub async fn relay<I, O>(
    inbound: I,
    outbound: O,
    shutdown: &CancellationToken,
    copy_timeout: Option<Duration>,
) -> RelayReport
where
    I: AsyncRead + AsyncWrite,
    O: AsyncRead + AsyncWrite,
{
    let pair = shutdown.child_token();
    let (inbound_reader, inbound_writer) = tokio::io::split(inbound);
    let (outbound_reader, outbound_writer) = tokio::io::split(outbound);

    let ((bytes_in, error_in), (bytes_out, error_out)) = tokio::join!(
        copy_direction(
            inbound_reader,
            outbound_writer,
            &pair,
            copy_timeout,
            Direction::Inbound
        ),
        copy_direction(
            outbound_reader,
            inbound_writer,
            &pair,
            copy_timeout,
            Direction::Outbound
        ),
    );

    RelayReport {
        bytes_in,
        bytes_out,
        error_in,
        error_out,
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    pair: &CancellationToken,
    copy_timeout: Option<Duration>,
    direction: Direction,
) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    let error = loop {
        let read = tokio::select! {
            () = pair.cancelled() => break None,
            read = read_with_timeout(&mut reader, &mut buffer, copy_timeout) => read,
        };

        match read {
            Ok(0) => {
                debug!(%direction, bytes = copied, "Source closed");
                // Pass the FIN along; the sibling direction is stopped right after.
                let _ = writer.shutdown().await;
                break None;
            }
            Ok(n) => {
                let written = tokio::select! {
                    () = pair.cancelled() => break None,
                    written = writer.write_all(&buffer[..n]) => written,
                };
                if let Err(e) = written {
                    debug!(%direction, error = %e, bytes = n, "Failed to write");
                    break Some(e);
                }
                copied += n as u64;
            }
            Err(e) => {
                debug!(%direction, error = %e, "Failed to read");
                break Some(e);
            }
        }
    };

    pair.cancel();
    (copied, error)
}

async fn read_with_timeout<R>(
    reader: &mut R,
    buffer: &mut [u8],
    copy_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match copy_timeout {
        Some(limit) => timeout(limit, reader.read(buffer)).await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no data within {limit:?}"),
            ))
        }),
        None => reader.read(buffer).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn copies_both_directions() {
        let (mut client, inbound) = duplex(1024);
        let (outbound, mut server) = duplex(1024);
        let shutdown = CancellationToken::new();

        let relay_task =
            tokio::spawn(async move { relay(inbound, outbound, &shutdown, None).await });

        client.write_all(b"anybody there?").await.unwrap();
        let mut request = [0u8; 14];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"anybody there?");

        server.write_all(b"hello world\n").await.unwrap();
        drop(server);

        let mut response = Vec::new();
        timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, b"hello world\n");

        let report = timeout(TEST_TIMEOUT, relay_task).await.unwrap().unwrap();
        assert_eq!(report.bytes_in, 14);
        assert_eq!(report.bytes_out, 12);
        assert!(report.error_in.is_none());
        assert!(report.error_out.is_none());
    }

    #[tokio::test]
    async fn client_close_ends_relay() {
        let (client, inbound) = duplex(1024);
        let (outbound, mut server) = duplex(1024);
        let shutdown = CancellationToken::new();

        drop(client);
        let report = timeout(TEST_TIMEOUT, relay(inbound, outbound, &shutdown, None))
            .await
            .unwrap();

        assert_eq!(report.bytes_in, 0);
        assert_eq!(report.bytes_out, 0);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn shutdown_unblocks_idle_relay() {
        let (_client, inbound) = duplex(1024);
        let (outbound, _server) = duplex(1024);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let relay_task =
            tokio::spawn(async move { relay(inbound, outbound, &token, None).await });

        shutdown.cancel();
        let report = timeout(TEST_TIMEOUT, relay_task).await.unwrap().unwrap();

        assert_eq!(report.bytes_in, 0);
        assert_eq!(report.bytes_out, 0);
        assert!(report.error_in.is_none());
        assert!(report.error_out.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_reports_timed_out() {
        let (_client, inbound) = duplex(1024);
        let (outbound, _server) = duplex(1024);
        let shutdown = CancellationToken::new();

        let report = timeout(
            TEST_TIMEOUT,
            relay(inbound, outbound, &shutdown, Some(Duration::from_millis(50))),
        )
        .await
        .unwrap();

        let kind = report
            .error(Direction::Inbound)
            .or_else(|| report.error(Direction::Outbound))
            .map(io::Error::kind);
        assert_eq!(kind, Some(io::ErrorKind::TimedOut));
        assert_eq!(report.bytes(Direction::Inbound), 0);
        assert_eq!(report.bytes(Direction::Outbound), 0);
    }

    #[tokio::test]
    async fn copies_more_than_one_buffer() {
        let (mut client, inbound) = duplex(64 * 1024);
        let (outbound, mut server) = duplex(64 * 1024);
        let shutdown = CancellationToken::new();

        let relay_task =
            tokio::spawn(async move { relay(inbound, outbound, &shutdown, None).await });

        let payload = vec![0xAB; BUFFER_SIZE * 3 + 17];
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        timeout(TEST_TIMEOUT, server.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);

        let report = timeout(TEST_TIMEOUT, relay_task).await.unwrap().unwrap();
        assert_eq!(report.bytes_in, payload.len() as u64);
    }
}
