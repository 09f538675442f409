//! Bidirectional byte pump between a client and its backend.
//!
//! Each direction runs in its own task. The first direction to finish (EOF or
//! error), or a shutdown request, stops both and closes both connections.

use std::{fmt, io};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
};

use crate::mctunnel::net;

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

#[derive(Debug)]
pub enum RelayEnd {
    /// The source of this direction closed cleanly.
    Done(Direction),
    Failed(Direction, io::Error),
    Shutdown,
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub end: RelayEnd,
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

pub async fn relay<C, B>(
    client: C,
    backend: B,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (backend_r, backend_w) = tokio::io::split(backend);

    let (events_tx, mut events_rx) = mpsc::channel::<RelayEnd>(2);
    let (stop_tx, stop_rx) = watch::channel(false);

    let up = tokio::spawn(pump(
        Direction::ClientToBackend,
        client_r,
        backend_w,
        buffer_size,
        events_tx.clone(),
        stop_rx.clone(),
    ));
    let down = tokio::spawn(pump(
        Direction::BackendToClient,
        backend_r,
        client_w,
        buffer_size,
        events_tx,
        stop_rx,
    ));

    let end = tokio::select! {
        ev = events_rx.recv() => ev.unwrap_or(RelayEnd::Shutdown),
        _ = net::shutdown_requested(&mut shutdown) => RelayEnd::Shutdown,
    };

    let _ = stop_tx.send(true);
    let client_to_backend = up.await.unwrap_or_default();
    let backend_to_client = down.await.unwrap_or_default();

    RelayOutcome {
        end,
        client_to_backend,
        backend_to_client,
    }
}

async fn pump<R, W>(
    dir: Direction,
    mut src: R,
    mut dst: W,
    buffer_size: usize,
    events: mpsc::Sender<RelayEnd>,
    mut stop: watch::Receiver<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1024)];
    let mut total = 0u64;

    let ev = loop {
        let n = tokio::select! {
            res = src.read(&mut buf) => match res {
                Ok(0) => break RelayEnd::Done(dir),
                Ok(n) => n,
                Err(err) => break RelayEnd::Failed(dir, err),
            },
            _ = net::shutdown_requested(&mut stop) => return total,
        };
        tokio::select! {
            res = dst.write_all(&buf[..n]) => {
                if let Err(err) = res {
                    break RelayEnd::Failed(dir, err);
                }
            }
            _ = net::shutdown_requested(&mut stop) => return total,
        }
        total += n as u64;
    };

    let _ = dst.shutdown().await;
    let _ = events.send(ev).await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pumps_both_ways_until_client_closes() {
        let (mut client, client_end) = duplex(1024);
        let (backend_end, mut backend) = duplex(1024);
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(relay(client_end, backend_end, 1024, rx));

        client.write_all(b"hello backend").await.unwrap();
        let mut got = [0u8; 13];
        backend.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello backend");

        backend.write_all(b"hi").await.unwrap();
        let mut got = [0u8; 2];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hi");

        drop(client);
        let out = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(out.end, RelayEnd::Done(Direction::ClientToBackend)));
        assert_eq!(out.client_to_backend, 13);
        assert_eq!(out.backend_to_client, 2);

        // the backend side sees the close too
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn preserves_order_across_many_writes() {
        let (mut client, client_end) = duplex(64);
        let (backend_end, mut backend) = duplex(64);
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(relay(client_end, backend_end, 16, rx));

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(37) {
                client.write_all(chunk).await.unwrap();
            }
            client
        });

        let mut got = vec![0u8; expected.len()];
        backend.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        drop(writer.await.unwrap());
        let out = task.await.unwrap();
        assert_eq!(out.client_to_backend, 10_000);
    }

    #[tokio::test]
    async fn shutdown_unblocks_idle_relay() {
        let (_client, client_end) = duplex(64);
        let (backend_end, mut backend) = duplex(64);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(relay(client_end, backend_end, 1024, rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let out = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("relay stopped")
            .unwrap();
        assert!(matches!(out.end, RelayEnd::Shutdown));

        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
