use std::{borrow::Cow, time::Duration};

use tokio::sync::watch;

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Resolves once the flag behind `rx` is set.
///
/// A dropped sender never counts as a shutdown request; the future then stays
/// pending so it can sit in a `select!` arm.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleeps for `d` unless shutdown is requested first. Returns `true` on
/// shutdown.
pub async fn sleep_or_shutdown(d: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_requested(rx) => true,
        _ = tokio::time::sleep(d) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":25565").as_ref(), "0.0.0.0:25565");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[tokio::test]
    async fn shutdown_requested_fires_on_true_only() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(false).unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(30), shutdown_requested(&mut rx)).await;
        assert!(waited.is_err());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), shutdown_requested(&mut rx))
            .await
            .expect("shutdown observed");
    }

    #[tokio::test]
    async fn dropped_sender_is_not_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited = tokio::time::timeout(Duration::from_millis(30), shutdown_requested(&mut rx)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn backoff_sleep_is_cut_short_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_millis(10), &mut rx).await);

        let waker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
            tx
        });
        let stopped = tokio::time::timeout(
            Duration::from_secs(1),
            sleep_or_shutdown(Duration::from_secs(30), &mut rx),
        )
        .await
        .expect("backoff returned promptly");
        assert!(stopped);
        drop(waker.await.unwrap());
    }
}
