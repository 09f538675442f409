use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::mctunnel::{
    config, dialer, logging, proxy,
    resolver::{self, SharedSrvLookup},
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        domain = %cfg.domain,
        strict_domain = cfg.strict_domain,
        proxies = cfg.proxies.len(),
        rate = cfg.ratelimit.rate,
        capacity = cfg.ratelimit.capacity,
        "mctunnel: starting"
    );

    let lookup: SharedSrvLookup = Arc::new(resolver::HickorySrvLookup::from_system_conf());
    let backend_resolver = Arc::new(resolver::BackendResolver::new(
        lookup,
        resolver::ResolverOptions {
            domain: cfg.domain.clone(),
            strict_domain: cfg.strict_domain,
            service: cfg.resolver.service.clone(),
            proto: cfg.resolver.proto.clone(),
            default_port: cfg.resolver.default_port,
            cache_ttl: cfg.resolver.cache_ttl,
            cache_capacity: cfg.resolver.cache_capacity,
        },
    ));
    let sessions = Arc::new(telemetry::SessionRegistry::new());

    let opts = Arc::new(proxy::ProxyOptions {
        resolver: backend_resolver,
        dialer: Arc::new(dialer::Dialer::new(
            cfg.proxies.clone(),
            cfg.timeouts.dial_timeout,
        )),
        sessions: sessions.clone(),
        runtime: proxy::RuntimeConfig {
            handshake_timeout: cfg.timeouts.handshake_timeout,
            resolve_timeout: cfg.timeouts.resolve_timeout,
            max_frame_bytes: cfg.max_frame_bytes,
            buffer_size: cfg.buffer_size,
            read_login_start: cfg.read_login_start,
            handshake_address: cfg.handshake_address,
            disconnect_message: cfg.disconnect_message.clone(),
            status: cfg.status.clone(),
        },
    });

    let limiter = proxy::accept_limiter(cfg.ratelimit.rate, cfg.ratelimit.capacity)?;
    let ln = proxy::bind(&cfg.listen_addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    {
        let shutdown = shutdown_rx.clone();
        let opts = opts.clone();
        tasks.spawn(async move { proxy::serve_listener(ln, opts, limiter, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    if !sessions.is_empty() {
        tracing::info!(active = sessions.len(), "shutdown: closing active sessions");
        for s in sessions.snapshot() {
            tracing::debug!(
                sid = %s.id,
                client = %s.client,
                host = %s.host,
                player = %s.player,
                backend = %s.backend,
                via = %s.via,
                age_ms = telemetry::now_unix_ms().saturating_sub(s.started_at_unix_ms),
                "shutdown: active session"
            );
        }
    }

    // Relays observe the shutdown flag and unregister themselves as they close.
    let drain = async {
        while let Some(_res) = tasks.join_next().await {}
        while !sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(active = sessions.len(), "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
