use std::{fmt, net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::BytesMut;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

use crate::mctunnel::{
    config::{AddressPolicy, StatusConfig},
    dialer::Dialer,
    net,
    protocol::{
        Disconnect, Frame, FrameReader, Handshake, Initial, LegacyKick, LegacyQuery, LoginStart,
        NextState, Pong, ProtocolError, Serverbound, ServerStatus, State, StatusResponse,
        encode_frame,
    },
    relay::{self, RelayEnd},
    resolver::{BackendResolver, BackendTarget},
    telemetry,
};

/// Protocol number legacy clients read as "incompatible version", which makes
/// them show the MOTD instead of a ping.
const LEGACY_PROTOCOL: i32 = 127;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub handshake_timeout: Duration,
    pub resolve_timeout: Duration,
    pub max_frame_bytes: usize,
    pub buffer_size: usize,
    pub read_login_start: bool,
    pub handshake_address: AddressPolicy,
    pub disconnect_message: String,
    pub status: StatusConfig,
}

pub struct ProxyOptions {
    pub resolver: Arc<BackendResolver>,
    pub dialer: Arc<Dialer>,
    pub sessions: telemetry::SharedSessions,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Handshaking,
    StatusQuery,
    LoginForward,
    Relaying,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnState::Handshaking => "handshaking",
            ConnState::StatusQuery => "status",
            ConnState::LoginForward => "login",
            ConnState::Relaying => "relaying",
        })
    }
}

/// Result of the client-facing part of a connection.
enum Hello {
    /// Answered locally; nothing to forward.
    Answered,
    Login {
        handshake: Handshake,
        login: Option<(LoginStart, Frame)>,
    },
}

/// Token bucket for accepted connections: `rate` per second, bursts up to
/// `capacity`.
pub fn accept_limiter(rate: u32, capacity: u32) -> anyhow::Result<DefaultDirectRateLimiter> {
    let rate = NonZeroU32::new(rate).context("ratelimit: rate must be > 0")?;
    let burst = NonZeroU32::new(capacity).context("ratelimit: capacity must be > 0")?;
    Ok(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}

pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))
}

/// Accepts connections until shutdown. The listener is dropped (closing the
/// socket) before this returns, including while waiting for a rate limit
/// token.
pub async fn serve_listener(
    ln: TcpListener,
    opts: Arc<ProxyOptions>,
    limiter: DefaultDirectRateLimiter,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local = ln
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    tracing::info!(listen_addr = %local, "tcp: listening");

    loop {
        tokio::select! {
            _ = net::shutdown_requested(&mut shutdown) => break,
            _ = limiter.until_ready() => {}
        }

        tokio::select! {
            _ = net::shutdown_requested(&mut shutdown) => break,
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "tcp: accept failed");
                        if net::sleep_or_shutdown(ACCEPT_BACKOFF, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                };
                let opts = opts.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "tcp: accepted");
                    }
                    handle_conn(conn, peer, opts, shutdown).await;
                });
            }
        }
    }

    drop(ln);
    tracing::info!(listen_addr = %local, "tcp: listener closed");
    Ok(())
}

pub async fn handle_conn(
    conn: TcpStream,
    peer: SocketAddr,
    opts: Arc<ProxyOptions>,
    shutdown: watch::Receiver<bool>,
) {
    let sid = telemetry::new_session_id();
    let client = peer.to_string();
    let rt = &opts.runtime;

    let _ = conn.set_nodelay(true);
    let mut reader = FrameReader::new(conn, rt.max_frame_bytes);
    let mut state = ConnState::Handshaking;

    let hello = {
        let fut = read_hello(&mut reader, &opts, &mut state);
        if rt.handshake_timeout > Duration::from_millis(0) {
            match time::timeout(rt.handshake_timeout, fut).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::debug!(sid=%sid, client=%client, state=%state, "proxy: handshake timeout");
                    let _ = reader.get_mut().shutdown().await;
                    return;
                }
            }
        } else {
            fut.await
        }
    };

    let (handshake, login) = match hello {
        Ok(Hello::Answered) => {
            tracing::debug!(sid=%sid, client=%client, state=%state, "proxy: answered locally");
            let _ = reader.get_mut().shutdown().await;
            return;
        }
        Ok(Hello::Login { handshake, login }) => (handshake, login),
        Err(ProtocolError::Eof) => {
            tracing::debug!(sid=%sid, client=%client, state=%state, "proxy: client closed during handshake");
            return;
        }
        Err(err) => {
            tracing::warn!(sid=%sid, client=%client, state=%state, err=%err, "proxy: handshake failed");
            let _ = reader.get_mut().shutdown().await;
            return;
        }
    };

    let host = handshake.server_address.clone();
    let player = login
        .as_ref()
        .map(|(ls, _)| ls.name.clone())
        .unwrap_or_default();

    let target = match resolve_backend(&opts, &host).await {
        Ok(t) => t,
        Err(err) => {
            tracing::warn!(sid=%sid, client=%client, host=%host, player=%player, err=%format!("{err:#}"), "proxy: resolve failed");
            send_disconnect(reader.get_mut(), &rt.disconnect_message).await;
            return;
        }
    };

    let (mut backend, via) = match opts.dialer.dial(&target).await {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(sid=%sid, client=%client, host=%host, backend=%target.addr(), err=%format!("{err:#}"), "proxy: backend dial failed");
            send_disconnect(reader.get_mut(), &rt.disconnect_message).await;
            return;
        }
    };

    let rewritten = Handshake {
        protocol_version: handshake.protocol_version,
        server_address: match rt.handshake_address {
            AddressPolicy::Canonical => target.server_address.clone(),
            AddressPolicy::Target => target.host.clone(),
        },
        server_port: target.port,
        next_state: NextState::Login,
        mod_marker: handshake.mod_marker,
    };

    let (mut conn, leftover) = reader.into_parts();
    let prelude = match build_prelude(&rewritten, login.as_ref().map(|(_, f)| f), &leftover) {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(sid=%sid, client=%client, host=%host, err=%err, "proxy: handshake re-encode failed");
            send_disconnect(&mut conn, &rt.disconnect_message).await;
            let _ = backend.shutdown().await;
            return;
        }
    };

    if let Err(err) = backend.write_all(&prelude).await {
        tracing::debug!(sid=%sid, err=%err, "proxy: failed writing handshake to backend");
        let _ = conn.shutdown().await;
        return;
    }

    state = ConnState::Relaying;
    let _active = telemetry::ActiveSession::register(
        &opts.sessions,
        telemetry::SessionInfo {
            id: sid.clone(),
            client: client.clone(),
            host: host.clone(),
            player: player.clone(),
            backend: target.addr(),
            via: via.clone(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        },
    );
    tracing::info!(sid=%sid, client=%client, host=%host, player=%player, backend=%target.addr(), via=%via, "proxy: relaying");

    let out = relay::relay(conn, backend, rt.buffer_size, shutdown).await;
    match out.end {
        RelayEnd::Done(dir) => {
            tracing::debug!(sid=%sid, state=%state, closed_by=%dir, up=out.client_to_backend, down=out.backend_to_client, "proxy: session closed");
        }
        RelayEnd::Failed(dir, err) => {
            tracing::debug!(sid=%sid, state=%state, direction=%dir, err=%err, up=out.client_to_backend, down=out.backend_to_client, "proxy: session ended with error");
        }
        RelayEnd::Shutdown => {
            tracing::debug!(sid=%sid, state=%state, up=out.client_to_backend, down=out.backend_to_client, "proxy: session stopped by shutdown");
        }
    }
}

async fn read_hello(
    reader: &mut FrameReader<TcpStream>,
    opts: &ProxyOptions,
    state: &mut ConnState,
) -> Result<Hello, ProtocolError> {
    let rt = &opts.runtime;

    let frame = match reader.read_initial().await? {
        Initial::LegacyPing(ping) => {
            *state = ConnState::StatusQuery;
            if rt.status.enabled {
                let motd = motd_for(opts, &ping.server_address);
                answer_legacy(reader.get_mut(), LegacyQuery::WithPayload, motd, opts).await?;
            }
            return Ok(Hello::Answered);
        }
        Initial::LegacyQuery(query) => {
            *state = ConnState::StatusQuery;
            if rt.status.enabled {
                let motd = rt.status.motd.clone();
                answer_legacy(reader.get_mut(), query, motd, opts).await?;
            }
            return Ok(Hello::Answered);
        }
        Initial::Frame(f) => f,
    };

    let handshake = match Serverbound::decode(State::Handshaking, &frame)? {
        Serverbound::Handshake(h) => h,
        other => {
            return Err(ProtocolError::UnexpectedContent(format!(
                "expected handshake, got {other:?}"
            )));
        }
    };

    match handshake.next_state {
        NextState::Status => {
            *state = ConnState::StatusQuery;
            if rt.status.enabled {
                answer_status(reader, &handshake, opts).await?;
            }
            Ok(Hello::Answered)
        }
        NextState::Login => {
            *state = ConnState::LoginForward;
            let login = if rt.read_login_start {
                let f = reader.read_frame().await?;
                match Serverbound::decode(State::Login, &f)? {
                    Serverbound::LoginStart(ls) => Some((ls, f)),
                    other => {
                        return Err(ProtocolError::UnexpectedContent(format!(
                            "expected login start, got {other:?}"
                        )));
                    }
                }
            } else {
                None
            };
            Ok(Hello::Login { handshake, login })
        }
    }
}

fn motd_for(opts: &ProxyOptions, host: &str) -> String {
    let st = &opts.runtime.status;
    if opts.resolver.lookup_key(host).is_ok() {
        st.motd.clone()
    } else {
        st.unknown_host_motd.clone()
    }
}

async fn answer_status(
    reader: &mut FrameReader<TcpStream>,
    handshake: &Handshake,
    opts: &ProxyOptions,
) -> Result<(), ProtocolError> {
    let st = &opts.runtime.status;

    let f = reader.read_frame().await?;
    match Serverbound::decode(State::Status, &f)? {
        Serverbound::StatusRequest(_) => {}
        other => {
            return Err(ProtocolError::UnexpectedContent(format!(
                "expected status request, got {other:?}"
            )));
        }
    }

    let mut status = ServerStatus::new(
        &st.version_name,
        handshake.protocol_version,
        st.max_players,
        &motd_for(opts, &handshake.server_address),
    );
    status.favicon = st.favicon.clone();
    let resp = encode_frame(&StatusResponse { status })?;
    reader.get_mut().write_all(&resp).await?;

    // The ping is optional; some clients hang up right after the response.
    let f = match reader.read_frame().await {
        Ok(f) => f,
        Err(ProtocolError::Eof) => return Ok(()),
        Err(err) => return Err(err),
    };
    match Serverbound::decode(State::Status, &f)? {
        Serverbound::Ping(p) => {
            let pong = encode_frame(&Pong { payload: p.payload })?;
            reader.get_mut().write_all(&pong).await?;
            Ok(())
        }
        other => Err(ProtocolError::UnexpectedContent(format!(
            "expected ping, got {other:?}"
        ))),
    }
}

async fn answer_legacy(
    conn: &mut TcpStream,
    query: LegacyQuery,
    motd: String,
    opts: &ProxyOptions,
) -> Result<(), ProtocolError> {
    let st = &opts.runtime.status;
    let kick = LegacyKick {
        protocol_version: LEGACY_PROTOCOL,
        version_name: st.version_name.clone(),
        motd,
        online: 0,
        max_players: st.max_players,
    };
    conn.write_all(&kick.encode_for(query)?).await?;
    Ok(())
}

async fn resolve_backend(opts: &ProxyOptions, host: &str) -> anyhow::Result<BackendTarget> {
    let timeout = opts.runtime.resolve_timeout;
    if timeout > Duration::from_millis(0) {
        Ok(time::timeout(timeout, opts.resolver.resolve(host))
            .await
            .with_context(|| format!("resolve timeout {host}"))??)
    } else {
        Ok(opts.resolver.resolve(host).await?)
    }
}

fn build_prelude(
    handshake: &Handshake,
    login: Option<&Frame>,
    leftover: &[u8],
) -> Result<BytesMut, ProtocolError> {
    let hs = encode_frame(handshake)?;
    let login_len = login.map(|f| f.raw.len()).unwrap_or(0);
    let mut out = BytesMut::with_capacity(hs.len() + login_len + leftover.len());
    out.extend_from_slice(&hs);
    if let Some(f) = login {
        out.extend_from_slice(&f.raw);
    }
    out.extend_from_slice(leftover);
    Ok(out)
}

async fn send_disconnect(conn: &mut TcpStream, message: &str) {
    if let Ok(frame) = encode_frame(&Disconnect::text(message)) {
        let _ = conn.write_all(&frame).await;
    }
    let _ = conn.shutdown().await;
}
