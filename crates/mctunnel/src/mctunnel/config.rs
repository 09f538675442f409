use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::mctunnel::{dialer::Socks5Proxy, protocol::frame::DEFAULT_MAX_FRAME_LEN, relay};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps MCTUNNEL_CONFIG into the flag already; this covers callers
    // that bypass the CLI.
    if let Some(p) = std::env::var_os("MCTUNNEL_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("mctunnel.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["mctunnel.toml", "mctunnel.yaml", "mctunnel.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no mctunnel.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/mctunnel/mctunnel.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "mctunnel", "mctunnel")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("mctunnel.toml"))
    }
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {}", other),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Suffix stripped from virtual hosts, without the leading dot.
    pub domain: String,
    pub strict_domain: bool,
    pub proxies: Vec<Socks5Proxy>,
    pub ratelimit: RateLimitConfig,
    pub timeouts: Timeouts,
    pub resolver: ResolverConfig,
    pub status: StatusConfig,
    pub handshake_address: AddressPolicy,
    pub read_login_start: bool,
    pub disconnect_message: String,
    pub max_frame_bytes: usize,
    pub buffer_size: usize,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Accepted connections per second.
    pub rate: u32,
    pub capacity: u32,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub handshake_timeout: Duration,
    pub resolve_timeout: Duration,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub default_port: u16,
    pub service: String,
    pub proto: String,
}

/// Keeps every status text, and the legacy kick built from all of them,
/// inside the kick's u16 length field.
const MAX_STATUS_TEXT_UNITS: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub enabled: bool,
    pub version_name: String,
    pub max_players: i32,
    pub motd: String,
    pub unknown_host_motd: String,
    pub favicon: Option<String>,
}

/// What the backend sees as the handshake server address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPolicy {
    /// The virtual host with the tunnel domain removed.
    Canonical,
    /// The host the connection was actually dialed to.
    Target,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    domain: Option<String>,
    #[serde(default)]
    strict_domain: bool,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    production: bool,
    #[serde(default)]
    proxies: Vec<String>,
    ratelimit: Option<FileRateLimit>,
    timeouts: Option<FileTimeouts>,
    resolver: Option<FileResolver>,
    status: Option<FileStatus>,
    handshake_address: Option<String>,
    read_login_start: Option<bool>,
    disconnect_message: Option<String>,
    #[serde(default)]
    max_frame_bytes: i64,
    #[serde(default)]
    buffer_size: i64,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRateLimit {
    rate: Option<i64>,
    capacity: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    handshake_timeout_ms: Option<i64>,
    resolve_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileResolver {
    cache_ttl_ms: Option<i64>,
    cache_capacity: Option<i64>,
    default_port: Option<u16>,
    service: Option<String>,
    proto: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStatus {
    enabled: Option<bool>,
    version_name: Option<String>,
    max_players: Option<i32>,
    motd: Option<String>,
    unknown_host_motd: Option<String>,
    favicon: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|v| v.max(0) as u64).unwrap_or(default))
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let rl = fc.ratelimit.as_ref();
        let rate = rl.and_then(|r| r.rate).unwrap_or(150);
        let capacity = rl.and_then(|r| r.capacity).unwrap_or(1000);
        if rate <= 0 || rate > u32::MAX as i64 {
            anyhow::bail!("config: ratelimit.rate must be a positive integer, got {rate}");
        }
        if capacity <= 0 || capacity > u32::MAX as i64 {
            anyhow::bail!("config: ratelimit.capacity must be a positive integer, got {capacity}");
        }

        let t = fc.timeouts.as_ref();
        let timeouts = Timeouts {
            handshake_timeout: millis(t.and_then(|t| t.handshake_timeout_ms), 5000),
            resolve_timeout: millis(t.and_then(|t| t.resolve_timeout_ms), 5000),
            dial_timeout: millis(t.and_then(|t| t.dial_timeout_ms), 3000),
        };

        let r = fc.resolver.as_ref();
        let resolver = ResolverConfig {
            cache_ttl: millis(r.and_then(|r| r.cache_ttl_ms), 5 * 60 * 1000),
            cache_capacity: r
                .and_then(|r| r.cache_capacity)
                .unwrap_or(10_000)
                .max(0) as usize,
            default_port: r.and_then(|r| r.default_port).unwrap_or(25565),
            service: non_empty(r.and_then(|r| r.service.as_ref())).unwrap_or_else(|| "minecraft".into()),
            proto: non_empty(r.and_then(|r| r.proto.as_ref())).unwrap_or_else(|| "tcp".into()),
        };
        if resolver.default_port == 0 {
            anyhow::bail!("config: resolver.default_port must not be 0");
        }

        let st = fc.status.as_ref();
        let favicon = non_empty(st.and_then(|s| s.favicon.as_ref()));
        if let Some(f) = &favicon {
            if !f.starts_with("data:image/png;base64,") {
                anyhow::bail!("config: status.favicon must be a data:image/png;base64 URI");
            }
        }
        let status = StatusConfig {
            enabled: st.and_then(|s| s.enabled).unwrap_or(true),
            version_name: non_empty(st.and_then(|s| s.version_name.as_ref()))
                .unwrap_or_else(|| "mctunnel".into()),
            max_players: st.and_then(|s| s.max_players).unwrap_or(0),
            motd: st
                .and_then(|s| s.motd.clone())
                .unwrap_or_else(|| "mctunnel".into()),
            unknown_host_motd: st
                .and_then(|s| s.unknown_host_motd.clone())
                .unwrap_or_else(|| "Unknown hostname".into()),
            favicon,
        };
        for (field, text) in [
            ("status.version_name", &status.version_name),
            ("status.motd", &status.motd),
            ("status.unknown_host_motd", &status.unknown_host_motd),
        ] {
            if text.encode_utf16().count() > MAX_STATUS_TEXT_UNITS {
                anyhow::bail!("config: {field} is longer than {MAX_STATUS_TEXT_UNITS} characters");
            }
        }

        let handshake_address = match non_empty(fc.handshake_address.as_ref())
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("canonical") => AddressPolicy::Canonical,
            Some("target") => AddressPolicy::Target,
            Some(other) => anyhow::bail!(
                "config: handshake_address must be \"canonical\" or \"target\", got {other:?}"
            ),
        };

        let proxies = fc
            .proxies
            .iter()
            .enumerate()
            .map(|(i, p)| Socks5Proxy::parse(p).with_context(|| format!("config: proxies[{i}]")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut cfg = Config {
            listen_addr: non_empty(fc.listen_addr.as_ref()).unwrap_or_else(|| ":25565".into()),
            domain: fc
                .domain
                .as_deref()
                .unwrap_or("")
                .trim()
                .trim_matches('.')
                .to_ascii_lowercase(),
            strict_domain: fc.strict_domain,
            proxies,
            ratelimit: RateLimitConfig {
                rate: rate as u32,
                capacity: capacity as u32,
            },
            timeouts,
            resolver,
            status,
            handshake_address,
            read_login_start: fc.read_login_start.unwrap_or(true),
            disconnect_message: non_empty(fc.disconnect_message.as_ref())
                .unwrap_or_else(|| "Could not connect to the server".into()),
            max_frame_bytes: fc.max_frame_bytes.max(0) as usize,
            buffer_size: fc.buffer_size.max(0) as usize,
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        if cfg.strict_domain && cfg.domain.is_empty() {
            anyhow::bail!("config: strict_domain requires domain");
        }
        if cfg.max_frame_bytes == 0 {
            cfg.max_frame_bytes = DEFAULT_MAX_FRAME_LEN;
        }
        if cfg.buffer_size == 0 {
            cfg.buffer_size = relay::DEFAULT_BUFFER_SIZE;
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(l.level.as_ref()) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = non_empty(l.format.as_ref()) {
                cfg.logging.format = fmt;
            }
            if let Some(out) = non_empty(l.output.as_ref()) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }
        if fc.debug {
            cfg.logging.level = "debug".into();
        }
        if fc.production {
            cfg.logging.format = "json".into();
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# mctunnel configuration (auto-generated)
#
# This file was created because mctunnel could not find a configuration file at
# the resolved config path.
#
# Players connect to <server>.<domain>. mctunnel strips the domain, looks up
# the SRV record _minecraft._tcp.<server> (falling back to <server>:25565) and
# forwards the connection there.

listen_addr = ":25565"
domain = ""
strict_domain = false

# debug = true forces log level "debug"; production = true forces JSON logs.
debug = false
production = false

# Optional SOCKS5 proxies for backend connections, rotated per connection.
# proxies = ["socks5://127.0.0.1:1080"]
proxies = []

[ratelimit]
rate = 150
capacity = 1000

[timeouts]
handshake_timeout_ms = 5000
resolve_timeout_ms = 5000
dial_timeout_ms = 3000

[resolver]
cache_ttl_ms = 300000
cache_capacity = 10000
default_port = 25565

[status]
enabled = true
version_name = "mctunnel"
max_players = 0
motd = "mctunnel"
unknown_host_motd = "Unknown hostname"

[logging]
level = "info"
format = "text"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# mctunnel configuration (auto-generated)
#
# This file was created because mctunnel could not find a configuration file at
# the resolved config path.
#
# Players connect to <server>.<domain>. mctunnel strips the domain, looks up
# the SRV record _minecraft._tcp.<server> (falling back to <server>:25565) and
# forwards the connection there.

listen_addr: ":25565"
domain: ""
strict_domain: false

# debug: true forces log level "debug"; production: true forces JSON logs.
debug: false
production: false

# Optional SOCKS5 proxies for backend connections, rotated per connection.
# proxies: ["socks5://127.0.0.1:1080"]
proxies: []

ratelimit:
  rate: 150
  capacity: 1000

timeouts:
  handshake_timeout_ms: 5000
  resolve_timeout_ms: 5000
  dial_timeout_ms: 3000

resolver:
  cache_ttl_ms: 300000
  cache_capacity: 10000
  default_port: 25565

status:
  enabled: true
  version_name: "mctunnel"
  max_players: 0
  motd: "mctunnel"
  unknown_host_motd: "Unknown hostname"

logging:
  level: "info"
  format: "text"
  output: "stderr"
  add_source: false
"#;
