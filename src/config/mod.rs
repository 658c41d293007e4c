//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "specchio";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_RELAY_PORT: u16 = 8080;
const DEFAULT_RENDERER_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_TARGET_URL: &str = "https://example.org/";
const DEFAULT_RENDERER_URL: &str = "http://127.0.0.1:3001/";
const DEFAULT_COOKIE_NAME: &str = "specchio_sid";
const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 60;
const DEFAULT_NAV_TIMEOUT_SECS: u64 = 45;
const DEFAULT_SETTLE_GRACE_MS: u64 = 500;
const DEFAULT_ENGINE_LAUNCH_TIMEOUT_SECS: u64 = 15;

/// Command-line arguments for the specchio binary.
#[derive(Debug, Parser)]
#[command(name = "specchio", version, about = "Specchio snapshot-browsing relay")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SPECCHIO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run relay and renderer together in one process.
    Serve(Box<ServeArgs>),
    /// Run only the client-facing relay, against a remote renderer.
    Relay(Box<RelayArgs>),
    /// Run only the renderer service.
    Renderer(Box<RendererArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub server: ServerOverrides,

    #[command(flatten)]
    pub relay: RelayOverrides,

    #[command(flatten)]
    pub renderer: RendererOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RelayArgs {
    #[command(flatten)]
    pub server: ServerOverrides,

    #[command(flatten)]
    pub relay: RelayOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RendererArgs {
    #[command(flatten)]
    pub server: ServerOverrides,

    #[command(flatten)]
    pub renderer: RendererOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServerOverrides {
    /// Override the listener host for both services.
    #[arg(long = "server-host", value_name = "HOST")]
    pub host: Option<String>,

    /// Override the relay listener port.
    #[arg(long = "server-relay-port", value_name = "PORT")]
    pub relay_port: Option<u16>,

    /// Override the renderer listener port.
    #[arg(long = "server-renderer-port", value_name = "PORT")]
    pub renderer_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RelayOverrides {
    /// Override the start target opened for fresh sessions.
    #[arg(long = "relay-target-url", value_name = "URL")]
    pub target_url: Option<String>,

    /// Override the renderer base URL the relay talks to.
    #[arg(long = "relay-renderer-url", value_name = "URL")]
    pub renderer_url: Option<String>,

    /// Override the session cookie name.
    #[arg(long = "relay-cookie-name", value_name = "NAME")]
    pub cookie_name: Option<String>,

    /// Override the relay→renderer request timeout.
    #[arg(long = "relay-backend-timeout-seconds", value_name = "SECONDS")]
    pub backend_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RendererOverrides {
    /// Override the per-operation navigation timeout.
    #[arg(long = "renderer-nav-timeout-seconds", value_name = "SECONDS")]
    pub nav_timeout_seconds: Option<u64>,

    /// Override the trailing capture grace period.
    #[arg(long = "renderer-settle-grace-ms", value_name = "MILLIS")]
    pub settle_grace_ms: Option<u64>,

    /// Override the browser binary the engine launches.
    #[arg(long = "engine-browser-path", value_name = "PATH")]
    pub browser_path: Option<PathBuf>,

    /// Route engine traffic through a proxy (e.g. socks5://tor:9050).
    #[arg(long = "engine-proxy", value_name = "URL")]
    pub proxy: Option<String>,

    /// Override the engine launch readiness timeout.
    #[arg(long = "engine-launch-timeout-seconds", value_name = "SECONDS")]
    pub launch_timeout_seconds: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub relay: RelaySettings,
    pub renderer: RendererSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub relay_addr: SocketAddr,
    pub renderer_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Target opened when a fresh session bootstraps.
    pub target_url: Url,
    pub renderer_url: Url,
    pub cookie_name: String,
    pub backend_timeout: Duration,
    /// Ordered transform steps; order here is execution order.
    pub transforms: Vec<TransformSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformSettings {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_options")]
    pub options: Value,
}

fn default_enabled() -> bool {
    true
}

fn default_options() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    /// Overall per-operation timeout; expiry fails the operation.
    pub nav_timeout: Duration,
    /// Trailing capture window; expiry never fails the operation.
    pub settle_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub browser_path: Option<PathBuf>,
    pub proxy: Option<String>,
    pub launch_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("SPECCHIO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => {
            raw.apply_server_overrides(&args.server);
            raw.apply_relay_overrides(&args.relay);
            raw.apply_renderer_overrides(&args.renderer);
        }
        Some(Command::Relay(args)) => {
            raw.apply_server_overrides(&args.server);
            raw.apply_relay_overrides(&args.relay);
        }
        Some(Command::Renderer(args)) => {
            raw.apply_server_overrides(&args.server);
            raw.apply_renderer_overrides(&args.renderer);
        }
        None => {}
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    relay: RawRelaySettings,
    renderer: RawRendererSettings,
    engine: RawEngineSettings,
}

impl RawSettings {
    fn apply_server_overrides(&mut self, overrides: &ServerOverrides) {
        if let Some(host) = overrides.host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.relay_port {
            self.server.relay_port = Some(port);
        }
        if let Some(port) = overrides.renderer_port {
            self.server.renderer_port = Some(port);
        }
        if let Some(seconds) = overrides.graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_relay_overrides(&mut self, overrides: &RelayOverrides) {
        if let Some(url) = overrides.target_url.as_ref() {
            self.relay.target_url = Some(url.clone());
        }
        if let Some(url) = overrides.renderer_url.as_ref() {
            self.relay.renderer_url = Some(url.clone());
        }
        if let Some(name) = overrides.cookie_name.as_ref() {
            self.relay.cookie_name = Some(name.clone());
        }
        if let Some(seconds) = overrides.backend_timeout_seconds {
            self.relay.backend_timeout_seconds = Some(seconds);
        }
    }

    fn apply_renderer_overrides(&mut self, overrides: &RendererOverrides) {
        if let Some(seconds) = overrides.nav_timeout_seconds {
            self.renderer.nav_timeout_seconds = Some(seconds);
        }
        if let Some(millis) = overrides.settle_grace_ms {
            self.renderer.settle_grace_ms = Some(millis);
        }
        if let Some(path) = overrides.browser_path.as_ref() {
            self.engine.browser_path = Some(path.clone());
        }
        if let Some(proxy) = overrides.proxy.as_ref() {
            self.engine.proxy = Some(proxy.clone());
        }
        if let Some(seconds) = overrides.launch_timeout_seconds {
            self.engine.launch_timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            relay,
            renderer,
            engine,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            relay: build_relay_settings(relay)?,
            renderer: build_renderer_settings(renderer)?,
            engine: build_engine_settings(engine)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let relay_port = server.relay_port.unwrap_or(DEFAULT_RELAY_PORT);
    if relay_port == 0 {
        return Err(LoadError::invalid(
            "server.relay_port",
            "port must be greater than zero",
        ));
    }

    let renderer_port = server.renderer_port.unwrap_or(DEFAULT_RENDERER_PORT);
    if renderer_port == 0 {
        return Err(LoadError::invalid(
            "server.renderer_port",
            "port must be greater than zero",
        ));
    }

    let relay_addr = parse_socket_addr(&host, relay_port)
        .map_err(|reason| LoadError::invalid("server.relay_addr", reason))?;
    let renderer_addr = parse_socket_addr(&host, renderer_port)
        .map_err(|reason| LoadError::invalid("server.renderer_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        relay_addr,
        renderer_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_relay_settings(relay: RawRelaySettings) -> Result<RelaySettings, LoadError> {
    let target_url = parse_url(
        relay.target_url.as_deref().unwrap_or(DEFAULT_TARGET_URL),
        "relay.target_url",
    )?;
    let renderer_url = parse_url(
        relay.renderer_url.as_deref().unwrap_or(DEFAULT_RENDERER_URL),
        "relay.renderer_url",
    )?;

    let cookie_name = relay
        .cookie_name
        .unwrap_or_else(|| DEFAULT_COOKIE_NAME.to_string());
    if cookie_name.is_empty()
        || !cookie_name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(LoadError::invalid(
            "relay.cookie_name",
            "must be a non-empty token of [A-Za-z0-9_-]",
        ));
    }

    let backend_secs = relay
        .backend_timeout_seconds
        .unwrap_or(DEFAULT_BACKEND_TIMEOUT_SECS);
    if backend_secs == 0 {
        return Err(LoadError::invalid(
            "relay.backend_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let transforms = relay.transforms.unwrap_or_else(default_transforms);

    Ok(RelaySettings {
        target_url,
        renderer_url,
        cookie_name,
        backend_timeout: Duration::from_secs(backend_secs),
        transforms,
    })
}

/// With no explicit pipeline, only the base-tag guard runs.
fn default_transforms() -> Vec<TransformSettings> {
    vec![TransformSettings {
        name: "drop-base-tags".to_string(),
        enabled: true,
        options: default_options(),
    }]
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let nav_secs = renderer
        .nav_timeout_seconds
        .unwrap_or(DEFAULT_NAV_TIMEOUT_SECS);
    if nav_secs == 0 {
        return Err(LoadError::invalid(
            "renderer.nav_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let settle_ms = renderer.settle_grace_ms.unwrap_or(DEFAULT_SETTLE_GRACE_MS);

    Ok(RendererSettings {
        nav_timeout: Duration::from_secs(nav_secs),
        settle_grace: Duration::from_millis(settle_ms),
    })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    if let Some(path) = engine.browser_path.as_ref()
        && path.as_os_str().is_empty()
    {
        return Err(LoadError::invalid(
            "engine.browser_path",
            "path must not be empty",
        ));
    }

    let launch_secs = engine
        .launch_timeout_seconds
        .unwrap_or(DEFAULT_ENGINE_LAUNCH_TIMEOUT_SECS);
    if launch_secs == 0 {
        return Err(LoadError::invalid(
            "engine.launch_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(EngineSettings {
        browser_path: engine.browser_path,
        proxy: engine.proxy,
        launch_timeout: Duration::from_secs(launch_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    relay_port: Option<u16>,
    renderer_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRelaySettings {
    target_url: Option<String>,
    renderer_url: Option<String>,
    cookie_name: Option<String>,
    backend_timeout_seconds: Option<u64>,
    transforms: Option<Vec<TransformSettings>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    nav_timeout_seconds: Option<u64>,
    settle_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    browser_path: Option<PathBuf>,
    proxy: Option<String>,
    launch_timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    Url::parse(value).map_err(|err| LoadError::invalid(key, format!("failed to parse: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_valid_configuration() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.server.relay_addr.port(), DEFAULT_RELAY_PORT);
        assert_eq!(settings.server.renderer_addr.port(), DEFAULT_RENDERER_PORT);
        assert_eq!(settings.relay.cookie_name, DEFAULT_COOKIE_NAME);
        assert_eq!(settings.relay.target_url.as_str(), DEFAULT_TARGET_URL);
        assert_eq!(
            settings.renderer.nav_timeout,
            Duration::from_secs(DEFAULT_NAV_TIMEOUT_SECS)
        );
        assert_eq!(settings.relay.transforms.len(), 1);
        assert_eq!(settings.relay.transforms[0].name, "drop-base-tags");
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.relay_port = Some(4000);
        raw.relay.target_url = Some("https://file.example/".to_string());

        let server = ServerOverrides {
            relay_port: Some(4321),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let relay = RelayOverrides {
            target_url: Some("https://cli.example/".to_string()),
            ..Default::default()
        };
        raw.apply_server_overrides(&server);
        raw.apply_relay_overrides(&relay);

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.server.relay_addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.relay.target_url.as_str(), "https://cli.example/");
    }

    #[test]
    fn invalid_target_url_is_rejected_with_its_key() {
        let mut raw = RawSettings::default();
        raw.relay.target_url = Some("not a url".to_string());

        match Settings::from_raw(raw) {
            Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "relay.target_url"),
            other => panic!("expected invalid target_url, got {other:?}"),
        }
    }

    #[test]
    fn cookie_name_must_be_a_plain_token() {
        let mut raw = RawSettings::default();
        raw.relay.cookie_name = Some("bad name;".to_string());
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let server = ServerOverrides {
            log_json: Some(true),
            ..Default::default()
        };
        raw.apply_server_overrides(&server);

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["specchio"]);
        assert!(args.command.is_none());
    }

    #[test]
    fn parse_relay_arguments() {
        let args = CliArgs::parse_from([
            "specchio",
            "relay",
            "--relay-renderer-url",
            "http://render-box:3001/",
            "--relay-target-url",
            "https://example.net/",
        ]);

        match args.command.expect("relay command") {
            Command::Relay(relay) => {
                assert_eq!(
                    relay.relay.renderer_url.as_deref(),
                    Some("http://render-box:3001/")
                );
                assert_eq!(
                    relay.relay.target_url.as_deref(),
                    Some("https://example.net/")
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_renderer_arguments() {
        let args = CliArgs::parse_from([
            "specchio",
            "renderer",
            "--renderer-nav-timeout-seconds",
            "20",
            "--engine-proxy",
            "socks5://tor:9050",
        ]);

        match args.command.expect("renderer command") {
            Command::Renderer(renderer) => {
                assert_eq!(renderer.renderer.nav_timeout_seconds, Some(20));
                assert_eq!(
                    renderer.renderer.proxy.as_deref(),
                    Some("socks5://tor:9050")
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn transform_settings_default_enabled_with_empty_options() {
        let parsed: TransformSettings =
            serde_json::from_value(serde_json::json!({ "name": "append-title-suffix" }))
                .expect("parsed");
        assert!(parsed.enabled);
        assert!(parsed.options.as_object().is_some_and(|map| map.is_empty()));
    }
}
