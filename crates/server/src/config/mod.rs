//! Server configuration, loaded once at startup from a TOML file merged
//! with `HEARTH_`-prefixed environment variables.

use std::sync::OnceLock;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

use crate::core::identifiers::{OwnedServerName, ServerName};
use crate::core::signatures::Ed25519KeyPair;
use crate::core::{RoomVersionId, room_version};

static CONFIG: OnceLock<ServerConfig> = OnceLock::new();
static KEYPAIR: OnceLock<Ed25519KeyPair> = OnceLock::new();

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,

    pub federation: FederationConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bodies beyond this many bytes are rejected with `M_TOO_LARGE`.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FederationConfig {
    /// The canonical identity this server signs events as.
    pub server_name: OwnedServerName,

    /// When set, only these peers may federate with us.
    #[serde(default)]
    pub allowed_servers: Option<Vec<OwnedServerName>>,

    /// How long our published keys stay valid.
    #[serde(default = "default_key_validity_ms")]
    pub key_validity_ms: u64,

    #[serde(default = "default_true")]
    pub enable: bool,

    /// Where the Ed25519 signing key lives; generated on first boot.
    #[serde(default = "default_signing_key_path")]
    pub signing_key_path: String,

    /// The room version used for newly created rooms.
    #[serde(default)]
    pub default_room_version: Option<RoomVersionId>,
}

#[derive(Debug, Deserialize)]
pub struct SecurityConfig {
    /// Requests per minute per client before `M_LIMIT_EXCEEDED`.
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_rpm: default_rate_limit_rpm(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaConfig {
    /// Upload cap for the (external) media repository; carried in config
    /// so deployments keep one file.
    #[serde(default = "default_max_upload")]
    pub max_upload: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct TlsConfig {
    /// "disabled" (terminate TLS upstream) or "direct".
    #[serde(default)]
    pub mode: String,

    #[serde(default)]
    pub cert: Option<String>,

    #[serde(default)]
    pub key: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8008
}

fn default_max_request_size() -> usize {
    1024 * 1024
}

fn default_key_validity_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_true() -> bool {
    true
}

fn default_signing_key_path() -> String {
    "hearth.signing.key".to_owned()
}

fn default_rate_limit_rpm() -> u32 {
    600
}

fn default_max_upload() -> usize {
    10 * 1024 * 1024
}

/// Reads the config from `HEARTH_CONFIG` (default `hearth.toml`) plus the
/// environment.
pub fn load() -> Result<ServerConfig, figment::Error> {
    let path = std::env::var("HEARTH_CONFIG").unwrap_or_else(|_| "hearth.toml".to_owned());
    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("HEARTH_").split("__").global())
        .extract()
}

pub fn init(conf: ServerConfig) {
    CONFIG.set(conf).expect("config initialized twice");
}

pub fn get() -> &'static ServerConfig {
    CONFIG.get().expect("config is initialized at startup")
}

pub fn server_name() -> &'static ServerName {
    &get().federation.server_name
}

pub fn listen_addr() -> String {
    format!("{}:{}", get().server.host, get().server.port)
}

pub fn set_keypair(keypair: Ed25519KeyPair) {
    KEYPAIR.set(keypair).expect("keypair initialized twice");
}

pub fn keypair() -> &'static Ed25519KeyPair {
    KEYPAIR.get().expect("signing key is initialized at startup")
}

pub fn default_room_version() -> RoomVersionId {
    get()
        .federation
        .default_room_version
        .unwrap_or(room_version::DEFAULT_ROOM_VERSION)
}

pub fn supported_room_versions() -> Vec<RoomVersionId> {
    RoomVersionId::supported()
}

/// Whether `server` may federate with us at all.
pub fn server_is_allowed(server: &ServerName) -> bool {
    match &get().federation.allowed_servers {
        Some(allowed) => allowed.iter().any(|name| **name == *server),
        None => true,
    }
}

/// Installs a default config and fresh keypair for in-process tests; safe
/// to call from any number of tests.
#[cfg(test)]
pub fn init_test() {
    CONFIG.get_or_init(|| ServerConfig {
        server: ListenConfig::default(),
        federation: FederationConfig {
            server_name: "test.example".try_into().unwrap(),
            allowed_servers: None,
            key_validity_ms: default_key_validity_ms(),
            enable: true,
            signing_key_path: String::new(),
            default_room_version: None,
        },
        security: SecurityConfig::default(),
        media: MediaConfig::default(),
        tls: TlsConfig::default(),
    });
    KEYPAIR.get_or_init(|| Ed25519KeyPair::generate("test"));
}
