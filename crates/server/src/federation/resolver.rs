//! Resolving a server name to the host and port that speak federation for
//! it: IP literals, explicit ports, `/.well-known/matrix/server`
//! delegation, DNS SRV and the 8448 fallback, in that order.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use hickory_resolver::TokioResolver;

use crate::core::UnixMillis;
use crate::core::federation::directory::ServerWellKnown;
use crate::core::identifiers::{OwnedServerName, ServerName};
use crate::{AppError, AppResult};

const DEFAULT_FEDERATION_PORT: u16 = 8448;

/// Well-known results are cached at most this long, whatever Cache-Control
/// says.
const WELL_KNOWN_MAX_CACHE_MS: u64 = 24 * 60 * 60 * 1000;

/// Where federation traffic for a server name actually goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDest {
    pub host: String,
    pub port: u16,
    /// The name presented in the Host header and TLS SNI: the original
    /// server name, or the well-known delegate.
    pub host_header: String,
}

impl ResolvedDest {
    /// The https base URL requests to this destination are built against.
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

struct CachedDest {
    dest: ResolvedDest,
    expires_at: UnixMillis,
}

static CACHE: LazyLock<RwLock<HashMap<OwnedServerName, CachedDest>>> =
    LazyLock::new(Default::default);

static DNS: LazyLock<Option<TokioResolver>> = LazyLock::new(|| {
    TokioResolver::builder_tokio()
        .map(|builder| builder.build())
        .map_err(|e| {
            warn!(error = %e, "system DNS configuration unavailable, SRV lookups disabled");
            e
        })
        .ok()
});

/// The https base URL for a destination, resolving and caching as needed.
pub async fn origin(server: &ServerName) -> AppResult<String> {
    Ok(resolve(server).await?.base_url())
}

pub async fn resolve(server: &ServerName) -> AppResult<ResolvedDest> {
    if let Some(cached) = CACHE.read().unwrap().get(server) {
        if cached.expires_at > UnixMillis::now() {
            return Ok(cached.dest.clone());
        }
    }

    let (dest, ttl_ms) = resolve_uncached(server).await?;
    CACHE.write().unwrap().insert(
        server.to_owned(),
        CachedDest {
            dest: dest.clone(),
            expires_at: UnixMillis::now().saturating_add(ttl_ms),
        },
    );
    Ok(dest)
}

async fn resolve_uncached(server: &ServerName) -> AppResult<(ResolvedDest, u64)> {
    // 1. IP literals and 2. explicit ports are used as given.
    if server.is_ip_literal() || server.port().is_some() {
        let dest = ResolvedDest {
            host: server.host().to_owned(),
            port: server.port().unwrap_or(DEFAULT_FEDERATION_PORT),
            host_header: server.as_str().to_owned(),
        };
        return Ok((dest, WELL_KNOWN_MAX_CACHE_MS));
    }

    // 3. Well-known delegation, followed one hop.
    if let Some((delegate, ttl_ms)) = fetch_well_known(server.host()).await {
        if let Ok(delegated) = ServerName::parse(&delegate) {
            if delegated.is_ip_literal() || delegated.port().is_some() {
                let dest = ResolvedDest {
                    host: delegated.host().to_owned(),
                    port: delegated.port().unwrap_or(DEFAULT_FEDERATION_PORT),
                    host_header: delegate.clone(),
                };
                return Ok((dest, ttl_ms));
            }
            let (host, port) = srv_or_fallback(delegated.host()).await;
            let dest = ResolvedDest {
                host,
                port,
                host_header: delegate.clone(),
            };
            return Ok((dest, ttl_ms));
        }
    }

    // 4./5. SRV, else the name itself on 8448.
    let (host, port) = srv_or_fallback(server.host()).await;
    let dest = ResolvedDest {
        host,
        port,
        host_header: server.as_str().to_owned(),
    };
    Ok((dest, WELL_KNOWN_MAX_CACHE_MS))
}

/// Fetches `/.well-known/matrix/server`, returning the delegate and a
/// cache TTL honoring Cache-Control within the 24 hour cap.
async fn fetch_well_known(host: &str) -> Option<(String, u64)> {
    let url = format!("https://{host}/.well-known/matrix/server");
    let response = crate::federation::client()
        .get(&url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }

    let ttl_ms = response
        .headers()
        .get(reqwest::header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_max_age)
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(WELL_KNOWN_MAX_CACHE_MS)
        .min(WELL_KNOWN_MAX_CACHE_MS);

    let well_known: ServerWellKnown = response.json().await.ok()?;
    debug!(%host, delegate = %well_known.server, "well-known delegation");
    Some((well_known.server, ttl_ms))
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|value| value.parse().ok())
}

/// SRV resolution: `_matrix-fed._tcp` first, the deprecated `_matrix._tcp`
/// second, lowest priority then highest weight; the name itself on 8448 as
/// the final fallback.
async fn srv_or_fallback(host: &str) -> (String, u16) {
    if let Some(resolver) = DNS.as_ref() {
        for service in ["_matrix-fed._tcp", "_matrix._tcp"] {
            let name = format!("{service}.{host}.");
            if let Ok(lookup) = resolver.srv_lookup(name).await {
                let mut records: Vec<_> = lookup.iter().collect();
                records.sort_by_key(|srv| (srv.priority(), std::cmp::Reverse(srv.weight())));
                if let Some(srv) = records.first() {
                    let target = srv.target().to_utf8();
                    let target = target.trim_end_matches('.').to_owned();
                    return (target, srv.port());
                }
            }
        }
    }
    (host.to_owned(), DEFAULT_FEDERATION_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_age_parsing() {
        assert_eq!(parse_max_age("public, max-age=3600"), Some(3600));
        assert_eq!(parse_max_age("max-age=86400, immutable"), Some(86400));
        assert_eq!(parse_max_age("no-cache"), None);
    }

    #[tokio::test]
    async fn literals_and_ports_resolve_directly() {
        let ip = ServerName::parse("198.51.100.5").unwrap();
        let (dest, _) = resolve_uncached(ip).await.unwrap();
        assert_eq!(dest.host, "198.51.100.5");
        assert_eq!(dest.port, 8448);

        let explicit = ServerName::parse("example.com:8008").unwrap();
        let (dest, _) = resolve_uncached(explicit).await.unwrap();
        assert_eq!(dest.host, "example.com");
        assert_eq!(dest.port, 8008);
        assert_eq!(dest.host_header, "example.com:8008");
        assert_eq!(dest.base_url(), "https://example.com:8008");
    }
}
