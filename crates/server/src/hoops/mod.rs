//! Request middleware: authentication, body-size limits and rate
//! limiting.

pub mod auth;

pub use auth::{auth_by_access_token, auth_by_signatures};

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use salvo::prelude::*;

use crate::core::UnixMillis;
use crate::{AppResult, MatrixError, config};

/// Rejects bodies over the configured cap before any handler runs.
#[handler]
pub async fn limit_size(req: &mut Request) -> AppResult<()> {
    let max = config::get().server.max_request_size;
    let length = req
        .header::<String>("content-length")
        .and_then(|raw| raw.parse::<usize>().ok());
    if let Some(length) = length {
        if length > max {
            return Err(MatrixError::too_large("request body exceeds the limit").into());
        }
    }
    Ok(())
}

/// Fixed-window rate limiting per client (access token when present,
/// remote address otherwise).
#[handler]
pub async fn rate_limit(req: &mut Request) -> AppResult<()> {
    static WINDOWS: LazyLock<Mutex<HashMap<String, (UnixMillis, u32)>>> =
        LazyLock::new(Default::default);
    const WINDOW_MS: u64 = 60_000;

    let limit = config::get().security.rate_limit_rpm;
    if limit == 0 {
        return Ok(());
    }

    let key = req
        .header::<String>("authorization")
        .unwrap_or_else(|| req.remote_addr().to_string());

    let now = UnixMillis::now();
    let mut windows = WINDOWS.lock().unwrap();
    let entry = windows.entry(key).or_insert((now, 0));
    if now.get().saturating_sub(entry.0.get()) > WINDOW_MS {
        *entry = (now, 0);
    }
    entry.1 += 1;
    if entry.1 > limit {
        let retry_after = WINDOW_MS.saturating_sub(now.get().saturating_sub(entry.0.get()));
        return Err(MatrixError::limit_exceeded(
            Some(Duration::from_millis(retry_after)),
            "too many requests",
        )
        .into());
    }
    Ok(())
}
