// ABOUTME: Shared helpers for retries, URL redaction and admin token files
// ABOUTME: Used by webhook delivery, logging and the admin server bootstrap

use anyhow::{bail, Context, Result};
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Retry an async operation with exponential backoff.
///
/// The operation runs at most `max_retries + 1` times. The delay starts at
/// `initial_delay` and doubles after every failure. The last error is
/// returned when every attempt fails.
///
/// # Examples
///
/// ```
/// # use subscriber_sync::utils::retry_with_backoff;
/// # use std::time::Duration;
/// # async fn example() -> Result<(), String> {
/// let result = retry_with_backoff(
///     || async { Ok::<_, String>("delivered") },
///     2,
///     Duration::from_millis(200),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}, retrying in {:?}...",
                    attempt,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Strip credentials and query string from a URL before it is logged.
///
/// Unparsable input is returned as `<invalid url>` so secrets embedded in a
/// malformed value never reach the log.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Read a shared-secret token file, rejecting empty files.
pub fn read_token_file(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read token file {}", path.display()))?;
    let token = contents.trim().to_string();
    if token.is_empty() {
        bail!("token file {} is empty", path.display());
    }
    Ok(token)
}

/// Read the token file, generating a random token first if none exists.
///
/// A generated file is written with owner-only permissions on unix.
pub fn ensure_token_file(path: &Path) -> Result<String> {
    if path.exists() {
        return read_token_file(path);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let token = format!("{:032x}", rand::random::<u128>());
    fs::write(path, format!("{}\n", token))
        .with_context(|| format!("failed to write token file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)
            .with_context(|| format!("failed to restrict {}", path.display()))?;
    }

    tracing::info!("Generated admin token at {}", path.display());
    Ok(token)
}
