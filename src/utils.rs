// ABOUTME: Utility functions for identifier quoting, string escaping and retries
// ABOUTME: Shared by discovery, chunking and the data writers

use anyhow::Result;
use std::time::Duration;

/// Quote a MySQL identifier with backticks
///
/// Embedded backticks are doubled, which is the only escaping MySQL applies
/// inside quoted identifiers.
///
/// # Examples
///
/// ```
/// # use parallel_dumper::utils::quote_ident;
/// assert_eq!(quote_ident("orders"), "`orders`");
/// assert_eq!(quote_ident("we`ird"), "`we``ird`");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// Build a fully qualified `db`.`table` reference
///
/// # Examples
///
/// ```
/// # use parallel_dumper::utils::qualified_name;
/// assert_eq!(qualified_name("shop", "orders"), "`shop`.`orders`");
/// ```
pub fn qualified_name(database: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(database), quote_ident(table))
}

/// Escape a string for use inside a single-quoted MySQL literal
///
/// Mirrors `mysql_real_escape_string` for the default SQL mode: NUL, newline,
/// carriage return, backslash, quotes and Ctrl-Z are backslash-escaped.
///
/// # Examples
///
/// ```
/// # use parallel_dumper::utils::escape_string;
/// assert_eq!(escape_string("O'Brien"), "O\\'Brien");
/// assert_eq!(escape_string("a\nb"), "a\\nb");
/// ```
pub fn escape_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\0' => escaped.push_str("\\0"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\x1a' => escaped.push_str("\\Z"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Render raw column bytes as a SQL literal
///
/// Valid UTF-8 is emitted as an escaped quoted string, anything else as a
/// hex literal so binary columns survive the round trip.
pub fn sql_literal(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => format!("'{}'", escape_string(text)),
        Err(_) => {
            let mut hex = String::with_capacity(2 + bytes.len() * 2);
            hex.push_str("0x");
            for byte in bytes {
                hex.push_str(&format!("{:02x}", byte));
            }
            hex
        }
    }
}

/// Run `operation` up to `max_retries + 1` times, doubling the pause after each failure
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                tracing::warn!(
                    "Attempt {}/{} failed: {:#}; retrying in {:?}",
                    attempt,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

/// Seconds since the unix epoch, used for metadata timestamps
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
