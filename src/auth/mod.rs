//! Authentication for the gateway
//!
//! The gateway issues bearer JWTs out of band; `login` stores one in the
//! config file. `ELDOR_TOKEN` in the environment takes precedence.

pub mod tokens;

use anyhow::{bail, Result};

use crate::config::Config;
pub use tokens::{StoredToken, TokenStore};

/// Environment variable that overrides the stored token.
pub const TOKEN_ENV: &str = "ELDOR_TOKEN";

/// Store a bearer token.
pub async fn login(token: &str) -> Result<()> {
    if token.trim().is_empty() {
        bail!("Token must not be empty");
    }
    let mut config = Config::load()?;
    config.set_access_token(token);
    config.save()?;

    let stored = config.get_access_token();
    match stored.and_then(|t| t.expires_at) {
        Some(exp) => {
            let when = chrono::DateTime::from_timestamp(exp, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| exp.to_string());
            println!("Token saved (expires {}).", when);
        }
        None => println!("Token saved."),
    }
    Ok(())
}

/// Clear the stored token.
pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_tokens();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Print authentication status.
pub async fn status() -> Result<()> {
    let config = Config::load()?;
    if std::env::var(TOKEN_ENV).is_ok() {
        println!("Using token from ${}.", TOKEN_ENV);
    }
    match config.get_access_token() {
        Some(t) if t.is_expired() => println!("Stored token is expired. Run 'eldor-cli login'."),
        Some(_) => println!("Logged in. API: {}", config.api_base),
        None => println!("Not logged in."),
    }
    Ok(())
}

/// Resolve the bearer token: environment first, then the config file.
pub fn resolve_token(config: &Config) -> Result<String> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }
    let Some(token) = config.get_access_token() else {
        bail!("No token. Run 'eldor-cli login <token>' or set ${}.", TOKEN_ENV);
    };
    if token.is_expired() {
        bail!("Token expired. Run 'eldor-cli login <token>' with a fresh one.");
    }
    Ok(token.token)
}
