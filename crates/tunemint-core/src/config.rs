//! ============================================================================
//! Configuration - Environment-Driven Settings
//! ============================================================================

use anyhow::{anyhow, Result};

/// Runtime configuration gathered from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Generation service API key (TUNEMINT_SUNO_API_KEY)
    pub suno_api_key: String,
    /// Generation service base URL override (TUNEMINT_SUNO_BASE_URL)
    pub suno_base_url: Option<String>,
    /// Solana RPC endpoint (TUNEMINT_RPC_URL, defaults to devnet)
    pub rpc_url: String,
    /// Websocket endpoint for signature subscriptions (TUNEMINT_WS_URL,
    /// derived from the RPC URL when unset)
    pub ws_url: Option<String>,
    /// Wallet keypair file (TUNEMINT_KEYPAIR_PATH)
    pub keypair_path: Option<String>,
    /// Pinning service JWT (TUNEMINT_PINATA_JWT)
    pub pinata_jwt: String,
    /// Gateway base override (TUNEMINT_PINATA_GATEWAY)
    pub pinata_gateway: Option<String>,
    /// Callback listener port (TUNEMINT_CALLBACK_PORT)
    pub callback_port: Option<u16>,
    /// Publicly reachable callback URL advertised to the generation service
    /// (TUNEMINT_CALLBACK_URL)
    pub callback_url: Option<String>,
    /// Journal path override (TUNEMINT_DB_PATH, also read by TaskDb)
    pub db_path: Option<String>,
}

const DEFAULT_RPC_URL: &str = "https://api.devnet.solana.com";

impl Config {
    pub fn from_env() -> Result<Self> {
        let rpc_url =
            std::env::var("TUNEMINT_RPC_URL").unwrap_or_else(|_| DEFAULT_RPC_URL.to_string());

        let ws_url = std::env::var("TUNEMINT_WS_URL")
            .ok()
            .or_else(|| Some(derive_ws_url(&rpc_url)));

        Ok(Self {
            suno_api_key: std::env::var("TUNEMINT_SUNO_API_KEY")
                .map_err(|_| anyhow!("TUNEMINT_SUNO_API_KEY is not set"))?,
            suno_base_url: std::env::var("TUNEMINT_SUNO_BASE_URL").ok(),
            rpc_url,
            ws_url,
            keypair_path: std::env::var("TUNEMINT_KEYPAIR_PATH").ok(),
            pinata_jwt: std::env::var("TUNEMINT_PINATA_JWT")
                .map_err(|_| anyhow!("TUNEMINT_PINATA_JWT is not set"))?,
            pinata_gateway: std::env::var("TUNEMINT_PINATA_GATEWAY").ok(),
            callback_port: std::env::var("TUNEMINT_CALLBACK_PORT")
                .ok()
                .and_then(|p| p.parse().ok()),
            callback_url: std::env::var("TUNEMINT_CALLBACK_URL").ok(),
            db_path: std::env::var("TUNEMINT_DB_PATH").ok(),
        })
    }
}

/// Derive the websocket endpoint from an HTTP RPC endpoint
pub fn derive_ws_url(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        rpc_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_ws_url() {
        assert_eq!(
            derive_ws_url("https://api.devnet.solana.com"),
            "wss://api.devnet.solana.com"
        );
        assert_eq!(derive_ws_url("http://127.0.0.1:8899"), "ws://127.0.0.1:8899");
        assert_eq!(derive_ws_url("wss://already.ws"), "wss://already.ws");
    }
}
