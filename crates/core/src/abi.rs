//! ABI documents for contracts whose ABI isn't configured, fetched from a block explorer and
//! cached on disk by address.
use std::path::{Path, PathBuf};

use alloy::{json_abi::JsonAbi, primitives::Address};
use color_eyre::eyre::{self, OptionExt as _, WrapErr as _};
use reqwest::{Client, Url, header};
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, info, instrument};

const USER_AGENT: &str = concat!("pricebot/", env!("CARGO_PKG_VERSION"));

pub struct AbiRegistry {
    client: Client,
    explorer_url: Url,
    cache_dir: PathBuf,
}

#[derive(Deserialize)]
struct ExplorerResponse {
    result: Option<serde_json::Value>,
}

impl AbiRegistry {
    pub fn new(explorer_url: &str, cache_dir: impl Into<PathBuf>) -> eyre::Result<Self> {
        let explorer_url = Url::parse(explorer_url).wrap_err("failed to parse explorer_url")?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .wrap_err("failed to build explorer http client")?;

        Ok(Self {
            client,
            explorer_url,
            cache_dir: cache_dir.into(),
        })
    }

    pub fn cache_path(&self, address: Address) -> PathBuf {
        self.cache_dir.join(format!("{address}.json"))
    }

    /// Uses the configured ABI verbatim if there is one, otherwise the cached or fetched one.
    pub async fn resolve(
        &self,
        address: Address,
        configured: Option<&str>,
    ) -> eyre::Result<JsonAbi> {
        let raw = match configured {
            Some(abi) => abi.to_string(),
            None => self.fetch_or_cache(address).await?,
        };
        serde_json::from_str(&raw).wrap_err_with(|| format!("malformed ABI for {address}"))
    }

    #[instrument(skip(self))]
    async fn fetch_or_cache(&self, address: Address) -> eyre::Result<String> {
        let path = self.cache_path(address);
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "using cached ABI");
            return fs::read_to_string(&path)
                .await
                .wrap_err_with(|| format!("failed to read cached ABI {}", path.display()));
        }

        let abi = self.fetch(address).await?;
        store(&self.cache_dir, &path, &abi).await?;
        info!(path = %path.display(), "fetched ABI from block explorer");

        Ok(abi)
    }

    async fn fetch(&self, address: Address) -> eyre::Result<String> {
        let mut url = self.explorer_url.clone();
        url.query_pairs_mut()
            .append_pair("module", "contract")
            .append_pair("action", "getabi")
            .append_pair("address", &address.to_string());

        let body = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .wrap_err_with(|| format!("failed to request ABI of {address}"))?
            .error_for_status()
            .wrap_err_with(|| format!("block explorer rejected ABI request for {address}"))?
            .text()
            .await
            .wrap_err("failed to read block explorer response")?;

        parse_explorer_response(&body).wrap_err_with(|| format!("no ABI returned for {address}"))
    }
}

/// Extracts the serialized ABI from the `result` field of an explorer response.
pub fn parse_explorer_response(body: &str) -> eyre::Result<String> {
    let response: ExplorerResponse =
        serde_json::from_str(body).wrap_err("malformed block explorer response")?;

    match response.result.ok_or_eyre("response has no `result` field")? {
        serde_json::Value::String(abi) => Ok(abi),
        // some explorers inline the ABI instead of serializing it
        abi @ serde_json::Value::Array(_) => Ok(abi.to_string()),
        other => Err(eyre::eyre!("unexpected `result` in response: {other}")),
    }
}

async fn store(dir: &Path, path: &Path, abi: &str) -> eyre::Result<()> {
    fs::create_dir_all(dir)
        .await
        .wrap_err_with(|| format!("failed to create ABI cache dir {}", dir.display()))?;
    fs::write(path, abi)
        .await
        .wrap_err_with(|| format!("failed to write ABI cache {}", path.display()))
}
