//! Read-only contract handles.
//!
//! The price engine only ever needs three views of a contract, so handles are bound once at
//! startup to the [`Erc20`] capability instead of being dispatched through the ABI at runtime.
use std::{path::PathBuf, sync::Arc};

use alloy::{
    json_abi::JsonAbi,
    primitives::{Address, U256},
    providers::{DynProvider, IpcConnect, Provider as _, ProviderBuilder},
    sol,
    transports::http::reqwest::Url,
};
use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr as _, eyre};
use tracing::{debug, info, instrument};

use crate::{
    abi::AbiRegistry,
    config::{Config, TokenConfig},
};

// Taken from https://github.com/OpenZeppelin/openzeppelin-contracts/blob/3790c59623e99cb0272ddf84e6a17a5979d06b35/contracts/token/ERC20/IERC20.sol
sol!(
    #[sol(rpc)]
    contract IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function totalSupply() external view returns (uint256);
        function decimals() external view returns (uint8);
    }
);

/// The read-only calls the bot makes against a contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Erc20: Send + Sync {
    fn address(&self) -> Address;

    async fn balance_of(&self, account: Address) -> eyre::Result<U256>;

    async fn total_supply(&self) -> eyre::Result<U256>;

    async fn decimals(&self) -> eyre::Result<u8>;
}

/// An [`Erc20`] backed by an RPC node.
pub struct OnChainErc20 {
    instance: IERC20::IERC20Instance<DynProvider>,
}

impl OnChainErc20 {
    pub fn new(address: Address, provider: DynProvider) -> Self {
        Self {
            instance: IERC20::new(address, provider),
        }
    }
}

#[async_trait]
impl Erc20 for OnChainErc20 {
    fn address(&self) -> Address {
        *self.instance.address()
    }

    async fn balance_of(&self, account: Address) -> eyre::Result<U256> {
        self.instance
            .balanceOf(account)
            .call()
            .await
            .wrap_err_with(|| format!("balanceOf({account}) failed on {}", self.address()))
    }

    async fn total_supply(&self) -> eyre::Result<U256> {
        self.instance
            .totalSupply()
            .call()
            .await
            .wrap_err_with(|| format!("totalSupply() failed on {}", self.address()))
    }

    async fn decimals(&self) -> eyre::Result<u8> {
        self.instance
            .decimals()
            .call()
            .await
            .wrap_err_with(|| format!("decimals() failed on {}", self.address()))
    }
}

/// A function a bound handle is expected to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    BalanceOf,
    TotalSupply,
    Decimals,
}

impl Capability {
    fn function_name(self) -> &'static str {
        match self {
            Self::BalanceOf => "balanceOf",
            Self::TotalSupply => "totalSupply",
            Self::Decimals => "decimals",
        }
    }
}

/// Checks that `abi` declares every function in `required`.
pub fn ensure_capabilities(
    address: Address,
    abi: &JsonAbi,
    required: &[Capability],
) -> eyre::Result<()> {
    let missing = required
        .iter()
        .map(|capability| capability.function_name())
        .filter(|name| !abi.functions.contains_key(*name))
        .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(eyre!(
            "ABI of {address} is missing functions: {}",
            missing.join(", ")
        ))
    }
}

/// How to reach the RPC node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Http(Url),
    Ipc(PathBuf),
}

impl Endpoint {
    /// Anything that isn't an http(s) url is taken as the path of an IPC socket.
    pub fn parse(node: &str) -> eyre::Result<Self> {
        match Url::parse(node) {
            Ok(url) if url.scheme().contains("http") => Ok(Self::Http(url)),
            Ok(url) => Ok(Self::Ipc(PathBuf::from(url.path()))),
            Err(_) if !node.trim().is_empty() => Ok(Self::Ipc(PathBuf::from(node.trim()))),
            Err(e) => Err(e).wrap_err("failed to parse eth_node"),
        }
    }

    pub async fn connect(&self) -> eyre::Result<DynProvider> {
        let provider = match self {
            Self::Http(url) => ProviderBuilder::new().connect_http(url.clone()).erased(),
            Self::Ipc(path) => ProviderBuilder::new()
                .connect_ipc(IpcConnect::new(path.display().to_string()))
                .await
                .wrap_err_with(|| format!("failed to connect to IPC socket {}", path.display()))?
                .erased(),
        };
        Ok(provider)
    }
}

/// The four handles a token's price is derived from.
#[derive(Clone)]
pub struct Contracts {
    pub reference: Arc<dyn Erc20>,
    pub stable: Arc<dyn Erc20>,
    pub token: Arc<dyn Erc20>,
    pub lp: Arc<dyn Erc20>,
}

/// Bound handles plus the token's resolved decimals.
#[derive(Clone)]
pub struct Bindings {
    pub contracts: Contracts,
    pub decimals: u8,
}

/// Binds a token's configuration to contract handles on the configured node.
pub struct Binder<'a> {
    pub config: &'a Config,
    pub token: &'a TokenConfig,
    pub provider: DynProvider,
    pub abis: &'a AbiRegistry,
}

impl Binder<'_> {
    #[instrument(skip_all, fields(token.name = %self.token.name))]
    pub async fn bind(self) -> eyre::Result<Bindings> {
        let Self {
            config,
            token,
            provider,
            abis,
        } = self;

        let erc20_abi = token.abi.as_deref();
        let reference = bind_one(
            abis,
            &provider,
            config.reference.address,
            erc20_abi,
            &[Capability::BalanceOf],
        )
        .await
        .wrap_err("failed to bind reference asset contract")?;
        let stable = bind_one(
            abis,
            &provider,
            config.stable.address,
            erc20_abi,
            &[Capability::BalanceOf],
        )
        .await
        .wrap_err("failed to bind stable asset contract")?;

        let token_capabilities: &[Capability] = if token.decimals.is_some() {
            &[Capability::BalanceOf]
        } else {
            &[Capability::BalanceOf, Capability::Decimals]
        };
        let token_contract = bind_one(
            abis,
            &provider,
            token.contract,
            erc20_abi,
            token_capabilities,
        )
        .await
        .wrap_err("failed to bind token contract")?;

        let lp = bind_one(
            abis,
            &provider,
            token.lp,
            token.lp_abi.as_deref(),
            &[Capability::TotalSupply],
        )
        .await
        .wrap_err("failed to bind liquidity pool contract")?;

        let decimals = resolve_decimals(token, token_contract.as_ref()).await?;

        info!(
            token.contract = %token.contract,
            token.lp = %token.lp,
            token.decimals = decimals,
            "🔗 Bound contracts"
        );

        Ok(Bindings {
            contracts: Contracts {
                reference,
                stable,
                token: token_contract,
                lp,
            },
            decimals,
        })
    }
}

async fn bind_one(
    abis: &AbiRegistry,
    provider: &DynProvider,
    address: Address,
    configured_abi: Option<&str>,
    required: &[Capability],
) -> eyre::Result<Arc<dyn Erc20>> {
    let abi = abis.resolve(address, configured_abi).await?;
    ensure_capabilities(address, &abi, required)?;
    debug!(%address, "ABI resolved");
    Ok(Arc::new(OnChainErc20::new(address, provider.clone())))
}

/// Configured decimals win, otherwise they are read from the contract once.
pub async fn resolve_decimals(token: &TokenConfig, contract: &dyn Erc20) -> eyre::Result<u8> {
    match token.decimals {
        Some(decimals) => Ok(decimals),
        None => contract
            .decimals()
            .await
            .wrap_err_with(|| format!("failed to read decimals of {}", token.name)),
    }
}
