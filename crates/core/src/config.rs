use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    str::FromStr as _,
    time::{Duration, Instant},
};

use alloy::primitives::{Address, address};
use color_eyre::eyre::{self, OptionExt as _, eyre};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

/// Wrapped ether on Gnosis chain.
const DEFAULT_REFERENCE_ADDRESS: Address = address!("0x6A023CCd1ff6F2045C3309768eAd9E68F978f6e1");
/// Wrapped xDai on Gnosis chain.
const DEFAULT_STABLE_ADDRESS: Address = address!("0xe91D153E0b41518A2Ce8Dd3D7944Fa863463a97d");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// RPC endpoint of the blockchain node, either an http(s) url or an IPC path
    pub eth_node: Option<String>,

    /// Seconds between two refresh ticks
    pub refresh_rate: u64,

    /// Base url of the block explorer API used to fetch missing ABIs
    #[serde(default = "default_explorer_url")]
    pub explorer_url: String,

    /// Directory holding fetched ABI documents
    #[serde(default = "default_abi_cache_dir")]
    pub abi_cache_dir: PathBuf,

    /// Intermediate pricing asset
    #[serde(default = "AssetConfig::default_reference")]
    pub reference: AssetConfig,

    /// Stable-value asset the reference asset is priced in
    #[serde(default = "AssetConfig::default_stable")]
    pub stable: AssetConfig,

    /// AMM configurations by name
    pub amm: HashMap<String, AmmConfig>,

    /// One bot is run per configured token
    pub tokens: Vec<TokenConfig>,

    /// Allowed command channels per guild id
    #[serde(default)]
    pub restrict_to: HashMap<String, Vec<ChannelRef>>,

    /// User ids bypassing channel restrictions, in addition to the application owners
    #[serde(default)]
    pub owners: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    pub address: Address,
    #[serde(default = "default_reference_symbol")]
    pub symbol: String,
}

impl AssetConfig {
    fn default_reference() -> Self {
        Self {
            address: DEFAULT_REFERENCE_ADDRESS,
            symbol: default_reference_symbol(),
        }
    }

    fn default_stable() -> Self {
        Self {
            address: DEFAULT_STABLE_ADDRESS,
            symbol: "DAI".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmmConfig {
    /// Pool holding the reference/stable pair on this AMM
    pub address: Address,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Display name
    pub name: String,

    /// Token contract address
    pub contract: Address,

    /// Token/reference liquidity pool address
    pub lp: Address,

    /// Name of the home AMM in [`Config::amm`]
    pub from: String,

    /// Token decimals, read from the contract when absent
    pub decimals: Option<u8>,

    /// ERC-20 ABI used for the reference, stable and token contracts
    pub abi: Option<String>,

    /// ABI of the liquidity pool contract
    pub lp_abi: Option<String>,

    #[serde(default)]
    pub icon: String,

    pub emoji: Option<String>,

    /// Renamed commands, keyed by their default name
    #[serde(default)]
    pub command_override: HashMap<String, String>,

    /// Chat platform API token
    pub apikey: String,
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("name", &self.name)
            .field("contract", &self.contract)
            .field("lp", &self.lp)
            .field("from", &self.from)
            .field("decimals", &self.decimals)
            .field("icon", &self.icon)
            .field("emoji", &self.emoji)
            .field("command_override", &self.command_override)
            .finish_non_exhaustive()
    }
}

/// A restricted channel, given either by id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelRef {
    Id(u64),
    Name(String),
}

impl ChannelRef {
    /// Names that parse as integers are treated as ids.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Name(name) => u64::from_str(name.trim()).ok(),
        }
    }
}

impl Config {
    /// Load configuration from `pricebot.yaml` and `PRICEBOT_` prefixed environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file("pricebot.yaml"))
                .merge(Env::prefixed("PRICEBOT_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }

    pub fn eth_node(&self) -> eyre::Result<&str> {
        self.eth_node
            .as_deref()
            .filter(|node| !node.trim().is_empty())
            .ok_or_eyre("Required setting 'eth_node' not configured!")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_rate)
    }

    /// Looks up an AMM by name, falling back to the token's home AMM.
    pub fn get_amm(&self, token: &TokenConfig, amm: Option<&str>) -> Option<&AmmConfig> {
        self.amm.get(amm.unwrap_or(&token.from))
    }

    pub fn home_amm(&self, token: &TokenConfig) -> eyre::Result<&AmmConfig> {
        self.get_amm(token, None)
            .ok_or_else(|| eyre!("{}'s AMM {} does not exist!", token.name, token.from))
    }

    /// Startup checks that don't need any network access.
    pub fn validate(&self) -> eyre::Result<()> {
        self.eth_node()?;
        if self.refresh_rate == 0 {
            return Err(eyre!("refresh_rate must be at least one second"));
        }
        if Instant::now().checked_add(self.refresh_interval()).is_none() {
            return Err(eyre!("refresh_rate of {}s is too long", self.refresh_rate));
        }
        if self.tokens.is_empty() {
            return Err(eyre!("no tokens configured"));
        }
        for token in &self.tokens {
            self.home_amm(token)?;
            if token.apikey.trim().is_empty() {
                return Err(eyre!("{}'s apikey not configured!", token.name));
            }
        }
        Ok(())
    }
}

impl TokenConfig {
    /// Pairs `value` with the token's emoji or icon, or with its name when neither is set.
    pub fn icon_value(&self, value: Option<&str>) -> String {
        let icon = self
            .emoji
            .as_deref()
            .filter(|emoji| !emoji.is_empty())
            .or(Some(self.icon.as_str()).filter(|icon| !icon.is_empty()));

        match (icon, value) {
            (Some(icon), Some(value)) => format!("{icon} {value}"),
            (Some(icon), None) => icon.to_string(),
            (None, Some(value)) => format!("{value} {}", self.name),
            (None, None) => self.name.clone(),
        }
    }

    /// Name under which the command `default` is invoked for this token.
    pub fn command_name<'a>(&'a self, default: &'a str) -> &'a str {
        self.command_override
            .get(default)
            .map(String::as_str)
            .unwrap_or(default)
    }
}

fn default_explorer_url() -> String {
    "https://blockscout.com/poa/xdai/api".to_string()
}

fn default_abi_cache_dir() -> PathBuf {
    PathBuf::from("contracts")
}

fn default_reference_symbol() -> String {
    "ETH".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
eth_node: https://rpc.gnosischain.com
refresh_rate: 60
amm:
  honeyswap:
    address: "0x0000000000000000000000000000000000000001"
tokens:
  - name: HNY
    contract: "0x0000000000000000000000000000000000000002"
    lp: "0x0000000000000000000000000000000000000003"
    from: honeyswap
    icon: "🍯"
    apikey: secret
    command_override:
      price: hny
restrict_to:
  "1234":
    - 42
    - general
    - "77"
"#;

    fn load(yaml: &str) -> Config {
        Config::from_figment(Figment::from(Yaml::string(yaml))).expect("config should parse")
    }

    #[test]
    fn test_parse_config_with_defaults() {
        let config = load(CONFIG);

        assert_eq!(config.eth_node().unwrap(), "https://rpc.gnosischain.com");
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.abi_cache_dir, PathBuf::from("contracts"));
        assert_eq!(config.reference.address, DEFAULT_REFERENCE_ADDRESS);
        assert_eq!(config.reference.symbol, "ETH");
        assert_eq!(config.stable.address, DEFAULT_STABLE_ADDRESS);
        assert_eq!(config.tokens[0].decimals, None);
        config.validate().expect("config should be valid");
    }

    #[test]
    fn test_channel_refs() {
        let config = load(CONFIG);
        let channels = &config.restrict_to["1234"];

        assert_eq!(channels[0], ChannelRef::Id(42));
        assert_eq!(channels[1], ChannelRef::Name("general".to_string()));
        assert_eq!(channels[1].id(), None);
        assert_eq!(channels[2].id(), Some(77));
    }

    #[test]
    fn test_missing_eth_node_is_an_error() {
        let mut config = load(CONFIG);
        config.eth_node = None;

        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Required setting 'eth_node' not configured!"
        );
    }

    #[test]
    fn test_unknown_amm_is_an_error() {
        let mut config = load(CONFIG);
        config.tokens[0].from = "sushiswap".to_string();

        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "HNY's AMM sushiswap does not exist!");
    }

    #[test]
    fn test_unschedulable_refresh_rate_is_an_error() {
        let mut config = load(CONFIG);
        config.refresh_rate = u64::MAX;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("is too long"));
    }

    #[test]
    fn test_missing_apikey_is_an_error() {
        let mut config = load(CONFIG);
        config.tokens[0].apikey = String::new();

        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "HNY's apikey not configured!");
    }

    #[test]
    fn test_debug_output_hides_apikey() {
        let config = load(CONFIG);
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn test_get_amm() {
        let config = load(CONFIG);
        let token = &config.tokens[0];

        assert!(config.get_amm(token, None).is_some());
        assert!(config.get_amm(token, Some("honeyswap")).is_some());
        assert!(config.get_amm(token, Some("uniswap")).is_none());
    }

    #[test]
    fn test_icon_value() {
        let mut token = load(CONFIG).tokens.remove(0);
        assert_eq!(token.icon_value(Some("$1.00")), "🍯 $1.00");
        assert_eq!(token.icon_value(None), "🍯");

        token.emoji = Some("🐝".to_string());
        assert_eq!(token.icon_value(Some("$1.00")), "🐝 $1.00");

        token.emoji = None;
        token.icon = String::new();
        assert_eq!(token.icon_value(Some("$1.00")), "$1.00 HNY");
        assert_eq!(token.icon_value(None), "HNY");
    }

    #[test]
    fn test_command_override() {
        let token = load(CONFIG).tokens.remove(0);
        assert_eq!(token.command_name("price"), "hny");
        assert_eq!(token.command_name("lp"), "lp");
    }
}
