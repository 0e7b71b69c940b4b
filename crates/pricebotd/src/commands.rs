//! Built-in chat commands.
//!
//! In direct messages the whole message is the command, in guilds the message has to start with
//! a mention of the bot. Command names are case-insensitive and can be renamed per token.
use bigdecimal::BigDecimal;
use pricebot_core::{config::TokenConfig, display};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Current price, optionally quoted through another AMM
    Price,
    /// LP unit composition
    Lp,
    Help,
}

impl Command {
    const ALL: [Command; 3] = [Command::Price, Command::Lp, Command::Help];

    fn default_name(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Lp => "lp",
            Self::Help => "help",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Invocation<'a> {
    pub(crate) command: Command,
    pub(crate) args: Vec<&'a str>,
}

/// Returns the message without its command prefix, or `None` if it isn't addressed to the bot.
pub(crate) fn strip_prefix(content: &str, bot_id: u64, is_direct: bool) -> Option<&str> {
    let content = content.trim();
    if is_direct {
        return Some(content);
    }

    [format!("<@{bot_id}>"), format!("<@!{bot_id}>")]
        .iter()
        .find_map(|mention| content.strip_prefix(mention.as_str()))
        .map(str::trim_start)
}

pub(crate) fn parse<'a>(token: &TokenConfig, content: &'a str) -> Option<Invocation<'a>> {
    let mut words = content.split_whitespace();
    let name = words.next()?;
    let command = Command::ALL
        .into_iter()
        .find(|command| token.command_name(command.default_name()).eq_ignore_ascii_case(name))?;

    Some(Invocation {
        command,
        args: words.collect(),
    })
}

pub(crate) fn price_reply(
    token: &TokenConfig,
    price: &BigDecimal,
    rate: &BigDecimal,
    reference_symbol: &str,
) -> String {
    let price = format!("${}", display::fixed(price, 4));
    format!(
        "{} | {} {reference_symbol}",
        token.icon_value(Some(&price)),
        display::fixed(rate, 4)
    )
}

pub(crate) fn help_text(token: &TokenConfig) -> String {
    let names = Command::ALL
        .into_iter()
        .map(|command| format!("`{}`", token.command_name(command.default_name())))
        .collect::<Vec<_>>();
    format!("{} commands: {}", token.name, names.join(", "))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, str::FromStr as _};

    use alloy::primitives::Address;

    use super::*;

    const BOT_ID: u64 = 42;

    fn token() -> TokenConfig {
        TokenConfig {
            name: "HNY".to_string(),
            contract: Address::ZERO,
            lp: Address::ZERO,
            from: "honeyswap".to_string(),
            decimals: Some(18),
            abi: None,
            lp_abi: None,
            icon: "🍯".to_string(),
            emoji: None,
            command_override: HashMap::from([("price".to_string(), "honey".to_string())]),
            apikey: String::new(),
        }
    }

    #[test]
    fn test_direct_messages_have_no_prefix() {
        assert_eq!(strip_prefix(" honey ", BOT_ID, true), Some("honey"));
    }

    #[test]
    fn test_guild_messages_need_a_mention() {
        assert_eq!(strip_prefix("<@42> lp", BOT_ID, false), Some("lp"));
        assert_eq!(strip_prefix("<@!42>   lp", BOT_ID, false), Some("lp"));
        assert_eq!(strip_prefix("lp", BOT_ID, false), None);
        assert_eq!(strip_prefix("<@7> lp", BOT_ID, false), None);
    }

    #[test]
    fn test_parse_is_case_insensitive_and_honours_overrides() {
        let token = token();
        assert_eq!(
            parse(&token, "HONEY sushiswap"),
            Some(Invocation {
                command: Command::Price,
                args: vec!["sushiswap"],
            })
        );
        assert_eq!(parse(&token, "price"), None);
        assert_eq!(
            parse(&token, "Lp"),
            Some(Invocation {
                command: Command::Lp,
                args: vec![],
            })
        );
        assert_eq!(parse(&token, ""), None);
        assert_eq!(parse(&token, "gm"), None);
    }

    #[test]
    fn test_price_reply() {
        let reply = price_reply(
            &token(),
            &BigDecimal::from_str("1.5").unwrap(),
            &BigDecimal::from_str("0.0005").unwrap(),
            "ETH",
        );
        assert_eq!(reply, "🍯 $1.5000 | 0.0005 ETH");
    }

    #[test]
    fn test_help_lists_renamed_commands() {
        assert_eq!(help_text(&token()), "HNY commands: `honey`, `lp`, `help`");
    }
}
