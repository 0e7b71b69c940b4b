use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr as _, eyre};
use tracing::info;

use crate::config::ChannelRef;

/// Looks up channels of a guild by name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn channel_id(&self, guild_id: u64, name: &str) -> eyre::Result<Option<u64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied,
}

/// Channels commands may be invoked from, per guild. Guilds without an entry are unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionMap(HashMap<u64, HashSet<u64>>);

impl RestrictionMap {
    pub fn new(restrictions: HashMap<u64, HashSet<u64>>) -> Self {
        Self(restrictions)
    }

    /// Resolves configured channel names to ids. Unknown names are an error.
    pub async fn resolve(
        configured: &HashMap<String, Vec<ChannelRef>>,
        directory: &dyn ChannelDirectory,
    ) -> eyre::Result<Self> {
        let mut restrictions = HashMap::with_capacity(configured.len());

        for (guild, channels) in configured {
            let guild_id: u64 = guild
                .trim()
                .parse()
                .wrap_err_with(|| format!("restricted guild `{guild}` is not a guild id"))?;

            let mut allowed = HashSet::with_capacity(channels.len());
            for channel in channels {
                let channel_id = match channel {
                    ChannelRef::Id(id) => *id,
                    ChannelRef::Name(name) => match channel.id() {
                        Some(id) => id,
                        None => directory.channel_id(guild_id, name).await?.ok_or_else(|| {
                            eyre!("No channel named {name} in guild {guild_id}!")
                        })?,
                    },
                };
                allowed.insert(channel_id);
            }

            info!(guild.id = guild_id, channels = ?allowed, "restricting commands to channels");
            restrictions.insert(guild_id, allowed);
        }

        Ok(Self(restrictions))
    }

    /// Owners are never restricted; direct messages have no guild and are never restricted.
    pub fn check(&self, guild_id: Option<u64>, channel_id: u64, is_owner: bool) -> Access {
        let allowed = guild_id.and_then(|guild_id| self.0.get(&guild_id));
        match allowed {
            Some(channels) if !channels.is_empty() && !is_owner => {
                if channels.contains(&channel_id) {
                    Access::Allowed
                } else {
                    Access::Denied
                }
            }
            _ => Access::Allowed,
        }
    }
}
