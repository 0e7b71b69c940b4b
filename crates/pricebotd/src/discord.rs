//! Serenity event handling for one token's bot.
//!
//! The refresh scheduler needs a gateway context to publish through, so it is started from the
//! first `ready` event. Reconnects fire `ready` again and leave the running scheduler alone.
use std::{
    collections::HashSet,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr as _};
use pricebot_core::{
    config::{Config, TokenConfig},
    display,
    price::{PriceEngine, PriceSource},
    restrict::{Access, ChannelDirectory, RestrictionMap},
    state::PriceState,
};
use serenity::{
    Error as SerenityError,
    all::{ActivityData, Context, EventHandler, Guild, GuildId, Http, Message, Ready, UserId},
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    commands::{self, Command, Invocation},
    scheduler::{self, Publisher, TickError},
};

/// Publishes through the gateway connection of a ready client.
struct DiscordPublisher {
    ctx: Context,
}

#[async_trait]
impl Publisher for DiscordPublisher {
    async fn set_presence(&self, presence: &str) -> Result<(), TickError> {
        self.ctx.set_activity(Some(ActivityData::playing(presence)));
        Ok(())
    }

    fn guilds(&self) -> Vec<u64> {
        self.ctx
            .cache
            .guilds()
            .into_iter()
            .map(GuildId::get)
            .collect()
    }

    async fn set_nickname(&self, guild_id: u64, nickname: &str) -> Result<(), TickError> {
        GuildId::new(guild_id)
            .edit_nickname(&self.ctx.http, Some(nickname))
            .await
            .map_err(classify)
    }
}

/// Transport failures are worth retrying on the next tick, anything else is a bug or a
/// misconfiguration.
fn classify(err: SerenityError) -> TickError {
    match err {
        SerenityError::Http(_) | SerenityError::Gateway(_) => TickError::Transient(err.into()),
        err => TickError::Fatal(err.into()),
    }
}

/// A rejected command is only removed where the bot may manage messages.
fn should_delete(access: Access, can_manage_messages: bool) -> bool {
    access == Access::Denied && can_manage_messages
}

struct GuildChannels {
    http: Arc<Http>,
}

#[async_trait]
impl ChannelDirectory for GuildChannels {
    async fn channel_id(&self, guild_id: u64, name: &str) -> eyre::Result<Option<u64>> {
        if guild_id == 0 {
            return Ok(None);
        }

        let channels = GuildId::new(guild_id)
            .channels(&self.http)
            .await
            .wrap_err_with(|| format!("failed to list channels of guild {guild_id}"))?;

        Ok(channels
            .into_values()
            .find(|channel| channel.name == name)
            .map(|channel| channel.id.get()))
    }
}

/// The application owner, or every member of the owning team, plus the configured owners.
async fn fetch_owners(http: &Http, configured: &[u64]) -> eyre::Result<HashSet<u64>> {
    let info = http
        .get_current_application_info()
        .await
        .wrap_err("failed to fetch application info")?;

    let mut owners: HashSet<u64> = configured.iter().copied().collect();
    match (info.team, info.owner) {
        (Some(team), _) => owners.extend(team.members.iter().map(|member| member.user.id.get())),
        (None, Some(owner)) => {
            owners.insert(owner.id.get());
        }
        (None, None) => {}
    }

    Ok(owners)
}

/// What the scheduler needs besides the gateway context, consumed by the first `ready`.
pub(crate) struct PendingScheduler {
    pub(crate) state_tx: watch::Sender<Arc<PriceState>>,
    pub(crate) shutdown_token: CancellationToken,
}

struct AccessControl {
    restrictions: RestrictionMap,
    owners: HashSet<u64>,
}

pub(crate) struct Handler {
    token: Arc<TokenConfig>,
    config: Arc<Config>,
    engine: Arc<PriceEngine>,
    state_rx: watch::Receiver<Arc<PriceState>>,
    scheduler: Mutex<Option<PendingScheduler>>,
    access: OnceLock<AccessControl>,
    fatal_tx: mpsc::UnboundedSender<eyre::Report>,
}

impl Handler {
    pub(crate) fn new(
        token: Arc<TokenConfig>,
        config: Arc<Config>,
        engine: Arc<PriceEngine>,
        state_rx: watch::Receiver<Arc<PriceState>>,
        scheduler: PendingScheduler,
        fatal_tx: mpsc::UnboundedSender<eyre::Report>,
    ) -> Self {
        Self {
            token,
            config,
            engine,
            state_rx,
            scheduler: Mutex::new(Some(scheduler)),
            access: OnceLock::new(),
            fatal_tx,
        }
    }

    #[instrument(skip_all, fields(token.name = %self.token.name))]
    async fn start(&self, ctx: Context) -> eyre::Result<()> {
        let Some(pending) = self.scheduler.lock().await.take() else {
            debug!("Reconnected, refresh scheduler already running");
            return Ok(());
        };

        let directory = GuildChannels {
            http: Arc::clone(&ctx.http),
        };
        let restrictions = RestrictionMap::resolve(&self.config.restrict_to, &directory)
            .await
            .wrap_err("failed to resolve restricted channels")?;
        let owners = fetch_owners(&ctx.http, &self.config.owners).await?;
        info!(owners = owners.len(), "Resolved command access");
        let _ = self.access.set(AccessControl {
            restrictions,
            owners,
        });

        let source: Arc<dyn PriceSource> = self.engine.clone();
        let handle = scheduler::Builder {
            source,
            publisher: Arc::new(DiscordPublisher { ctx }),
            token: Arc::clone(&self.token),
            reference_symbol: self.config.reference.symbol.clone(),
            refresh_interval: self.config.refresh_interval(),
            state_tx: pending.state_tx,
            shutdown_token: pending.shutdown_token,
        }
        .build();

        let fatal_tx = self.fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                let _ = fatal_tx.send(e);
            }
        });

        Ok(())
    }

    /// Reply text for an allowed invocation, `None` when there is nothing to say.
    async fn reply(&self, invocation: Invocation<'_>) -> eyre::Result<Option<String>> {
        let symbol = &self.config.reference.symbol;

        match invocation.command {
            Command::Price => {
                let (price, rate) = match invocation.args.first().copied() {
                    Some(amm) => {
                        let Some(amm_config) = self.config.get_amm(&self.token, Some(amm)) else {
                            return Ok(Some(format!("Unknown AMM `{amm}`")));
                        };
                        let quote = self.engine.quote(Some(amm_config.address)).await?;
                        let rate =
                            display::reference_rate(&quote.reference_amount, &quote.token_amount);
                        (quote.price, rate)
                    }
                    None => {
                        let state = self.snapshot();
                        if state.is_empty() {
                            return Ok(None);
                        }
                        let rate =
                            display::reference_rate(&state.reference_amount, &state.token_amount);
                        (state.price.clone(), rate)
                    }
                };
                Ok(Some(commands::price_reply(&self.token, &price, &rate, symbol)))
            }
            Command::Lp => display::presence(&self.snapshot(), &self.token, symbol),
            Command::Help => Ok(Some(commands::help_text(&self.token))),
        }
    }

    fn snapshot(&self) -> Arc<PriceState> {
        Arc::clone(&self.state_rx.borrow())
    }

    /// Deletes a message sent outside the allowed channels, if the bot may.
    async fn reject(&self, ctx: &Context, msg: &Message, bot_id: UserId, access: Access) {
        let can_manage_messages = msg
            .guild_id
            .and_then(|guild_id| {
                let guild = ctx.cache.guild(guild_id)?;
                let channel = guild.channels.get(&msg.channel_id)?;
                let member = guild.members.get(&bot_id)?;
                Some(guild.user_permissions_in(channel, member).manage_messages())
            })
            .unwrap_or(false);

        debug!(
            channel.id = msg.channel_id.get(),
            user.id = msg.author.id.get(),
            can_manage_messages,
            "Rejected command outside allowed channels"
        );
        if should_delete(access, can_manage_messages) {
            if let Err(e) = msg.delete(ctx).await {
                warn!(error = %e, "Failed to delete rejected command");
            }
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(
            token.name = %self.token.name,
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            "🔌 Connected to Discord"
        );
        if let Err(e) = self.start(ctx).await {
            let _ = self.fatal_tx.send(e);
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, is_new: Option<bool>) {
        if is_new != Some(true) {
            return;
        }

        let state = self.snapshot();
        if state.is_empty() {
            debug!(guild.id = guild.id.get(), "Joined guild before the first refresh");
            return;
        }

        let nickname = display::nickname(&state, &self.token);
        match guild.id.edit_nickname(&ctx.http, Some(&nickname)).await {
            Ok(()) => info!(guild.id = guild.id.get(), %nickname, "Joined guild"),
            Err(e) => warn!(guild.id = guild.id.get(), error = %e, "Failed to set nickname"),
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(access) = self.access.get() else {
            return;
        };

        let bot_id = ctx.cache.current_user().id;
        let Some(content) =
            commands::strip_prefix(&msg.content, bot_id.get(), msg.guild_id.is_none())
        else {
            return;
        };
        let Some(invocation) = commands::parse(&self.token, content) else {
            return;
        };

        let is_owner = access.owners.contains(&msg.author.id.get());
        let guild_id = msg.guild_id.map(GuildId::get);
        let decision = access
            .restrictions
            .check(guild_id, msg.channel_id.get(), is_owner);
        if decision == Access::Denied {
            self.reject(&ctx, &msg, bot_id, decision).await;
            return;
        }

        let command = invocation.command;
        match self.reply(invocation).await {
            Ok(Some(reply)) => {
                if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
                    warn!(?command, error = %e, "Failed to reply");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(?command, error = %e, "Command failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serenity::{gateway::GatewayError, http::HttpError};

    use super::*;

    #[test]
    fn test_transport_errors_are_transient() {
        let gateway = SerenityError::from(GatewayError::HeartbeatFailed);
        assert!(matches!(classify(gateway), TickError::Transient(_)));

        let http = SerenityError::from(HttpError::InvalidWebhook);
        assert!(matches!(classify(http), TickError::Transient(_)));
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let err = SerenityError::Other("nickname rejected by model checks");
        assert!(matches!(classify(err), TickError::Fatal(_)));
    }

    #[test]
    fn test_denied_command_is_deleted_with_permission() {
        assert!(should_delete(Access::Denied, true));
    }

    #[test]
    fn test_denied_command_is_kept_without_permission() {
        assert!(!should_delete(Access::Denied, false));
    }

    #[test]
    fn test_allowed_command_is_never_deleted() {
        assert!(!should_delete(Access::Allowed, true));
        assert!(!should_delete(Access::Allowed, false));
    }
}
