use std::{sync::Arc, time::Duration};

use alloy::providers::DynProvider;
use color_eyre::eyre::{self, WrapErr as _, eyre};
use pricebot_core::{
    abi::AbiRegistry,
    config::{Config, TokenConfig},
    contract::{Binder, Bindings, Endpoint},
    price::PriceEngine,
    state::PriceState,
};
use serenity::{Client, all::GatewayIntents};
use tokio::{
    select,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::discord::{Handler, PendingScheduler};

/// Binds every configured token and runs one bot per token until shutdown or the first failure.
pub(super) async fn run(cfg: Config, shutdown_token: CancellationToken) -> eyre::Result<()> {
    let cfg = Arc::new(cfg);

    let endpoint = Endpoint::parse(cfg.eth_node()?)?;
    let provider = endpoint
        .connect()
        .await
        .wrap_err("failed to connect to the blockchain node")?;
    info!(?endpoint, "🔗 Connected to blockchain node");

    let abis = AbiRegistry::new(&cfg.explorer_url, cfg.abi_cache_dir.clone())?;

    let mut bots = Vec::with_capacity(cfg.tokens.len());
    for token in &cfg.tokens {
        let bot = Bot::new(
            Arc::clone(&cfg),
            token.clone(),
            provider.clone(),
            &abis,
            shutdown_token.child_token(),
        )
        .await
        .wrap_err_with(|| format!("failed to set up {}", token.name))?;
        bots.push(bot);
    }

    let result = futures::future::try_join_all(bots.into_iter().map(Bot::run)).await;
    shutdown_token.cancel();
    result.map(|_| ())
}

struct Bot {
    token: Arc<TokenConfig>,
    client: Client,
    fatal_rx: mpsc::UnboundedReceiver<eyre::Report>,
    shutdown_token: CancellationToken,
}

impl Bot {
    #[instrument(name = "bot", skip_all, fields(token.name = %token.name))]
    async fn new(
        cfg: Arc<Config>,
        token: TokenConfig,
        provider: DynProvider,
        abis: &AbiRegistry,
        shutdown_token: CancellationToken,
    ) -> eyre::Result<Self> {
        let Bindings {
            contracts,
            decimals,
        } = Binder {
            config: &cfg,
            token: &token,
            provider,
            abis,
        }
        .bind()
        .await?;

        let home = cfg.home_amm(&token)?;
        let engine = Arc::new(PriceEngine::new(
            contracts,
            decimals,
            token.lp,
            home.address,
        ));
        info!(decimals, amm = %token.from, "🪙 Bound token contracts");

        let token = Arc::new(token);
        let (state_tx, state_rx) = watch::channel(Arc::new(PriceState::default()));
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let handler = Handler::new(
            Arc::clone(&token),
            cfg,
            engine,
            state_rx,
            PendingScheduler {
                state_tx,
                shutdown_token: shutdown_token.clone(),
            },
            fatal_tx,
        );

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;
        let client = Client::builder(&token.apikey, intents)
            .event_handler(handler)
            .await
            .wrap_err("failed to create discord client")?;

        Ok(Self {
            token,
            client,
            fatal_rx,
            shutdown_token,
        })
    }

    #[instrument(name = "bot", skip_all, fields(token.name = %self.token.name))]
    async fn run(mut self) -> eyre::Result<()> {
        let reason: eyre::Result<&'static str> = select! {
            biased;

            () = self.shutdown_token.cancelled() => Ok("received shutdown signal"),

            Some(e) = self.fatal_rx.recv() => Err(e),

            res = self.client.start() => match res {
                Ok(()) => Err(eyre!("discord client stopped")),
                Err(e) => Err(e).wrap_err("discord client failed"),
            },
        };

        self.shutdown(reason).await
    }

    async fn shutdown(self, reason: eyre::Result<&'static str>) -> eyre::Result<()> {
        const WAIT_BEFORE_ABORT: Duration = Duration::from_secs(25);

        // stops the refresh scheduler too
        self.shutdown_token.cancel();

        let message = format!(
            "waiting {} for the discord client to shutdown",
            humantime::format_duration(WAIT_BEFORE_ABORT)
        );
        match &reason {
            Ok(reason) => info!(%reason, message),
            Err(reason) => error!(%reason, message),
        };

        let shard_manager = Arc::clone(&self.client.shard_manager);
        if tokio::time::timeout(WAIT_BEFORE_ABORT, shard_manager.shutdown_all())
            .await
            .is_err()
        {
            warn!("discord client did not shut down in time");
        }

        reason.map(|_| ())
    }
}
