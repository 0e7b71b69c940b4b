//! Refresh scheduler publishing a token's price to the chat platform.
//!
//! One tick runs as soon as the worker starts, then one per refresh interval. A tick publishes
//! the presence line of the previous snapshot, computes a new snapshot, swaps it in and renames
//! the bot in every guild from it.

use std::{fmt, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use color_eyre::eyre::{self, OptionExt as _, WrapErr as _};
use futures::Future;
use pricebot_core::{config::TokenConfig, display, price::PriceSource, state::PriceState};
use tokio::{
    select,
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use builder::Builder;
mod builder;

/// Why a tick was abandoned.
#[derive(Debug)]
pub enum TickError {
    /// The chat platform could not be reached; the next tick runs as scheduled.
    Transient(eyre::Report),
    /// Anything else; the scheduler stops.
    Fatal(eyre::Report),
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(e) => write!(f, "transient: {e}"),
            Self::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

/// Where the status strings end up.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn set_presence(&self, presence: &str) -> Result<(), TickError>;

    /// Guilds the bot currently belongs to.
    fn guilds(&self) -> Vec<u64>;

    async fn set_nickname(&self, guild_id: u64, nickname: &str) -> Result<(), TickError>;
}

pub struct Handle {
    worker_handle: tokio::task::JoinHandle<eyre::Result<()>>,
}

// Awaiting the handle deals with the Worker's result
impl Future for Handle {
    type Output = eyre::Result<()>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use futures::future::FutureExt as _;

        self.worker_handle.poll_unpin(cx).map(|result| match result {
            Ok(worker_res) => match worker_res {
                Ok(()) => Ok(()),
                Err(e) => Err(e).wrap_err("refresh scheduler returned with err"),
            },
            Err(e) => Err(e).wrap_err("refresh scheduler panicked"),
        })
    }
}

struct Worker {
    source: Arc<dyn PriceSource>,
    publisher: Arc<dyn Publisher>,
    token: Arc<TokenConfig>,
    reference_symbol: String,
    refresh_interval: Duration,
    state_tx: watch::Sender<Arc<PriceState>>,
    shutdown_token: CancellationToken,
}

impl Worker {
    #[instrument(name = "refresh_scheduler", skip(self), fields(token.name = %self.token.name))]
    async fn run(self) -> eyre::Result<()> {
        info!(
            refresh_interval = %humantime::format_duration(self.refresh_interval),
            "Starting refresh scheduler"
        );

        let first_tick = Instant::now()
            .checked_add(self.refresh_interval)
            .ok_or_eyre("refresh interval is too long to schedule")?;

        self.run_tick().await?;

        let mut ticks = tokio::time::interval_at(first_tick, self.refresh_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                () = self.shutdown_token.cancelled() => {
                    info!("Refresh scheduler received shutdown signal");
                    break Ok(());
                }

                _ = ticks.tick() => self.run_tick().await?,
            }
        }
    }

    /// Swallows transient errors, surfaces fatal ones.
    async fn run_tick(&self) -> eyre::Result<()> {
        match self.tick().await {
            Ok(()) => Ok(()),
            Err(TickError::Transient(e)) => {
                warn!(error = %e, "Publishing failed, waiting for next tick");
                Ok(())
            }
            Err(TickError::Fatal(e)) => Err(e).wrap_err("refresh tick failed"),
        }
    }

    async fn tick(&self) -> Result<(), TickError> {
        let previous = self.state_tx.borrow().clone();
        let presence = display::presence(&previous, &self.token, &self.reference_symbol)
            .map_err(TickError::Fatal)?;
        if let Some(presence) = presence {
            self.publisher.set_presence(&presence).await?;
            debug!(%presence, "📣 Updated presence");
        }

        let state = Arc::new(self.source.snapshot().await.map_err(TickError::Fatal)?);
        self.state_tx.send_replace(Arc::clone(&state));

        let nickname = display::nickname(&state, &self.token);
        for guild_id in self.publisher.guilds() {
            self.publisher.set_nickname(guild_id, &nickname).await?;
        }
        info!(price = %state.price, %nickname, "💱 Refreshed price");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        str::FromStr as _,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use alloy::primitives::Address;
    use bigdecimal::BigDecimal;
    use color_eyre::eyre::eyre;
    use tokio::sync::mpsc;

    use super::*;

    const REFRESH: Duration = Duration::from_secs(60);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Snapshot(Instant),
        Presence(String),
        Nickname(u64, String),
    }

    struct FixedSource {
        state: Option<PriceState>,
        events: mpsc::UnboundedSender<Event>,
    }

    #[async_trait]
    impl PriceSource for FixedSource {
        async fn snapshot(&self) -> eyre::Result<PriceState> {
            let _ = self.events.send(Event::Snapshot(Instant::now()));
            self.state.clone().ok_or_else(|| eyre!("execution reverted"))
        }
    }

    /// Records what gets published; the first `failures` nickname updates fail with a transport
    /// error.
    struct RecordingPublisher {
        events: mpsc::UnboundedSender<Event>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn set_presence(&self, presence: &str) -> Result<(), TickError> {
            let _ = self.events.send(Event::Presence(presence.to_string()));
            Ok(())
        }

        fn guilds(&self) -> Vec<u64> {
            vec![1, 2]
        }

        async fn set_nickname(&self, guild_id: u64, nickname: &str) -> Result<(), TickError> {
            let _ = self
                .events
                .send(Event::Nickname(guild_id, nickname.to_string()));
            let failures = self.failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.failures.store(failures - 1, Ordering::SeqCst);
                return Err(TickError::Transient(eyre!("503 Service Unavailable")));
            }
            Ok(())
        }
    }

    fn dec(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    fn state() -> PriceState {
        PriceState {
            price: dec("1.5000"),
            reference_price: dec("3000"),
            reference_amount: dec("10"),
            token_amount: dec("20000"),
            total_supply: dec("1000"),
        }
    }

    fn token() -> TokenConfig {
        TokenConfig {
            name: "COIN".to_string(),
            contract: Address::ZERO,
            lp: Address::ZERO,
            from: "honeyswap".to_string(),
            decimals: Some(18),
            abi: None,
            lp_abi: None,
            icon: "🪙".to_string(),
            emoji: None,
            command_override: HashMap::new(),
            apikey: String::new(),
        }
    }

    struct Fixture {
        handle: Handle,
        shutdown_token: CancellationToken,
        events: mpsc::UnboundedReceiver<Event>,
        state_rx: watch::Receiver<Arc<PriceState>>,
    }

    fn spawn(state: Option<PriceState>, nickname_failures: usize) -> Fixture {
        spawn_every(REFRESH, state, nickname_failures)
    }

    fn spawn_every(
        refresh_interval: Duration,
        state: Option<PriceState>,
        nickname_failures: usize,
    ) -> Fixture {
        let (events_tx, events) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(Arc::new(PriceState::default()));

        let handle = Builder {
            source: Arc::new(FixedSource {
                state,
                events: events_tx.clone(),
            }),
            publisher: Arc::new(RecordingPublisher {
                events: events_tx,
                failures: AtomicUsize::new(nickname_failures),
            }),
            token: Arc::new(token()),
            reference_symbol: "ETH".to_string(),
            refresh_interval,
            state_tx,
            shutdown_token: shutdown_token.clone(),
        }
        .build();

        Fixture {
            handle,
            shutdown_token,
            events,
            state_rx,
        }
    }

    async fn next_snapshot(events: &mut mpsc::UnboundedReceiver<Event>) -> Instant {
        loop {
            match events.recv().await.expect("scheduler stopped") {
                Event::Snapshot(at) => break at,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_tick_skips_empty_presence() {
        let Fixture {
            handle,
            shutdown_token,
            mut events,
            state_rx,
        } = spawn(Some(state()), 0);

        assert!(matches!(events.recv().await, Some(Event::Snapshot(_))));
        assert_eq!(
            events.recv().await,
            Some(Event::Nickname(1, "🪙 $1.5000 (0.0005)".to_string()))
        );
        assert_eq!(
            events.recv().await,
            Some(Event::Nickname(2, "🪙 $1.5000 (0.0005)".to_string()))
        );
        assert_eq!(**state_rx.borrow(), state());

        shutdown_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_tick_publishes_presence_of_previous_snapshot() {
        let Fixture {
            handle,
            shutdown_token,
            mut events,
            ..
        } = spawn(Some(state()), 0);

        next_snapshot(&mut events).await;
        let presence = loop {
            match events.recv().await.expect("scheduler stopped") {
                Event::Presence(presence) => break presence,
                Event::Snapshot(_) => panic!("presence must be published before refreshing"),
                Event::Nickname(..) => continue,
            }
        };
        assert_eq!(presence, "LP ≈$60.0 | 20.0 🪙 + 0.01 ETH");

        shutdown_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_refresh_interval() {
        let Fixture {
            handle,
            shutdown_token,
            mut events,
            ..
        } = spawn(Some(state()), 0);

        let first = next_snapshot(&mut events).await;
        let second = next_snapshot(&mut events).await;
        let third = next_snapshot(&mut events).await;

        assert_eq!(second - first, REFRESH);
        assert_eq!(third - second, REFRESH);

        shutdown_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_reserves_give_identical_snapshots() {
        let Fixture {
            handle,
            shutdown_token,
            mut events,
            state_rx,
        } = spawn(Some(state()), 0);

        let mut nicknames = Vec::new();
        while nicknames.len() < 4 {
            if let Some(Event::Nickname(_, nickname)) = events.recv().await {
                nicknames.push(nickname);
            }
        }
        assert!(nicknames.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(**state_rx.borrow(), state());

        shutdown_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_do_not_stop_the_loop() {
        let Fixture {
            handle,
            shutdown_token,
            mut events,
            ..
        } = spawn(Some(state()), 2);

        let first = next_snapshot(&mut events).await;
        let second = next_snapshot(&mut events).await;
        let third = next_snapshot(&mut events).await;

        assert_eq!(second - first, REFRESH);
        assert_eq!(third - second, REFRESH);

        shutdown_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_computation_errors_are_fatal() {
        let Fixture { handle, events, .. } = spawn(None, 0);

        let err = handle.await.unwrap_err();
        assert!(format!("{err:?}").contains("execution reverted"));
        drop(events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedulable_interval_is_an_error() {
        let Fixture { handle, events, .. } = spawn_every(Duration::MAX, Some(state()), 0);

        let err = handle.await.unwrap_err();
        assert!(format!("{err:?}").contains("refresh interval is too long to schedule"));
        drop(events);
    }
}
