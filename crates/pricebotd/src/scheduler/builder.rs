use std::{sync::Arc, time::Duration};

use pricebot_core::{config::TokenConfig, price::PriceSource, state::PriceState};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Handle, Publisher, Worker};

pub struct Builder {
    pub source: Arc<dyn PriceSource>,
    pub publisher: Arc<dyn Publisher>,
    pub token: Arc<TokenConfig>,
    pub reference_symbol: String,
    pub refresh_interval: Duration,
    /// The scheduler is the only writer of the snapshot
    pub state_tx: watch::Sender<Arc<PriceState>>,
    pub shutdown_token: CancellationToken,
}

impl Builder {
    pub fn build(self) -> Handle {
        let Self {
            source,
            publisher,
            token,
            reference_symbol,
            refresh_interval,
            state_tx,
            shutdown_token,
        } = self;

        let worker = Worker {
            source,
            publisher,
            token,
            reference_symbol,
            refresh_interval,
            state_tx,
            shutdown_token,
        };

        let worker_handle = tokio::task::spawn(async move { worker.run().await });

        Handle { worker_handle }
    }
}
