use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use color_eyre::eyre::{self, Context as _};
use pricebot_core::config::Config;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

mod bot;
mod commands;
mod discord;
mod scheduler;
pub mod telemetry;

/// The [`Pricebot`] service returned by [`Pricebot::spawn`].
pub struct Pricebot {
    shutdown_token: CancellationToken,
    task: Option<JoinHandle<eyre::Result<()>>>,
}

impl Pricebot {
    /// Spawns one bot per configured token.
    ///
    /// # Errors
    /// Returns an error if the configuration is unusable. Failures binding contracts or
    /// connecting to Discord surface when the service is awaited.
    pub fn spawn(cfg: Config) -> eyre::Result<Self> {
        cfg.validate().wrap_err("invalid configuration")?;

        let shutdown_token = CancellationToken::new();
        let task = tokio::spawn(bot::run(cfg, shutdown_token.child_token()));

        Ok(Self {
            shutdown_token,
            task: Some(task),
        })
    }

    /// Shuts down every bot and its refresh scheduler.
    ///
    /// # Errors
    /// Returns an error if an error occured during shutdown.
    ///
    /// # Panics
    /// Panics if called twice
    pub async fn shutdown(mut self) -> eyre::Result<()> {
        self.shutdown_token.cancel();
        flatten_join_result(
            self.task
                .take()
                .expect("shutdown must only be called once")
                .await,
        )
    }
}

impl Future for Pricebot {
    type Output = eyre::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        use futures::future::FutureExt as _;

        let task = self
            .task
            .as_mut()
            .expect("pricebot must not be polled after completion");
        task.poll_unpin(cx).map(flatten_join_result)
    }
}

fn flatten_join_result<T>(res: Result<eyre::Result<T>, JoinError>) -> eyre::Result<T> {
    match res {
        Ok(Ok(res)) => Ok(res),
        Ok(Err(e)) => Err(e).wrap_err("task returned with error"),
        Err(e) => Err(e).wrap_err("task panicked"),
    }
}
