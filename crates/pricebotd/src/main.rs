use std::process::ExitCode;

use color_eyre::eyre::{self, eyre};
use pricebot_core::config::Config;
use pricebotd::{
    Pricebot,
    telemetry::{self, init_subscriber},
};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{error, info, instrument, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // set up config
    let cfg: Config = match Config::load() {
        Err(err) => {
            eprintln!("failed to read config:\n{err:?}");
            return ExitCode::FAILURE;
        }
        Ok(cfg) => cfg,
    };
    eprintln!("starting with config:\n{cfg:?}");

    // set up tracing
    let tracing_subscriber = telemetry::get_subscriber();
    init_subscriber(tracing_subscriber);

    // spawn service
    let mut pricebot = match Pricebot::spawn(cfg) {
        Ok(pricebot) => pricebot,
        Err(e) => {
            error!(%e, "failed initializing pricebot");
            return ExitCode::FAILURE;
        }
    };

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            error!(%e, "failed installing signal listeners");
            return ExitCode::FAILURE;
        }
    };

    let exit_reason = select! {
        _ = sigterm.recv() => Ok("received SIGTERM"),
        _ = sigint.recv() => Ok("received SIGINT"),
        res = &mut pricebot => {
            res.and_then(|()| Err(eyre!("pricebot service exited")))
        },
    };

    shutdown(exit_reason, pricebot).await
}

#[instrument(skip_all)]
async fn shutdown(reason: eyre::Result<&str>, service: Pricebot) -> ExitCode {
    let exit_code = match reason {
        Ok(reason) => {
            info!(reason, "shutting down");
            if let Err(e) = service.shutdown().await {
                warn!(%e, "shutting down");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(e = ?e, "pricebot service exited unexpectedly");
            ExitCode::FAILURE
        }
    };
    info!("shutdown successful");
    exit_code
}
