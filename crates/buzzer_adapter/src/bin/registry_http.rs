#![forbid(unsafe_code)]

use std::env;

use buzzer_adapter::config::RegistryServerConfig;
use buzzer_adapter::{
    cancel_on_signal, exit_config_error, init_tracing, router, run_announcer, RegistryState,
    EXIT_INIT,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let ephemeral = env::args().skip(1).any(|arg| arg == "--ephemeral");
    let config = RegistryServerConfig::from_env(ephemeral).unwrap_or_else(|err| exit_config_error(&err));

    let state = match RegistryState::open(&config) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "could not open pitch store");
            std::process::exit(EXIT_INIT);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let announcer = config
        .announce_interval
        .map(|interval| tokio::spawn(run_announcer(state.clone(), interval, cancel.clone())));

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        addr = %config.bind,
        ephemeral,
        auth = config.auth.is_some(),
        announcer = config.announce_interval.is_some(),
        "buzzer registry listening"
    );
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    cancel.cancel();
    if let Some(announcer) = announcer {
        announcer.await?;
    }
    info!("buzzer registry stopped");
    Ok(())
}
