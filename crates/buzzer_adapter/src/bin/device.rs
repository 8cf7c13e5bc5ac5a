#![forbid(unsafe_code)]

use buzzer_adapter::{cancel_on_signal, exit_config_error, init_tracing, EXIT_INIT};
use buzzer_os::{DeviceConfig, DeviceParts, DeviceRuntime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = DeviceConfig::from_env().unwrap_or_else(|err| exit_config_error(&err));

    let parts = match DeviceParts::open(&config) {
        Ok(parts) => parts,
        Err(err) => {
            error!(error = %err, "hardware initialization failed");
            std::process::exit(EXIT_INIT);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let runtime = DeviceRuntime::start(parts, cancel)?;
    let summary = runtime.wait().await;
    info!(ticks = summary.ticks, updates = summary.updates, "buzzer device exited");
    Ok(())
}
