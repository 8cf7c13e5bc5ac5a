#![forbid(unsafe_code)]

//! Drives the scrolling sign from the registry's next pitch.
//!
//! The serial device is opened write-only and its line settings are used as
//! they are. The sign expects 9600 baud, 8N1; configure the port before
//! starting, e.g. `stty -F /dev/ttyUSB0 9600 cs8 -cstopb -parenb raw`.

use std::fs::OpenOptions;
use std::sync::Arc;

use buzzer_adapter::{cancel_on_signal, exit_config_error, init_tracing, EXIT_INIT};
use buzzer_contracts::device::DeviceRegistration;
use buzzer_engines::registry_client::RegistryClient;
use buzzer_engines::sign::{SignProtocol, SignSink};
use buzzer_os::sync::{default_device_name, local_addresses, SyncClient};
use buzzer_os::SignConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = SignConfig::from_env().unwrap_or_else(|err| exit_config_error(&err));

    let port = match OpenOptions::new().write(true).open(&config.device) {
        Ok(port) => port,
        Err(err) => {
            error!(device = %config.device.display(), error = %err, "could not open sign");
            std::process::exit(EXIT_INIT);
        }
    };
    let protocol = SignProtocol::new(port).with_effect(config.effect);
    let sink = SignSink::new(protocol, config.display_tz);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let identity = DeviceRegistration::v1(default_device_name(None), local_addresses());
    let client = Arc::new(RegistryClient::new(config.registry.clone()));
    info!(
        device = %config.device.display(),
        effect = config.effect.name(),
        "buzzer sign running"
    );
    let summary = SyncClient::new(client, config.check_interval, identity)
        .run(Box::new(sink), cancel)
        .await;
    info!(ticks = summary.ticks, updates = summary.updates, "buzzer sign exited");
    Ok(())
}
