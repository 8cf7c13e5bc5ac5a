#![forbid(unsafe_code)]

//! Switches both relays off and exits. Used from boot scripts and to recover
//! a box whose device process died with its outputs on.

use std::sync::Arc;

use buzzer_adapter::{exit_config_error, init_tracing, EXIT_INIT};
use buzzer_os::hardware::{OutputPair, SysfsGpioBoard};
use buzzer_os::BoardConfig;
use tracing::{error, info};

fn main() {
    init_tracing();
    let config = BoardConfig::from_env().unwrap_or_else(|err| exit_config_error(&err));
    let board = match SysfsGpioBoard::open(&config.gpio_base, &config.layout) {
        Ok(board) => board,
        Err(err) => {
            error!(error = %err, "hardware initialization failed");
            std::process::exit(EXIT_INIT);
        }
    };
    let outputs = OutputPair::from_layout(Arc::new(board), &config.layout);
    outputs.all_off();
    info!(
        light = config.layout.light_relay,
        horn = config.layout.horn_relay,
        "outputs reset"
    );
}
