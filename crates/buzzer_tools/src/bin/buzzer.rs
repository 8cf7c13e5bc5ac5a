#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};

use buzzer_engines::registry_client::RegistryClient;
use buzzer_tools::pitch_cli::{execute_pitch_command, parse_command, CliConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut config = CliConfig::from_env().map_err(|e| e.to_string())?;
    let command = parse_command(&args, config.display_tz)?;
    if config.needs_password() {
        config.password = Some(read_password(config.username.as_deref().unwrap_or_default())?);
    }

    let client = RegistryClient::new(config.client_config());
    let output = execute_pitch_command(&client, &command, config.display_tz)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn read_password(username: &str) -> Result<String, String> {
    if io::stdin().is_terminal() {
        rpassword::prompt_password(format!("Password for {username}:")).map_err(|e| e.to_string())
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        Ok(input.trim_end_matches(['\r', '\n']).to_string())
    }
}
