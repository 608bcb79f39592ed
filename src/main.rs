// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BLE Duplex daemon

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ble_duplex::bluetooth::{BluezPlatform, EventSink, GrantAll, Role, RoleCoordinator};
use ble_duplex::commands::{self, Flow, HostCommand};
use ble_duplex::config::Config;
use ble_duplex::events::{EventProcessor, LogNotifier, OutputFormat};
use ble_duplex::state::AppState;
use ble_duplex::storage::ImageStore;

struct Args {
    role: Option<Role>,
    format: OutputFormat,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        role: None,
        format: OutputFormat::Text,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => args.format = OutputFormat::Json,
            "--role" => {
                let value = iter.next().ok_or_else(|| anyhow!("--role needs a value"))?;
                args.role = Some(value.parse().map_err(|e: String| anyhow!(e))?);
            }
            other => return Err(anyhow!("unknown argument: {}", other)),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("ble_duplex=info".parse()?))
        .init();

    info!("Starting BLE Duplex v{}...", env!("CARGO_PKG_VERSION"));

    let args = parse_args()?;

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Initialize storage
    let images = Arc::new(ImageStore::new(&config.data_dir)?);
    info!("Images are saved to {}", images.dir().display());

    // Initialize BlueZ
    let platform = BluezPlatform::new(
        config.bluetooth.adapter.as_deref(),
        &config.bluetooth.device_name,
    )
    .await?;

    // Create application state
    let state = AppState::new();

    let (events, mut event_rx) = EventSink::channel();
    let coordinator = RoleCoordinator::new(
        platform,
        Arc::new(GrantAll),
        images,
        events,
        config.engine_options(),
    );

    // Handle engine events
    let mut processor = EventProcessor::new(state.clone(), Box::new(LogNotifier), args.format);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = processor.process_event(event) {
                error!("Error processing BLE event: {}", e);
            }
        }
    });

    if let Some(role) = args.role {
        coordinator.set_role(role).await;
    }

    info!("Ready as '{}'. Type 'help' for commands.", config.bluetooth.device_name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                };
                let command = match HostCommand::parse(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                };
                match commands::execute(command, &coordinator, &state).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => {
                        info!("Quit requested");
                        break;
                    }
                    Err(e) => warn!("Command failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    coordinator.shutdown().await;
    info!("BLE Duplex stopped");
    Ok(())
}
