//! bass-client: inspect BASS payloads and exercise the client state machine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};

use bass_client::config::{load_config, DEFAULT_CONFIG_FILE};
use bass_client::{
    BassClientHandle, ClientConfig, ClientError, Collaborators, ConfigFile, ConnectionState,
    InMemorySyncManager, LoopbackSink, PeriodicSync, RecordingCallbacks, State,
};
use bass_protocol::{
    AddressType, BaseData, BisSync, BroadcastChannel, BroadcastMetadata, BroadcastSubgroup,
    ControlPointOperation, ControlPointSubgroup, DeviceAddress, DeviceId, PaSync,
    ReceiveStateDecoder,
};

/// bass-client - Broadcast Audio Scan Service client tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long, global = true)]
    log_retention_days: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a BASE buffer and print it as JSON
    ParseBase {
        /// BASE service data in hex
        hex: String,
    },
    /// Decode a Broadcast Receive State value and print it as JSON
    DecodeReceiveState {
        /// Characteristic value in hex
        hex: String,
    },
    /// Print a Scan Control Point operation in hex
    Encode {
        #[command(subcommand)]
        op: EncodeCommand,
    },
    /// Run connect, add, pause, remove and disconnect against an emulated sink
    Simulate {
        /// Number of receive-state slots on the sink
        #[arg(long, default_value = "2")]
        slots: usize,

        /// Broadcast id of the source to add
        #[arg(long, default_value = "0x123456", value_parser = parse_u32)]
        broadcast_id: u32,
    },
}

#[derive(Subcommand, Debug)]
enum EncodeCommand {
    /// Add Source
    Add {
        /// Source address, e.g. 11:22:33:44:55:66
        #[arg(long, value_parser = parse_address)]
        address: DeviceAddress,

        /// The source address is random
        #[arg(long)]
        random: bool,

        #[arg(long, default_value = "0")]
        adv_sid: u8,

        #[arg(long, value_parser = parse_u32)]
        broadcast_id: u32,

        /// Selected BIS indexes of the single subgroup; none means no preference
        #[arg(long = "bis")]
        bis: Vec<u8>,

        /// Ask for PA sync without PAST
        #[arg(long)]
        past_unavailable: bool,
    },
    /// Modify Source
    Modify {
        #[arg(long)]
        source_id: u8,

        #[arg(long, value_enum, default_value = "past-available")]
        pa_sync: PaSyncArg,

        /// BIS_Sync bitmap per subgroup
        #[arg(long = "bis-sync", value_parser = parse_u32)]
        bis_sync: Vec<u32>,
    },
    /// Remove Source
    Remove {
        #[arg(long)]
        source_id: u8,
    },
    /// Set Broadcast Code
    SetCode {
        #[arg(long)]
        source_id: u8,

        /// Broadcast code as UTF-8 text (at most 16 bytes)
        #[arg(long)]
        code: String,
    },
    /// Remote Scan Started
    ScanStart,
    /// Remote Scan Stopped
    ScanStop,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PaSyncArg {
    DoNotSync,
    PastAvailable,
    PastUnavailable,
}

impl From<PaSyncArg> for PaSync {
    fn from(value: PaSyncArg) -> Self {
        match value {
            PaSyncArg::DoNotSync => PaSync::DoNotSync,
            PaSyncArg::PastAvailable => PaSync::SyncPastAvailable,
            PaSyncArg::PastUnavailable => PaSync::SyncPastUnavailable,
        }
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_address(s: &str) -> Result<DeviceAddress, String> {
    DeviceAddress::parse(s).ok_or_else(|| format!("invalid address '{}'", s))
}

fn decode_hex(input: &str) -> Result<Vec<u8>, ClientError> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    Ok(hex::decode(cleaned.trim_start_matches("0x"))?)
}

fn encode(op: EncodeCommand) -> Result<ControlPointOperation, ClientError> {
    let op = match op {
        EncodeCommand::Add {
            address,
            random,
            adv_sid,
            broadcast_id,
            bis,
            past_unavailable,
        } => {
            let address_type = if random {
                AddressType::Random
            } else {
                AddressType::Public
            };
            let metadata = BroadcastMetadata {
                source_device: DeviceId::new(address, address_type),
                source_adv_sid: adv_sid,
                broadcast_id,
                subgroups: vec![BroadcastSubgroup {
                    channels: bis
                        .into_iter()
                        .map(|channel_index| BroadcastChannel {
                            channel_index,
                            selected: true,
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            };
            ControlPointOperation::add_source(&metadata, past_unavailable)
        }
        EncodeCommand::Modify {
            source_id,
            pa_sync,
            bis_sync,
        } => ControlPointOperation::ModifySource {
            source_id,
            pa_sync: pa_sync.into(),
            pa_interval: bass_protocol::types::PA_INTERVAL_UNKNOWN,
            subgroups: bis_sync
                .into_iter()
                .map(|bits| ControlPointSubgroup {
                    bis_sync: BisSync(bits),
                    metadata: Vec::new(),
                })
                .collect(),
        },
        EncodeCommand::Remove { source_id } => ControlPointOperation::RemoveSource { source_id },
        EncodeCommand::SetCode { source_id, code } => {
            ControlPointOperation::set_broadcast_code(source_id, code.as_bytes())?
        }
        EncodeCommand::ScanStart => ControlPointOperation::RemoteScanStarted,
        EncodeCommand::ScanStop => ControlPointOperation::RemoteScanStopped,
    };
    Ok(op)
}

async fn simulate(
    config: ClientConfig,
    slots: usize,
    broadcast_id: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = DeviceId::new(
        DeviceAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
        AddressType::Random,
    );
    let sink_device = DeviceId::new(
        DeviceAddress([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01]),
        AddressType::Public,
    );
    let metadata = BroadcastMetadata {
        source_device: source,
        source_adv_sid: 1,
        broadcast_id,
        subgroups: vec![BroadcastSubgroup {
            channels: vec![BroadcastChannel {
                channel_index: 1,
                selected: true,
                ..Default::default()
            }],
            content_metadata: vec![0x03, 0x02, 0x04, 0x00],
            ..Default::default()
        }],
        ..Default::default()
    };

    let sink = LoopbackSink::new(slots);
    let callbacks = RecordingCallbacks::new();
    let periodic = InMemorySyncManager::new();
    periodic.add_sync(
        broadcast_id,
        PeriodicSync {
            sync_handle: 1,
            advertiser: source.address,
        },
    );
    let wait = config.gatt_txn_timeout() + config.connect_timeout();
    let collaborators = Collaborators::new(Box::new(sink.clone()), Arc::new(callbacks.clone()))
        .with_periodic(Arc::new(periodic));
    let handle = BassClientHandle::spawn(sink_device, config, collaborators);

    info!("Connecting to emulated sink {}", sink_device);
    handle.connect()?;
    handle.wait_for(wait, |s| s.bass_state_ready).await?;

    info!("Adding broadcast 0x{:06X}", broadcast_id);
    handle.add_source(metadata.clone())?;
    let snapshot = handle
        .wait_for(wait, |s| {
            s.sources
                .iter()
                .any(|s| s.is_source_present() && s.broadcast_id == broadcast_id)
        })
        .await?;
    let source_id = snapshot
        .sources
        .iter()
        .find(|s| s.is_source_present() && s.broadcast_id == broadcast_id)
        .map(|s| s.source_id)
        .ok_or(ClientError::ActorClosed)?;

    info!("Pausing source {}", source_id);
    handle.update_source(source_id, Some(metadata.paused()), None)?;
    handle
        .wait_for(wait, |s| {
            s.state == State::Connected
                && s.sources.iter().any(|s| {
                    s.is_source_present()
                        && s.source_id == source_id
                        && s.subgroups.iter().all(|g| !g.bis_sync_state.is_synced())
                })
        })
        .await?;

    info!("Removing source {}", source_id);
    handle.remove_source(source_id)?;
    handle
        .wait_for(wait, |s| {
            s.state == State::Connected && s.sources.iter().all(|s| !s.is_source_present())
        })
        .await?;

    info!("Disconnecting");
    handle.disconnect()?;
    let snapshot = handle
        .wait_for(wait, |s| s.connection_state == ConnectionState::Disconnected)
        .await?;
    handle.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!("{} callbacks recorded", callbacks.events().len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    });
    let file_config = if let Some(config_path) = &config_path {
        match load_config(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        }
    } else {
        ConfigFile::default()
    };

    // Command line takes precedence over the config file
    let log_dir = args.log_dir.clone().or(file_config.logging.log_dir.clone());
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    bass_client::logging::init_logging(
        log_dir.as_deref(),
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    match args.command {
        Command::ParseBase { hex } => {
            let bytes = decode_hex(&hex)?;
            match BaseData::parse(&bytes) {
                Some(base) => println!("{}", serde_json::to_string_pretty(&base)?),
                None => println!("invalid BASE"),
            }
        }
        Command::DecodeReceiveState { hex } => {
            let bytes = decode_hex(&hex)?;
            let mut decoder = ReceiveStateDecoder::new();
            let state = decoder.try_decode(0, &bytes, |address, address_type| {
                Some(DeviceId::new(address, address_type))
            })?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Encode { op } => {
            let op = encode(op)?;
            println!("{}", hex::encode(op.encode()?));
        }
        Command::Simulate {
            slots,
            broadcast_id,
        } => {
            if let Err(e) = simulate(file_config.client, slots, broadcast_id).await {
                error!("Simulation failed: {}", e);
                return Err(e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("0x123456"), Ok(0x123456));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn test_encode_commands() {
        let op = encode(EncodeCommand::Remove { source_id: 3 }).unwrap();
        assert_eq!(hex::encode(op.encode().unwrap()), "0503");

        let op = encode(EncodeCommand::Modify {
            source_id: 1,
            pa_sync: PaSyncArg::DoNotSync,
            bis_sync: vec![0],
        })
        .unwrap();
        assert_eq!(hex::encode(op.encode().unwrap()), "030100ffff010000000000");

        assert!(encode(EncodeCommand::SetCode {
            source_id: 1,
            code: "a code that is far too long".to_string(),
        })
        .is_err());
    }

    #[test]
    fn test_decode_hex_input() {
        assert_eq!(decode_hex("0x01 02:03").unwrap(), vec![1, 2, 3]);
        assert!(decode_hex("0g").is_err());
    }
}
