mod loader;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use samflash_core::{
    DeviceChannel, ErrorKind, FirmwareImage, FlashError, FlashOrchestrator, FlashPolicy,
    MockChannel, OperationOutcome, SambaChannel,
};
use tracing::{error, info};

use loader::{load_image, parse_checksum};

#[derive(Parser, Debug)]
#[command(author, version, about = "SamFlash firmware flashing tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Device identifier (`VID:PID` in hex, or `auto`)
    #[arg(long, global = true)]
    device: Option<String>,

    /// Firmware file path
    #[arg(long, global = true)]
    file: Option<PathBuf>,

    /// Expected CRC-32 of the firmware file (hex)
    #[arg(long, global = true, value_parser = parse_checksum)]
    checksum: Option<u32>,

    /// Run against an in-memory simulated device (starts erased)
    #[arg(long, global = true)]
    simulate: bool,

    /// Policy file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write the effective policy (file plus flags) to this TOML file
    #[arg(long, global = true)]
    save_config: Option<PathBuf>,

    /// Additional attempts per stage after the first
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Timeout for each device call, in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Bytes per write call
    #[arg(long, global = true)]
    block_size: Option<usize>,

    /// Skip verification after writing
    #[arg(long, global = true)]
    no_verify: bool,

    /// Skip erasing before writing
    #[arg(long, global = true)]
    no_erase: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// List attached devices
    Scan,
    /// Connect to the device and report its identity
    Connect,
    /// Write the firmware file to the device
    Flash,
    /// Compare device memory against the firmware file
    Verify,
    /// Erase the device
    Erase,
    /// Report device status
    Status,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {e}");
    }

    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Error: {:#}", e);
            match e.downcast_ref::<FlashError>() {
                Some(err) => ExitCode::from(exit_code(err.underlying())),
                None => ExitCode::from(1),
            }
        }
    }
}

fn build_policy(args: &Args) -> Result<FlashPolicy> {
    let base = match &args.config {
        Some(path) => FlashPolicy::load_from_file(path)
            .with_context(|| format!("Failed to load policy {}", path.display()))?,
        None => FlashPolicy::default(),
    };

    let mut builder = base.to_builder();
    if let Some(retries) = args.retries {
        builder = builder.retry_count(retries);
    }
    if let Some(ms) = args.timeout_ms {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    if let Some(bytes) = args.block_size {
        builder = builder.block_size(bytes);
    }
    if args.no_verify {
        builder = builder.verify_after_write(false);
    }
    if args.no_erase {
        builder = builder.erase_before_write(false);
    }
    let policy = builder.build()?;

    if let Some(path) = &args.save_config {
        policy
            .save_to_file(path)
            .with_context(|| format!("Failed to save policy {}", path.display()))?;
        info!(path = %path.display(), "Saved policy");
    }
    Ok(policy)
}

fn run(args: &Args) -> Result<u8> {
    let policy = build_policy(args)?;
    let device = args
        .device
        .clone()
        .unwrap_or_else(|| if args.simulate { "sim0" } else { "auto" }.to_string());

    let image = match args.command {
        Command::Flash | Command::Verify => {
            let Some(path) = &args.file else {
                bail!(FlashError::invalid_argument(format!(
                    "--file is required for {:?}",
                    args.command
                )));
            };
            Some(load_image(path, args.checksum)?)
        }
        _ => None,
    };

    info!(command = ?args.command, device = %device, "Starting SamFlash");

    let code = if args.simulate {
        execute(MockChannel::new(), policy, args.command, &device, image.as_ref())
    } else {
        execute(SambaChannel::usb(), policy, args.command, &device, image.as_ref())
    };
    Ok(code)
}

fn execute<C: DeviceChannel>(
    channel: C,
    policy: FlashPolicy,
    command: Command,
    device: &str,
    image: Option<&FirmwareImage>,
) -> u8 {
    let orchestrator = FlashOrchestrator::new(channel, policy);

    match command {
        Command::Scan => scan(&orchestrator),
        Command::Connect => with_session(&orchestrator, device, |o| {
            if let Some(info) = o.device_info() {
                println!(
                    "Connected: {} ({}), flash {} bytes, page {} bytes",
                    info.id, info.name, info.flash_size, info.page_size
                );
            }
            0
        }),
        Command::Flash => with_session(&orchestrator, device, |o| match image {
            Some(image) => report(command, &o.flash_firmware(image)),
            None => exit_code(ErrorKind::InvalidArgument),
        }),
        Command::Verify => with_session(&orchestrator, device, |o| {
            report(command, &o.verify_firmware(image))
        }),
        Command::Erase => with_session(&orchestrator, device, |o| {
            report(command, &o.erase_device())
        }),
        Command::Status => with_session(&orchestrator, device, |o| match o.status() {
            Ok(status) => {
                println!("Status: {status}");
                0
            }
            Err(e) => {
                error!(command = ?command, "{}", e);
                exit_code(e.underlying())
            }
        }),
    }
}

/// Connect to `device`, run `body`, then disconnect. A failed connect is
/// reported and returned without running `body`.
fn with_session<C, F>(orchestrator: &FlashOrchestrator<C>, device: &str, body: F) -> u8
where
    C: DeviceChannel,
    F: FnOnce(&FlashOrchestrator<C>) -> u8,
{
    let connected = orchestrator.connect(device);
    if !connected.is_success() {
        return report(Command::Connect, &connected);
    }
    let code = body(orchestrator);
    orchestrator.disconnect();
    code
}

fn scan<C: DeviceChannel>(orchestrator: &FlashOrchestrator<C>) -> u8 {
    match orchestrator.scan_devices() {
        Ok(devices) if devices.is_empty() => {
            println!("No devices found");
            0
        }
        Ok(devices) => {
            for info in devices {
                println!("{}  {}", info.id, info.name);
            }
            0
        }
        Err(e) => {
            error!(command = ?Command::Scan, "{}", e);
            exit_code(e.underlying())
        }
    }
}

/// Log the outcome and map it to an exit code.
fn report(command: Command, outcome: &OperationOutcome) -> u8 {
    match outcome {
        OperationOutcome::Success { attempts_made, .. } => {
            info!(command = ?command, attempts = attempts_made, "Success");
            0
        }
        OperationOutcome::Failure {
            kind,
            attempts_made,
            last_error,
            ..
        } => {
            let underlying = last_error.underlying();
            match underlying {
                ErrorKind::VerificationMismatch => {
                    error!(command = ?command, attempts = attempts_made, "Device contents do not match the firmware: {}", last_error)
                }
                ErrorKind::DeviceUnreachable => {
                    error!(command = ?command, attempts = attempts_made, "Device unreachable: {}", last_error)
                }
                ErrorKind::Timeout => {
                    error!(command = ?command, attempts = attempts_made, "Device timed out: {}", last_error)
                }
                _ => error!(command = ?command, kind = %kind, attempts = attempts_made, "{}", last_error),
            }
            exit_code(underlying)
        }
    }
}

/// Process exit code for a failure kind.
fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidArgument => 2,
        ErrorKind::InvalidConfiguration => 3,
        ErrorKind::OperationInProgress => 4,
        ErrorKind::DeviceUnreachable => 5,
        ErrorKind::Timeout => 6,
        ErrorKind::ProtocolError => 7,
        ErrorKind::VerificationMismatch => 8,
        ErrorKind::NotConnected => 9,
        ErrorKind::RetriesExhausted => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["samflash"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_distinct_exit_codes() {
        let kinds = [
            ErrorKind::InvalidArgument,
            ErrorKind::InvalidConfiguration,
            ErrorKind::OperationInProgress,
            ErrorKind::DeviceUnreachable,
            ErrorKind::Timeout,
            ErrorKind::ProtocolError,
            ErrorKind::VerificationMismatch,
            ErrorKind::NotConnected,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|k| exit_code(*k)).collect();
        assert!(codes.iter().all(|c| *c > 1));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_policy_flags_override() {
        let policy = build_policy(&args(&[
            "flash",
            "--retries",
            "5",
            "--timeout-ms",
            "10000",
            "--no-verify",
            "--no-erase",
        ]))
        .unwrap();
        assert_eq!(policy.retry_count(), 5);
        assert_eq!(policy.timeout(), Duration::from_secs(10));
        assert!(!policy.verify_after_write());
        assert!(!policy.erase_before_write());
    }

    #[test]
    fn test_save_config_writes_effective_policy() {
        let path = std::env::temp_dir().join(format!("samflash-cli-{}.toml", std::process::id()));
        let path_arg = path.to_str().unwrap();

        let policy =
            build_policy(&args(&["erase", "--retries", "1", "--save-config", path_arg])).unwrap();
        let saved = build_policy(&args(&["erase", "--config", path_arg])).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(saved, policy);
        assert_eq!(saved.retry_count(), 1);
    }

    #[test]
    fn test_invalid_policy_flag() {
        let err = build_policy(&args(&["erase", "--timeout-ms", "0"])).unwrap_err();
        let err = err.downcast_ref::<FlashError>().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_simulated_commands() {
        assert_eq!(run(&args(&["scan", "--simulate"])).unwrap(), 0);
        assert_eq!(run(&args(&["connect", "--simulate"])).unwrap(), 0);
        assert_eq!(run(&args(&["erase", "--simulate"])).unwrap(), 0);
        assert_eq!(run(&args(&["status", "--simulate"])).unwrap(), 0);
    }

    #[test]
    fn test_flash_requires_file() {
        let err = run(&args(&["flash", "--simulate"])).unwrap_err();
        let err = err.downcast_ref::<FlashError>().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_simulated_flash_and_verify() {
        let path = std::env::temp_dir().join(format!("samflash-cli-{}.bin", std::process::id()));
        std::fs::write(&path, vec![0x5A; 700]).unwrap();
        let file = path.to_str().unwrap();

        assert_eq!(run(&args(&["flash", "--simulate", "--file", file])).unwrap(), 0);
        // A fresh simulated device is erased, so a standalone verify mismatches.
        assert_eq!(run(&args(&["verify", "--simulate", "--file", file])).unwrap(), 8);

        std::fs::remove_file(&path).unwrap();
    }
}
