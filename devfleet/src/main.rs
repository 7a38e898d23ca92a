use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use devfleet::{AdbBridge, DeviceManager, FastbootHelper, FleetConfig, ProcessRunner};

const USAGE: &str = "Usage: devfleet <command> [options]

Commands:
  list        Show every tracked device
  fastboot    Show devices sitting in the bootloader

Options (list):
  --json          Print the listing as JSON
  --wait <secs>   Wait for the first device before listing [default: 0]";

enum Cmd {
    List { json: bool, wait: Duration },
    Fastboot,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("DEVFLEET_LOG_LEVEL").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("devfleet={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Cmd, String> {
    let command = args.get(1).ok_or("missing command")?;
    match command.as_str() {
        "list" => {
            let mut json = false;
            let mut wait = Duration::ZERO;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--json" => json = true,
                    "--wait" => {
                        i += 1;
                        let secs = args.get(i).ok_or("--wait requires a value")?;
                        let secs: u64 = secs
                            .parse()
                            .map_err(|_| format!("invalid --wait value: {secs}"))?;
                        wait = Duration::from_secs(secs);
                    }
                    arg => return Err(format!("unknown argument: {arg}")),
                }
                i += 1;
            }
            Ok(Cmd::List { json, wait })
        }
        "fastboot" => match args.get(2) {
            None => Ok(Cmd::Fastboot),
            Some(arg) => Err(format!("unexpected argument: {arg}")),
        },
        "--help" | "-h" => Err(String::new()),
        other => Err(format!("unknown command: {other}")),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let cmd = match parse_args(&args) {
        Ok(cmd) => cmd,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(cmd).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(cmd: Cmd) -> anyhow::Result<()> {
    let config = FleetConfig::default();
    let runner = Arc::new(ProcessRunner);

    match cmd {
        Cmd::Fastboot => {
            let helper = FastbootHelper::new(
                runner,
                config.fastboot_path.clone(),
                config.fastboot_command_timeout,
            );
            if !helper.is_available().await {
                anyhow::bail!("fastboot is not runnable at {}", config.fastboot_path.display());
            }
            let mut serials: Vec<String> = helper
                .get_devices()
                .await
                .context("fastboot devices failed")?
                .into_iter()
                .collect();
            serials.sort();
            for serial in serials {
                println!("{serial}");
            }
        }
        Cmd::List { json, wait } => {
            let probe = Arc::new(AdbBridge::new(config.adb_path.clone(), runner.clone()));
            let manager = Arc::new(DeviceManager::new(
                config.with_synchronous_checks(true),
                probe,
                runner,
            ));
            manager.init().await.context("failed to start device manager")?;
            if !wait.is_zero() && !manager.wait_for_first_device_added(wait).await {
                tracing::warn!(?wait, "No device connected before the deadline");
            }

            let devices = manager.list_all_devices();
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                println!("{:<24} {:<12} {:<14} {}", "SERIAL", "KIND", "CONNECTIVITY", "ALLOCATION");
                for d in &devices {
                    let kind = serde_json::to_value(&d.kind)?;
                    println!(
                        "{:<24} {:<12} {:<14} {}",
                        d.serial,
                        kind.as_str().unwrap_or_default(),
                        d.connectivity.as_str(),
                        d.allocation.as_str()
                    );
                }
            }
            manager.terminate().await;
        }
    }
    Ok(())
}
