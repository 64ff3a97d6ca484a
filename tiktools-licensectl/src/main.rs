//! TikTools license control.
//!
//! Validates a key against the license authority, shows the cached session,
//! releases this machine's binding, or prints the machine hash for support.
//!
//! Usage:
//!   tiktools-licensectl validate ABCD-1234 --watch
//!   tiktools-licensectl status
//!
//! Authority settings come from flags or `TIKTOOLS_AUTHORITY_URL`,
//! `TIKTOOLS_API_KEY` and `TIKTOOLS_CACHE_PATH`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tiktools_license::{
    DeviceInfo, LicenseClient, LicenseConfig, MachineIdentity, ValidateOptions, ValidationResult,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tiktools-licensectl")]
#[command(about = "Validate and manage the TikTools license on this machine")]
struct Args {
    /// License authority base URL
    #[arg(long, env = "TIKTOOLS_AUTHORITY_URL")]
    authority_url: Option<String>,

    /// Public API key for the authority
    #[arg(long, env = "TIKTOOLS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Path of the sealed license cache
    #[arg(long, env = "TIKTOOLS_CACHE_PATH")]
    cache_path: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a license key online
    Validate {
        key: String,

        /// Stay running and report revocations until disabled or Ctrl-C
        #[arg(long)]
        watch: bool,

        /// Do not start realtime/poll monitoring
        #[arg(long, conflicts_with = "watch")]
        no_monitor: bool,
    },
    /// Show the session restored from the local cache
    Status,
    /// Release this machine's binding
    Deactivate,
    /// Print this machine's bound hash
    Fingerprint,
}

impl Args {
    fn config(&self) -> LicenseConfig {
        let mut config = LicenseConfig::default();
        if let Some(url) = &self.authority_url {
            config.authority_url = url.clone();
        }
        if let Some(key) = &self.api_key {
            config.api_key = key.clone();
        }
        config.cache_path = self.cache_path.clone();
        config
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match &args.command {
        Command::Fingerprint => {
            let identity = MachineIdentity::current();
            let device = DeviceInfo::collect();
            println!("machine hash: {}", identity.bound_hash());
            println!("host:         {} ({}/{})", device.hostname, device.os_name, device.arch);
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let client = LicenseClient::new(args.config()).context("failed to open license session")?;
            print_session(&client);
            Ok(exit_for(client.is_valid()))
        }
        Command::Deactivate => {
            let client = LicenseClient::new(args.config()).context("failed to open license session")?;
            client
                .deactivate()
                .await
                .context("failed to deactivate this machine")?;
            println!("This machine has been released from the license.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate {
            key,
            watch,
            no_monitor,
        } => {
            let client = LicenseClient::new(args.config()).context("failed to open license session")?;
            let options = ValidateOptions {
                monitor: !*no_monitor,
            };

            let (tx, mut disabled) = mpsc::unbounded_channel();
            client.on_license_disabled(move |reason| {
                let _ = tx.send(reason.to_string());
            });
            client.on_status_change(|old, new| info!("License status {old} -> {new}"));

            let result = client.validate_with(key, options).await;
            print_result(&result);

            if *watch && result.is_valid() {
                info!("Watching for revocations, Ctrl-C to exit");
                tokio::select! {
                    reason = disabled.recv() => {
                        if let Some(reason) = reason {
                            println!("License disabled: {reason}");
                        }
                    }
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("failed to listen for Ctrl-C")?;
                    }
                }
                client.stop();
                return Ok(exit_for(client.is_valid()));
            }

            client.stop();
            Ok(exit_for(result.is_valid()))
        }
    }
}

fn exit_for(valid: bool) -> ExitCode {
    if valid { ExitCode::SUCCESS } else { ExitCode::from(2) }
}

fn print_result(result: &ValidationResult) {
    println!("status:   {}", result.status);
    if let Some(message) = &result.message {
        println!("message:  {message}");
    }
    if let Some(hours) = result.offline_hours {
        println!("offline:  {hours}h since last online check");
    }
    if let Some(entitlement) = &result.entitlement {
        println!("type:     {}", entitlement.license_type);
        println!("features: {}", entitlement.features.join(", "));
        match entitlement.expires_at {
            Some(at) => println!("expires:  {}", at.format("%Y-%m-%d")),
            None => println!("expires:  never"),
        }
    }
}

fn print_session(client: &LicenseClient) {
    println!("status:   {}", client.status());
    match client.license_key() {
        Some(key) => println!("key:      {}...", key.chars().take(8).collect::<String>()),
        None => println!("key:      none"),
    }
    println!("type:     {}", client.license_type());
    if let Some(entitlement) = client.entitlement() {
        println!("features: {}", entitlement.features.join(", "));
    }
    if let Some(days) = client.days_remaining() {
        println!("days:     {days}");
    }
}
