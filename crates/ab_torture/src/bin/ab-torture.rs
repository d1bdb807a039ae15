//! A/B Torture CLI
//!
//! Stress tests dual slot firmware updates on a remote device.
//!
//! ## Usage
//!
//! ```bash
//! # 100 normal updates against a device
//! ab-torture -d 192.168.1.50 update -f image.swu
//!
//! # Forced capsule updates with sudo, giving up if the device is gone for 30 minutes
//! ab-torture -d 192.168.1.50 -u admin -s --max-wait-secs 1800 update -f image.swu --force-capsule
//!
//! # Rolling reboots, asserting the boot slot never changes
//! ab-torture -d 192.168.1.50 reboot --num-reboots 200 --check-slot
//! ```

use ab_torture::config::DEFAULT_USER;
use ab_torture::{
    Config, ConsoleOperator, Credential, Harness, IcmpPinger, RecoveryScenarios, Result,
    RollingConfig, RollingReboot, SshConnector, UpdateCampaign, ENV_LOG,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// A/B firmware update torture tester
#[derive(Parser, Debug)]
#[command(name = "ab-torture")]
#[command(author = "Apilium Technologies")]
#[command(version)]
#[command(about = "Torture tests A/B firmware updates on remote embedded devices", long_about = None)]
struct Cli {
    /// Device address (host name or IP)
    #[arg(short, long, env = "AB_TORTURE_DEVICE")]
    device: Option<String>,

    /// User to log in as
    #[arg(short, long, default_value = DEFAULT_USER)]
    user: String,

    /// Password for the user
    #[arg(short, long, env = "AB_TORTURE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key file; takes precedence over the password
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Issue the reboot through sudo (needs NOPASSWD for reboot)
    #[arg(short, long)]
    sudo: bool,

    /// Give up waiting for the device after this many seconds (waits forever by default)
    #[arg(long)]
    max_wait_secs: Option<u64>,

    /// Write a JSON report here when the run succeeds
    #[arg(long)]
    report: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repeated update cycles, or one of the guided recovery scenarios
    Update(UpdateArgs),
    /// Rolling reboots without updates
    Reboot(RebootArgs),
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// The local file to use for updates
    #[arg(short = 'f', long = "updatefile")]
    update_file: PathBuf,

    /// Force a version mismatch before every update so a capsule update runs
    #[arg(long)]
    force_capsule: bool,

    /// Randomly mix reboots, normal updates and forced capsule updates
    #[arg(long)]
    random_mix: bool,

    /// Number of updates to complete
    #[arg(long, default_value_t = 100)]
    num_updates: u32,

    /// Seed for --random-mix
    #[arg(long)]
    seed: Option<u64>,

    /// Guided power interruption recovery scenario
    #[arg(long, conflicts_with = "unbootable_slot")]
    power_interrupt: bool,

    /// Guided unbootable slot recovery scenario
    #[arg(long)]
    unbootable_slot: bool,

    /// Version file rewritten to force a mismatch
    #[arg(long)]
    version_file: Option<String>,

    /// Skip comparing the uploaded payload's sha256sum
    #[arg(long)]
    no_verify_checksum: bool,
}

#[derive(Args, Debug)]
struct RebootArgs {
    /// Number of reboots
    #[arg(long, default_value_t = 100)]
    num_reboots: u32,

    /// Fail if the boot slot changes
    #[arg(long)]
    check_slot: bool,

    /// Check the Tegra UEFI VarErrorFlag before every reboot
    #[arg(long)]
    check_var_error_flag: bool,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = if std::env::var_os(ENV_LOG).is_some() {
        env_logger::Env::new().filter(ENV_LOG)
    } else {
        env_logger::Env::default()
    };
    env_logger::Builder::from_env(env.default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn build_config(cli: &Cli) -> Config {
    let mut config = Config::default();
    config.target.host = cli.device.clone().unwrap_or_default();
    config.target.user = cli.user.clone();
    config.target.credential = Credential::select(cli.key.clone(), cli.password.clone());
    config.target.elevated = cli.sudo;

    if let Command::Update(args) = &cli.command {
        config.update.update_file = Some(args.update_file.clone());
        config.update.verify_checksum = !args.no_verify_checksum;
        if let Some(file) = &args.version_file {
            config.update.version_file = file.clone();
        }
        config.campaign.num_updates = args.num_updates;
        config.campaign.force_capsule = args.force_capsule;
        config.campaign.mixed_random = args.random_mix;
        config.campaign.seed = args.seed;
    }

    config.apply_env();
    if let Some(secs) = cli.max_wait_secs {
        config.timing.max_wait = Some(Duration::from_secs(secs));
    }
    config
}

fn write_report<T: Serialize>(path: Option<&Path>, report: &T) -> Result<()> {
    if let Some(path) = path {
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json)?;
        log::info!("Report written to {}", path.display());
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let config = build_config(cli);
    let report_path = cli.report.as_deref();

    let connector = Box::new(SshConnector::new());
    let pinger = Box::new(IcmpPinger::new(config.timing.ping_wait));

    match &cli.command {
        Command::Update(args) => {
            config.validate_for_updates()?;
            let mut harness = Harness::new(&config, connector, pinger);

            if args.power_interrupt || args.unbootable_slot {
                let mut scenarios = RecoveryScenarios::new(Box::new(ConsoleOperator));
                let report = if args.power_interrupt {
                    scenarios.power_interruption(&mut harness)?
                } else {
                    scenarios.unbootable_slot(&mut harness)?
                };
                write_report(report_path, &report)?;
            } else {
                let mut campaign = UpdateCampaign::new(&config.campaign);
                let report = campaign.run(&mut harness)?;
                write_report(report_path, &report)?;
            }
        }
        Command::Reboot(args) => {
            config.validate()?;
            let mut harness = Harness::new(&config, connector, pinger);
            let rolling = RollingReboot::new(RollingConfig {
                num_reboots: args.num_reboots,
                check_slot: args.check_slot,
                check_var_error_flag: args.check_var_error_flag,
            });
            let report = rolling.run(&mut harness)?;
            write_report(report_path, &report)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    log::info!("ab-torture {}", ab_torture::VERSION);

    match run(&cli) {
        Ok(()) => {
            log::info!("Test completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("[{}] {}", e.code(), e);
            eprintln!("ab-torture: {}", e);
            ExitCode::FAILURE
        }
    }
}
