use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::DiscoveryConfig;
use crate::crawler::{CancelFlag, CrawlStatus};
use crate::discovery::{self, ProgressCallback};
use crate::error;

#[derive(Parser)]
#[command(name = "cartograph")]
#[command(author = "Cartograph Contributors")]
#[command(version = "0.1.0")]
#[command(about = "SSH-driven network topology discovery and mapping", long_about = None)]
#[command(after_help = "Credentials may also come from SC_USERNAME / SC_PASSWORD / SC_ALT_USERNAME / SC_ALT_PASSWORD.")]
pub struct Cli {
    #[arg(long, help = "YAML config file")]
    pub yaml: Option<PathBuf>,

    #[arg(long, help = "Seed IP address or hostname")]
    pub seed_ip: Option<String>,

    #[arg(long, help = "Device username (can also use SC_USERNAME)")]
    pub username: Option<String>,

    #[arg(long, help = "Device password (can also use SC_PASSWORD)")]
    pub password: Option<String>,

    #[arg(long, help = "Alternate username (can also use SC_ALT_USERNAME)")]
    pub alt_username: Option<String>,

    #[arg(long, help = "Alternate password (can also use SC_ALT_PASSWORD)")]
    pub alt_password: Option<String>,

    #[arg(long, help = "Domain name stripped during hostname canonicalization")]
    pub domain: Option<String>,

    #[arg(long, help = "Comma-separated substrings; matching neighbors are not crawled")]
    pub exclude: Option<String>,

    #[arg(long, help = "Comma-separated prompt substrings that abort a device")]
    pub blacklist: Option<String>,

    #[arg(long, help = "Output directory")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, help = "Directory of .textfsm files overriding the embedded templates")]
    pub templates_dir: Option<PathBuf>,

    #[arg(long, help = "Per-device timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Maximum devices to discover")]
    pub max_devices: Option<usize>,

    #[arg(long, help = "Concurrent discovery workers")]
    pub max_workers: Option<usize>,

    #[arg(long, help = "Output map name")]
    pub map_name: Option<String>,

    #[arg(long, help = "Graph layout hint (kk/rt/circular/multipartite), forwarded to renderers")]
    pub layout: Option<String>,

    #[arg(short, long, help = "Enable verbose logging and debug dumps")]
    pub verbose: bool,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Configuration error:".bright_red().bold(), e);
            std::process::exit(2);
        }
    };

    println!("{}", "Cartograph Network Discovery".bright_cyan().bold());
    println!("{}", "═".repeat(60).bright_cyan());
    println!("🌱 Seed: {}", config.seed_ip.bright_yellow());
    println!("🧵 Workers: {}", config.max_workers.to_string().bright_green());
    println!("🗺  Layout hint: {:?}", config.layout);
    if !config.exclude.is_empty() {
        println!("🚫 Excluding: {}", config.exclude.bright_cyan());
    }

    let cancel = CancelFlag::default();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{}", "Interrupt received, finishing in-flight devices...".bright_yellow());
                cancel.cancel();
            }
        });
    }

    let bar = ProgressBar::new(config.max_devices as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    let progress_bar = bar.clone();
    let callback: ProgressCallback = Box::new(move |event| {
        if event.status == CrawlStatus::Complete {
            return;
        }
        progress_bar.set_position(event.stats.devices_discovered as u64);
        if let Some(ip) = &event.ip {
            progress_bar.set_message(format!("{}: {}", ip, event.status.as_str()));
        }
    });

    let report = discovery::discover(&config, cancel, Some(callback)).await?;
    bar.finish_and_clear();

    let map_path =
        discovery::save_topology(&report.topology, &config.output_dir, &config.map_name)?;
    if config.save_debug_info {
        discovery::save_debug_info(&report, &config.output_dir)?;
    }

    println!("\n{}", "Discovery Summary".bright_green().bold());
    println!("{}", "═".repeat(60).bright_green());
    println!("✅ Discovered: {}", report.stats.devices_discovered.to_string().bright_green());
    println!("❌ Failed: {}", report.stats.devices_failed.to_string().bright_red());
    println!("🔌 Unreachable: {}", report.stats.unreachable_hosts.to_string().bright_yellow());
    println!("📋 Left in queue: {}", report.stats.devices_queued);
    if report.dropped_links > 0 {
        println!("🔗 Dropped unconfirmed links: {}", report.dropped_links.to_string().bright_yellow());
    }
    println!("💾 Map saved to: {}", map_path.display().to_string().bright_cyan());

    if config.verbose && !report.failures.is_empty() {
        println!("\n{}", "Failures:".bright_red().bold());
        for (address, kind) in &report.failures {
            println!("  {} {} ({})", "✗".bright_red(), address, kind.bright_yellow());
        }
    }

    if report.cancelled {
        std::process::exit(130);
    }
    Ok(())
}

fn build_config(cli: &Cli) -> error::Result<DiscoveryConfig> {
    let mut config = DiscoveryConfig::from_env();
    if let Some(yaml) = &cli.yaml {
        config.apply_yaml(yaml)?;
    }
    if let Some(v) = &cli.seed_ip {
        config.seed_ip = v.clone();
    }
    if let Some(v) = &cli.username {
        config.username = v.clone();
    }
    if let Some(v) = &cli.password {
        config.password = v.clone();
    }
    if let Some(v) = &cli.alt_username {
        config.alternate_username = v.clone();
    }
    if let Some(v) = &cli.alt_password {
        config.alternate_password = v.clone();
    }
    if let Some(v) = &cli.domain {
        config.domain_name = v.clone();
    }
    if let Some(v) = &cli.exclude {
        config.exclude = v.clone();
    }
    if let Some(v) = &cli.blacklist {
        config.blacklist = v.clone();
    }
    if let Some(v) = &cli.output_dir {
        config.output_dir = v.clone();
    }
    if let Some(v) = &cli.templates_dir {
        config.templates_dir = Some(v.clone());
    }
    if let Some(v) = cli.timeout {
        config.timeout = v;
    }
    if let Some(v) = cli.max_devices {
        config.max_devices = v;
    }
    if let Some(v) = cli.max_workers {
        config.max_workers = v;
    }
    if let Some(v) = &cli.map_name {
        config.map_name = v.clone();
    }
    if let Some(v) = &cli.layout {
        config.layout = v.parse()?;
    }
    if cli.verbose {
        config.verbose = true;
        config.save_debug_info = true;
    }
    config.validate()?;
    Ok(config)
}
