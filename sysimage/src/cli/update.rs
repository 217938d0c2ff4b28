// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::Write,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use serde_json::json;
use tracing::info;

use crate::{
    candidates::Filter,
    cli::status,
    config::Config,
    download::{self, DownloadHandle, Progress},
    hooks,
    service::Service,
    state::{CheckResult, DownloadOutcome, Overrides, StateMachine},
};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum FilterArg {
    Full,
    Delta,
}

impl From<FilterArg> for Filter {
    fn from(f: FilterArg) -> Self {
        match f {
            FilterArg::Full => Filter::Full,
            FilterArg::Delta => Filter::Delta,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum ProgressStyle {
    /// Dots on stderr.
    #[default]
    Dots,
    /// Progress messages in the log.
    Logfile,
    /// JSON records on stdout.
    Json,
}

/// Check for, download, and apply an update.
#[derive(Args, Debug)]
pub struct UpdateCli {
    /// Override the current build number just this once.
    #[arg(short, long, value_name = "NUMBER")]
    build: Option<u64>,

    /// Override the channel just this once. Use with `--build 0` to switch
    /// channels.
    #[arg(short, long)]
    channel: Option<String>,

    /// Override the device name just this once.
    #[arg(short, long)]
    device: Option<String>,

    /// Restrict candidate paths to full or delta upgrades only.
    #[arg(short, long, value_enum)]
    filter: Option<FilterArg>,

    /// Cap the winning path at this image version.
    #[arg(long, value_name = "VERSION")]
    maximage: Option<u64>,

    /// Override the computed phased-rollout percentage (0-100).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    percentage: Option<u8>,

    /// Calculate and print the upgrade path, but do not download or apply.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Download but stop short of applying the update.
    #[arg(long)]
    no_apply: bool,

    /// Allow downloading over cellular for this batch.
    #[arg(long)]
    override_gsm: bool,

    /// Download progress reporting style.
    #[arg(long, value_enum, default_value_t)]
    progress: ProgressStyle,
}

/// Show information about the current device and build.
#[derive(Args, Debug)]
pub struct InfoCli {}

/// List the channels offered by the server.
#[derive(Args, Debug)]
pub struct ChannelsCli {}

fn overrides_from(cli: &UpdateCli) -> Overrides {
    Overrides {
        build: cli.build,
        channel: cli.channel.clone(),
        device: cli.device.clone(),
        filter: cli.filter.map(Into::into),
        maximage: cli.maximage,
        percentage: cli.percentage,
        allow_gsm: cli.override_gsm,
    }
}

fn path_display(result: &CheckResult) -> String {
    let path = result
        .versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(":");

    match &result.channel_switch {
        Some((from, to)) => format!("{path} ({from} -> {to})"),
        None => path,
    }
}

pub fn update_main(
    cli: &UpdateCli,
    config: Config,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<ExitCode> {
    let config = Arc::new(config);
    let hooks = hooks::resolve(&config.hooks)?;
    let link = hooks.device.link_type();
    let downloader = download::select_backend(&config);

    let mut machine = StateMachine::new(config, hooks, downloader, overrides_from(cli));

    let result = machine.check().context("Check for update failed")?;

    if cli.dry_run {
        if result.available {
            println!("Upgrade path is {}", path_display(&result));
        } else {
            println!("Already up-to-date");
        }
        return Ok(ExitCode::SUCCESS);
    }

    if !result.available {
        status!("Already up to date");
        return Ok(ExitCode::SUCCESS);
    }

    status!(
        "Upgrade path is {} ({} bytes)",
        path_display(&result),
        result.size,
    );

    let handle = machine
        .start_download(link, false)
        .context("Could not start download")?;

    let batch = wait_with_progress(&handle, cli.progress, cancel_signal);
    let outcome = machine
        .finish_download(batch)
        .context("Download failed")?;

    if matches!(outcome, DownloadOutcome::Paused) {
        bail!("Download did not complete (queued by network policy)");
    }

    status!("Update downloaded and verified");

    if cli.no_apply {
        return Ok(ExitCode::SUCCESS);
    }

    let rebooting = machine.apply().context("Could not apply update")?;

    if rebooting {
        status!("Applying update; rebooting");
    } else {
        status!("Update staged for the next recovery boot");
    }

    Ok(ExitCode::SUCCESS)
}

fn wait_with_progress(
    handle: &Arc<dyn DownloadHandle>,
    style: ProgressStyle,
    cancel_signal: &Arc<AtomicBool>,
) -> download::Result<download::BatchStatus> {
    let mut reporter = Reporter::new(style);

    let status = thread::scope(|scope| {
        let waiter = scope.spawn(|| handle.wait());

        while !waiter.is_finished() {
            if cancel_signal.load(Ordering::SeqCst) {
                handle.cancel();
            }

            reporter.report(handle.progress());
            thread::sleep(Duration::from_millis(250));
        }

        waiter.join().unwrap()
    });

    reporter.finish();

    status
}

struct Reporter {
    style: ProgressStyle,
    last_percent: i32,
    dots: usize,
}

impl Reporter {
    fn new(style: ProgressStyle) -> Self {
        Self {
            style,
            last_percent: -1,
            dots: 0,
        }
    }

    fn report(&mut self, progress: Progress) {
        let percent = progress.percent();
        if percent <= self.last_percent {
            return;
        }
        self.last_percent = percent;

        match self.style {
            ProgressStyle::Dots => {
                eprint!(".");
                let _ = std::io::stderr().flush();

                self.dots += 1;
                if self.dots % 78 == 0 {
                    eprintln!();
                }
            }
            ProgressStyle::Logfile => {
                info!(
                    "received {} of {} bytes ({percent}%)",
                    progress.received, progress.total,
                );
            }
            ProgressStyle::Json => {
                println!(
                    "{}",
                    json!({
                        "type": "progress",
                        "now": progress.received,
                        "total": progress.total,
                        "eta": progress.eta_seconds,
                    }),
                );
            }
        }
    }

    fn finish(&mut self) {
        if matches!(self.style, ProgressStyle::Dots) && self.dots > 0 {
            eprintln!();
        }
    }
}

pub fn info_main(_cli: &InfoCli, config: Config) -> Result<ExitCode> {
    let (service, _events) = Service::new(Arc::new(config), Overrides::default())?;
    let info = service.info()?;

    println!("current build number: {}", info.current_build);
    if let Some(target) = info.target_build {
        println!("target build number: {target}");
    }
    println!("device name: {}", info.device);
    println!("channel: {}", info.channel);
    if let Some(target) = &info.channel_target {
        println!("alias: {target}");
    }
    println!("last update: {}", info.last_update_date);
    if !info.last_check_date.is_empty() {
        println!("last check: {}", info.last_check_date);
    }
    // Reverse order so the rootfs component generally comes first.
    for (name, version) in info.version_detail.iter().rev() {
        println!("version {name}: {version}");
    }
    if !info.target_version_detail.is_empty() {
        println!("target version detail: {}", info.target_version_detail);
    }

    Ok(ExitCode::SUCCESS)
}

pub fn channels_main(_cli: &ChannelsCli, config: Config) -> Result<ExitCode> {
    let config = Arc::new(config);
    let hooks = hooks::resolve(&config.hooks)?;
    let downloader = download::select_backend(&config);

    let mut machine = StateMachine::new(config, hooks, downloader, Overrides::default());
    let channels = machine.channels().context("Could not fetch channels")?;

    for (name, channel) in channels.names() {
        let mut line = name.to_owned();
        if let Some(alias) = &channel.alias {
            line.push_str(&format!(" (alias for {alias})"));
        }
        if channel.hidden {
            line.push_str(" [hidden]");
        }
        println!("{line}");
    }

    Ok(ExitCode::SUCCESS)
}
