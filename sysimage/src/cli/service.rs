// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use clap::Args;
use serde_json::json;
use tracing::info;

use crate::{
    cli::args::EXIT_ALREADY_RUNNING,
    config::Config,
    service::{self, Event, Service},
    state::Overrides,
};

/// Run the long-lived update service, emitting events as JSON lines on
/// stdout until the idle lifetime expires.
#[derive(Args, Debug)]
pub struct ServiceCli {
    /// Do not start an update check on startup.
    #[arg(long)]
    no_check: bool,
}

fn event_json(event: &Event) -> serde_json::Value {
    match event {
        Event::UpdateAvailableStatus {
            is_available,
            downloading,
            available_version,
            update_size,
            last_update_date,
            error_reason,
        } => json!({
            "event": "update_available_status",
            "is_available": is_available,
            "downloading": downloading,
            "available_version": available_version,
            "update_size": update_size,
            "last_update_date": last_update_date,
            "error_reason": error_reason,
        }),
        Event::UpdateProgress { percentage, eta } => json!({
            "event": "update_progress",
            "percentage": percentage,
            "eta": eta,
        }),
        Event::UpdateDownloaded => json!({ "event": "update_downloaded" }),
        Event::UpdateFailed {
            consecutive_failures,
            last_reason,
        } => json!({
            "event": "update_failed",
            "consecutive_failures": consecutive_failures,
            "last_reason": last_reason,
        }),
        Event::UpdatePaused { percentage } => json!({
            "event": "update_paused",
            "percentage": percentage,
        }),
        Event::SettingChanged { key, value } => json!({
            "event": "setting_changed",
            "key": key,
            "value": value,
        }),
        Event::Applied { success } => json!({ "event": "applied", "success": success }),
        Event::Rebooting { status } => json!({ "event": "rebooting", "status": status }),
    }
}

pub fn service_main(
    cli: &ServiceCli,
    config: Config,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<ExitCode> {
    let config = Arc::new(config);

    // Single instance, system wide. A second copy exits with a distinct
    // code so supervisors can tell the difference from a real failure.
    let Some(_lock) = service::acquire_instance_lock(&config)? else {
        eprintln!("Another instance is already running");
        return Ok(ExitCode::from(EXIT_ALREADY_RUNNING));
    };

    let (service, events) = Service::new(config.clone(), Overrides::default())?;

    info!(
        "Service started [{}/{}]",
        config.service.channel,
        config.service.device.as_deref().unwrap_or("?"),
    );

    if !cli.no_check {
        service.check();
    }

    loop {
        if cancel_signal.load(Ordering::SeqCst) {
            info!("Service interrupted");
            break;
        }
        if service.idle_expired() {
            info!("Idle lifetime expired");
            break;
        }

        if let Some(event) = service::wait_for_event(&events, Duration::from_millis(500)) {
            println!("{}", event_json(&event));
        }
    }

    Ok(ExitCode::SUCCESS)
}
