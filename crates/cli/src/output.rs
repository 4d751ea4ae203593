//! Human and JSON rendering.
//!
//! The human output is deliberately terse; the stable machine contract is
//! `--json` plus the exit codes.

use anyhow::Result;
use ignition_engine::{InstallReport, SecuritySummary, UpdateCandidate};
use ignition_history::HistoryEntry;

/// List devices; `details` carries the verbose per-device dumps (engine
/// base fields plus the plugin's extra lines) when the operator asked
/// for them.
pub fn render_devices(
    devices: &[ignition_device::Device],
    details: Option<&[String]>,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("no devices");
        return Ok(());
    }
    if let Some(details) = details {
        for detail in details {
            print!("{detail}");
        }
        return Ok(());
    }
    for device in devices {
        println!(
            "{}  {}  {}  [{}]",
            device.id,
            device.name,
            device.version.as_deref().unwrap_or("?"),
            device.plugin,
        );
        for guid in &device.guids {
            println!("  guid: {guid}");
        }
    }
    Ok(())
}

pub fn render_updates(updates: &[UpdateCandidate], json: bool) -> Result<()> {
    if json {
        let rows: Vec<serde_json::Value> = updates
            .iter()
            .map(|u| {
                serde_json::json!({
                    "remote_id": u.remote_id,
                    "component_id": u.component_id,
                    "version": u.release.version,
                    "urgency": u.release.urgency,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for update in updates {
        println!(
            "{}  {}  (from {})",
            update.component_id, update.release.version, update.remote_id
        );
        if let Some(ref message) = update.release.update_message {
            println!("  note: {message}");
        }
    }
    Ok(())
}

pub fn render_report(report: &InstallReport, json: bool) -> Result<()> {
    if json {
        let rows: Vec<serde_json::Value> = report
            .outcomes
            .iter()
            .map(|o| {
                serde_json::json!({
                    "device_id": o.device_id.as_str(),
                    "status": format!("{:?}", o.status),
                    "error": o.error.as_ref().map(|e| e.to_string()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for outcome in &report.outcomes {
        match &outcome.error {
            Some(error) => println!("{}: {:?}: {error}", outcome.device_id, outcome.status),
            None => println!("{}: {:?}", outcome.device_id, outcome.status),
        }
    }
    Ok(())
}

pub fn render_history(history: &[HistoryEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(history)?);
        return Ok(());
    }
    for entry in history {
        println!(
            "{}  {}  {} -> {}  {:?}{}",
            entry.modified.format("%Y-%m-%d %H:%M:%S"),
            entry.device_name,
            entry.old_version.as_deref().unwrap_or("?"),
            entry.new_version,
            entry.state,
            entry
                .error_message
                .as_deref()
                .map(|m| format!("  ({m})"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

pub fn render_security(summary: &SecuritySummary, json: bool) -> Result<()> {
    if json {
        let row = serde_json::json!({
            "devices_total": summary.devices_total,
            "devices_updatable": summary.devices_updatable,
            "remotes_enabled": summary.remotes_enabled,
            "trusted_keys": summary.trusted_keys,
            "metadata_age_days": summary.metadata_age_days,
        });
        println!("{}", serde_json::to_string_pretty(&row)?);
        return Ok(());
    }
    println!("devices:        {}", summary.devices_total);
    println!("updatable:      {}", summary.devices_updatable);
    println!("remotes on:     {}", summary.remotes_enabled);
    println!("trusted keys:   {}", summary.trusted_keys);
    match summary.metadata_age_days {
        Some(days) => println!("metadata age:   {days} days"),
        None => println!("metadata age:   never refreshed"),
    }
    Ok(())
}
