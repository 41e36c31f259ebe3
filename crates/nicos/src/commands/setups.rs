//! `nicos setups`: inspect the setup files of the configured directories.

use nicos_config::{Config, SetupCatalog};
use nicos_core::SetupInfo;
use serde::Serialize;
use tabled::Tabled;

use crate::cli::{GlobalOpts, SetupsArgs, SetupsCommand};
use crate::config;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct SetupSummary {
    name: String,
    group: String,
    description: String,
    devices: Vec<String>,
    includes: Vec<String>,
}

impl From<&SetupInfo> for SetupSummary {
    fn from(s: &SetupInfo) -> Self {
        Self {
            name: s.name.clone(),
            group: s.group.to_string(),
            description: s.description.clone(),
            devices: s.devices.keys().cloned().collect(),
            includes: s.includes.clone(),
        }
    }
}

#[derive(Tabled)]
struct SetupRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Devices")]
    devices: usize,
    #[tabled(rename = "Description")]
    description: String,
}

fn row(s: &SetupSummary) -> SetupRow {
    SetupRow {
        name: s.name.clone(),
        group: s.group.clone(),
        devices: s.devices.len(),
        description: s.description.clone(),
    }
}

pub fn handle(args: &SetupsArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let catalog = config::catalog(cfg)?;
    match &args.command {
        SetupsCommand::List => {
            list(&catalog, global);
            Ok(())
        }
        SetupsCommand::Show { name } => show(&catalog, name, global),
    }
}

fn list(catalog: &SetupCatalog, global: &GlobalOpts) {
    for (name, reason) in catalog.broken() {
        tracing::warn!(setup = %name, %reason, "setup file cannot be read");
    }
    let summaries: Vec<SetupSummary> = catalog.setups().map(SetupSummary::from).collect();
    let out = output::render_list(&global.output, &summaries, row, |s| s.name.clone());
    output::print_output(&out, global.quiet);
}

fn show(catalog: &SetupCatalog, name: &str, global: &GlobalOpts) -> Result<(), CliError> {
    let setup = catalog.get(name)?;
    let out = output::render_single(&global.output, setup, detail, |s| {
        s.devices.keys().cloned().collect::<Vec<_>>().join("\n")
    });
    output::print_output(&out, global.quiet);
    Ok(())
}

fn detail(s: &SetupInfo) -> String {
    let mut lines = vec![
        format!("Setup:       {}", s.name),
        format!("Group:       {}", s.group),
    ];
    if !s.description.is_empty() {
        lines.push(format!("Description: {}", s.description));
    }
    if !s.includes.is_empty() {
        lines.push(format!("Includes:    {}", s.includes.join(", ")));
    }
    if !s.excludes.is_empty() {
        lines.push(format!("Excludes:    {}", s.excludes.join(", ")));
    }
    if !s.devices.is_empty() {
        lines.push("Devices:".into());
        for (dev, config) in &s.devices {
            let marker = if config.is_lowlevel() { " (lowlevel)" } else { "" };
            lines.push(format!("  {dev:<16} {}{marker}", config.class));
        }
    }
    for (alias, targets) in &s.alias_config {
        let targets: Vec<String> = targets
            .iter()
            .map(|(t, prio)| format!("{t} ({prio})"))
            .collect();
        lines.push(format!("Alias {alias}: {}", targets.join(", ")));
    }
    lines.join("\n")
}
