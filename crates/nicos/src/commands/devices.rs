//! Device commands: `read` and `move`.

use std::sync::Arc;

use nicos_config::Config;
use nicos_core::{Device, Mode, Session, Status};
use serde::Serialize;
use tabled::Tabled;

use super::util;
use crate::cli::{GlobalOpts, MoveArgs, ReadArgs};
use crate::error::CliError;
use crate::output;

/// Value and status of one device.
#[derive(Debug, Serialize)]
struct Reading {
    device: String,
    value: Option<String>,
    unit: String,
    status: Option<Status>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Reading {
    async fn take(dev: &Device, maxage: Option<f64>) -> Self {
        let mut reading = Self {
            device: dev.name().to_owned(),
            value: None,
            unit: dev.unit(),
            status: None,
            message: String::new(),
            error: None,
        };
        match dev.read(maxage).await {
            Ok(value) => reading.value = Some(dev.format(&value)),
            Err(e) => reading.error = Some(e.to_string()),
        }
        match dev.status(maxage).await {
            Ok(st) => {
                reading.status = Some(st.status);
                reading.message = st.message;
            }
            Err(e) => {
                reading.error.get_or_insert_with(|| e.to_string());
            }
        }
        reading
    }

    fn line(&self) -> String {
        match (&self.value, &self.error) {
            (Some(value), _) if self.unit.is_empty() => format!("{} = {value}", self.device),
            (Some(value), _) => format!("{} = {value} {}", self.device, self.unit),
            (None, error) => format!("{}: {}", self.device, error.as_deref().unwrap_or("no value")),
        }
    }
}

#[derive(Tabled)]
struct ReadingRow {
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

fn reading_row(r: &Reading, color: bool) -> ReadingRow {
    let value = match &r.value {
        Some(v) if r.unit.is_empty() => v.clone(),
        Some(v) => format!("{v} {}", r.unit),
        None => "-".into(),
    };
    ReadingRow {
        device: r.device.clone(),
        value,
        status: r
            .status
            .map_or_else(|| "-".into(), |s| output::status_label(s, color)),
        message: r.error.clone().unwrap_or_else(|| r.message.clone()),
    }
}

// ── read ─────────────────────────────────────────────────────────────

pub async fn read(args: ReadArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let (session, remote) = util::open_session(cfg, &args.session, Mode::Slave).await?;
    let result = read_devices(&session, &args.devices, global).await;
    let closed = util::close_session(session, remote).await;
    result.and(closed)
}

async fn read_devices(
    session: &Session,
    names: &[String],
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let mut devices: Vec<Arc<Device>> = if names.is_empty() {
        session.devices()
    } else {
        names
            .iter()
            .map(|name| session.get_device(name))
            .collect::<Result<_, _>>()?
    };
    if names.is_empty() {
        devices.sort_by(|a, b| a.name().to_lowercase().cmp(&b.name().to_lowercase()));
    }

    // Without a cache every read goes to the hardware.
    let maxage = if session.cache().is_some() { None } else { Some(0.0) };
    let mut readings = Vec::with_capacity(devices.len());
    for dev in &devices {
        readings.push(Reading::take(dev, maxage).await);
    }

    let color = output::should_color(&global.color);
    let out = output::render_list(
        &global.output,
        &readings,
        |r| reading_row(r, color),
        Reading::line,
    );
    output::print_output(&out, global.quiet);

    let failed = readings.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        return Err(CliError::Device {
            message: format!("{failed} of {} device(s) could not be read", readings.len()),
        });
    }
    Ok(())
}

// ── move ─────────────────────────────────────────────────────────────

/// Outcome of a move.
#[derive(Debug, Serialize)]
struct Moved {
    device: String,
    target: String,
    value: String,
    unit: String,
    status: Status,
    waited: bool,
}

impl Moved {
    fn line(&self) -> String {
        format!("{} = {} {}", self.device, self.value, self.unit)
            .trim_end()
            .to_owned()
    }

    fn detail(&self) -> String {
        let verb = if self.waited { "moved to" } else { "started towards" };
        format!(
            "{} {verb} {} {}\nnow at {} {} ({})",
            self.device, self.target, self.unit, self.value, self.unit, self.status
        )
    }
}

pub async fn move_device(
    args: MoveArgs,
    cfg: &Config,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    // Maintenance: devices can be driven without taking over the instrument.
    let (session, remote) = util::open_session(cfg, &args.session, Mode::Maintenance).await?;
    let result = drive(&session, &args, global).await;
    let closed = util::close_session(session, remote).await;
    result.and(closed)
}

async fn drive(session: &Session, args: &MoveArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let dev = session.get_device(&args.device)?;
    let target = util::parse_target(&args.target);
    dev.start(target.clone()).await?;
    tracing::info!(device = %dev.name(), to = %target, "move started");

    let value = if args.wait {
        match args.timeout {
            Some(limit) => match tokio::time::timeout(limit, dev.wait()).await {
                Ok(value) => value?,
                Err(_) => {
                    dev.stop().await?;
                    return Err(CliError::Timeout {
                        device: dev.name().to_owned(),
                        seconds: limit.as_secs_f64(),
                    });
                }
            },
            None => dev.wait().await?,
        }
    } else {
        dev.read(Some(0.0)).await?
    };
    let status = dev.status(Some(0.0)).await?;

    let moved = Moved {
        device: dev.name().to_owned(),
        target: dev.format(&target),
        value: dev.format(&value),
        unit: dev.unit(),
        status: status.status,
        waited: args.wait,
    };
    let out = output::render_single(&global.output, &moved, Moved::detail, Moved::line);
    output::print_output(&out, global.quiet);
    Ok(())
}
