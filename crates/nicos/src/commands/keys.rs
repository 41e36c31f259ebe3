//! Cache key commands: `get`, `set` and `watch`.

use futures_util::StreamExt;
use nicos_config::Config;
use nicos_core::cache::now;
use nicos_proto::{Message, Op};
use serde::Serialize;
use tabled::Tabled;

use super::util;
use crate::cli::{GetArgs, GlobalOpts, OutputFormat, SetArgs, WatchArgs};
use crate::error::CliError;
use crate::output;

/// One cache entry as reported by the server.
#[derive(Debug, Serialize)]
pub struct KeyEntry {
    pub key: String,
    pub value: Option<String>,
    pub time: Option<f64>,
    pub ttl: Option<f64>,
    pub expired: bool,
}

impl KeyEntry {
    fn from_message(msg: Message) -> Self {
        Self {
            expired: msg.op == Op::TellOld,
            value: msg.value().map(str::to_owned),
            key: msg.key,
            time: msg.time,
            ttl: msg.ttl,
        }
    }

    fn line(&self) -> String {
        let value = self.value.as_deref().unwrap_or("");
        let op = if self.expired { '!' } else { '=' };
        format!("{}{op}{value}", self.key)
    }
}

#[derive(Tabled)]
struct KeyRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "TTL")]
    ttl: String,
}

impl KeyRow {
    fn new(e: &KeyEntry) -> Self {
        let mut value = e.value.clone().unwrap_or_else(|| "-".into());
        if e.expired && e.value.is_some() {
            value.push_str(" (expired)");
        }
        Self {
            key: e.key.clone(),
            value,
            time: util::format_time(e.time),
            ttl: e.ttl.map_or_else(String::new, |t| format!("{t}s")),
        }
    }
}

// ── get ──────────────────────────────────────────────────────────────

pub async fn get(args: GetArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let mut client = util::connect(cfg).await?;
    let mut entries = Vec::new();
    if args.all {
        for pattern in &args.keys {
            let replies = client.query(&pattern.to_lowercase(), true).await?;
            entries.extend(replies.into_iter().map(KeyEntry::from_message));
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.dedup_by(|a, b| a.key == b.key);
    } else {
        for key in &args.keys {
            let key = util::full_key(&cfg.cache.prefix, key);
            entries.push(KeyEntry::from_message(client.ask(&key, true).await?));
        }
        if entries.iter().all(|e| e.value.is_none()) {
            let key = entries.first().map(|e| e.key.clone()).unwrap_or_default();
            return Err(CliError::NoValue { key });
        }
    }

    let out = output::render_list(&global.output, &entries, KeyRow::new, |e| {
        e.value.clone().unwrap_or_default()
    });
    output::print_output(&out, global.quiet);
    Ok(())
}

// ── set ──────────────────────────────────────────────────────────────

pub async fn set(args: SetArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let key = util::full_key(&cfg.cache.prefix, &args.key);
    let value = util::parse_value(&args.value)?;
    let ttl = args.ttl.map(|t| t.as_secs_f64());

    let mut client = util::connect(cfg).await?;
    client
        .send(Message::tell_at(now(), ttl, key.as_str(), value.encode()))
        .await?;
    // Reading back makes sure the server has processed the update.
    let entry = KeyEntry::from_message(client.ask(&key, true).await?);
    tracing::info!(key = %entry.key, value = ?entry.value, "key set");

    let out = output::render_single(&global.output, &entry, KeyEntry::line, KeyEntry::line);
    output::print_output(&out, global.quiet);
    Ok(())
}

// ── watch ────────────────────────────────────────────────────────────

pub async fn watch(args: WatchArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let pattern = args
        .pattern
        .map_or_else(|| format!("{}/", cfg.cache.prefix), |p| p.to_lowercase());
    let mut client = util::connect(cfg).await?;
    client.send(Message::subscribe(pattern.as_str(), true)).await?;
    let mut stream = client.into_stream();

    let deadline = async {
        match args.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut seen = 0usize;
    while args.count.is_none_or(|count| seen < count) {
        let msg = tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            next = stream.next() => match next {
                Some(msg) => msg?,
                None => {
                    return Err(CliError::Communication {
                        message: "cache server closed the connection".into(),
                    });
                }
            },
        };
        if !matches!(msg.op, Op::Tell | Op::TellOld) {
            continue;
        }
        let entry = KeyEntry::from_message(msg);
        let line = match global.output {
            OutputFormat::Json | OutputFormat::JsonCompact => output::render_json(&entry, true),
            _ => format!("{}  {}", util::format_time(entry.time), entry.line()),
        };
        output::print_output(&line, global.quiet);
        seen += 1;
    }
    Ok(())
}
