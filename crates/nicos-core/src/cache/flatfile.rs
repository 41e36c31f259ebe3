// ── Flat-file persistence ──
//
// Keeps the latest state of every key on disk so a restarted cache server
// comes back with the values it had. There is one file per category, named
// after the category with slashes replaced by dashes. After a header line
// every update appends one tab-separated line:
//
//     subkey <TAB> time <TAB> flag <TAB> value
//
// The flag is `+` for entries without a ttl and `-` otherwise; `-` entries
// come back expired. A value of `-` invalidates the key and an empty value
// deletes it. Files are compacted to one line per key on load.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use nicos_proto::Value;

use super::{CacheBackend, CacheEntry, CacheStore, CacheUpdate, split_key};
use crate::error::NicosError;

const HEADER: &str = "# NICOS cache store file v2";

/// On-disk mirror of a [`CacheStore`].
#[derive(Debug)]
pub struct FlatFileStore {
    dir: PathBuf,
    /// Append handles, opened on the first update of each category.
    files: Mutex<HashMap<String, File>>,
}

impl FlatFileStore {
    /// Load the files in `dir` into `store`, then append every later
    /// update of `store` to them. Returns the number of keys loaded.
    pub fn attach(store: &CacheStore, dir: impl Into<PathBuf>) -> Result<usize, NicosError> {
        let this = Arc::new(Self {
            dir: dir.into(),
            files: Mutex::default(),
        });
        fs::create_dir_all(&this.dir).map_err(|e| this.error(&this.dir, &e))?;
        let loaded = this.load(store)?;
        this.compact(store)?;
        tracing::info!(dir = %this.dir.display(), keys = loaded, "cache store loaded");

        let writer = Arc::clone(&this);
        store.subscribe(
            "",
            Arc::new(move |update: &CacheUpdate| {
                if let Err(e) = writer.record(update) {
                    tracing::error!(key = %update.key, error = %e, "cannot write cache store");
                }
            }),
        );
        Ok(loaded)
    }

    fn load(&self, store: &CacheStore) -> Result<usize, NicosError> {
        let mut loaded = 0;
        let dir = fs::read_dir(&self.dir).map_err(|e| self.error(&self.dir, &e))?;
        for item in dir {
            let path = item.map_err(|e| self.error(&self.dir, &e))?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            let category = name.replace('-', "/");
            let entries = match read_store_file(&path) {
                Ok(Some(entries)) => entries,
                Ok(None) => {
                    tracing::warn!(file = %path.display(), "ignoring file with wrong format");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "cannot read store file");
                    continue;
                }
            };
            for (subkey, entry) in entries {
                store.restore(&format!("{category}/{subkey}"), entry);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Rewrite every category file with the current entries only.
    fn compact(&self, store: &CacheStore) -> Result<(), NicosError> {
        let mut categories: BTreeMap<String, String> = BTreeMap::new();
        for (key, entry) in store.query("") {
            let (category, subkey) = split_key(&key);
            let text = categories.entry(category.to_owned()).or_default();
            text.push_str(&entry_line(subkey, &entry));
        }
        for (category, lines) in categories {
            let path = self.path(&category);
            let tmp = self.dir.join(format!(".{}.tmp", file_name(&category)));
            fs::write(&tmp, format!("{HEADER}\n{lines}")).map_err(|e| self.error(&tmp, &e))?;
            fs::rename(&tmp, &path).map_err(|e| self.error(&path, &e))?;
        }
        Ok(())
    }

    fn record(&self, update: &CacheUpdate) -> io::Result<()> {
        let (category, subkey) = split_key(&update.key);
        let line = match &update.value {
            None => format!("{subkey}\t{}\t+\t\n", update.time),
            Some(_) if update.expired => format!("{subkey}\t{}\t-\t-\n", update.time),
            Some(value) => {
                let flag = if update.ttl.is_some() { '-' } else { '+' };
                format!("{subkey}\t{}\t{flag}\t{}\n", update.time, value.encode())
            }
        };

        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match files.entry(category.to_owned()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path(category))?;
                if file.metadata()?.len() == 0 {
                    writeln!(file, "{HEADER}")?;
                }
                slot.insert(file)
            }
        };
        file.write_all(line.as_bytes())
    }

    fn path(&self, category: &str) -> PathBuf {
        self.dir.join(file_name(category))
    }

    fn error(&self, path: &Path, e: &io::Error) -> NicosError {
        NicosError::config(format!(
            "cache store {}: {}: {e}",
            self.dir.display(),
            path.display()
        ))
    }
}

fn file_name(category: &str) -> String {
    category.replace('/', "-")
}

fn entry_line(subkey: &str, entry: &CacheEntry) -> String {
    let flag = if entry.ttl.is_some() || entry.expired {
        '-'
    } else {
        '+'
    };
    format!("{subkey}\t{}\t{flag}\t{}\n", entry.time, entry.value.encode())
}

/// Last state of each subkey in one file; `None` for a foreign format.
fn read_store_file(path: &Path) -> io::Result<Option<BTreeMap<String, CacheEntry>>> {
    let mut lines = BufReader::new(File::open(path)?).lines();
    match lines.next() {
        Some(Ok(first)) if first.starts_with(HEADER) => {}
        Some(Err(e)) => return Err(e),
        _ => return Ok(None),
    }

    let mut entries: BTreeMap<String, CacheEntry> = BTreeMap::new();
    for line in lines {
        let line = line?;
        let mut fields = line.splitn(4, '\t');
        let (Some(subkey), Some(time), Some(flag), Some(value)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            tracing::warn!(file = %path.display(), line = %line, "skipping corrupted line");
            continue;
        };
        let Ok(time) = time.parse::<f64>() else {
            tracing::warn!(file = %path.display(), line = %line, "skipping line with bad timestamp");
            continue;
        };
        match value {
            "" => {
                entries.remove(subkey);
            }
            "-" => {
                if let Some(entry) = entries.get_mut(subkey) {
                    entry.expired = true;
                }
            }
            text => match Value::decode(text) {
                Ok(value) => {
                    entries.insert(
                        subkey.to_owned(),
                        CacheEntry {
                            value,
                            time,
                            ttl: None,
                            expired: flag == "-",
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), line = %line, error = %e, "skipping invalid value");
                }
            },
        }
    }
    Ok(Some(entries))
}
