//! Process-wide `tracing` setup for relay binaries.
//!
//! Session spans (`relay_session`, carrying `session_id` and `provider`) are
//! emitted by the library regardless; this module only decides where they go.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Relay crates at `info`, dependencies (hyper, reqwest) only on warnings.
const DEFAULT_DIRECTIVES: &str = "warn,chat_relay_core=info,chat_relay=info";
const DEFAULT_LOG_FILE: &str = "relay.logs.jsonl";

static INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, PartialEq, Eq)]
enum Sink {
    /// Compact lines on stderr; stdout carries relayed text.
    Stderr,
    /// One JSON object per line, appended to `dir/file_name`.
    JsonFile { dir: PathBuf, file_name: String },
}

#[derive(Debug)]
struct Settings {
    enabled: bool,
    directives: Vec<String>,
    sink: Sink,
}

impl Settings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("RELAY_OBSERVABILITY_ENABLED")
            .and_then(|value| parse_flag(&value))
            .unwrap_or(true);
        // Candidates in priority order; the first one that parses wins.
        let directives = ["RELAY_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(&lookup)
            .filter(|value| !value.trim().is_empty())
            .collect();
        let sink = lookup("RELAY_JSON_LOG_PATH")
            .filter(|value| !value.trim().is_empty())
            .map(|raw| json_sink(Path::new(raw.trim())))
            .unwrap_or(Sink::Stderr);
        Self {
            enabled,
            directives,
            sink,
        }
    }

    fn chosen_directives(&self) -> &str {
        self.directives
            .iter()
            .map(String::as_str)
            .find(|directives| EnvFilter::try_new(directives).is_ok())
            .unwrap_or(DEFAULT_DIRECTIVES)
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(self.chosen_directives())
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn json_sink(path: &Path) -> Sink {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    Sink::JsonFile {
        dir: dir.to_path_buf(),
        file_name: file_name.to_string(),
    }
}

/// Installs the global subscriber once per process.
///
/// - `RELAY_OBSERVABILITY_ENABLED`: `false`/`off`/`0` disables logging.
/// - `RELAY_LOG_LEVEL`, then `RUST_LOG`: filter directives. Defaults to
///   relay crates at `info` and everything else at `warn`.
/// - `RELAY_JSON_LOG_PATH`: write JSONL with span context to this file
///   instead of stderr.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let settings = Settings::from_lookup(|key| std::env::var(key).ok());
        if !settings.enabled {
            return;
        }
        let filter = settings.env_filter();

        match settings.sink {
            Sink::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(&dir);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(tracing_appender::rolling::never(dir, file_name));
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(json_layer)
                    .try_init();
            }
            Sink::Stderr => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
