//! Source Scanner (§4.1): discovers action-log files via a glob, reads each
//! atomically, and parses each line into an [`ActionRecord`].

pub mod fs;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::ShipperError;
use crate::types::{digest, ActionRecord};
use fs::SourceFs;

static MDT_COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+-MDT\d{4})$").expect("static regex"));
static IDX_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"idx=\[?(\d+)/(\d+)\]?").expect("static regex"));
static FID_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"fid=\[([^\]]*)\]").expect("static regex"));
static ACTION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"action=(\S+)").expect("static regex"));
static STATUS_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"status=(\S+)").expect("static regex"));

/// Extracts the MDT name from a source path: the component matching
/// `*-MDT????` (§4.1, §6).
pub fn extract_mdt(path: &Path) -> Option<String> {
    path.components().rev().find_map(|component| {
        let text = component.as_os_str().to_string_lossy();
        MDT_COMPONENT
            .captures(&text)
            .map(|caps| caps[1].to_string())
    })
}

/// Parses one raw action-log line. Returns `None` (and logs a warning) if
/// the line lacks `idx=` or `fid=`, per §4.1.
pub fn parse_line(mdt: &str, line: &str) -> Option<ActionRecord> {
    let idx_caps = match IDX_TOKEN.captures(line) {
        Some(caps) => caps,
        None => {
            warn!(
                "{}",
                ShipperError::Parse {
                    path: mdt.to_string(),
                    line: line.to_string(),
                }
            );
            return None;
        }
    };
    let cat_idx: u64 = idx_caps[1].parse().ok()?;
    let rec_idx: u64 = idx_caps[2].parse().ok()?;

    let fid = match FID_TOKEN.captures(line) {
        Some(caps) => caps[1].to_string(),
        None => {
            warn!(
                "{}",
                ShipperError::Parse {
                    path: mdt.to_string(),
                    line: line.to_string(),
                }
            );
            return None;
        }
    };

    let action = ACTION_TOKEN
        .captures(line)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default();
    let status = STATUS_TOKEN
        .captures(line)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default();

    Some(ActionRecord {
        mdt: mdt.to_string(),
        cat_idx,
        rec_idx,
        fid,
        action,
        status,
        hash: digest(line),
        raw: line.to_string(),
    })
}

/// Reads and parses every currently-observable action-log file.
pub struct Scanner {
    watch_glob: String,
    fs: Arc<dyn SourceFs>,
}

impl Scanner {
    pub fn new(watch_glob: impl Into<String>, fs: Arc<dyn SourceFs>) -> Self {
        Self {
            watch_glob: watch_glob.into(),
            fs,
        }
    }

    /// `scan() -> map<mdt, list<rawLine>>` (§4.1 literal contract): expands
    /// the glob, reads each match best-effort, and splits on non-empty
    /// lines. An MDT whose file vanishes or errors mid-scan is simply
    /// omitted — the Differ treats an absent MDT identically to an empty
    /// file (§4.2 edge case).
    pub async fn scan_raw(&self) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for path in self.fs.glob_paths(&self.watch_glob).await {
            let Some(mdt) = extract_mdt(&path) else {
                warn!("glob match {} has no *-MDT#### component", path.display());
                continue;
            };
            match self.fs.read_to_string(&path).await {
                Ok(contents) => {
                    let lines: Vec<String> = contents
                        .lines()
                        .filter(|line| !line.trim().is_empty())
                        .map(|line| line.to_string())
                        .collect();
                    out.entry(mdt).or_default().extend(lines);
                }
                Err(err) => {
                    warn!(
                        "{}",
                        ShipperError::SourceRead {
                            path: path.display().to_string(),
                            source: err,
                        }
                    );
                }
            }
        }
        out
    }

    /// Full scan: raw lines plus line parsing, per §4.1's note that parsing
    /// is performed by the Scanner before hand-off to the Differ (the Differ
    /// itself is pure, §4.2).
    pub async fn scan(&self) -> HashMap<String, Vec<ActionRecord>> {
        let raw = self.scan_raw().await;
        raw.into_iter()
            .map(|(mdt, lines)| {
                let records = lines
                    .iter()
                    .filter_map(|line| parse_line(&mdt, line))
                    .collect();
                (mdt, records)
            })
            .collect()
    }
}
