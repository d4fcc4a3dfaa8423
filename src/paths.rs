//! Prefix normalization and resolution of image references to files on disk.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{SinkError, SinkResult};

/// Which root folder an image lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderKind {
    Temp,
    Output,
}

/// `{filename, subfolder, type}` as exchanged with the interactive side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: FolderKind,
}

impl ImageRef {
    pub fn temp(filename: impl Into<String>) -> Self {
        Self { filename: filename.into(), subfolder: String::new(), kind: FolderKind::Temp }
    }
}

#[derive(Debug, Clone)]
pub struct FolderPaths {
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl FolderPaths {
    pub fn root(&self, kind: FolderKind) -> &Path {
        match kind {
            FolderKind::Temp => &self.temp_dir,
            FolderKind::Output => &self.output_dir,
        }
    }

    /// Map a reference to its file, refusing anything that leaves its root folder.
    pub fn resolve(&self, r: &ImageRef) -> SinkResult<PathBuf> {
        if !is_safe_filename(&r.filename) {
            return Err(SinkError::InvalidReference(r.filename.clone()));
        }
        let sub = safe_relative(&r.subfolder).ok_or_else(|| SinkError::InvalidReference(r.subfolder.clone()))?;
        Ok(self.root(r.kind).join(sub).join(&r.filename))
    }
}

/// Where a prefix writes and which counter scope it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    /// Output directory joined with `subfolder`.
    pub folder: PathBuf,
    /// Filename stem the counter is appended to.
    pub stem: String,
    /// Subfolder relative to the output directory, `/`-separated.
    pub subfolder: String,
}

impl SaveTarget {
    pub fn filename(&self, counter: u64) -> String {
        format!("{}_{:05}.png", self.stem, counter)
    }
}

pub fn normalize_prefix(output_dir: &Path, prefix: &str, width: u32, height: u32) -> SinkResult<SaveTarget> {
    normalize_prefix_at(output_dir, prefix, width, height, Local::now())
}

pub(crate) fn normalize_prefix_at(
    output_dir: &Path,
    prefix: &str,
    width: u32,
    height: u32,
    now: DateTime<Local>,
) -> SinkResult<SaveTarget> {
    let expanded = expand_tokens(prefix, width, height, now);
    let (subfolder, stem) = match expanded.rsplit_once('/') {
        Some((sub, stem)) => (sub.to_string(), stem.to_string()),
        None => (String::new(), expanded.clone()),
    };
    if stem.is_empty() {
        return Err(SinkError::InvalidPrefix { prefix: prefix.to_string(), reason: "missing filename after subfolder" });
    }
    let sub = safe_relative(&subfolder).ok_or_else(|| SinkError::InvalidPrefix {
        prefix: prefix.to_string(),
        reason: "saving outside the output folder is not allowed",
    })?;
    Ok(SaveTarget { folder: output_dir.join(sub), stem, subfolder })
}

fn expand_tokens(prefix: &str, width: u32, height: u32, now: DateTime<Local>) -> String {
    if !prefix.contains('%') {
        return prefix.to_string();
    }
    prefix
        .replace("%width%", &width.to_string())
        .replace("%height%", &height.to_string())
        .replace("%year%", &now.year().to_string())
        .replace("%month%", &format!("{:02}", now.month()))
        .replace("%day%", &format!("{:02}", now.day()))
        .replace("%hour%", &format!("{:02}", now.hour()))
        .replace("%minute%", &format!("{:02}", now.minute()))
        .replace("%second%", &format!("{:02}", now.second()))
}

fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let p = Path::new(name);
    let mut comps = p.components();
    matches!((comps.next(), comps.next()), (Some(Component::Normal(_)), None))
}

/// Relative path made only of normal components; empty input is the root itself.
fn safe_relative(sub: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in Path::new(sub).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}
