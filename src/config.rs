use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{counter::CounterAllocator, metadata::PngWriter, paths::FolderPaths, sink::ImageSink};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkCfg {
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub bind: String,
    /// Route namespace: the endpoint lives at `/{namespace}/manual_save`.
    pub namespace: String,
    /// Used whenever a node's prefix is empty.
    pub default_prefix: String,
    pub compress_level: u8, // 0..=9
}

impl Default for SinkCfg {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            temp_dir: PathBuf::from("temp"),
            bind: "127.0.0.1:8189".into(),
            namespace: "piepie".into(),
            default_prefix: "ComfyUI".into(),
            compress_level: 4,
        }
    }
}

impl SinkCfg {
    /// Read YAML from `path` (defaults when absent), then apply env overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if tokio::fs::try_exists(p).await.unwrap_or(false) => {
                let txt = tokio::fs::read_to_string(p)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                serde_yaml::from_str::<SinkCfg>(&txt).context("Failed to parse config YAML")?
            }
            _ => SinkCfg::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("PREVIEW_SINK_OUTPUT_DIR") { self.output_dir = v.into(); }
        if let Some(v) = get("PREVIEW_SINK_TEMP_DIR") { self.temp_dir = v.into(); }
        if let Some(v) = get("PREVIEW_SINK_BIND") { self.bind = v; }
        if let Some(v) = get("PREVIEW_SINK_NAMESPACE") { self.namespace = v; }
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            anyhow::bail!("namespace must be a single non-empty path segment, got {:?}", self.namespace);
        }
        if self.compress_level > 9 {
            anyhow::bail!("compress_level must be within 0..=9, got {}", self.compress_level);
        }
        if self.output_dir == self.temp_dir {
            anyhow::bail!("output_dir and temp_dir must differ");
        }
        Ok(())
    }

    pub fn folder_paths(&self) -> FolderPaths {
        FolderPaths { output_dir: self.output_dir.clone(), temp_dir: self.temp_dir.clone() }
    }

    pub fn build_sink(&self) -> ImageSink {
        ImageSink::new(self.folder_paths(), CounterAllocator::new(), PngWriter::new(self.compress_level), self.default_prefix.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: SinkCfg = serde_yaml::from_str("output_dir: /data/out\nnamespace: studio\n").unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("/data/out"));
        assert_eq!(cfg.namespace, "studio");
        assert_eq!(cfg.default_prefix, "ComfyUI");
        assert_eq!(cfg.compress_level, 4);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = SinkCfg::default();
        cfg.apply_env(|k| (k == "PREVIEW_SINK_TEMP_DIR").then(|| "/scratch".to_string()));
        assert_eq!(cfg.temp_dir, PathBuf::from("/scratch"));
        assert_eq!(cfg.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn rejects_bad_namespace_and_level() {
        let cfg = SinkCfg { namespace: "a/b".into(), ..SinkCfg::default() };
        assert!(cfg.validate().is_err());
        let cfg = SinkCfg { compress_level: 12, ..SinkCfg::default() };
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let cfg = SinkCfg::load(Some(path.as_path())).await;
        assert!(cfg.is_ok());
    }
}
