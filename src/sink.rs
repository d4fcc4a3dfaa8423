//! Backend half of the preview node: per-step mode decision and manual commit.

use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    counter::{CounterAllocator, CounterLease},
    error::{SinkError, SinkResult},
    frame::Frame,
    io::{read_staged, write_atomic},
    metadata::{png_dimensions, ExecutionContext, PngWriter},
    paths::{normalize_prefix, FolderKind, FolderPaths, ImageRef, SaveTarget},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SaveMode {
    #[default]
    #[serde(rename = "Always save")]
    AlwaysSave,
    #[serde(rename = "Manual save")]
    ManualSave,
}

/// What a step hands back to the engine: `{"ui": {"images": [...]}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub ui: UiImages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiImages {
    pub images: Vec<ImageRef>,
}

impl ExecutionResult {
    pub fn images(&self) -> &[ImageRef] { &self.ui.images }
}

/// Outcome of one commit batch. Failures never cancel later items.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub saved: Vec<PathBuf>,
    pub failed: Vec<(ImageRef, SinkError)>,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool { self.failed.is_empty() }
}

#[derive(Clone)]
pub struct ImageSink {
    paths: FolderPaths,
    counters: CounterAllocator,
    png: PngWriter,
    default_prefix: String,
}

impl ImageSink {
    pub fn new(paths: FolderPaths, counters: CounterAllocator, png: PngWriter, default_prefix: impl Into<String>) -> Self {
        Self { paths, counters, png, default_prefix: default_prefix.into() }
    }

    pub fn paths(&self) -> &FolderPaths { &self.paths }

    fn effective_prefix<'a>(&'a self, prefix: &'a str) -> &'a str {
        if prefix.trim().is_empty() { &self.default_prefix } else { prefix }
    }

    pub async fn execute(
        &self,
        frames: &[Frame],
        mode: SaveMode,
        prefix: &str,
        ctx: &ExecutionContext,
    ) -> SinkResult<ExecutionResult> {
        if frames.is_empty() {
            return Err(SinkError::InvalidInput("received an empty image batch".into()));
        }
        let prefix = self.effective_prefix(prefix);
        let images = match mode {
            SaveMode::AlwaysSave => self.save_permanent(frames, prefix, ctx).await?,
            SaveMode::ManualSave => self.stage_temp(frames, prefix, ctx).await?,
        };
        info!(?mode, prefix, count = images.len(), "node executed");
        Ok(ExecutionResult { ui: UiImages { images } })
    }

    async fn save_permanent(&self, frames: &[Frame], prefix: &str, ctx: &ExecutionContext) -> SinkResult<Vec<ImageRef>> {
        let (w, h) = (frames[0].width(), frames[0].height());
        let target = normalize_prefix(&self.paths.output_dir, prefix, w, h)?;
        let mut lease = self.counters.reserve(&target.folder, &target.stem).await?;
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames {
            let bytes = self.png.encode(frame, ctx)?;
            let (filename, _) = write_numbered(&target, &mut lease, &bytes).await?;
            out.push(ImageRef { filename, subfolder: target.subfolder.clone(), kind: FolderKind::Output });
        }
        Ok(out)
    }

    async fn stage_temp(&self, frames: &[Frame], prefix: &str, ctx: &ExecutionContext) -> SinkResult<Vec<ImageRef>> {
        let (w, h) = (frames[0].width(), frames[0].height());
        let target = normalize_prefix(&self.paths.temp_dir, prefix, w, h)?;
        let tag = random_tag();
        let mut out = Vec::with_capacity(frames.len());
        for (idx, frame) in frames.iter().enumerate() {
            let bytes = self.png.encode(frame, ctx)?;
            let filename = format!("{}_temp_{}_{:05}_.png", target.stem, tag, idx + 1);
            write_atomic(&self.paths.temp_dir.join(&filename), &bytes).await?;
            out.push(ImageRef::temp(filename));
        }
        Ok(out)
    }

    /// Copy previously returned images into counter-numbered permanent files.
    ///
    /// Staged bytes already carry the workflow metadata, so they are copied
    /// verbatim. All reads happen before the counter scope is locked; the lock
    /// is held across every write of the batch.
    pub async fn commit(&self, refs: &[ImageRef], prefix: &str) -> SinkResult<CommitReport> {
        if refs.is_empty() {
            return Err(SinkError::EmptyBatch);
        }
        let prefix = self.effective_prefix(prefix);

        let mut loaded = Vec::with_capacity(refs.len());
        for r in refs {
            let bytes = match self.paths.resolve(r) {
                Ok(path) => read_staged(&path).await,
                Err(e) => Err(e),
            };
            loaded.push(bytes);
        }
        let (w, h) = loaded
            .iter()
            .filter_map(|b| b.as_ref().ok())
            .find_map(|b| png_dimensions(b))
            .unwrap_or((0, 0));

        let target = normalize_prefix(&self.paths.output_dir, prefix, w, h)?;
        let mut lease = self.counters.reserve(&target.folder, &target.stem).await?;
        let mut report = CommitReport::default();
        for (r, bytes) in refs.iter().zip(loaded) {
            let result = match bytes {
                Ok(bytes) => write_numbered(&target, &mut lease, &bytes).await,
                Err(e) => Err(e),
            };
            match result {
                Ok((_, path)) => report.saved.push(path),
                Err(e) => {
                    warn!(filename = %r.filename, error = %e, "manual save item failed");
                    report.failed.push((r.clone(), e));
                }
            }
        }
        info!(prefix, saved = report.saved.len(), failed = report.failed.len(), "manual save committed");
        Ok(report)
    }
}

/// Write `bytes` at the lease's next number. Numbers some other writer took since
/// the scan are skipped; a failed write gives its number back so the run stays
/// contiguous.
async fn write_numbered(target: &SaveTarget, lease: &mut CounterLease, bytes: &[u8]) -> SinkResult<(String, PathBuf)> {
    loop {
        let filename = target.filename(lease.next()?);
        let path = target.folder.join(&filename);
        match write_atomic(&path, bytes).await {
            Ok(()) => return Ok((filename, path)),
            Err(SinkError::AlreadyExists(taken)) => {
                debug!(path = %taken.display(), "counter value taken by another writer, moving on");
            }
            Err(e) => {
                lease.rewind();
                return Err(e);
            }
        }
    }
}

fn random_tag() -> String {
    let mut rng = rand::rng();
    (0..5).map(|_| rng.random_range(b'a'..=b'z') as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn sink() -> (ImageSink, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = FolderPaths { output_dir: dir.path().join("output"), temp_dir: dir.path().join("temp") };
        (ImageSink::new(paths, CounterAllocator::new(), PngWriter::new(4), "ComfyUI"), dir)
    }

    fn frame() -> Frame { Frame::new(4, 4, 3, vec![0.25; 48]).unwrap() }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(dir) {
            Ok(rd) => rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect(),
            Err(_) => vec![],
        };
        names.sort();
        names
    }

    #[tokio::test]
    async fn always_save_writes_one_numbered_file() {
        let (sink, _dir) = sink();
        let res = sink.execute(&[frame()], SaveMode::AlwaysSave, "cat", &ExecutionContext::default()).await.unwrap();
        assert_eq!(res.images(), &[ImageRef { filename: "cat_00001.png".into(), subfolder: String::new(), kind: FolderKind::Output }]);
        assert_eq!(files(&sink.paths().output_dir), vec!["cat_00001.png"]);
    }

    #[tokio::test]
    async fn manual_save_only_stages() {
        let (sink, _dir) = sink();
        let res = sink.execute(&[frame(), frame()], SaveMode::ManualSave, "cat", &ExecutionContext::default()).await.unwrap();
        assert!(res.images().iter().all(|r| r.kind == FolderKind::Temp));
        assert!(files(&sink.paths().output_dir).is_empty());
        assert_eq!(files(&sink.paths().temp_dir).len(), 2);
    }

    #[tokio::test]
    async fn empty_frames_rejected() {
        let (sink, _dir) = sink();
        let err = sink.execute(&[], SaveMode::AlwaysSave, "cat", &ExecutionContext::default()).await.unwrap_err();
        assert!(matches!(err, SinkError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn empty_prefix_uses_default() {
        let (sink, _dir) = sink();
        sink.execute(&[frame()], SaveMode::AlwaysSave, "  ", &ExecutionContext::default()).await.unwrap();
        assert_eq!(files(&sink.paths().output_dir), vec!["ComfyUI_00001.png"]);
    }

    #[tokio::test]
    async fn commit_batch_is_contiguous_after_existing_files() {
        let (sink, _dir) = sink();
        std::fs::create_dir_all(&sink.paths().output_dir).unwrap();
        std::fs::write(sink.paths().output_dir.join("cat_00003_.png"), b"x").unwrap();

        let staged = sink.execute(&[frame(), frame(), frame()], SaveMode::ManualSave, "cat", &ExecutionContext::default()).await.unwrap();
        let report = sink.commit(staged.images(), "cat").await.unwrap();
        assert!(report.is_complete());
        let names: Vec<String> = report.saved.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["cat_00004.png", "cat_00005.png", "cat_00006.png"]);
    }

    #[tokio::test]
    async fn commit_copies_staged_bytes_verbatim() {
        let (sink, _dir) = sink();
        let staged = sink.execute(&[frame()], SaveMode::ManualSave, "cat", &ExecutionContext::default()).await.unwrap();
        let src = sink.paths().resolve(&staged.images()[0]).unwrap();
        let report = sink.commit(staged.images(), "cat").await.unwrap();
        assert_eq!(std::fs::read(&report.saved[0]).unwrap(), std::fs::read(src).unwrap());
    }

    #[tokio::test]
    async fn commit_twice_makes_two_copies() {
        let (sink, _dir) = sink();
        let staged = sink.execute(&[frame()], SaveMode::ManualSave, "cat", &ExecutionContext::default()).await.unwrap();
        sink.commit(staged.images(), "cat").await.unwrap();
        sink.commit(staged.images(), "cat").await.unwrap();
        assert_eq!(files(&sink.paths().output_dir), vec!["cat_00001.png", "cat_00002.png"]);
    }

    #[tokio::test]
    async fn missing_item_does_not_abort_siblings() {
        let (sink, _dir) = sink();
        let staged = sink.execute(&[frame(), frame()], SaveMode::ManualSave, "cat", &ExecutionContext::default()).await.unwrap();
        let mut refs = staged.images().to_vec();
        refs.insert(1, ImageRef::temp("reclaimed.png"));

        let report = sink.commit(&refs, "cat").await.unwrap();
        assert_eq!(report.saved.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, SinkError::NotFound(_)));
        assert_eq!(files(&sink.paths().output_dir), vec!["cat_00001.png", "cat_00002.png"]);
    }

    #[tokio::test]
    async fn commit_of_output_reference_makes_distinct_copy() {
        let (sink, _dir) = sink();
        let res = sink.execute(&[frame()], SaveMode::AlwaysSave, "cat", &ExecutionContext::default()).await.unwrap();
        sink.commit(res.images(), "cat").await.unwrap();
        assert_eq!(files(&sink.paths().output_dir), vec!["cat_00001.png", "cat_00002.png"]);
    }

    #[tokio::test]
    async fn empty_commit_is_rejected() {
        let (sink, _dir) = sink();
        assert!(matches!(sink.commit(&[], "cat").await, Err(SinkError::EmptyBatch)));
    }

    #[tokio::test]
    async fn failed_writes_do_not_use_up_numbers() {
        let (sink, _dir) = sink();
        let out = &sink.paths().output_dir;
        let staged = sink.execute(&[frame(), frame()], SaveMode::ManualSave, "cat", &ExecutionContext::default()).await.unwrap();
        std::fs::create_dir_all(out.join(".cat_00001.png.tmp")).unwrap();

        let report = sink.commit(staged.images(), "cat").await.unwrap();
        assert!(report.saved.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|(_, e)| matches!(e, SinkError::Write { .. })));

        std::fs::remove_dir(out.join(".cat_00001.png.tmp")).unwrap();
        let report = sink.commit(staged.images(), "cat").await.unwrap();
        assert!(report.is_complete());
        assert_eq!(files(out), vec!["cat_00001.png", "cat_00002.png"]);
    }

    #[tokio::test]
    async fn number_taken_after_the_scan_is_skipped_not_overwritten() {
        let (sink, _dir) = sink();
        let out = sink.paths().output_dir.clone();
        let target = normalize_prefix(&out, "cat", 4, 4).unwrap();
        let mut lease = sink.counters.reserve(&target.folder, &target.stem).await.unwrap();
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("cat_00001.png"), b"theirs").unwrap();

        let (filename, _) = write_numbered(&target, &mut lease, b"ours").await.unwrap();
        assert_eq!(filename, "cat_00002.png");
        assert_eq!(std::fs::read(out.join("cat_00001.png")).unwrap(), b"theirs");
        assert_eq!(lease.peek(), 3);
    }

    #[tokio::test]
    async fn subfolder_prefix_lands_in_subfolder() {
        let (sink, _dir) = sink();
        let res = sink.execute(&[frame()], SaveMode::AlwaysSave, "pets/cat", &ExecutionContext::default()).await.unwrap();
        assert_eq!(res.images()[0].subfolder, "pets");
        assert_eq!(files(&sink.paths().output_dir.join("pets")), vec!["cat_00001.png"]);
    }
}
