use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

use crate::error::{SinkError, SinkResult};

/// Write `bytes` to a new file at `path` via a hidden sibling `.tmp` file and a
/// hard link, so readers never observe a half-written image. An existing file at
/// `path` is left alone and reported as [`SinkError::AlreadyExists`].
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> SinkResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| SinkError::write(parent, e))?;
    }
    let tmp = tmp_sibling(path);
    {
        let mut f = fs::File::create(&tmp).await.map_err(|e| SinkError::write(&tmp, e))?;
        if let Err(e) = f.write_all(bytes).await {
            drop(f);
            let _ = fs::remove_file(&tmp).await;
            return Err(SinkError::write(&tmp, e));
        }
        let _ = f.sync_all().await; // best-effort
    }
    // link, unlike rename, refuses to replace an existing target
    let linked = fs::hard_link(&tmp, path).await;
    let _ = fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(SinkError::AlreadyExists(path.to_path_buf())),
        Err(e) => Err(SinkError::write(path, e)),
    }
}

/// Read a staged file, mapping a missing file to [`SinkError::NotFound`].
pub async fn read_staged(path: &Path) -> SinkResult<Vec<u8>> {
    match fs::read(path).await {
        Ok(b) => Ok(b),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(SinkError::NotFound(path.to_path_buf())),
        Err(e) => Err(SinkError::write(path, e)),
    }
}

/// `.{name}.tmp`: the leading dot keeps it out of counter scans.
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(n) = path.file_name() {
        name.push(n);
    }
    name.push(".tmp");
    path.with_file_name(name)
}
