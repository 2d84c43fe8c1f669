//! Chunked copy into a temporary sibling followed by an atomic rename.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use crate::error::{FsOpsError, FsOpsResult};

/// Copy `source` to `destination`, creating parent directories.
///
/// `after_chunk` runs before the first read and after every chunk written
/// with the size of that chunk; returning an error aborts the copy. On any
/// failure the temporary file is removed and `destination` is untouched.
pub(crate) async fn copy_atomically(
    source: &Path,
    destination: &Path,
    chunk_size: usize,
    mut after_chunk: impl FnMut(u64) -> FsOpsResult<()>,
) -> FsOpsResult<u64> {
    let parent = destination.parent().ok_or_else(|| FsOpsError::InvalidInput {
        field: "destination",
        reason: "destination has no parent directory",
        value: Some(destination.display().to_string()),
    })?;
    fs::create_dir_all(parent)
        .await
        .map_err(|source| FsOpsError::io("copy.create_parent", parent, source))?;

    let temp = temp_sibling(destination);
    let copied = copy_chunks(source, &temp, chunk_size, &mut after_chunk).await;
    let outcome = match copied {
        Ok(bytes) => fs::rename(&temp, destination)
            .await
            .map(|()| bytes)
            .map_err(|source| FsOpsError::io("copy.rename", destination, source)),
        Err(err) => Err(err),
    };
    if outcome.is_err() {
        discard(&temp).await;
    }
    outcome
}

async fn copy_chunks(
    source: &Path,
    temp: &Path,
    chunk_size: usize,
    after_chunk: &mut impl FnMut(u64) -> FsOpsResult<()>,
) -> FsOpsResult<u64> {
    after_chunk(0)?;
    let mut reader = File::open(source)
        .await
        .map_err(|err| FsOpsError::io("copy.open_source", source, err))?;
    let mut writer = File::create(temp)
        .await
        .map_err(|err| FsOpsError::io("copy.create_temp", temp, err))?;
    let mut buffer = vec![0_u8; chunk_size.max(1)];
    let mut total = 0_u64;
    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|err| FsOpsError::io("copy.read", source, err))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .await
            .map_err(|err| FsOpsError::io("copy.write", temp, err))?;
        let read = read as u64;
        total += read;
        after_chunk(read)?;
    }
    writer
        .sync_all()
        .await
        .map_err(|err| FsOpsError::io("copy.sync", temp, err))?;
    Ok(total)
}

fn temp_sibling(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map_or_else(|| "ferry".into(), |name| name.to_string_lossy());
    destination.with_file_name(format!(".{name}.{}.part", Uuid::new_v4().simple()))
}

async fn discard(temp: &Path) {
    match fs::remove_file(temp).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %temp.display(), error = %err, "failed to remove partial file"),
    }
}
