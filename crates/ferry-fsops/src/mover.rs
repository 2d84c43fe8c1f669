//! Protocol mover for `file://` locations.

use std::path::Path;

use async_trait::async_trait;
use ferry_core::{
    LocalUser, MoverJob, MoverReport, ProtocolMover, TransferContext, TransferResult, local_path,
};
use nix::unistd::{Gid, Uid, chown};
use tracing::{debug, info};

use crate::copy::copy_atomically;
use crate::error::{FsOpsError, FsOpsResult};

/// Default copy buffer.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Copies between local paths.
///
/// Cancellation and progress are observed at every chunk boundary. When the
/// process runs as root the destination is handed to the request's local user.
#[derive(Debug, Clone, Copy)]
pub struct LocalFileMover {
    chunk_size: usize,
}

impl Default for LocalFileMover {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFileMover {
    /// Mover with the default chunk size.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Mover with a custom chunk size.
    #[must_use]
    pub const fn with_chunk_size(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

#[async_trait]
impl ProtocolMover for LocalFileMover {
    fn schemes(&self) -> &'static [&'static str] {
        &["file"]
    }

    async fn transfer(&self, job: MoverJob<'_>, context: TransferContext) -> TransferResult<MoverReport> {
        let source = local_path(job.source)?;
        let destination = local_path(job.destination)?;
        debug!(
            request_id = %job.request_id,
            source = %source.display(),
            destination = %destination.display(),
            "local copy starting"
        );

        let bytes = copy_atomically(&source, &destination, self.chunk_size, |chunk| {
            if context.cancellation().is_cancelled() {
                return Err(FsOpsError::Cancelled {
                    path: destination.clone(),
                });
            }
            context.progress().advance(chunk);
            Ok(())
        })
        .await?;
        hand_over(&destination, job.user)?;

        info!(request_id = %job.request_id, bytes, "local copy finished");
        Ok(MoverReport {
            bytes_transferred: bytes,
        })
    }
}

fn hand_over(path: &Path, user: &LocalUser) -> FsOpsResult<()> {
    if !Uid::effective().is_root() {
        return Ok(());
    }
    chown(path, Some(Uid::from_raw(user.uid)), Some(Gid::from_raw(user.gid))).map_err(|source| {
        FsOpsError::Nix {
            operation: "transfer.chown",
            path: path.to_path_buf(),
            source,
        }
    })
}
