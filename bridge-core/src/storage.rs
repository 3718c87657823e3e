//! Scratch tmpfs volume on the router that scan exports are written to.

use crate::router::{self, Record};
use crate::traits::{Method, RouterApi};
use crate::{Error, Result};
use serde_json::json;

/// Reserved slot / mount point of the scratch volume.
pub const SCRATCH_SLOT: &str = "tmp1";

/// Size passed as `tmpfs-max-size` when the volume is created.
const SCRATCH_MAX_SIZE: &str = "1";

fn is_scratch(disk: &Record) -> bool {
    router::field(disk, "mount-point") == SCRATCH_SLOT
        || router::field(disk, "slot") == SCRATCH_SLOT
}

/// Makes sure the scratch volume exists. Idempotent.
pub async fn ensure(api: &dyn RouterApi) -> Result<()> {
    let disks = router::get_list(api, "/disk")
        .await
        .map_err(|e| Error::ResourceUnavailable(format!("cannot list disks: {}", e)))?;

    if disks.iter().any(is_scratch) {
        return Ok(());
    }

    tracing::info!("tmpfs {} missing, creating...", SCRATCH_SLOT);
    let body = json!({ "type": "tmpfs", "tmpfs-max-size": SCRATCH_MAX_SIZE });
    router::send(api, Method::Post, "/disk/add", Some(&body))
        .await
        .map_err(|e| Error::ResourceUnavailable(format!("cannot create tmpfs: {}", e)))?;
    tracing::info!("tmpfs {} created", SCRATCH_SLOT);
    Ok(())
}

/// Removes the scratch volume if present. Idempotent.
pub async fn release(api: &dyn RouterApi) -> Result<()> {
    let disks = router::get_list(api, "/disk").await?;

    let Some(disk) = disks.iter().find(|d| is_scratch(d)) else {
        return Ok(());
    };

    let id = router::field(disk, ".id");
    if id.is_empty() {
        tracing::warn!("tmpfs {} has no .id, leaving it in place", SCRATCH_SLOT);
        return Ok(());
    }

    tracing::debug!("Deleting tmpfs {}...", SCRATCH_SLOT);
    router::send(api, Method::Post, "/disk/remove", Some(&json!({ "numbers": id }))).await?;
    tracing::info!("tmpfs {} removed", SCRATCH_SLOT);
    Ok(())
}

/// [`release`] for cleanup paths: failures leak a little router storage but
/// must never abort the caller, so they are only logged.
pub async fn release_best_effort(api: &dyn RouterApi) {
    if let Err(e) = release(api).await {
        tracing::warn!("Failed to release tmpfs {}: {}", SCRATCH_SLOT, e);
    }
}
