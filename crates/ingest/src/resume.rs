//! Durable resumption
//!
//! A requested start index of `-1` means "continue where the store left
//! off": the highest stored index for this log identity plus one, or
//! zero for a log never mirrored before.

use tracing::info;

use treeline_store::IndexLookup;

use crate::IngestError;

pub async fn resolve_start_index(
    lookup: &dyn IndexLookup,
    log_id: &str,
    requested: i64,
) -> Result<u64, IngestError> {
    if requested >= 0 {
        return Ok(requested as u64);
    }

    let resolved = match lookup.max_index(log_id).await? {
        Some(max) => max + 1,
        None => 0,
    };

    info!(log_id, resolved, "resuming from the stored high-water mark");
    Ok(resolved)
}
