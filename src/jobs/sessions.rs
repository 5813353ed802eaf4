use crate::util::logging::debug;
use anyhow::Result;
use chrono::Utc;
use hearthmap_common::cache::CacheHandle;
use hearthmap_common::keys;
use hearthmap_storage::Store;

/// Sweeps active sessions whose expiry has passed into `expired` and drops
/// the affected liveness flags so the next check refills from the store.
pub fn expire_overdue(store: &dyn Store, cache: &dyn CacheHandle) -> Result<usize> {
    let users = store.expire_sessions(Utc::now())?;
    for user_id in &users {
        if let Err(e) = cache.delete(&keys::session_live(*user_id)) {
            debug!("failed to clear liveness flag for user {}: {:#}", user_id, e);
        }
    }
    Ok(users.len())
}
