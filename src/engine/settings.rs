use crate::util::logging::debug;
use hearthmap_common::cache::{self, CacheHandle};
use hearthmap_common::keys;
use hearthmap_core::error::EngineError;
use hearthmap_core::model::FamilySettings;
use hearthmap_storage::Store;
use std::sync::Arc;

/// Read-only view over per-family settings; families without a row get the
/// defaults.
pub struct SettingsService {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheHandle>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn CacheHandle>) -> Self {
        Self { store, cache }
    }

    pub fn family(&self, family_id: i64) -> Result<FamilySettings, EngineError> {
        let key = keys::family_settings(family_id);
        match cache::get_json::<FamilySettings>(self.cache.as_ref(), &key) {
            Ok(Some(settings)) => return Ok(settings),
            Ok(None) => {}
            Err(e) => debug!("settings cache read failed: {:#}", e),
        }

        let settings = self
            .store
            .fetch_settings(family_id)
            .map_err(EngineError::persistence)?
            .unwrap_or_default();
        if let Err(e) =
            cache::set_json(self.cache.as_ref(), &key, &settings, Some(keys::SETTINGS_TTL))
        {
            debug!("settings cache write failed: {:#}", e);
        }
        Ok(settings)
    }
}
