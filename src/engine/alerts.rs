use crate::util::logging::debug;
use hearthmap_common::cache::{self, CacheHandle};
use hearthmap_common::keys;
use hearthmap_core::alerts;
use hearthmap_core::error::EngineError;
use hearthmap_core::model::{AlertRule, LocationFix, TriggeredAlert};
use hearthmap_storage::Store;
use std::sync::Arc;

/// Evaluates a family's alert rules against one fix. Rules whose stored
/// condition payload cannot be decoded are dropped at the store layer, so one
/// bad rule never blocks the rest.
pub struct AlertsService {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheHandle>,
}

impl AlertsService {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn CacheHandle>) -> Self {
        Self { store, cache }
    }

    pub fn evaluate(
        &self,
        user_id: i64,
        family_id: i64,
        fix: &LocationFix,
    ) -> Result<Vec<TriggeredAlert>, EngineError> {
        let rules = self.family_rules(family_id)?;
        let triggered = rules
            .iter()
            .filter(|rule| alerts::applies_to(rule, user_id))
            .filter_map(|rule| alerts::evaluate(rule, fix))
            .collect();
        Ok(triggered)
    }

    fn family_rules(&self, family_id: i64) -> Result<Vec<AlertRule>, EngineError> {
        let key = keys::alert_rules(family_id);
        match cache::get_json::<Vec<AlertRule>>(self.cache.as_ref(), &key) {
            Ok(Some(rules)) => return Ok(rules),
            Ok(None) => {}
            Err(e) => debug!("alert rules cache read failed: {:#}", e),
        }

        let rules = self
            .store
            .list_alert_rules(family_id)
            .map_err(EngineError::persistence)?;
        if let Err(e) =
            cache::set_json(self.cache.as_ref(), &key, &rules, Some(keys::ALERT_RULES_TTL))
        {
            debug!("alert rules cache write failed: {:#}", e);
        }
        Ok(rules)
    }
}
