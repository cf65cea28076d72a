//! Per-domain admission ("pump").
//!
//! A domain admits pending transfers, oldest first, while fewer than its
//! ceiling hold a slot. Counting and claiming run under the domain's lock and
//! the claim itself is a single conditional update, so two pumps for the same
//! domain can never admit past the ceiling.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{BatchHandle, EngineInner, batch};
use crate::transfer::{StoreError, TransferStatus};

/// Supplies the admission ceiling for a domain.
pub trait CeilingResolver: Send + Sync + std::fmt::Debug {
    /// Maximum number of slot-holding transfers allowed for `domain`.
    fn ceiling(&self, domain: &str) -> usize;

    /// Drops cached ceilings for `domain`, or for every domain when `None`.
    fn invalidate(&self, domain: Option<&str>);
}

/// Default ceiling plus per-domain overrides.
///
/// An override applies to its domain and every subdomain; the most specific
/// match wins. Resolved ceilings are cached until invalidated.
#[derive(Debug)]
pub struct ConfiguredCeilings {
    default: usize,
    overrides: RwLock<HashMap<String, usize>>,
    cache: DashMap<String, usize>,
}

impl ConfiguredCeilings {
    #[must_use]
    pub fn new(default: usize, overrides: HashMap<String, usize>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(domain, ceiling)| (domain.to_ascii_lowercase(), ceiling.max(1)))
            .collect();
        Self {
            default: default.max(1),
            overrides: RwLock::new(overrides),
            cache: DashMap::new(),
        }
    }

    /// Sets or replaces an override and invalidates affected cache entries.
    pub fn set_override(&self, domain: &str, ceiling: usize) {
        let domain = domain.to_ascii_lowercase();
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain.clone(), ceiling.max(1));
        self.invalidate_subtree(&domain);
    }

    pub fn remove_override(&self, domain: &str) {
        let domain = domain.to_ascii_lowercase();
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&domain);
        self.invalidate_subtree(&domain);
    }

    fn invalidate_subtree(&self, domain: &str) {
        let suffix = format!(".{domain}");
        self.cache
            .retain(|cached, _| cached != domain && !cached.ends_with(&suffix));
    }

    fn resolve(&self, domain: &str) -> usize {
        let overrides = self.overrides.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidate = domain;
        loop {
            if let Some(ceiling) = overrides.get(candidate) {
                return *ceiling;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return self.default,
            }
        }
    }
}

impl CeilingResolver for ConfiguredCeilings {
    fn ceiling(&self, domain: &str) -> usize {
        let domain = domain.to_ascii_lowercase();
        if let Some(cached) = self.cache.get(&domain) {
            return *cached;
        }
        let ceiling = self.resolve(&domain);
        self.cache.insert(domain, ceiling);
        ceiling
    }

    fn invalidate(&self, domain: Option<&str>) {
        match domain {
            Some(domain) => {
                self.cache.remove(&domain.to_ascii_lowercase());
            }
            None => self.cache.clear(),
        }
    }
}

impl EngineInner {
    /// Admits pending transfers for `domain` until its ceiling is reached.
    ///
    /// Boxed because admitted batches pump their domain again when they end.
    pub(crate) fn pump(self: &Arc<Self>, domain: String) -> BoxFuture<'static, Result<usize, StoreError>> {
        let inner = Arc::clone(self);
        async move { inner.admit(&domain).await }.boxed()
    }

    /// Fire-and-forget pump. Failures are logged.
    pub(crate) fn request_pump(self: &Arc<Self>, domain: &str) {
        let pump = self.pump(domain.to_string());
        let domain = domain.to_string();
        self.tasks.spawn(async move {
            if let Err(error) = pump.await {
                warn!(%domain, error = %error, "pump failed");
            }
        });
    }

    #[instrument(skip(self))]
    async fn admit(self: &Arc<Self>, domain: &str) -> Result<usize, StoreError> {
        if self.is_closed() {
            return Ok(0);
        }

        let _domain_guard = self.domain_locks.lock(domain.to_string()).await;
        let ceiling = self.ceilings.ceiling(domain);
        let mut admitted = 0;

        loop {
            let holding = self.transfers.count_slot_holders(domain).await?;
            if holding >= ceiling {
                debug!(holding, ceiling, "domain at ceiling");
                break;
            }

            let batch_id = Uuid::new_v4().to_string();
            let Some(record) = self.transfers.claim_next_pending(domain, &batch_id).await? else {
                break;
            };

            info!(transfer_id = record.id, %batch_id, holding, ceiling, "admitted transfer");
            self.events.status_changed(record.id, TransferStatus::Queued);

            let handle = BatchHandle::new(batch_id);
            self.batches.insert(record.id, handle.clone());
            self.tasks.spawn(batch::run(Arc::clone(self), record, handle));
            admitted += 1;
        }

        Ok(admitted)
    }

    /// Pumps every domain that has pending transfers.
    pub(crate) async fn pump_all(self: &Arc<Self>) -> Result<usize, StoreError> {
        let mut admitted = 0;
        for domain in self.transfers.pending_domains().await? {
            admitted += self.pump(domain).await?;
        }
        Ok(admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceilings() -> ConfiguredCeilings {
        let mut overrides = HashMap::new();
        overrides.insert("example.com".to_string(), 4);
        overrides.insert("slow.example.com".to_string(), 1);
        ConfiguredCeilings::new(2, overrides)
    }

    #[test]
    fn test_default_ceiling_for_unknown_domain() {
        assert_eq!(ceilings().ceiling("other.org"), 2);
    }

    #[test]
    fn test_override_applies_to_subdomains() {
        let ceilings = ceilings();
        assert_eq!(ceilings.ceiling("example.com"), 4);
        assert_eq!(ceilings.ceiling("cdn.example.com"), 4);
        assert_eq!(ceilings.ceiling("a.slow.example.com"), 1);
        assert_eq!(ceilings.ceiling("SLOW.example.com"), 1);
    }

    #[test]
    fn test_suffix_without_dot_boundary_does_not_match() {
        assert_eq!(ceilings().ceiling("notexample.com"), 2);
    }

    #[test]
    fn test_set_override_invalidates_cached_subdomains() {
        let ceilings = ceilings();
        assert_eq!(ceilings.ceiling("img.example.com"), 4);
        ceilings.set_override("example.com", 6);
        assert_eq!(ceilings.ceiling("img.example.com"), 6);
        ceilings.remove_override("example.com");
        assert_eq!(ceilings.ceiling("img.example.com"), 2);
    }

    #[test]
    fn test_zero_ceilings_are_raised_to_one() {
        let ceilings = ConfiguredCeilings::new(0, HashMap::new());
        assert_eq!(ceilings.ceiling("a.example"), 1);
    }

    #[test]
    fn test_invalidate_all_clears_cache() {
        let ceilings = ceilings();
        ceilings.ceiling("a.example.com");
        ceilings.invalidate(None);
        assert!(ceilings.cache.is_empty());
    }
}
