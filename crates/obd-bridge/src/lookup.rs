//! Read-through cache in front of a [`Lookup`]
//!
//! Answers are kept until explicitly invalidated. Sessions tolerate stale
//! answers, so nothing expires on its own. Misses are not kept: every entry
//! corresponds to something the backing catalog defines, which bounds the
//! cache by the catalog size.

use obd_session::Lookup;
use packet_decoder::{DataPointDef, SniffRule};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Which cached answers to drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    All,
    DataPoints,
    SniffRules,
    Macros,
    /// Sniff rules of one network, after the vehicle bus was switched
    Network(String),
}

pub struct CachedLookup {
    inner: Arc<dyn Lookup>,
    data_points: RwLock<HashMap<String, DataPointDef>>,
    /// (network, header) -> rules
    sniff_rules: RwLock<HashMap<(String, String), Vec<SniffRule>>>,
    macros: RwLock<HashMap<String, String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedLookup {
    pub fn new(inner: Arc<dyn Lookup>) -> Self {
        Self {
            inner,
            data_points: RwLock::new(HashMap::new()),
            sniff_rules: RwLock::new(HashMap::new()),
            macros: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn invalidate(&self, scope: CacheScope) {
        debug!(?scope, "Invalidating lookup cache");
        match scope {
            CacheScope::All => {
                self.data_points.write().clear();
                self.sniff_rules.write().clear();
                self.macros.write().clear();
            }
            CacheScope::DataPoints => self.data_points.write().clear(),
            CacheScope::SniffRules => self.sniff_rules.write().clear(),
            CacheScope::Macros => self.macros.write().clear(),
            CacheScope::Network(network) => {
                self.sniff_rules.write().retain(|(net, _), _| *net != network);
            }
        }
    }

    /// (hits, misses) since creation
    pub fn counters(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    /// Cached entries across all maps
    pub fn len(&self) -> usize {
        self.data_points.read().len() + self.sniff_rules.read().len() + self.macros.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read through `map`; `None` from `fetch` is returned but not stored
    fn cached<K, V>(
        &self,
        map: &RwLock<HashMap<K, V>>,
        key: K,
        fetch: impl FnOnce() -> Option<V>,
    ) -> Option<V>
    where
        K: std::hash::Hash + Eq,
        V: Clone,
    {
        if let Some(value) = map.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = fetch()?;
        map.write().insert(key, value.clone());
        Some(value)
    }
}

impl Lookup for CachedLookup {
    fn data_point(&self, name: &str) -> Option<DataPointDef> {
        self.cached(&self.data_points, name.to_string(), || self.inner.data_point(name))
    }

    fn sniff_rules(&self, header: &str, network: &str) -> Vec<SniffRule> {
        let key = (network.to_string(), header.to_ascii_uppercase());
        self.cached(&self.sniff_rules, key, || {
            let rules = self.inner.sniff_rules(header, network);
            (!rules.is_empty()).then_some(rules)
        })
        .unwrap_or_default()
    }

    fn command_macro(&self, name: &str) -> Option<String> {
        self.cached(&self.macros, name.to_string(), || self.inner.command_macro(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_session::StaticLookup;
    use packet_decoder::FormulaProgram;
    use std::sync::atomic::AtomicUsize;

    /// Counts every call that reaches the backing catalog
    struct Counting {
        catalog: StaticLookup,
        calls: AtomicUsize,
    }

    impl Lookup for Counting {
        fn data_point(&self, name: &str) -> Option<DataPointDef> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.catalog.data_point(name)
        }

        fn sniff_rules(&self, header: &str, network: &str) -> Vec<SniffRule> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.catalog.sniff_rules(header, network)
        }

        fn command_macro(&self, name: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.catalog.command_macro(name)
        }
    }

    fn cached() -> (CachedLookup, Arc<Counting>) {
        let formula = |text| FormulaProgram::parse(text).unwrap();
        let catalog = StaticLookup::new()
            .with_data_point(DataPointDef::new("speed", "010D", formula("A")))
            .with_sniff_rule("default", "3E9", SniffRule::new("00", "wheel", formula("C")))
            .with_sniff_rule("body", "3E9", SniffRule::new("", "door", formula("A")))
            .with_macro("horn", "AA BB CC DD 01");
        let counting = Arc::new(Counting {
            catalog,
            calls: AtomicUsize::new(0),
        });
        (CachedLookup::new(counting.clone()), counting)
    }

    #[test]
    fn test_read_through() {
        let (lookup, backing) = cached();
        assert_eq!(lookup.data_point("speed").unwrap().request, "010D");
        assert_eq!(lookup.data_point("speed").unwrap().request, "010D");
        assert!(lookup.data_point("boost").is_none());
        assert!(lookup.data_point("boost").is_none());
        assert_eq!(backing.calls.load(Ordering::SeqCst), 3);
        assert_eq!(lookup.counters(), (1, 3));
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn test_unknown_names_are_not_retained() {
        let (lookup, backing) = cached();
        for i in 0..1000 {
            assert!(lookup.data_point(&format!("missing_{i}")).is_none());
            assert!(lookup.command_macro(&format!("missing_{i}")).is_none());
            assert!(lookup.sniff_rules(&format!("{i:03X}"), "default").is_empty());
        }
        assert!(lookup.is_empty());
        assert_eq!(backing.calls.load(Ordering::SeqCst), 3000);

        // 3E9 is defined on the default bus, so it is the one entry kept
        for _ in 0..10 {
            lookup.sniff_rules("3E9", "default");
        }
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn test_header_case_shares_entry() {
        let (lookup, backing) = cached();
        assert_eq!(lookup.sniff_rules("3e9", "default").len(), 1);
        assert_eq!(lookup.sniff_rules("3E9", "default")[0].name, "wheel");
        assert_eq!(backing.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scoped_invalidation() {
        let (lookup, backing) = cached();
        lookup.data_point("speed");
        lookup.command_macro("horn");
        lookup.sniff_rules("3E9", "default");
        lookup.sniff_rules("3E9", "body");
        assert_eq!(backing.calls.load(Ordering::SeqCst), 4);

        lookup.invalidate(CacheScope::Network("body".to_string()));
        lookup.sniff_rules("3E9", "default");
        lookup.sniff_rules("3E9", "body");
        assert_eq!(backing.calls.load(Ordering::SeqCst), 5);

        lookup.invalidate(CacheScope::Macros);
        lookup.data_point("speed");
        lookup.command_macro("horn");
        assert_eq!(backing.calls.load(Ordering::SeqCst), 6);

        lookup.invalidate(CacheScope::All);
        lookup.data_point("speed");
        lookup.command_macro("horn");
        lookup.sniff_rules("3E9", "default");
        assert_eq!(backing.calls.load(Ordering::SeqCst), 9);
    }
}
