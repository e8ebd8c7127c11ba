//! Lookup collaborator
//!
//! Sessions resolve data-point definitions, sniff rules and command macros
//! through this trait. Implementations may cache arbitrarily; sessions
//! tolerate stale answers.

use packet_decoder::{DataPointDef, SniffRule};
use std::collections::HashMap;

pub trait Lookup: Send + Sync {
    /// Definition of a requestable data point
    fn data_point(&self, name: &str) -> Option<DataPointDef>;

    /// Rules for frames carrying `header` on `network`
    fn sniff_rules(&self, header: &str, network: &str) -> Vec<SniffRule>;

    /// Semicolon-delimited command text of a named macro
    fn command_macro(&self, name: &str) -> Option<String>;
}

/// In-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    data_points: HashMap<String, DataPointDef>,
    /// (network, header) -> rules
    sniff_rules: HashMap<(String, String), Vec<SniffRule>>,
    macros: HashMap<String, String>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_point(mut self, def: DataPointDef) -> Self {
        self.data_points.insert(def.name.clone(), def);
        self
    }

    pub fn with_sniff_rule(mut self, network: &str, header: &str, rule: SniffRule) -> Self {
        self.sniff_rules
            .entry((network.to_string(), header.to_ascii_uppercase()))
            .or_default()
            .push(rule);
        self
    }

    pub fn with_macro(mut self, name: &str, text: &str) -> Self {
        self.macros.insert(name.to_string(), text.to_string());
        self
    }

    pub fn data_point_names(&self) -> impl Iterator<Item = &str> {
        self.data_points.keys().map(String::as_str)
    }
}

impl Lookup for StaticLookup {
    fn data_point(&self, name: &str) -> Option<DataPointDef> {
        self.data_points.get(name).cloned()
    }

    fn sniff_rules(&self, header: &str, network: &str) -> Vec<SniffRule> {
        self.sniff_rules
            .get(&(network.to_string(), header.to_ascii_uppercase()))
            .cloned()
            .unwrap_or_default()
    }

    fn command_macro(&self, name: &str) -> Option<String> {
        self.macros.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_decoder::FormulaProgram;

    #[test]
    fn test_static_lookup() {
        let lookup = StaticLookup::new()
            .with_data_point(DataPointDef::new(
                "rpm",
                "010C",
                FormulaProgram::parse("A*256,X+B,X/4").unwrap(),
            ))
            .with_sniff_rule(
                "default",
                "3e9",
                SniffRule::new("00", "wheel", FormulaProgram::parse("C").unwrap()),
            )
            .with_macro("unlock", "S2;ATSH7E0");

        assert_eq!(lookup.data_point("rpm").unwrap().request, "010C");
        assert!(lookup.data_point("speed").is_none());
        assert_eq!(lookup.sniff_rules("3E9", "default").len(), 1);
        assert!(lookup.sniff_rules("3E9", "body").is_empty());
        assert_eq!(lookup.command_macro("unlock").as_deref(), Some("S2;ATSH7E0"));
    }
}
