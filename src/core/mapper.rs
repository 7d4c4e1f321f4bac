// src/core/mapper.rs

//! Canonicalizes node identity literals.
//!
//! Every node of the fleet is declared once in the configuration under a
//! canonical name, optionally with aliases (FQDN, IPv4). The mapper resolves
//! any of those literals back to the canonical name and rejects everything
//! else. It is a pure function over the configured node set; declared order
//! is preserved because the placement strategies depend on it.

use crate::config::NodeConfig;
use indexmap::IndexMap;

#[derive(Debug, Clone)]
struct NodeEntry {
    aliases: Vec<String>,
}

/// Resolves node literals (canonical name, alias, FQDN) to canonical names.
#[derive(Debug, Clone, Default)]
pub struct AddressMapper {
    nodes: IndexMap<String, NodeEntry>,
}

impl AddressMapper {
    pub fn new(nodes: &[NodeConfig]) -> Self {
        let mut map = IndexMap::new();
        for node in nodes {
            map.insert(
                node.name.clone(),
                NodeEntry {
                    aliases: node.aliases.clone(),
                },
            );
        }
        Self { nodes: map }
    }

    /// Resolves a literal to the canonical node name, or `None` when the
    /// literal matches no declared node.
    pub fn resolve(&self, literal: &str) -> Option<&str> {
        if let Some((name, _)) = self.nodes.get_key_value(literal) {
            return Some(name.as_str());
        }
        for (name, entry) in &self.nodes {
            if entry.aliases.iter().any(|a| a == literal) {
                return Some(name.as_str());
            }
            // An FQDN literal matches a node declared by its short host name.
            if literal.split('.').next() == Some(name.as_str()) {
                return Some(name.as_str());
            }
        }
        None
    }

    /// Canonical node names in declared order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
