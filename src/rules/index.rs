//! The open-hashed rule index: 64-bit FNV-1a of the canonical source key, chained buckets, and a
//! wholesale rebuild after every append. Chain nodes live in an arena `Vec` and link by index, so
//! the whole structure is two flat allocations.

use super::Rule;
use crate::util::hash_rule_key;

const INITIAL_BUCKETS: usize = 16;
const LOAD_FACTOR: f64 = 0.75;

#[derive(Debug)]
struct IndexNode {
    hash: u64,
    position: usize,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub struct RuleIndex {
    buckets: Vec<Option<usize>>,
    nodes: Vec<IndexNode>,
}

impl RuleIndex {
    pub fn new() -> RuleIndex {
        RuleIndex::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Throw away the old table and index every enabled rule that has source coordinates.
    /// `load_rules` is rare, so rebuilding wholesale is fine.
    pub fn rebuild(&mut self, rules: &[Rule]) {
        self.buckets.clear();
        self.nodes.clear();

        for (position, rule) in rules.iter().enumerate() {
            let (Some(plugin), Some(interface)) = (&rule.source_plugin, &rule.source_interface)
            else {
                continue;
            };
            if !rule.enabled {
                continue;
            }

            let hash = hash_rule_key(plugin, interface, rule.source_param_index);
            self.insert(hash, position);
        }
    }

    /// Walk the bucket chain for the query key and collect every verified match, in insertion
    /// order. Each candidate is re-checked by exact comparison as a defence against collisions.
    pub fn lookup(
        &self,
        rules: &[Rule],
        plugin: &str,
        interface: &str,
        param_index: i32,
    ) -> Vec<usize> {
        if self.buckets.is_empty() {
            return Vec::new();
        }

        let hash = hash_rule_key(plugin, interface, param_index);
        let mut matches = Vec::new();

        let mut cursor = self.buckets[(hash % self.buckets.len() as u64) as usize];
        while let Some(node_index) = cursor {
            let node = &self.nodes[node_index];
            if node.hash == hash {
                if node.position >= rules.len() {
                    nx_warn!(
                        "rule index holds stale position {} (rule count {})",
                        node.position,
                        rules.len()
                    );
                } else {
                    let rule = &rules[node.position];
                    if rule.enabled && rule.matches_source(plugin, interface, param_index) {
                        matches.push(node.position);
                    }
                }
            }
            cursor = node.next;
        }

        // Chains are pushed head-first; matching order must be insertion order.
        matches.sort_unstable();
        matches
    }

    fn insert(&mut self, hash: u64, position: usize) {
        if self.buckets.is_empty()
            || (self.nodes.len() + 1) as f64 / self.buckets.len() as f64 > LOAD_FACTOR
        {
            self.grow();
        }

        let bucket = (hash % self.buckets.len() as u64) as usize;
        let node_index = self.nodes.len();
        self.nodes.push(IndexNode {
            hash,
            position,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(node_index);
    }

    fn grow(&mut self) {
        let new_bucket_count = if self.buckets.is_empty() {
            INITIAL_BUCKETS
        } else {
            self.buckets.len() * 2
        };

        self.buckets.clear();
        self.buckets.resize(new_bucket_count, None);

        // Rehash every node into the fresh buckets, keeping the arena as-is.
        for node_index in 0..self.nodes.len() {
            let bucket = (self.nodes[node_index].hash % new_bucket_count as u64) as usize;
            self.nodes[node_index].next = self.buckets[bucket];
            self.buckets[bucket] = Some(node_index);
        }
    }

    #[cfg(test)]
    fn entries(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.nodes.iter().map(|node| (node.hash, node.position))
    }
}
