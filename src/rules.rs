//! The rule store: transfer rules parsed from `.nxpt` files, held in an append-only sequence,
//! indexed by their source coordinates, and matched against dispatch events.

use std::os::raw::c_void;

use crate::error::{Result, RouteError};

pub mod index;
pub mod parser;

use index::RuleIndex;

/// How many targets one source event may fan out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// At most one fire per distinct target location.
    #[default]
    Unicast,
    /// Fire every matching rule.
    Broadcast,
    /// Fire every matching rule that carries a non-empty group tag.
    Multicast,
}

impl TransferMode {
    pub fn parse(value: &str) -> TransferMode {
        // Anything unrecognised falls back to unicast.
        match value.to_ascii_lowercase().as_str() {
            "broadcast" => TransferMode::Broadcast,
            "multicast" => TransferMode::Multicast,
            _ => TransferMode::Unicast,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransferMode::Unicast => "unicast",
            TransferMode::Broadcast => "broadcast",
            TransferMode::Multicast => "multicast",
        }
    }
}

/// The small predicate a rule can gate on, evaluated against the event's value pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    NotNull,
    Null,
    GreaterThanZero,
    LessThanZero,
    EqualsZero,
    NotEqualsZero,
}

impl Condition {
    pub fn parse(value: &str) -> Option<Condition> {
        match value {
            "not_null" => Some(Condition::NotNull),
            "null" => Some(Condition::Null),
            ">0" => Some(Condition::GreaterThanZero),
            "<0" => Some(Condition::LessThanZero),
            // "=0" has been seen in rule files in the wild as a spelling of "==0".
            "==0" | "=0" => Some(Condition::EqualsZero),
            "!=0" => Some(Condition::NotEqualsZero),
            _ => None,
        }
    }

    /// Evaluate against a value pointer. The numeric predicates interpret the pointee as an `int`.
    ///
    /// # Safety
    ///
    /// For the numeric predicates, a non-null `value` must point at a readable `i32`.
    pub unsafe fn evaluate(&self, value: *const c_void) -> bool {
        match self {
            Condition::NotNull => !value.is_null(),
            Condition::Null => value.is_null(),
            Condition::GreaterThanZero => !value.is_null() && *(value as *const i32) > 0,
            Condition::LessThanZero => !value.is_null() && *(value as *const i32) < 0,
            // A null pointer reads as zero here.
            Condition::EqualsZero => value.is_null() || *(value as *const i32) == 0,
            Condition::NotEqualsZero => !value.is_null() && *(value as *const i32) != 0,
        }
    }
}

/// One transfer rule. Immutable once loaded; the store only ever appends.
#[derive(Debug, Clone)]
pub struct Rule {
    pub source_plugin: Option<String>,
    pub source_interface: Option<String>,
    /// Signed; -1 means "the return value".
    pub source_param_index: i32,
    pub target_plugin: Option<String>,
    pub target_plugin_path: Option<String>,
    pub target_interface: Option<String>,
    pub target_param_index: i32,
    /// A literal applied to the target parameter instead of the source value.
    pub target_constant: Option<String>,
    pub description: Option<String>,
    pub multicast_group: Option<String>,
    pub mode: TransferMode,
    pub enabled: bool,
    pub condition: Option<Condition>,
    /// Hint: keep this rule in the fast-scan array.
    pub cache_self: bool,
    /// Cohort tag, recorded but not interpreted by the engine.
    pub set_group: Option<String>,
}

impl Default for Rule {
    fn default() -> Rule {
        Rule {
            source_plugin: None,
            source_interface: None,
            source_param_index: -1,
            target_plugin: None,
            target_plugin_path: None,
            target_interface: None,
            target_param_index: -1,
            target_constant: None,
            description: None,
            multicast_group: None,
            mode: TransferMode::Unicast,
            enabled: true,
            condition: None,
            cache_self: false,
            set_group: None,
        }
    }
}

impl Rule {
    /// Whether this rule's source coordinates equal the event's. Rules with missing source fields
    /// never match.
    pub fn matches_source(&self, plugin: &str, interface: &str, param_index: i32) -> bool {
        self.source_plugin.as_deref() == Some(plugin)
            && self.source_interface.as_deref() == Some(interface)
            && self.source_param_index == param_index
    }

    /// Whether `other` names the exact same target location (plugin, interface, parameter).
    pub fn same_target(&self, other: &Rule) -> bool {
        self.target_plugin.is_some()
            && self.target_interface.is_some()
            && self.target_plugin == other.target_plugin
            && self.target_interface == other.target_interface
            && self.target_param_index == other.target_param_index
    }
}

/// What a single rule-file load produced, including the global options that must take effect
/// before anything else is logged.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub added: usize,
    pub disable_info_log: Option<bool>,
    pub enable_validation: Option<bool>,
}

/// The append-only rule store with its hash index and `cache_self` fast-scan vector. Rules are
/// never removed during a process lifetime; every position handed out stays valid.
#[derive(Default)]
pub struct RuleStore {
    rules: Vec<Rule>,
    index: RuleIndex,
    cached: Vec<usize>,
}

impl RuleStore {
    pub fn new() -> RuleStore {
        RuleStore::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(&self, position: usize) -> &Rule {
        &self.rules[position]
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Positions of enabled rules flagged `cache_self`, in insertion order.
    pub fn cached_rules(&self) -> &[usize] {
        &self.cached
    }

    /// Parse a rule file and append all well-formed rules. The first pass extracts the global
    /// options from the `[EntryPlugin]` section so the caller can apply them before the rules are
    /// logged; the second pass extracts the rule sections in textual order. The index and the
    /// fast-scan vector are rebuilt over all rules, old and new.
    pub fn load_file(&mut self, path: &str) -> Result<LoadOutcome> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            nx_warn!("failed to open transfer rules file: {}", path);
            RouteError::FileOpen {
                path: path.to_owned(),
                source: err,
            }
        })?;

        let flags = parser::scan_global_flags(&text);
        // The info-log option takes effect before any rule below is logged.
        if let Some(disable) = flags.disable_info_log {
            log::set_max_level(if disable {
                log::LevelFilter::Warn
            } else {
                log::LevelFilter::Info
            });
        }
        nx_log!("opening transfer rules file: {}", path);

        let parsed = parser::parse_rules(&text, path);
        let added = parsed.len();
        let first_new = self.rules.len();
        self.rules.extend(parsed);
        self.rebuild();

        for (position, rule) in self.rules.iter().enumerate().skip(first_new) {
            if let (Some(source_plugin), Some(target_plugin)) =
                (&rule.source_plugin, &rule.target_plugin)
            {
                nx_log!(
                    "rule {}: {}.{}[{}] -> {}.{}[{}], mode={}",
                    position,
                    source_plugin,
                    rule.source_interface.as_deref().unwrap_or("?"),
                    rule.source_param_index,
                    target_plugin,
                    rule.target_interface.as_deref().unwrap_or("?"),
                    rule.target_param_index,
                    rule.mode.name(),
                );
            }
        }
        nx_log!(
            "loaded {} transfer rules from {} (total {})",
            added,
            path,
            self.rules.len()
        );

        Ok(LoadOutcome {
            added,
            disable_info_log: flags.disable_info_log,
            enable_validation: flags.enable_validation,
        })
    }

    /// Append already-parsed rules, rebuilding the side tables. Used by tests and by anything
    /// that synthesizes rules without a file.
    pub fn append_rules(&mut self, rules: impl IntoIterator<Item = Rule>) -> usize {
        let before = self.rules.len();
        self.rules.extend(rules);
        self.rebuild();
        self.rules.len() - before
    }

    /// Positions of enabled rules whose source coordinates equal the query, in insertion order.
    /// Uses the hash index when it has entries and falls back to a linear scan otherwise.
    pub fn find_rules(&self, plugin: &str, interface: &str, param_index: i32) -> Vec<usize> {
        if !self.index.is_empty() {
            self.index.lookup(&self.rules, plugin, interface, param_index)
        } else {
            self.rules
                .iter()
                .enumerate()
                .filter(|(_, rule)| rule.enabled && rule.matches_source(plugin, interface, param_index))
                .map(|(position, _)| position)
                .collect()
        }
    }

    fn rebuild(&mut self) {
        self.index.rebuild(&self.rules);

        self.cached.clear();
        for (position, rule) in self.rules.iter().enumerate() {
            if rule.cache_self && rule.enabled {
                self.cached.push(position);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> &RuleIndex {
        &self.index
    }
}
