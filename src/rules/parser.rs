//! The line-oriented `.nxpt` parser. `#` starts a comment, `[Section]` lines open sections, and
//! `key=value` lines bind into the open section. Two kinds of section matter: `[EntryPlugin]`
//! with the engine-level options, and `[TransferRule_<N>]` with one transfer rule each.

use super::{Condition, Rule, TransferMode};
use crate::util::{parse_bool_option, parse_strict_bool};

const MAX_LINE_LEN: usize = 4096;
const MAX_SECTION_LEN: usize = 512;
const MAX_KEY_LEN: usize = 512;
const MAX_VALUE_LEN: usize = 2048;

/// The options that must take effect before anything else in the file is processed.
#[derive(Debug, Default)]
pub struct GlobalFlags {
    pub disable_info_log: Option<bool>,
    pub enable_validation: Option<bool>,
}

/// The `[EntryPlugin]` section in full.
#[derive(Debug, Default)]
pub struct EntryConfig {
    pub plugin_name: Option<String>,
    pub plugin_path: Option<String>,
    pub nxpt_path: Option<String>,
    pub auto_run_interface: Option<String>,
    pub disable_info_log: Option<bool>,
    pub enable_validation: Option<bool>,
    pub ignore_plugins: Vec<String>,
}

impl EntryConfig {
    /// The engine keeps running on an incomplete entry section, but the caller wants to know.
    pub fn is_complete(&self) -> bool {
        self.plugin_name.is_some() && self.nxpt_path.is_some()
    }
}

enum Line<'a> {
    Section(&'a str),
    KeyValue(&'a str, &'a str),
}

/// Normalise one raw line: enforce the length cap, strip the comment tail, trim. Returns `None`
/// for lines that carry nothing.
fn clean_line(raw: &str, line_number: usize) -> Option<&str> {
    let mut line = raw.strip_suffix('\r').unwrap_or(raw);

    if line.len() > MAX_LINE_LEN {
        nx_warn!(
            "line {} exceeds {} bytes, truncated",
            line_number,
            MAX_LINE_LEN
        );
        let mut cut = MAX_LINE_LEN;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line = &line[..cut];
    }

    if let Some(comment_start) = line.find('#') {
        line = &line[..comment_start];
    }

    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

fn classify_line<'a>(line: &'a str, line_number: usize) -> Option<Line<'a>> {
    if line.len() >= 2 && line.starts_with('[') && line.ends_with(']') {
        let mut name = &line[1..line.len() - 1];
        if name.len() > MAX_SECTION_LEN {
            nx_warn!(
                "line {} section name exceeds {} bytes, truncated",
                line_number,
                MAX_SECTION_LEN
            );
            let mut cut = MAX_SECTION_LEN;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name = &name[..cut];
        }
        return Some(Line::Section(name));
    }

    let (key, value) = line.split_once('=')?;
    let mut key = key.trim();
    let mut value = value.trim();
    if key.len() > MAX_KEY_LEN {
        nx_warn!("line {} key exceeds {} bytes, truncated", line_number, MAX_KEY_LEN);
        let mut cut = MAX_KEY_LEN;
        while !key.is_char_boundary(cut) {
            cut -= 1;
        }
        key = &key[..cut];
    }
    if value.len() > MAX_VALUE_LEN {
        nx_warn!(
            "line {} value exceeds {} bytes, truncated",
            line_number,
            MAX_VALUE_LEN
        );
        let mut cut = MAX_VALUE_LEN;
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        value = &value[..cut];
    }

    Some(Line::KeyValue(key, value))
}

fn lines(text: &str) -> impl Iterator<Item = (usize, Line<'_>)> {
    text.lines().enumerate().filter_map(|(index, raw)| {
        let line_number = index + 1;
        let cleaned = clean_line(raw, line_number)?;
        classify_line(cleaned, line_number).map(|line| (line_number, line))
    })
}

/// First pass: pull `DisableInfoLog` and `EnableValidation` out of the `[EntryPlugin]` section so
/// they apply before any rule is logged.
pub fn scan_global_flags(text: &str) -> GlobalFlags {
    let mut flags = GlobalFlags::default();
    let mut in_entry_section = false;

    for (_, line) in lines(text) {
        match line {
            Line::Section(name) => in_entry_section = name == "EntryPlugin",
            Line::KeyValue(key, value) if in_entry_section => match key {
                "DisableInfoLog" => {
                    flags.disable_info_log = Some(parse_bool_option("DisableInfoLog", value))
                }
                "EnableValidation" => {
                    flags.enable_validation = Some(parse_bool_option("EnableValidation", value))
                }
                _ => {}
            },
            _ => {}
        }
    }

    flags
}

/// Second pass: collect the `[TransferRule_<N>]` sections in textual order. Non-monotonic or
/// duplicate indices are warnings, not errors; the rules are accepted anyway.
pub fn parse_rules(text: &str, path: &str) -> Vec<Rule> {
    let mut rules: Vec<Rule> = Vec::new();
    let mut in_rule_section = false;
    let mut max_seen_index: i64 = -1;
    let mut expected_next_index: i64 = 0;

    for (line_number, line) in lines(text) {
        match line {
            Line::Section(name) => {
                in_rule_section = false;
                let Some(index_text) = name.strip_prefix("TransferRule_") else {
                    continue;
                };
                match index_text.parse::<i64>() {
                    Ok(section_index) if section_index >= 0 => {
                        if section_index < expected_next_index {
                            nx_warn!(
                                "{}: line {} section index {} is below the expected next index {}, duplicate or out-of-order sections",
                                path, line_number, section_index, expected_next_index
                            );
                        } else if section_index > expected_next_index {
                            nx_warn!(
                                "{}: line {} section index {} skips expected index {}, missing sections",
                                path, line_number, section_index, expected_next_index
                            );
                        }
                        max_seen_index = max_seen_index.max(section_index);
                        expected_next_index = section_index + 1;

                        rules.push(Rule::default());
                        in_rule_section = true;
                    }
                    _ => {
                        nx_warn!(
                            "{}: line {} bad numeric literal in section [{}], section ignored",
                            path, line_number, name
                        );
                    }
                }
            }
            Line::KeyValue(key, value) => {
                if !in_rule_section {
                    continue;
                }
                if let Some(rule) = rules.last_mut() {
                    apply_rule_key(rule, key, value);
                }
            }
        }
    }

    if max_seen_index >= 0 && (max_seen_index + 1) as usize != rules.len() {
        nx_warn!(
            "{}: section index inconsistency - max index {} but {} rules parsed",
            path,
            max_seen_index,
            rules.len()
        );
    }

    rules
}

fn apply_rule_key(rule: &mut Rule, key: &str, value: &str) {
    // Unknown keys are ignored silently; missing fields keep their defaults.
    match key {
        "SourcePlugin" => rule.source_plugin = Some(value.to_owned()),
        "SourceInterface" => rule.source_interface = Some(value.to_owned()),
        "SourceParamIndex" => {
            if let Ok(index) = value.parse::<i32>() {
                rule.source_param_index = index;
            }
        }
        "TargetPlugin" => rule.target_plugin = Some(value.to_owned()),
        "TargetPluginPath" => rule.target_plugin_path = Some(value.to_owned()),
        "TargetInterface" => rule.target_interface = Some(value.to_owned()),
        "TargetParamIndex" => {
            if let Ok(index) = value.parse::<i32>() {
                rule.target_param_index = index;
            }
        }
        "TargetParamValue" => rule.target_constant = Some(value.to_owned()),
        "Description" => rule.description = Some(value.to_owned()),
        "MulticastGroup" => rule.multicast_group = Some(value.to_owned()),
        "TransferMode" => rule.mode = TransferMode::parse(value),
        "Enabled" => rule.enabled = parse_strict_bool(value),
        "Condition" => {
            rule.condition = Condition::parse(value);
            if rule.condition.is_none() && !value.is_empty() {
                nx_warn!("unrecognised condition '{}', rule will always pass", value);
            }
        }
        "CacheSelf" => rule.cache_self = parse_strict_bool(value),
        "SetGroup" => rule.set_group = Some(value.to_owned()),
        _ => {}
    }
}

/// Parse the `[EntryPlugin]` section in full, including the ignore list (comma-separated,
/// trimmed, duplicates coalesced).
pub fn parse_entry_config(text: &str) -> EntryConfig {
    let mut config = EntryConfig::default();
    let mut in_entry_section = false;

    for (_, line) in lines(text) {
        match line {
            Line::Section(name) => in_entry_section = name == "EntryPlugin",
            Line::KeyValue(key, value) if in_entry_section => match key {
                "PluginName" => config.plugin_name = Some(value.to_owned()),
                "PluginPath" => config.plugin_path = Some(value.to_owned()),
                "NxptPath" => config.nxpt_path = Some(value.to_owned()),
                "AutoRunInterface" => config.auto_run_interface = Some(value.to_owned()),
                "DisableInfoLog" => {
                    config.disable_info_log = Some(parse_bool_option("DisableInfoLog", value))
                }
                "EnableValidation" => {
                    config.enable_validation = Some(parse_bool_option("EnableValidation", value))
                }
                "IgnorePlugins" => {
                    for element in value.split(',') {
                        let element = element.trim();
                        if element.is_empty() {
                            continue;
                        }
                        if !config.ignore_plugins.iter().any(|existing| existing == element) {
                            config.ignore_plugins.push(element.to_owned());
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = "\
# wiring for the demo pair
[TransferRule_0]
SourcePlugin=A
SourceInterface=f
SourceParamIndex=0
TargetPlugin=B
TargetPluginPath=./B.so
TargetInterface=g
TargetParamIndex=0
TransferMode=unicast
Enabled=true
";

    #[test]
    fn parses_a_basic_rule() {
        let rules = parse_rules(BASIC, "basic.nxpt");
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.source_plugin.as_deref(), Some("A"));
        assert_eq!(rule.source_interface.as_deref(), Some("f"));
        assert_eq!(rule.source_param_index, 0);
        assert_eq!(rule.target_plugin.as_deref(), Some("B"));
        assert_eq!(rule.target_plugin_path.as_deref(), Some("./B.so"));
        assert_eq!(rule.target_param_index, 0);
        assert_eq!(rule.mode, TransferMode::Unicast);
        assert!(rule.enabled);
    }

    #[test]
    fn defaults_for_missing_keys() {
        let rules = parse_rules("[TransferRule_0]\nSourcePlugin=A\n", "defaults.nxpt");
        let rule = &rules[0];
        assert_eq!(rule.source_param_index, -1);
        assert_eq!(rule.target_param_index, -1);
        assert_eq!(rule.mode, TransferMode::Unicast);
        assert!(rule.enabled);
        assert!(rule.target_plugin.is_none());
        assert!(rule.condition.is_none());
        assert!(!rule.cache_self);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let text = "[TransferRule_0]\nSourcePlugin=A\nFrobnicate=yes\n";
        let rules = parse_rules(text, "unknown.nxpt");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source_plugin.as_deref(), Some("A"));
    }

    #[test]
    fn non_monotonic_indices_still_accepted_in_textual_order() {
        let text = "\
[TransferRule_2]
SourcePlugin=A
[TransferRule_0]
SourcePlugin=B
[TransferRule_2]
SourcePlugin=C
";
        let rules = parse_rules(text, "scrambled.nxpt");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].source_plugin.as_deref(), Some("A"));
        assert_eq!(rules[1].source_plugin.as_deref(), Some("B"));
        assert_eq!(rules[2].source_plugin.as_deref(), Some("C"));
    }

    #[test]
    fn malformed_section_indices_are_skipped() {
        let text = "\
[TransferRule_x]
SourcePlugin=A
[TransferRule_-1]
SourcePlugin=B
[TransferRule_1]
SourcePlugin=C
";
        let rules = parse_rules(text, "bad-index.nxpt");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source_plugin.as_deref(), Some("C"));
    }

    #[test]
    fn keys_outside_any_rule_section_are_dropped() {
        let text = "SourcePlugin=A\n[Other]\nSourcePlugin=B\n";
        assert!(parse_rules(text, "loose.nxpt").is_empty());
    }

    #[test]
    fn enabled_parsing_is_strict() {
        let text = "\
[TransferRule_0]
Enabled=True
[TransferRule_1]
Enabled=1
[TransferRule_2]
Enabled=false
";
        let rules = parse_rules(text, "enabled.nxpt");
        assert!(!rules[0].enabled);
        assert!(rules[1].enabled);
        assert!(!rules[2].enabled);
    }

    #[test]
    fn comments_and_blank_lines() {
        let text = "\

# full-line comment
[TransferRule_0]   # trailing comment
SourcePlugin=A # another
";
        let rules = parse_rules(text, "comments.nxpt");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source_plugin.as_deref(), Some("A"));
    }

    #[test]
    fn global_flags_scan() {
        let text = "\
[EntryPlugin]
DisableInfoLog=yes
EnableValidation=0
[TransferRule_0]
SourcePlugin=A
";
        let flags = scan_global_flags(text);
        assert_eq!(flags.disable_info_log, Some(true));
        assert_eq!(flags.enable_validation, Some(false));
    }

    #[test]
    fn global_flags_ignore_other_sections() {
        let text = "[SomethingElse]\nDisableInfoLog=1\n";
        let flags = scan_global_flags(text);
        assert!(flags.disable_info_log.is_none());
        assert!(flags.enable_validation.is_none());
    }

    #[test]
    fn entry_config_full_parse() {
        let text = "\
[EntryPlugin]
PluginName=Demo
PluginPath=./demo.so
NxptPath=./demo.nxpt
AutoRunInterface=Start
EnableValidation=on
IgnorePlugins= plugins/skip_a.so , plugins/skip_b.so, plugins/skip_a.so
";
        let config = parse_entry_config(text);
        assert_eq!(config.plugin_name.as_deref(), Some("Demo"));
        assert_eq!(config.plugin_path.as_deref(), Some("./demo.so"));
        assert_eq!(config.nxpt_path.as_deref(), Some("./demo.nxpt"));
        assert_eq!(config.auto_run_interface.as_deref(), Some("Start"));
        assert_eq!(config.enable_validation, Some(true));
        assert_eq!(
            config.ignore_plugins,
            vec!["plugins/skip_a.so".to_owned(), "plugins/skip_b.so".to_owned()]
        );
        assert!(config.is_complete());
    }

    #[test]
    fn entry_config_incomplete_without_name_or_nxpt() {
        let config = parse_entry_config("[EntryPlugin]\nPluginPath=./x.so\n");
        assert!(!config.is_complete());
    }

    #[test]
    fn overlong_lines_are_truncated_not_fatal() {
        let mut text = String::from("[TransferRule_0]\n");
        text.push_str("Description=");
        text.push_str(&"x".repeat(MAX_LINE_LEN * 2));
        text.push('\n');
        text.push_str("SourcePlugin=A\n");
        let rules = parse_rules(&text, "long.nxpt");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source_plugin.as_deref(), Some("A"));
        let description = rules[0].description.as_deref().unwrap();
        assert!(description.len() <= MAX_VALUE_LEN);
    }

    #[test]
    fn condition_and_extras() {
        let text = "\
[TransferRule_0]
Condition=not_null
CacheSelf=1
SetGroup=alpha
MulticastGroup=g1
TransferMode=multicast
TargetParamValue=42
";
        let rules = parse_rules(text, "extras.nxpt");
        let rule = &rules[0];
        assert_eq!(rule.condition, Some(Condition::NotNull));
        assert!(rule.cache_self);
        assert_eq!(rule.set_group.as_deref(), Some("alpha"));
        assert_eq!(rule.multicast_group.as_deref(), Some("g1"));
        assert_eq!(rule.mode, TransferMode::Multicast);
        assert_eq!(rule.target_constant.as_deref(), Some("42"));
    }
}
