//! Chain loading: given a plugin's binary path, derive its `.nxpt` rule file, load it, and walk
//! the targets of the newly added rules transitively. The NXPT tracker makes every plugin's rule
//! file load at most once per process; the bounded ancestor stack breaks reference cycles.

use crate::context::RouteContext;
use crate::error::Result;
use crate::util::{fnv1a_64, swap_extension};

/// The visible window of the ancestor stack. Deeper chains collapse at the bottom; cycles within
/// the window are still caught.
pub const MAX_ANCESTORS: usize = 32;

const TRACKER_INITIAL_BUCKETS: usize = 8;
const TRACKER_LOAD_FACTOR: f64 = 0.75;

#[derive(Debug)]
struct TrackerNode {
    hash: u64,
    plugin_name: String,
    nxpt_path: String,
    next: Option<usize>,
}

/// An open-hashed set of plugin names whose rule files have been loaded. Each slot carries the
/// resolved rule-file path for diagnostics.
#[derive(Debug, Default)]
pub struct NxptTracker {
    buckets: Vec<Option<usize>>,
    nodes: Vec<TrackerNode>,
}

impl NxptTracker {
    pub fn new() -> NxptTracker {
        NxptTracker::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_loaded(&self, plugin_name: &str) -> bool {
        self.find(plugin_name).is_some()
    }

    pub fn nxpt_path(&self, plugin_name: &str) -> Option<&str> {
        self.find(plugin_name)
            .map(|node_index| self.nodes[node_index].nxpt_path.as_str())
    }

    /// Record a plugin's rule file as loaded. Marking the same plugin twice is a no-op.
    pub fn mark_loaded(&mut self, plugin_name: &str, nxpt_path: &str) {
        if self.is_loaded(plugin_name) {
            return;
        }

        if self.buckets.is_empty()
            || (self.nodes.len() + 1) as f64 / self.buckets.len() as f64 > TRACKER_LOAD_FACTOR
        {
            self.grow();
        }

        let hash = fnv1a_64(plugin_name.as_bytes());
        let bucket = (hash % self.buckets.len() as u64) as usize;
        let node_index = self.nodes.len();
        self.nodes.push(TrackerNode {
            hash,
            plugin_name: plugin_name.to_owned(),
            nxpt_path: nxpt_path.to_owned(),
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(node_index);
    }

    fn find(&self, plugin_name: &str) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }

        let hash = fnv1a_64(plugin_name.as_bytes());
        let mut cursor = self.buckets[(hash % self.buckets.len() as u64) as usize];
        while let Some(node_index) = cursor {
            let node = &self.nodes[node_index];
            if node.hash == hash && node.plugin_name == plugin_name {
                return Some(node_index);
            }
            cursor = node.next;
        }

        None
    }

    fn grow(&mut self) {
        let new_bucket_count = if self.buckets.is_empty() {
            TRACKER_INITIAL_BUCKETS
        } else {
            self.buckets.len() * 2
        };

        self.buckets.clear();
        self.buckets.resize(new_bucket_count, None);
        for node_index in 0..self.nodes.len() {
            let bucket = (self.nodes[node_index].hash % new_bucket_count as u64) as usize;
            self.nodes[node_index].next = self.buckets[bucket];
            self.buckets[bucket] = Some(node_index);
        }
    }
}

/// Derive the rule-file path for a plugin binary: the trailing extension becomes `.nxpt`, or the
/// suffix is appended when the path has none.
pub fn nxpt_path_for(binary_path: &str) -> String {
    swap_extension(binary_path, ".nxpt")
}

/// Load a plugin's rule file and, transitively, the rule files its new rules refer to.
///
/// Idempotence (the tracker) and the ancestor stack together guarantee termination: each plugin
/// name is visited at most once per process, and a name already on the stack stops the descent
/// with a warning rather than an error.
pub fn chain_load(ctx: &mut RouteContext, plugin_name: &str, plugin_path: &str) -> Result<()> {
    let mut ancestors: Vec<String> = Vec::new();
    chain_load_inner(ctx, plugin_name, plugin_path, &mut ancestors)
}

fn chain_load_inner(
    ctx: &mut RouteContext,
    plugin_name: &str,
    plugin_path: &str,
    ancestors: &mut Vec<String>,
) -> Result<()> {
    if ctx.tracker.is_loaded(plugin_name) {
        return Ok(());
    }

    // Linear scan on purpose; the stack is small by construction.
    if ancestors.iter().any(|ancestor| ancestor == plugin_name) {
        nx_warn!(
            "circular dependency in plugin loading chain: ... -> {} -> ... -> {}",
            ancestors.first().map(String::as_str).unwrap_or("?"),
            plugin_name
        );
        return Ok(());
    }

    let nxpt_path = nxpt_path_for(plugin_path);
    nx_log!(
        "chain loading rule file for plugin {}: {}",
        plugin_name,
        nxpt_path
    );

    let rule_count_before = ctx.rules.len();
    if let Err(err) = ctx.load_rules(&nxpt_path) {
        // Not fatal, and the plugin is not marked as loaded so a later attempt may retry.
        nx_warn!(
            "failed to load rule file for plugin {}: {} ({})",
            plugin_name,
            nxpt_path,
            err
        );
        return Err(err);
    }

    ctx.tracker.mark_loaded(plugin_name, &nxpt_path);

    if ancestors.len() >= MAX_ANCESTORS {
        ancestors.remove(0);
    }
    ancestors.push(plugin_name.to_owned());
    nx_debug_assert!(ancestors.len() <= MAX_ANCESTORS);

    // Only the rules this very file contributed are walked.
    let new_targets: Vec<(String, String)> = ctx.rules.rules()[rule_count_before..]
        .iter()
        .filter(|rule| rule.enabled)
        .filter_map(|rule| {
            let target_name = rule.target_plugin.as_deref()?;
            let target_path = rule.target_plugin_path.as_deref()?;
            if target_path.is_empty() {
                None
            } else {
                Some((target_name.to_owned(), target_path.to_owned()))
            }
        })
        .collect();

    for (target_name, target_path) in new_targets {
        if !ctx.tracker.is_loaded(&target_name) {
            let _ = chain_load_inner(ctx, &target_name, &target_path, ancestors);
        }
    }

    ancestors.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;

    fn test_context() -> RouteContext {
        RouteContext::new(Box::new(FakePlatform::new()))
    }

    fn write_rules(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn tracker_is_idempotent() {
        let mut tracker = NxptTracker::new();
        assert!(!tracker.is_loaded("A"));
        tracker.mark_loaded("A", "./A.nxpt");
        tracker.mark_loaded("A", "./other.nxpt");
        assert!(tracker.is_loaded("A"));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.nxpt_path("A"), Some("./A.nxpt"));
    }

    #[test]
    fn tracker_survives_growth() {
        let mut tracker = NxptTracker::new();
        for i in 0..64 {
            tracker.mark_loaded(&format!("plugin-{i}"), &format!("./p{i}.nxpt"));
        }
        for i in 0..64 {
            assert!(tracker.is_loaded(&format!("plugin-{i}")));
        }
        assert!(!tracker.is_loaded("plugin-64"));
    }

    #[test]
    fn nxpt_path_derivation() {
        assert_eq!(nxpt_path_for("./plugins/b.dll"), "./plugins/b.nxpt");
        assert_eq!(nxpt_path_for("libb.so"), "libb.nxpt");
        assert_eq!(nxpt_path_for("plugins/bare"), "plugins/bare.nxpt");
    }

    #[test]
    fn chain_follows_targets_transitively() {
        let dir = tempfile::tempdir().unwrap();
        let b_binary = dir.path().join("B.so");
        let c_binary = dir.path().join("C.so");
        write_rules(
            dir.path(),
            "B.nxpt",
            &format!(
                "[TransferRule_0]\nSourcePlugin=B\nSourceInterface=g\nSourceParamIndex=-1\n\
                 TargetPlugin=C\nTargetPluginPath={}\nTargetInterface=h\nTargetParamIndex=0\n",
                c_binary.display()
            ),
        );
        write_rules(dir.path(), "C.nxpt", "");

        let mut ctx = test_context();
        chain_load(&mut ctx, "B", &b_binary.to_string_lossy()).unwrap();

        assert!(ctx.tracker.is_loaded("B"));
        assert!(ctx.tracker.is_loaded("C"));
        assert_eq!(ctx.rules.len(), 1);
    }

    #[test]
    fn each_plugin_is_visited_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let b_binary = dir.path().join("B.so").to_string_lossy().into_owned();
        let c_binary = dir.path().join("C.so");
        // Two rules both name C; its file must still load exactly once.
        write_rules(
            dir.path(),
            "B.nxpt",
            &format!(
                "[TransferRule_0]\nSourcePlugin=B\nSourceInterface=g\nSourceParamIndex=0\n\
                 TargetPlugin=C\nTargetPluginPath={path}\nTargetInterface=h\nTargetParamIndex=0\n\
                 [TransferRule_1]\nSourcePlugin=B\nSourceInterface=g\nSourceParamIndex=1\n\
                 TargetPlugin=C\nTargetPluginPath={path}\nTargetInterface=h\nTargetParamIndex=1\n",
                path = c_binary.display()
            ),
        );
        write_rules(
            dir.path(),
            "C.nxpt",
            "[TransferRule_0]\nSourcePlugin=C\nSourceInterface=h\nSourceParamIndex=-1\n",
        );

        let mut ctx = test_context();
        chain_load(&mut ctx, "B", &b_binary).unwrap();
        assert_eq!(ctx.rules.len(), 3);

        // Loading B again is a no-op on the tracker and does not duplicate rules.
        chain_load(&mut ctx, "B", &b_binary).unwrap();
        assert_eq!(ctx.rules.len(), 3);
        assert_eq!(ctx.tracker.len(), 2);
    }

    #[test]
    fn reference_cycles_terminate_with_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let a_binary = dir.path().join("A.so");
        let b_binary = dir.path().join("B.so");
        write_rules(
            dir.path(),
            "A.nxpt",
            &format!(
                "[TransferRule_0]\nSourcePlugin=A\nSourceInterface=f\nSourceParamIndex=0\n\
                 TargetPlugin=B\nTargetPluginPath={}\nTargetInterface=g\nTargetParamIndex=0\n",
                b_binary.display()
            ),
        );
        write_rules(
            dir.path(),
            "B.nxpt",
            &format!(
                "[TransferRule_0]\nSourcePlugin=B\nSourceInterface=g\nSourceParamIndex=0\n\
                 TargetPlugin=A\nTargetPluginPath={}\nTargetInterface=f\nTargetParamIndex=0\n",
                a_binary.display()
            ),
        );

        let mut ctx = test_context();
        chain_load(&mut ctx, "A", &a_binary.to_string_lossy()).unwrap();

        // Both files load exactly once; the back-reference is cut by the tracker/stack.
        assert!(ctx.tracker.is_loaded("A"));
        assert!(ctx.tracker.is_loaded("B"));
        assert_eq!(ctx.rules.len(), 2);
    }

    #[test]
    fn missing_rule_file_does_not_mark_the_tracker() {
        let mut ctx = test_context();
        assert!(chain_load(&mut ctx, "Ghost", "./nonexistent/ghost.so").is_err());
        assert!(!ctx.tracker.is_loaded("Ghost"));
    }
}
