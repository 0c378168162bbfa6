//! Per-dimension index from resource values to matchers.
//!
//! Values are indexed character by character up to their first wildcard;
//! a matcher whose value carries a wildcard remainder is recorded at the
//! cut-off node and collected along any lookup path passing through it.
//! Matchers whose resource does not populate the dimension at all are held
//! aside and returned for every lookup, so that intersecting lookups
//! across dimensions never drops them.
//!
//! The trie returns candidate sets: the matcher itself re-verifies every
//! candidate, so a lookup may over-approximate but must never miss an
//! indexed matcher.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{PolicyResource, ResourceDef};
use crate::resource::access::ResourceElementMatchingScope;
use crate::resource::matcher::ServiceResourceMatcher;

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    /// Matchers whose value ends exactly at this node.
    evaluators: Vec<Arc<ServiceResourceMatcher>>,
    /// Matchers whose value continues past this node with a wildcard.
    wildcard_evaluators: Vec<Arc<ServiceResourceMatcher>>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.evaluators.is_empty() && self.wildcard_evaluators.is_empty()
    }

    fn prune(&mut self) {
        for child in self.children.values_mut() {
            child.prune();
        }
        self.children.retain(|_, child| !child.is_empty());
        self.children.shrink_to_fit();
        self.evaluators.shrink_to_fit();
        self.wildcard_evaluators.shrink_to_fit();
    }

    fn collect_subtree(&self, out: &mut Vec<Arc<ServiceResourceMatcher>>) {
        out.extend(self.evaluators.iter().cloned());
        out.extend(self.wildcard_evaluators.iter().cloned());
        for child in self.children.values() {
            child.collect_subtree(out);
        }
    }
}

/// Prefix/wildcard index over one resource dimension.
///
/// `clone()` yields a structural copy suitable for copy-on-write updates;
/// after a batch of `add`/`delete` calls, `wrap_up_update` must run before
/// the trie is queried again.
#[derive(Debug, Clone)]
pub struct ResourceTrie {
    resource_name: String,
    ignore_case: bool,
    wildcards_enabled: bool,
    root: TrieNode,
    inherited_evaluators: Vec<Arc<ServiceResourceMatcher>>,
    dirty: bool,
}

impl ResourceTrie {
    /// Builds the index for `resource_def` over a batch of matchers, using
    /// each matcher's own value for this dimension.
    pub fn new(resource_def: &ResourceDef, matchers: &[Arc<ServiceResourceMatcher>]) -> Self {
        let mut trie = Self {
            resource_name: resource_def.name.clone(),
            ignore_case: resource_def.ignore_case,
            wildcards_enabled: resource_def.wildcards_enabled,
            root: TrieNode::default(),
            inherited_evaluators: Vec::new(),
            dirty: false,
        };

        for matcher in matchers {
            let policy_resource = matcher
                .service_resource()
                .resource_elements
                .get(&trie.resource_name);
            trie.add(policy_resource, matcher);
        }
        trie.wrap_up_update();

        trie
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Indexes `matcher` under the values of `policy_resource`. A missing
    /// or value-less policy resource indexes the matcher as inherited: it
    /// is a candidate for every lookup on this dimension.
    pub fn add(
        &mut self,
        policy_resource: Option<&PolicyResource>,
        matcher: &Arc<ServiceResourceMatcher>,
    ) {
        self.dirty = true;

        match policy_resource {
            Some(policy) if !policy.values.is_empty() => {
                for value in &policy.values {
                    self.add_value(value, matcher);
                }
            }
            _ => {
                if !contains(&self.inherited_evaluators, matcher) {
                    self.inherited_evaluators.push(Arc::clone(matcher));
                }
            }
        }
    }

    /// Removes one indexed entry; a no-op when the entry is not present.
    pub fn delete(
        &mut self,
        policy_resource: Option<&PolicyResource>,
        matcher: &Arc<ServiceResourceMatcher>,
    ) {
        self.dirty = true;

        match policy_resource {
            Some(policy) if !policy.values.is_empty() => {
                for value in &policy.values {
                    self.delete_value(value, matcher);
                }
            }
            _ => {
                self.inherited_evaluators
                    .retain(|existing| !Arc::ptr_eq(existing, matcher));
            }
        }
    }

    /// Finalizes a batch of mutations: prunes nodes emptied by deletions.
    pub fn wrap_up_update(&mut self) {
        self.root.prune();
        self.inherited_evaluators.shrink_to_fit();
        self.dirty = false;
    }

    /// Whether mutations are pending a `wrap_up_update`.
    pub fn needs_wrap_up(&self) -> bool {
        self.dirty
    }

    /// Returns the candidate matchers for one dimension value.
    pub fn get_evaluators_for_resource(
        &self,
        value: &str,
        scope: ResourceElementMatchingScope,
    ) -> Vec<Arc<ServiceResourceMatcher>> {
        let folded = self.fold(value);

        let mut found: Vec<Arc<ServiceResourceMatcher>> = self.inherited_evaluators.clone();
        let mut node = &self.root;
        found.extend(node.wildcard_evaluators.iter().cloned());

        let mut consumed_all = true;
        for ch in folded.chars() {
            match node.children.get(&ch) {
                Some(child) => {
                    node = child;
                    found.extend(node.wildcard_evaluators.iter().cloned());
                }
                None => {
                    consumed_all = false;
                    break;
                }
            }
        }

        if consumed_all {
            found.extend(node.evaluators.iter().cloned());

            // a broader element scope admits values the lookup value is a
            // prefix of, i.e. the whole subtree below the terminal node
            if scope != ResourceElementMatchingScope::SelfOnly {
                for child in node.children.values() {
                    child.collect_subtree(&mut found);
                }
            }
        }

        dedup_by_id(&mut found);
        found
    }

    fn add_value(&mut self, value: &str, matcher: &Arc<ServiceResourceMatcher>) {
        let folded = self.fold(value);
        let (prefix, has_wildcard) = self.split_at_wildcard(&folded);

        let mut node = &mut self.root;
        for ch in prefix.chars() {
            node = node.children.entry(ch).or_default();
        }

        let bucket = if has_wildcard {
            &mut node.wildcard_evaluators
        } else {
            &mut node.evaluators
        };
        if !contains(bucket, matcher) {
            bucket.push(Arc::clone(matcher));
        }
    }

    fn delete_value(&mut self, value: &str, matcher: &Arc<ServiceResourceMatcher>) {
        let folded = self.fold(value);
        let (prefix, has_wildcard) = self.split_at_wildcard(&folded);

        let mut node = &mut self.root;
        for ch in prefix.chars() {
            let Some(child) = node.children.get_mut(&ch) else {
                return;
            };
            node = child;
        }

        let bucket = if has_wildcard {
            &mut node.wildcard_evaluators
        } else {
            &mut node.evaluators
        };
        bucket.retain(|existing| !Arc::ptr_eq(existing, matcher));
    }

    fn fold(&self, value: &str) -> String {
        if self.ignore_case {
            value.to_lowercase()
        } else {
            value.to_string()
        }
    }

    /// Splits a value at its first wildcard character. With wildcards
    /// disabled for the dimension, the whole value is literal.
    fn split_at_wildcard<'a>(&self, value: &'a str) -> (&'a str, bool) {
        if !self.wildcards_enabled {
            return (value, false);
        }
        match value.find(['*', '?']) {
            Some(index) => (&value[..index], true),
            None => (value, false),
        }
    }
}

fn contains(bucket: &[Arc<ServiceResourceMatcher>], matcher: &Arc<ServiceResourceMatcher>) -> bool {
    bucket.iter().any(|existing| Arc::ptr_eq(existing, matcher))
}

fn dedup_by_id(found: &mut Vec<Arc<ServiceResourceMatcher>>) {
    let mut seen = std::collections::HashSet::new();
    found.retain(|matcher| seen.insert(matcher.resource_id()));
}
