//! History stack
//!
//! The ordered, replayable list of edit steps for one image. Items are
//! applied in ascending `num`; only items with `num < end` are active.
//! Items past `end` are redo information and are discarded by the next
//! new edit.

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::Hasher;

/// One edit step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub num: u32,
    pub operation: String,
    pub module_version: u32,
    pub enabled: bool,
    pub params: Vec<u8>,
    #[serde(default)]
    pub blend_params: Vec<u8>,
    #[serde(default)]
    pub blend_version: u32,
    #[serde(default)]
    pub multi_priority: u32,
    #[serde(default)]
    pub multi_name: String,
}

/// Identity of a module instance: operation plus multi-instance priority.
pub type InstanceKey<'a> = (&'a str, u32);

impl HistoryItem {
    pub fn instance(&self) -> InstanceKey<'_> {
        (self.operation.as_str(), self.multi_priority)
    }

    pub fn is_instance(&self, operation: &str, multi_priority: u32) -> bool {
        self.operation == operation && self.multi_priority == multi_priority
    }

    /// Display label: operation plus instance name when there is one.
    pub fn label(&self) -> String {
        if self.multi_name.is_empty() {
            self.operation.clone()
        } else {
            format!("{} {}", self.operation, self.multi_name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStack {
    items: Vec<HistoryItem>,
    #[serde(rename = "history_end")]
    end: usize,
}

impl HistoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a stack from stored items. Items are ordered by `num` and
    /// renumbered densely; `end` is clamped to the item count.
    pub fn from_items(mut items: Vec<HistoryItem>, end: usize) -> Self {
        items.sort_by_key(|item| item.num);
        for (i, item) in items.iter_mut().enumerate() {
            item.num = i as u32;
        }
        let end = end.min(items.len());
        HistoryStack { items, end }
    }

    pub fn items(&self) -> &[HistoryItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Move the end marker, keeping redo items.
    pub fn set_end(&mut self, end: usize) {
        self.end = end.min(self.items.len());
    }

    pub fn active(&self) -> &[HistoryItem] {
        &self.items[..self.end]
    }

    /// Drop every item at or past `end`.
    pub fn truncate(&mut self) {
        self.items.truncate(self.end);
    }

    /// Discard redo items and append `item` as the new top. Returns its `num`.
    pub fn push(&mut self, mut item: HistoryItem) -> u32 {
        self.truncate();
        item.num = self.items.len() as u32;
        self.items.push(item);
        self.end = self.items.len();
        self.end as u32 - 1
    }

    /// Topmost active item.
    pub fn top(&self) -> Option<&HistoryItem> {
        self.end.checked_sub(1).and_then(|i| self.items.get(i))
    }

    pub fn top_mut(&mut self) -> Option<&mut HistoryItem> {
        match self.end.checked_sub(1) {
            Some(i) => self.items.get_mut(i),
            None => None,
        }
    }

    /// Most recent active item for a module instance.
    pub fn last_for(&self, operation: &str, multi_priority: u32) -> Option<&HistoryItem> {
        self.active().iter().rev().find(|item| item.is_instance(operation, multi_priority))
    }

    /// Winning active item per module instance, ordered by the winner's `num`.
    pub fn resolve(&self) -> Vec<&HistoryItem> {
        let mut winners: HashMap<InstanceKey<'_>, &HistoryItem> = HashMap::new();
        for item in self.active() {
            winners.insert(item.instance(), item);
        }
        let mut resolved: Vec<&HistoryItem> = winners.into_values().collect();
        resolved.sort_by_key(|item| item.num);
        resolved
    }

    /// Keep only the newest active item per module instance and drop redo
    /// items.
    pub fn compress(&mut self) {
        let kept: Vec<HistoryItem> = self.resolve().into_iter().cloned().collect();
        *self = HistoryStack::from_items(kept, usize::MAX);
    }

    /// Hash of what the stack renders: the enabled winning items.
    pub fn hash(&self) -> u64 {
        let mut hasher = SipHasher13::new();
        for item in self.resolve().into_iter().filter(|item| item.enabled) {
            hasher.write(item.operation.as_bytes());
            hasher.write_u32(item.multi_priority);
            hasher.write_u32(item.module_version);
            hasher.write_usize(item.params.len());
            hasher.write(&item.params);
            hasher.write_usize(item.blend_params.len());
            hasher.write(&item.blend_params);
        }
        hasher.finish()
    }

    /// One line per item, newest first: `●` enabled, `○` disabled.
    pub fn items_as_string(&self) -> String {
        self.items
            .iter()
            .rev()
            .map(|item| format!("{} {}", if item.enabled { "●" } else { "○" }, item.label()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Stored hashes used to tell untouched, auto-applied and user-edited
/// histories apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryHash {
    /// Empty history
    pub basic: Option<u64>,
    /// History right after auto-presets were applied
    pub auto: Option<u64>,
    pub current: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    Basic,
    Auto,
    Altered,
}

impl HistoryHash {
    pub fn status(&self) -> HistoryStatus {
        if self.basic == Some(self.current) {
            HistoryStatus::Basic
        } else if self.auto == Some(self.current) {
            HistoryStatus::Auto
        } else {
            HistoryStatus::Altered
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn item(operation: &str, enabled: bool, params: &[u8]) -> HistoryItem {
        HistoryItem {
            num: 0,
            operation: operation.to_string(),
            module_version: 1,
            enabled,
            params: params.to_vec(),
            blend_params: Vec::new(),
            blend_version: 0,
            multi_priority: 0,
            multi_name: String::new(),
        }
    }

    #[test]
    fn test_push_discards_redo() {
        let mut stack = HistoryStack::new();
        stack.push(item("crop", true, &[1]));
        stack.push(item("exposure", true, &[2]));
        stack.push(item("levels", true, &[3]));
        stack.set_end(1);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.active().len(), 1);

        let num = stack.push(item("shadhi", true, &[4]));
        assert_eq!(num, 1);
        assert_eq!(stack.len(), 2);
        assert!(stack.items().iter().all(|i| i.operation != "exposure"));
    }

    #[test]
    fn test_resolve_orders_by_winning_num() {
        let mut stack = HistoryStack::new();
        stack.push(item("crop", true, &[1]));
        stack.push(item("exposure", true, &[2]));
        stack.push(item("exposure", false, &[2]));
        stack.push(item("exposure", true, &[4]));

        let resolved = stack.resolve();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].operation, "crop");
        assert_eq!(resolved[1].operation, "exposure");
        assert_eq!(resolved[1].num, 3);
        assert_eq!(resolved[1].params, vec![4]);
    }

    #[test]
    fn test_multi_instances_are_distinct() {
        let mut stack = HistoryStack::new();
        stack.push(item("exposure", true, &[1]));
        let mut second = item("exposure", true, &[2]);
        second.multi_priority = 1;
        second.multi_name = "2".into();
        stack.push(second);
        assert_eq!(stack.resolve().len(), 2);
        assert!(stack.last_for("exposure", 1).is_some());
    }

    #[test]
    fn test_compress() {
        let mut stack = HistoryStack::new();
        stack.push(item("exposure", true, &[1]));
        stack.push(item("crop", true, &[2]));
        stack.push(item("exposure", true, &[3]));
        stack.push(item("levels", true, &[4]));
        stack.set_end(3);
        let hash = stack.hash();

        stack.compress();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.end(), 2);
        assert_eq!(stack.items()[0].operation, "crop");
        assert_eq!(stack.items()[1].params, vec![3]);
        assert_eq!(stack.items()[1].num, 1);
        assert_eq!(stack.hash(), hash);
    }

    #[test]
    fn test_hash_ignores_disabled_and_superseded() {
        let mut a = HistoryStack::new();
        a.push(item("exposure", true, &[1]));

        let mut b = HistoryStack::new();
        b.push(item("exposure", true, &[9]));
        b.push(item("levels", false, &[5]));
        b.push(item("exposure", true, &[1]));

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), HistoryStack::new().hash());
    }

    #[test]
    fn test_items_as_string() {
        let mut stack = HistoryStack::new();
        stack.push(item("exposure", true, &[1]));
        let mut second = item("exposure", false, &[2]);
        second.multi_priority = 1;
        second.multi_name = "skin".into();
        stack.push(second);
        assert_eq!(stack.items_as_string(), "○ exposure skin\n● exposure");
    }

    #[test]
    fn test_history_status() {
        let hash = HistoryHash {
            basic: Some(1),
            auto: Some(2),
            current: 2,
        };
        assert_eq!(hash.status(), HistoryStatus::Auto);
        assert_eq!(HistoryHash { current: 1, ..hash }.status(), HistoryStatus::Basic);
        assert_eq!(HistoryHash { current: 3, ..hash }.status(), HistoryStatus::Altered);
    }

    #[test]
    fn test_sidecar_json() {
        let mut stack = HistoryStack::new();
        stack.push(item("exposure", true, &[0, 0, 128, 63]));
        let json = serde_json::to_string(&stack).unwrap();
        assert!(json.contains("history_end"));
        let parsed: HistoryStack = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stack);
    }
}
