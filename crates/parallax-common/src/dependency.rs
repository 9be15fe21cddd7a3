//! Dependency predicates for task admission.
//!
//! A [`Dependency`] watches a set of msg_ids. A task carrying one may only
//! run once the predicate is met, and is failed outright once it becomes
//! unreachable.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::protocol::message::MsgId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyMode {
    /// Every watched id must finish.
    #[default]
    All,
    /// One watched id finishing is enough.
    Any,
}

/// A set of msg_ids plus how they must finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub ids: BTreeSet<MsgId>,
    #[serde(default)]
    pub mode: DependencyMode,
    /// Only successful completions count.
    #[serde(default = "default_success_only")]
    pub success_only: bool,
}

fn default_success_only() -> bool {
    true
}

impl Default for Dependency {
    fn default() -> Self {
        Self {
            ids: BTreeSet::new(),
            mode: DependencyMode::All,
            success_only: true,
        }
    }
}

impl Dependency {
    pub fn new<I, S>(ids: I, mode: DependencyMode, success_only: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MsgId>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            mode,
            success_only,
        }
    }

    /// Every id must succeed.
    pub fn all<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MsgId>,
    {
        Self::new(ids, DependencyMode::All, true)
    }

    /// Any one id must succeed.
    pub fn any<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MsgId>,
    {
        Self::new(ids, DependencyMode::Any, true)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the dependency is met.
    ///
    /// Failed ids count as finished unless `success_only` is set.
    pub fn check(&self, completed: &HashSet<MsgId>, failed: &HashSet<MsgId>) -> bool {
        if self.ids.is_empty() {
            return true;
        }
        let done = |id: &MsgId| completed.contains(id) || (!self.success_only && failed.contains(id));
        match self.mode {
            DependencyMode::All => self.ids.iter().all(done),
            DependencyMode::Any => self.ids.iter().any(done),
        }
    }

    /// Whether the dependency can never be met given the failures so far.
    pub fn unreachable(&self, failed: &HashSet<MsgId>) -> bool {
        if self.ids.is_empty() || !self.success_only || failed.is_empty() {
            return false;
        }
        match self.mode {
            DependencyMode::All => self.ids.iter().any(|id| failed.contains(id)),
            DependencyMode::Any => self.ids.iter().all(|id| failed.contains(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> HashSet<MsgId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_dependency_always_met() {
        let dep = Dependency::default();
        assert!(dep.check(&set(&[]), &set(&[])));
        assert!(!dep.unreachable(&set(&["a"])));

        let any = Dependency::new(Vec::<String>::new(), DependencyMode::Any, false);
        assert!(any.check(&set(&[]), &set(&[])));
    }

    #[test]
    fn test_all_success_only_is_subset_of_completed() {
        let dep = Dependency::all(["a", "b"]);
        assert!(!dep.check(&set(&["a"]), &set(&[])));
        assert!(dep.check(&set(&["a", "b", "c"]), &set(&[])));
        assert!(!dep.check(&set(&["a"]), &set(&["b"])));
    }

    #[test]
    fn test_all_counting_failures() {
        let dep = Dependency::new(["a", "b"], DependencyMode::All, false);
        assert!(dep.check(&set(&["a"]), &set(&["b"])));
        assert!(!dep.unreachable(&set(&["a", "b"])));
    }

    #[test]
    fn test_any_modes() {
        let strict = Dependency::any(["a", "b"]);
        assert!(strict.check(&set(&["b"]), &set(&[])));
        assert!(!strict.check(&set(&[]), &set(&["a"])));

        let lenient = Dependency::new(["a", "b"], DependencyMode::Any, false);
        assert!(lenient.check(&set(&[]), &set(&["a"])));
        assert!(!lenient.check(&set(&["c"]), &set(&["d"])));
    }

    #[test]
    fn test_all_unreachable_on_first_failure() {
        let dep = Dependency::all(["a", "b"]);
        assert!(!dep.unreachable(&set(&[])));
        assert!(dep.unreachable(&set(&["a"])));
    }

    #[test]
    fn test_any_unreachable_only_when_all_failed() {
        let dep = Dependency::any(["a", "b"]);
        assert!(!dep.unreachable(&set(&["a"])));
        assert!(dep.unreachable(&set(&["a", "b"])));
    }

    #[test]
    fn test_wire_defaults() {
        let dep: Dependency = serde_json::from_str(r#"{"ids": ["x"]}"#).unwrap();
        assert_eq!(dep.mode, DependencyMode::All);
        assert!(dep.success_only);

        let json = serde_json::to_value(Dependency::any(["y"])).unwrap();
        assert_eq!(json["mode"], "any");
    }
}
