//! Pure diff between the desired and previously applied rule sets.
//!
//! Entries are matched by rule identity (value and kind) and, where that
//! differs, by the remote rule name they are stored under: two rules that
//! share a name can never both exist.

use crate::rules::{RuleNameCodec, RuleSpec};

/// Lifecycle of a single rule entry within a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Not yet classified
    #[default]
    Unknown,
    /// Desired but not previously applied
    ToCreate,
    /// Desired and previously applied
    Existing,
    /// Previously applied but no longer desired
    ToDelete,
    /// Present remotely with a filter that needs rewriting
    ToRepair,
    /// Previously applied, but its rule name now belongs to a desired rule
    Superseded,
}

/// One classified entry of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub rule: RuleSpec,
    pub state: EntryState,
    /// Previously applied rule stored under the same rule name.
    ///
    /// Set when the kind changed, or when a different value maps to the same
    /// name. The remote rule is taken over rather than deleted.
    pub replaces: Option<RuleSpec>,
}

/// Ordered work for one pass: creates, then takeovers, then deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub entries: Vec<PlannedEntry>,
}

impl ReconcilePlan {
    /// New rules, excluding kind changes.
    pub fn creates(&self) -> impl Iterator<Item = &RuleSpec> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::ToCreate && e.replaces.is_none())
            .map(|e| &e.rule)
    }

    /// Takeovers of a previously applied rule's name, as `(old, new)` pairs.
    pub fn replacements(&self) -> impl Iterator<Item = (&RuleSpec, &RuleSpec)> {
        self.entries
            .iter()
            .filter_map(|e| e.replaces.as_ref().map(|old| (old, &e.rule)))
    }

    pub fn deletes(&self) -> impl Iterator<Item = &RuleSpec> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::ToDelete)
            .map(|e| &e.rule)
    }

    /// Previously applied rules whose name is held by a takeover.
    pub fn superseded(&self) -> impl Iterator<Item = &RuleSpec> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Superseded)
            .map(|e| &e.rule)
    }

    pub fn unchanged(&self) -> impl Iterator<Item = &RuleSpec> {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Existing)
            .map(|e| &e.rule)
    }

    /// Whether the pass needs any mutation.
    pub fn is_noop(&self) -> bool {
        self.entries.iter().all(|e| e.state == EntryState::Existing)
    }
}

/// Classify every entry of `desired` and `previous`.
///
/// Repeated entries share one remote rule and are planned once. A previous
/// entry is never planned for deletion while a desired entry needs its rule
/// name. Entries keep their input order within each group.
pub fn compute_plan(
    desired: &[RuleSpec],
    previous: &[RuleSpec],
    codec: &RuleNameCodec,
) -> ReconcilePlan {
    let mut entries: Vec<PlannedEntry> = Vec::new();
    let mut desired_names: Vec<String> = Vec::new();
    let mut claimed: Vec<&RuleSpec> = Vec::new();

    for rule in desired {
        if entries.iter().any(|e| &e.rule == rule) {
            continue;
        }
        let name = codec.encode(rule.value());

        let state = if previous.contains(rule) {
            EntryState::Existing
        } else {
            EntryState::ToCreate
        };
        let replaces = if state == EntryState::ToCreate {
            previous
                .iter()
                .filter(|p| !desired.contains(*p) && !claimed.contains(p))
                .find(|p| codec.encode(p.value()) == name)
        } else {
            None
        };
        if let Some(old) = replaces {
            claimed.push(old);
        }

        desired_names.push(name);
        entries.push(PlannedEntry {
            rule: rule.clone(),
            state,
            replaces: replaces.cloned(),
        });
    }

    let mut removed: Vec<&RuleSpec> = Vec::new();
    for rule in previous {
        if desired.contains(rule) || removed.contains(&rule) {
            continue;
        }
        removed.push(rule);
        if claimed.contains(&rule) {
            continue;
        }

        let state = if desired_names.contains(&codec.encode(rule.value())) {
            EntryState::Superseded
        } else {
            EntryState::ToDelete
        };
        entries.push(PlannedEntry {
            rule: rule.clone(),
            state,
            replaces: None,
        });
    }

    ReconcilePlan { entries }
}
