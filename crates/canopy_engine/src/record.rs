//! The per-path reconciliation state machine.
//!
//! Each path with data has one record merging two sources of truth: the
//! last value confirmed by the server (`synced`) and an optional local
//! mutation not yet confirmed (`pending`). The effective value seen by
//! callers is the pending value when one exists, else the synced value.
//!
//! Transitions here are pure and synchronous; persistence and write
//! dispatch are side effects owned by the facade, driven by the actions
//! these methods return. The facade must run transitions under the store
//! lock so a local edit and a remote sync never interleave mid-transition.

use canopy_protocol::Blob;

/// Classification of a pending local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// No pending change (equivalent to an absent pending entry).
    None,
    /// The path had no synced value; a pending value creates it.
    Create,
    /// The path had a synced value; the pending value differs.
    Update,
    /// The pending change is an explicit deletion.
    Delete,
}

impl ChangeKind {
    /// Stable string form used in persisted records.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(Self::None),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A local mutation not yet confirmed by the server.
///
/// `blob = None` represents a pending deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    /// The value being pushed, or `None` for a deletion.
    pub blob: Option<Blob>,
    /// How the change relates to the synced value at creation time.
    pub kind: ChangeKind,
}

/// Side effect requested by a remote sync transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// No side effect beyond persisting the new state.
    None,
    /// The pending write must be submitted again (the server has not seen
    /// it yet).
    Reissue,
    /// The record is fully cleared: release its short key and remove its
    /// storage entries.
    DeleteRecord,
}

/// Result of applying a local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApply {
    /// Whether the effective value changed.
    pub changed: bool,
    /// Whether a write must be scheduled for the new pending value.
    pub schedule_write: bool,
}

/// Result of applying a remote sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteApply {
    /// Whether the effective value changed.
    pub changed: bool,
    /// Side effect the facade must perform.
    pub action: SyncAction,
}

/// The reconciliation state for one path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordState {
    /// Last value confirmed by the server, or `None` if the server has no
    /// value (or the path never synced).
    pub synced: Option<Blob>,
    /// A local mutation awaiting confirmation.
    pub pending: Option<PendingChange>,
}

impl RecordState {
    /// Creates a record from persisted parts.
    #[must_use]
    pub fn new(synced: Option<Blob>, pending: Option<PendingChange>) -> Self {
        Self { synced, pending }
    }

    /// The value callers observe: the pending value when a pending change
    /// exists, else the synced value.
    #[must_use]
    pub fn effective_value(&self) -> Option<&Blob> {
        match &self.pending {
            Some(pending) => pending.blob.as_ref(),
            None => self.synced.as_ref(),
        }
    }

    /// True when the record holds no data at all. Such a record must not
    /// stay materialized: its short key is released.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.synced.is_none() && self.pending.is_none()
    }

    /// Applies a caller mutation. `new_blob = None` is a deletion.
    pub fn apply_local_change(&mut self, new_blob: Option<Blob>) -> LocalApply {
        let before = self.effective_value().cloned();

        if self.synced.is_none() {
            if new_blob.is_none() {
                // Nothing synced and nothing to create; drop any pending.
                self.pending = None;
                return LocalApply {
                    changed: before.is_some(),
                    schedule_write: false,
                };
            }
            let changed = before != new_blob;
            self.pending = Some(PendingChange {
                blob: new_blob,
                kind: ChangeKind::Create,
            });
            return LocalApply {
                changed,
                schedule_write: true,
            };
        }

        if before != new_blob {
            let kind = if new_blob.is_none() {
                ChangeKind::Delete
            } else {
                ChangeKind::Update
            };
            self.pending = Some(PendingChange {
                blob: new_blob,
                kind,
            });
            return LocalApply {
                changed: true,
                schedule_write: true,
            };
        }

        if new_blob.is_none() {
            // Explicit delete matching the current effective-null state:
            // push the delete again in case it never reached the server.
            return LocalApply {
                changed: false,
                schedule_write: true,
            };
        }

        LocalApply {
            changed: false,
            schedule_write: false,
        }
    }

    /// Applies an authoritative value pushed by the server.
    pub fn apply_remote_sync(&mut self, new_synced: Option<Blob>) -> RemoteApply {
        let before = self.effective_value().cloned();

        let action = match &self.pending {
            None => {
                if new_synced.is_none() {
                    self.synced = None;
                    SyncAction::DeleteRecord
                } else {
                    self.synced = new_synced;
                    SyncAction::None
                }
            }
            Some(pending) if pending.blob == new_synced => {
                // The server has caught up to the local edit: converge.
                let confirmed_absent = new_synced.is_none();
                self.synced = new_synced;
                self.pending = None;
                if confirmed_absent {
                    SyncAction::DeleteRecord
                } else {
                    SyncAction::None
                }
            }
            Some(pending) => match pending.kind {
                ChangeKind::Create => {
                    if new_synced.is_none() {
                        // The server has not seen the create yet.
                        SyncAction::Reissue
                    } else {
                        // A different authoritative value supersedes the
                        // local create.
                        self.synced = new_synced;
                        self.pending = None;
                        SyncAction::None
                    }
                }
                ChangeKind::Update => {
                    if new_synced.is_none() {
                        // Deleted remotely while an update was pending:
                        // delete locally too.
                        self.synced = None;
                        self.pending = None;
                        SyncAction::DeleteRecord
                    } else if self.synced == new_synced {
                        // Base value unchanged: the update has not landed.
                        SyncAction::Reissue
                    } else {
                        self.synced = new_synced;
                        self.pending = None;
                        SyncAction::None
                    }
                }
                ChangeKind::Delete => {
                    // A pending delete has `blob = None`, so a remote
                    // `None` is handled by the convergence arm above.
                    if self.synced == new_synced {
                        // Delete not yet applied remotely.
                        SyncAction::Reissue
                    } else {
                        // A newer remote value supersedes the delete.
                        self.synced = new_synced;
                        self.pending = None;
                        SyncAction::None
                    }
                }
                ChangeKind::None => {
                    self.synced = new_synced;
                    self.pending = None;
                    SyncAction::None
                }
            },
        };

        RemoteApply {
            changed: self.effective_value().cloned() != before,
            action,
        }
    }

    /// Drops the pending change without touching the synced value.
    ///
    /// The facade cancels any in-flight write task before calling this.
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(s: &str) -> Option<Blob> {
        Some(s.to_string())
    }

    #[test]
    fn effective_value_prefers_pending() {
        let mut state = RecordState::default();
        assert_eq!(state.effective_value(), None);

        state.synced = blob("a");
        assert_eq!(state.effective_value(), Some(&"a".to_string()));

        state.pending = Some(PendingChange {
            blob: blob("b"),
            kind: ChangeKind::Update,
        });
        assert_eq!(state.effective_value(), Some(&"b".to_string()));

        state.pending = Some(PendingChange {
            blob: None,
            kind: ChangeKind::Delete,
        });
        assert_eq!(state.effective_value(), None);
    }

    #[test]
    fn local_create_schedules_write() {
        let mut state = RecordState::default();
        let result = state.apply_local_change(blob("1"));
        assert!(result.changed);
        assert!(result.schedule_write);
        assert_eq!(
            state.pending,
            Some(PendingChange {
                blob: blob("1"),
                kind: ChangeKind::Create
            })
        );
    }

    #[test]
    fn local_delete_of_nothing_is_noop() {
        let mut state = RecordState::default();
        let result = state.apply_local_change(None);
        assert!(!result.changed);
        assert!(!result.schedule_write);
        assert!(state.is_empty());
    }

    #[test]
    fn local_delete_of_pending_create_clears() {
        let mut state = RecordState::default();
        state.apply_local_change(blob("1"));
        let result = state.apply_local_change(None);
        assert!(result.changed);
        assert!(!result.schedule_write);
        assert!(state.is_empty());
    }

    #[test]
    fn local_update_over_synced() {
        let mut state = RecordState::new(blob("a"), None);
        let result = state.apply_local_change(blob("b"));
        assert!(result.changed);
        assert!(result.schedule_write);
        assert_eq!(state.pending.as_ref().unwrap().kind, ChangeKind::Update);
        assert_eq!(state.effective_value(), Some(&"b".to_string()));
        assert_eq!(state.synced, blob("a"));
    }

    #[test]
    fn local_delete_over_synced() {
        let mut state = RecordState::new(blob("a"), None);
        let result = state.apply_local_change(None);
        assert!(result.changed);
        assert!(result.schedule_write);
        assert_eq!(state.pending.as_ref().unwrap().kind, ChangeKind::Delete);
        assert_eq!(state.effective_value(), None);
    }

    #[test]
    fn local_repeat_delete_reschedules_write() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(None);
        // Same delete again: unchanged, but the push is re-scheduled in
        // case the server never saw it.
        let result = state.apply_local_change(None);
        assert!(!result.changed);
        assert!(result.schedule_write);
    }

    #[test]
    fn local_idempotent_same_value() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(blob("b"));
        let result = state.apply_local_change(blob("b"));
        assert!(!result.changed);
    }

    #[test]
    fn remote_sync_without_pending_adopts() {
        let mut state = RecordState::default();
        let result = state.apply_remote_sync(blob("a"));
        assert!(result.changed);
        assert_eq!(result.action, SyncAction::None);
        assert_eq!(state.synced, blob("a"));

        let result = state.apply_remote_sync(blob("a"));
        assert!(!result.changed);
    }

    #[test]
    fn remote_delete_without_pending_removes_record() {
        let mut state = RecordState::new(blob("a"), None);
        let result = state.apply_remote_sync(None);
        assert!(result.changed);
        assert_eq!(result.action, SyncAction::DeleteRecord);
        assert!(state.is_empty());
    }

    #[test]
    fn remote_echo_converges() {
        let mut state = RecordState::default();
        state.apply_local_change(blob("1"));
        let result = state.apply_remote_sync(blob("1"));
        assert!(!result.changed);
        assert_eq!(result.action, SyncAction::None);
        assert_eq!(state.synced, blob("1"));
        assert_eq!(state.pending, None);
    }

    #[test]
    fn remote_none_with_pending_create_reissues() {
        let mut state = RecordState::default();
        state.apply_local_change(blob("1"));
        let result = state.apply_remote_sync(None);
        assert!(!result.changed);
        assert_eq!(result.action, SyncAction::Reissue);
        assert_eq!(state.pending.as_ref().unwrap().kind, ChangeKind::Create);
    }

    #[test]
    fn remote_value_supersedes_pending_create() {
        let mut state = RecordState::default();
        state.apply_local_change(blob("1"));
        let result = state.apply_remote_sync(blob("9"));
        assert!(result.changed);
        assert_eq!(result.action, SyncAction::None);
        assert_eq!(state.synced, blob("9"));
        assert_eq!(state.pending, None);
    }

    #[test]
    fn remote_delete_during_pending_update_deletes_locally() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(blob("b"));
        let result = state.apply_remote_sync(None);
        assert!(result.changed);
        assert_eq!(result.action, SyncAction::DeleteRecord);
        assert!(state.is_empty());
    }

    #[test]
    fn remote_unchanged_base_reissues_pending_update() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(blob("b"));
        let result = state.apply_remote_sync(blob("a"));
        assert!(!result.changed);
        assert_eq!(result.action, SyncAction::Reissue);
        assert_eq!(state.effective_value(), Some(&"b".to_string()));
    }

    #[test]
    fn remote_new_value_supersedes_pending_update() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(blob("b"));
        let result = state.apply_remote_sync(blob("c"));
        assert!(result.changed);
        assert_eq!(result.action, SyncAction::None);
        assert_eq!(state.synced, blob("c"));
        assert_eq!(state.pending, None);
    }

    #[test]
    fn remote_confirms_pending_delete() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(None);
        let result = state.apply_remote_sync(None);
        assert!(!result.changed);
        assert_eq!(result.action, SyncAction::DeleteRecord);
        assert!(state.is_empty());
    }

    #[test]
    fn remote_unchanged_base_reissues_pending_delete() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(None);
        let result = state.apply_remote_sync(blob("a"));
        assert!(!result.changed);
        assert_eq!(result.action, SyncAction::Reissue);
        assert_eq!(state.effective_value(), None);
    }

    #[test]
    fn remote_new_value_supersedes_pending_delete() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(None);
        let result = state.apply_remote_sync(blob("c"));
        assert!(result.changed);
        assert_eq!(result.action, SyncAction::None);
        assert_eq!(state.effective_value(), Some(&"c".to_string()));
        assert_eq!(state.pending, None);
    }

    #[test]
    fn clear_pending_keeps_synced() {
        let mut state = RecordState::new(blob("a"), None);
        state.apply_local_change(blob("b"));
        state.clear_pending();
        assert_eq!(state.effective_value(), Some(&"a".to_string()));
        assert_eq!(state.pending, None);
    }

    #[test]
    fn change_kind_string_roundtrip() {
        for kind in [
            ChangeKind::None,
            ChangeKind::Create,
            ChangeKind::Update,
            ChangeKind::Delete,
        ] {
            assert_eq!(ChangeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChangeKind::parse("bogus"), None);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Local(Option<u8>),
            Remote(Option<u8>),
        }

        fn arb_op() -> impl Strategy<Value = Op> {
            prop_oneof![
                proptest::option::of(0u8..4).prop_map(Op::Local),
                proptest::option::of(0u8..4).prop_map(Op::Remote),
            ]
        }

        fn as_blob(v: Option<u8>) -> Option<Blob> {
            v.map(|n| n.to_string())
        }

        fn apply(state: &mut RecordState, op: &Op) {
            match op {
                Op::Local(v) => {
                    state.apply_local_change(as_blob(*v));
                }
                Op::Remote(v) => {
                    let result = state.apply_remote_sync(as_blob(*v));
                    if result.action == SyncAction::DeleteRecord {
                        // The facade would tear the record down.
                        *state = RecordState::default();
                    }
                }
            }
        }

        proptest! {
            #[test]
            fn effective_value_invariant(ops in proptest::collection::vec(arb_op(), 0..40)) {
                let mut state = RecordState::default();
                for op in &ops {
                    apply(&mut state, op);
                    // The effective value is the pending blob when a
                    // pending change exists, else the synced value.
                    let expected = match &state.pending {
                        Some(p) => p.blob.clone(),
                        None => state.synced.clone(),
                    };
                    prop_assert_eq!(state.effective_value().cloned(), expected);
                    // A delete-kind pending change always holds no blob.
                    if let Some(p) = &state.pending {
                        if p.kind == ChangeKind::Delete {
                            prop_assert_eq!(p.blob.clone(), None);
                        }
                    }
                }
            }

            #[test]
            fn repeated_ops_are_idempotent(
                ops in proptest::collection::vec(arb_op(), 0..20),
                last in arb_op(),
            ) {
                let mut state = RecordState::default();
                for op in &ops {
                    apply(&mut state, op);
                }
                apply(&mut state, &last);
                let snapshot = state.clone();
                // Applying the same input again never changes the
                // effective value.
                match &last {
                    Op::Local(v) => {
                        let result = state.apply_local_change(as_blob(*v));
                        prop_assert!(!result.changed);
                    }
                    Op::Remote(v) => {
                        let result = state.apply_remote_sync(as_blob(*v));
                        if result.action == SyncAction::DeleteRecord {
                            state = RecordState::default();
                        }
                        prop_assert!(!result.changed);
                    }
                }
                prop_assert_eq!(
                    state.effective_value().cloned(),
                    snapshot.effective_value().cloned()
                );
            }
        }
    }
}
