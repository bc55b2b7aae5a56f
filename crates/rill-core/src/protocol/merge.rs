//! Operation coalescing
//!
//! One left-to-right pass over a pending operation list:
//! - UPDATEs to the same node fold into the first one (later keys win, removed
//!   keys are unioned, a later set cancels an earlier removal and vice versa)
//! - a DELETE drops every earlier UPDATE for its node and is emitted once
//! - UPDATEs that arrive after the node's DELETE are dropped, until a CREATE
//!   reuses the id
//! - everything else keeps its relative order

use rustc_hash::{FxHashMap, FxHashSet};

use super::{NodeId, Operation};

/// Stateless operation merger
#[derive(Debug, Default, Clone, Copy)]
pub struct OperationMerger;

impl OperationMerger {
    /// Coalesce redundant operations
    pub fn merge<V>(ops: Vec<Operation<V>>) -> Vec<Operation<V>> {
        let mut out: Vec<Option<Operation<V>>> = Vec::with_capacity(ops.len());
        let mut update_slot: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut deleted: FxHashSet<NodeId> = FxHashSet::default();

        for op in ops {
            match op {
                Operation::Update {
                    id,
                    props,
                    removed_prop_keys,
                } => {
                    if deleted.contains(&id) {
                        continue;
                    }
                    let Some(slot) = update_slot.get(&id).copied() else {
                        update_slot.insert(id, out.len());
                        out.push(Some(Operation::Update {
                            id,
                            props,
                            removed_prop_keys,
                        }));
                        continue;
                    };
                    if let Some(Operation::Update {
                        props: acc_props,
                        removed_prop_keys: acc_removed,
                        ..
                    }) = &mut out[slot]
                    {
                        // Same order the receiver applies one UPDATE in:
                        // props first, then removals.
                        for (key, value) in props {
                            acc_removed.retain(|k| k != &key);
                            acc_props.insert(key, value);
                        }
                        for key in removed_prop_keys {
                            acc_props.shift_remove(&key);
                            if !acc_removed.contains(&key) {
                                acc_removed.push(key);
                            }
                        }
                    }
                }
                Operation::Delete { id } => {
                    if let Some(slot) = update_slot.remove(&id) {
                        out[slot] = None;
                    }
                    if deleted.insert(id) {
                        out.push(Some(Operation::Delete { id }));
                    }
                }
                Operation::Create { id, node_type, props } => {
                    // A re-created id starts a fresh lifetime
                    deleted.remove(&id);
                    update_slot.remove(&id);
                    out.push(Some(Operation::Create { id, node_type, props }));
                }
                other => out.push(Some(other)),
            }
        }

        out.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Props;
    use crate::serialized::SerializedValue;

    fn update(id: NodeId, props: &[(&str, i32)], removed: &[&str]) -> Operation {
        Operation::Update {
            id,
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), SerializedValue::from(*v)))
                .collect::<Props>(),
            removed_prop_keys: removed.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_updates_then_delete_collapse_to_delete() {
        let merged = OperationMerger::merge(vec![
            update(1, &[("a", 1)], &[]),
            update(1, &[("b", 2)], &[]),
            Operation::Delete { id: 1 },
        ]);
        assert_eq!(merged, vec![Operation::Delete { id: 1 }]);
    }

    #[test]
    fn test_updates_to_different_nodes_are_kept() {
        let ops = vec![update(1, &[("a", 1)], &[]), update(2, &[("b", 2)], &[])];
        assert_eq!(OperationMerger::merge(ops.clone()), ops);
    }

    #[test]
    fn test_updates_fold_with_later_keys_winning() {
        let merged = OperationMerger::merge(vec![
            update(1, &[("a", 1), ("b", 1)], &[]),
            Operation::Append {
                id: 2,
                parent_id: 0,
                child_id: 2,
            },
            update(1, &[("a", 5)], &["b"]),
        ]);
        assert_eq!(
            merged,
            vec![
                update(1, &[("a", 5)], &["b"]),
                Operation::Append {
                    id: 2,
                    parent_id: 0,
                    child_id: 2
                },
            ]
        );
    }

    #[test]
    fn test_set_after_remove_cancels_removal() {
        let merged = OperationMerger::merge(vec![update(1, &[], &["a"]), update(1, &[("a", 3)], &[])]);
        assert_eq!(merged, vec![update(1, &[("a", 3)], &[])]);
    }

    #[test]
    fn test_delete_emitted_once_and_late_updates_dropped() {
        let merged = OperationMerger::merge(vec![
            Operation::Create {
                id: 1,
                node_type: "View".into(),
                props: Props::new(),
            },
            Operation::Delete { id: 1 },
            update(1, &[("a", 1)], &[]),
            Operation::Delete { id: 1 },
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], Operation::Delete { id: 1 });
    }

    #[test]
    fn test_recreated_id_starts_a_fresh_lifetime() {
        let create = || Operation::Create {
            id: 1,
            node_type: "View".into(),
            props: Props::new(),
        };
        let ops = vec![
            create(),
            Operation::Delete { id: 1 },
            create(),
            update(1, &[("a", 1)], &[]),
            Operation::Delete { id: 1 },
        ];
        let merged = OperationMerger::merge(ops.clone());
        assert_eq!(
            merged,
            vec![create(), Operation::Delete { id: 1 }, create(), Operation::Delete { id: 1 }]
        );

        let mut receiver = crate::receiver::Receiver::new();
        for op in &merged {
            receiver.apply(op).unwrap();
        }
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_update_after_recreate_folds_separately() {
        let merged = OperationMerger::merge(vec![
            Operation::Create {
                id: 1,
                node_type: "View".into(),
                props: Props::new(),
            },
            update(1, &[("a", 1)], &[]),
            Operation::Delete { id: 1 },
            Operation::Create {
                id: 1,
                node_type: "Text".into(),
                props: Props::new(),
            },
            update(1, &[("b", 2)], &[]),
        ]);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[3], update(1, &[("b", 2)], &[]));
    }

    #[test]
    fn test_structural_order_is_preserved() {
        let ops: Vec<Operation> = vec![
            Operation::Append {
                id: 2,
                parent_id: 1,
                child_id: 2,
            },
            Operation::Remove {
                parent_id: 1,
                child_id: 2,
            },
            Operation::Insert {
                id: 2,
                parent_id: 1,
                child_id: 2,
                index: 0,
            },
        ];
        assert_eq!(OperationMerger::merge(ops.clone()), ops);
    }
}
