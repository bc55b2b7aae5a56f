//! Host-side tree receiver
//!
//! Applies operation batches to an id-indexed node arena. Parents are stored
//! as ids, never as references, and the root (id 0) is implicit.
//!
//! Handle accounting: every `FunctionRef` stored in a node's props owns one
//! reference in the callback registry. Deleting a node releases the handles
//! of its whole subtree, children first. An UPDATE releases the handles of
//! every value it replaces or removes, and a skipped operation releases the
//! handles its own props carried.

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::rc::Rc;

use crate::protocol::{NodeId, Operation, OperationBatch, Props, PROTOCOL_VERSION, ROOT_ID};
use crate::registry::CallbackRegistry;
use crate::serialized::SerializedValue;

/// One replicated node
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverNode {
    /// Node id
    pub id: NodeId,
    /// Component type
    pub node_type: String,
    /// Current props
    pub props: Props,
    /// Ordered child ids
    pub children: Vec<NodeId>,
    /// Parent id (`Some(0)` when attached to the root)
    pub parent: Option<NodeId>,
}

/// Display-ready tree node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    /// Node id
    pub id: NodeId,
    /// Component type
    #[serde(rename = "type")]
    pub node_type: String,
    /// Props
    pub props: Props,
    /// Children in order
    pub children: Vec<TreeNode>,
}

/// Why an operation was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// CREATE for an id that already exists
    DuplicateNode(NodeId),
    /// Operation names a node that does not exist
    UnknownNode(NodeId),
    /// Parent does not exist
    UnknownParent(NodeId),
    /// REMOVE of a child that is not attached to that parent
    NotAChild {
        /// Parent named by the operation
        parent: NodeId,
        /// Child named by the operation
        child: NodeId,
    },
    /// Attaching would make a node its own ancestor
    WouldCycle(NodeId),
}

/// Outcome of applying one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Operations that changed the tree
    pub applied: usize,
    /// Operations skipped as soft failures
    pub ignored: usize,
}

/// Replicated node graph
#[derive(Debug, Default)]
pub struct Receiver {
    nodes: FxHashMap<NodeId, ReceiverNode>,
    root_children: Vec<NodeId>,
    registry: Option<Rc<CallbackRegistry>>,
    last_batch_id: Option<u64>,
}

impl Receiver {
    /// Receiver that does not track handles
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver that releases handles into `registry`
    pub fn with_registry(registry: Rc<CallbackRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::default()
        }
    }

    /// Apply a batch in order.
    ///
    /// Batches older than the last applied one and batches of another
    /// protocol version are rejected whole. Every skipped operation gives
    /// back the handle references its props carried across.
    pub fn apply_batch(&mut self, batch: &OperationBatch) -> ApplyReport {
        let mut report = ApplyReport::default();
        if batch.version != PROTOCOL_VERSION {
            tracing::error!(
                version = batch.version,
                batch_id = batch.batch_id,
                "rejecting batch with unsupported protocol version"
            );
            self.reject(batch, &mut report);
            return report;
        }
        if let Some(last) = self.last_batch_id {
            if batch.batch_id < last {
                tracing::warn!(batch_id = batch.batch_id, last, "rejecting out-of-order batch");
                self.reject(batch, &mut report);
                return report;
            }
        }
        self.last_batch_id = Some(batch.batch_id);

        for op in &batch.operations {
            match self.apply(op) {
                Ok(()) => report.applied += 1,
                Err(reason) => {
                    tracing::warn!(op = op.kind(), reason = ?reason, "operation skipped");
                    report.ignored += 1;
                }
            }
        }
        report
    }

    fn reject(&self, batch: &OperationBatch, report: &mut ApplyReport) {
        for op in &batch.operations {
            self.release_op(op);
        }
        report.ignored = batch.operations.len();
    }

    /// Apply one operation. A skipped operation releases its props' handles.
    pub fn apply(&mut self, op: &Operation) -> Result<(), SkipReason> {
        let result = self.apply_op(op);
        if result.is_err() {
            self.release_op(op);
        }
        result
    }

    fn apply_op(&mut self, op: &Operation) -> Result<(), SkipReason> {
        match op {
            Operation::Create { id, node_type, props } => {
                if self.nodes.contains_key(id) || *id == ROOT_ID {
                    return Err(SkipReason::DuplicateNode(*id));
                }
                self.nodes.insert(
                    *id,
                    ReceiverNode {
                        id: *id,
                        node_type: node_type.clone(),
                        props: props.clone(),
                        children: Vec::new(),
                        parent: None,
                    },
                );
                Ok(())
            }
            Operation::Update {
                id,
                props,
                removed_prop_keys,
            } => {
                let node = self.nodes.get_mut(id).ok_or(SkipReason::UnknownNode(*id))?;
                let mut dropped = Vec::new();
                for (key, value) in props {
                    // Each crossing holds its own reference, so the old value
                    // is released even when it is the same handle.
                    if let Some(old) = node.props.insert(key.clone(), value.clone()) {
                        dropped.push(old);
                    }
                }
                for key in removed_prop_keys {
                    if let Some(old) = node.props.shift_remove(key) {
                        dropped.push(old);
                    }
                }
                for value in &dropped {
                    self.release_value(value);
                }
                Ok(())
            }
            Operation::Delete { id } => {
                if !self.nodes.contains_key(id) {
                    return Err(SkipReason::UnknownNode(*id));
                }
                self.detach(*id);
                self.delete_subtree(*id);
                Ok(())
            }
            Operation::Append { parent_id, child_id, .. } => {
                self.check_attach(*parent_id, *child_id)?;
                self.detach(*child_id);
                self.children_mut(*parent_id).push(*child_id);
                self.set_parent(*child_id, Some(*parent_id));
                Ok(())
            }
            Operation::Insert {
                parent_id,
                child_id,
                index,
                ..
            } => {
                self.check_attach(*parent_id, *child_id)?;
                self.detach(*child_id);
                let children = self.children_mut(*parent_id);
                let at = (*index).min(children.len());
                children.insert(at, *child_id);
                self.set_parent(*child_id, Some(*parent_id));
                Ok(())
            }
            Operation::Remove { parent_id, child_id } => {
                let attached = self.nodes.get(child_id).and_then(|n| n.parent) == Some(*parent_id);
                if !attached {
                    return Err(SkipReason::NotAChild {
                        parent: *parent_id,
                        child: *child_id,
                    });
                }
                self.detach(*child_id);
                Ok(())
            }
        }
    }

    fn check_attach(&self, parent: NodeId, child: NodeId) -> Result<(), SkipReason> {
        if !self.nodes.contains_key(&child) {
            return Err(SkipReason::UnknownNode(child));
        }
        if parent != ROOT_ID && !self.nodes.contains_key(&parent) {
            return Err(SkipReason::UnknownParent(parent));
        }
        // Walk up from the parent; meeting the child means it is an ancestor.
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(SkipReason::WouldCycle(child));
            }
            if id == ROOT_ID {
                break;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        Ok(())
    }

    fn children_mut(&mut self, parent: NodeId) -> &mut Vec<NodeId> {
        if parent == ROOT_ID {
            return &mut self.root_children;
        }
        match self.nodes.get_mut(&parent) {
            Some(node) => &mut node.children,
            None => &mut self.root_children,
        }
    }

    fn set_parent(&mut self, child: NodeId, parent: Option<NodeId>) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = parent;
        }
    }

    /// Unlink a node from its parent's children, if attached
    fn detach(&mut self, child: NodeId) {
        let Some(parent) = self.nodes.get(&child).and_then(|n| n.parent) else {
            return;
        };
        self.children_mut(parent).retain(|c| *c != child);
        self.set_parent(child, None);
    }

    fn delete_subtree(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        for child in &node.children {
            self.delete_subtree(*child);
        }
        for value in node.props.values() {
            self.release_value(value);
        }
    }

    fn release_op(&self, op: &Operation) {
        if let Operation::Create { props, .. } | Operation::Update { props, .. } = op {
            for value in props.values() {
                self.release_value(value);
            }
        }
    }

    fn release_value(&self, value: &SerializedValue) {
        let Some(registry) = &self.registry else {
            return;
        };
        for handle in value.function_refs() {
            if let Err(err) = registry.release(&handle) {
                tracing::debug!(handle = %handle, error = %err, "release of unknown handle");
            }
        }
    }

    /// Look up a node
    pub fn node(&self, id: NodeId) -> Option<&ReceiverNode> {
        self.nodes.get(&id)
    }

    /// Children of the root, in order
    pub fn root_children(&self) -> &[NodeId] {
        &self.root_children
    }

    /// Children of a node (or of the root for id 0)
    pub fn children(&self, id: NodeId) -> Option<&[NodeId]> {
        if id == ROOT_ID {
            return Some(&self.root_children);
        }
        self.nodes.get(&id).map(|n| n.children.as_slice())
    }

    /// Number of live nodes, attached or not
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// No live nodes?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Id of the last applied batch
    pub fn last_batch_id(&self) -> Option<u64> {
        self.last_batch_id
    }

    /// Rebuild the attached tree below the root
    pub fn tree(&self) -> Vec<TreeNode> {
        self.root_children.iter().filter_map(|id| self.subtree(*id)).collect()
    }

    /// Rebuild the tree below one node
    pub fn subtree(&self, id: NodeId) -> Option<TreeNode> {
        let node = self.nodes.get(&id)?;
        Some(TreeNode {
            id,
            node_type: node.node_type.clone(),
            props: node.props.clone(),
            children: node.children.iter().filter_map(|c| self.subtree(*c)).collect(),
        })
    }

    /// Drop every node, releasing all held handles
    pub fn clear(&mut self) {
        let nodes = std::mem::take(&mut self.nodes);
        self.root_children.clear();
        self.last_batch_id = None;
        for node in nodes.values() {
            for value in node.props.values() {
                self.release_value(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CallbackId;
    use crate::value::RuntimeValue;

    fn create(id: NodeId, node_type: &str) -> Operation {
        Operation::Create {
            id,
            node_type: node_type.into(),
            props: Props::new(),
        }
    }

    fn append(parent_id: NodeId, child_id: NodeId) -> Operation {
        Operation::Append {
            id: child_id,
            parent_id,
            child_id,
        }
    }

    #[test]
    fn test_insert_clamps_and_moves() {
        let mut receiver = Receiver::new();
        for id in 1..=3 {
            receiver.apply(&create(id, "View")).unwrap();
            receiver.apply(&append(ROOT_ID, id)).unwrap();
        }
        receiver
            .apply(&Operation::Insert {
                id: 3,
                parent_id: ROOT_ID,
                child_id: 3,
                index: 0,
            })
            .unwrap();
        assert_eq!(receiver.root_children(), &[3, 1, 2]);
        receiver
            .apply(&Operation::Insert {
                id: 3,
                parent_id: 1,
                child_id: 3,
                index: 99,
            })
            .unwrap();
        assert_eq!(receiver.root_children(), &[1, 2]);
        assert_eq!(receiver.children(1), Some(&[3][..]));
        assert_eq!(receiver.node(3).unwrap().parent, Some(1));
    }

    #[test]
    fn test_remove_detaches_without_destroying() {
        let mut receiver = Receiver::new();
        receiver.apply(&create(1, "View")).unwrap();
        receiver.apply(&append(ROOT_ID, 1)).unwrap();
        receiver
            .apply(&Operation::Remove {
                parent_id: ROOT_ID,
                child_id: 1,
            })
            .unwrap();
        assert!(receiver.root_children().is_empty());
        assert!(receiver.node(1).is_some());
        assert_eq!(
            receiver.apply(&Operation::Remove {
                parent_id: ROOT_ID,
                child_id: 1
            }),
            Err(SkipReason::NotAChild { parent: 0, child: 1 })
        );
    }

    #[test]
    fn test_soft_failures() {
        let mut receiver = Receiver::new();
        assert_eq!(
            receiver.apply(&Operation::Update {
                id: 9,
                props: Props::new(),
                removed_prop_keys: vec![]
            }),
            Err(SkipReason::UnknownNode(9))
        );
        receiver.apply(&create(1, "View")).unwrap();
        assert_eq!(receiver.apply(&append(5, 1)), Err(SkipReason::UnknownParent(5)));
        assert_eq!(receiver.apply(&append(1, 1)), Err(SkipReason::WouldCycle(1)));
        assert_eq!(receiver.apply(&create(1, "Text")), Err(SkipReason::DuplicateNode(1)));
    }

    #[test]
    fn test_cannot_attach_ancestor_below_descendant() {
        let mut receiver = Receiver::new();
        receiver.apply(&create(1, "View")).unwrap();
        receiver.apply(&create(2, "View")).unwrap();
        receiver.apply(&append(ROOT_ID, 1)).unwrap();
        receiver.apply(&append(1, 2)).unwrap();
        assert_eq!(receiver.apply(&append(2, 1)), Err(SkipReason::WouldCycle(1)));
    }

    #[test]
    fn test_delete_removes_whole_subtree() {
        let mut receiver = Receiver::new();
        for id in 1..=3 {
            receiver.apply(&create(id, "View")).unwrap();
        }
        receiver.apply(&append(ROOT_ID, 1)).unwrap();
        receiver.apply(&append(1, 2)).unwrap();
        receiver.apply(&append(2, 3)).unwrap();
        receiver.apply(&Operation::Delete { id: 1 }).unwrap();
        assert!(receiver.is_empty());
        assert!(receiver.root_children().is_empty());
    }

    #[test]
    fn test_out_of_order_batch_rejected() {
        let mut receiver = Receiver::new();
        let report = receiver.apply_batch(&OperationBatch::new(5, vec![create(1, "View")]));
        assert_eq!(report.applied, 1);
        let report = receiver.apply_batch(&OperationBatch::new(4, vec![create(2, "View")]));
        assert_eq!(report, ApplyReport { applied: 0, ignored: 1 });
        assert!(receiver.node(2).is_none());
    }

    #[test]
    fn test_update_releases_replaced_handles() {
        let registry = Rc::new(CallbackRegistry::new());
        let f = RuntimeValue::function("a", |_| Ok(RuntimeValue::Undefined));
        let g = RuntimeValue::function("b", |_| Ok(RuntimeValue::Undefined));
        let a = registry.register(f.as_function().unwrap().clone());
        let b = registry.register(g.as_function().unwrap().clone());

        let mut receiver = Receiver::with_registry(registry.clone());
        receiver
            .apply(&Operation::Create {
                id: 1,
                node_type: "Button".into(),
                props: Props::from([("onPress".to_string(), SerializedValue::FunctionRef(a.clone()))]),
            })
            .unwrap();
        let update = Operation::Update {
            id: 1,
            props: Props::from([("onPress".to_string(), SerializedValue::FunctionRef(b.clone()))]),
            removed_prop_keys: vec![],
        };
        receiver.apply(&update).unwrap();
        assert!(!registry.has(&a));
        assert!(registry.has(&b));
        // A second crossing of the same handle takes its own reference
        registry.retain(&b).unwrap();
        receiver.apply(&update).unwrap();
        assert_eq!(registry.refcount(&b), Some(1));

        receiver
            .apply(&Operation::Update {
                id: 1,
                props: Props::new(),
                removed_prop_keys: vec!["onPress".into()],
            })
            .unwrap();
        assert!(!registry.has(&b));
        assert_eq!(registry.count(), 0);
    }

    fn button(id: NodeId, handle: &CallbackId) -> Operation {
        Operation::Create {
            id,
            node_type: "Button".into(),
            props: Props::from([("onPress".to_string(), SerializedValue::FunctionRef(handle.clone()))]),
        }
    }

    #[test]
    fn test_rerender_with_same_handler_releases_on_delete() {
        let registry = Rc::new(CallbackRegistry::new());
        let f = RuntimeValue::function("onPress", |_| Ok(RuntimeValue::Undefined));
        let func = f.as_function().unwrap().clone();
        let mut receiver = Receiver::with_registry(registry.clone());

        let id = registry.register(func.clone());
        receiver.apply(&button(1, &id)).unwrap();

        let again = registry.register(func);
        assert_eq!(again, id);
        assert_eq!(registry.refcount(&id), Some(2));
        receiver
            .apply(&Operation::Update {
                id: 1,
                props: Props::from([("onPress".to_string(), SerializedValue::FunctionRef(again))]),
                removed_prop_keys: vec![],
            })
            .unwrap();
        assert_eq!(registry.refcount(&id), Some(1));

        receiver.apply(&Operation::Delete { id: 1 }).unwrap();
        assert!(!registry.has(&id));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_skipped_operations_release_handles() {
        let registry = Rc::new(CallbackRegistry::new());
        let f = RuntimeValue::function("onPress", |_| Ok(RuntimeValue::Undefined));
        let func = f.as_function().unwrap().clone();
        let mut receiver = Receiver::with_registry(registry.clone());

        let id = registry.register(func.clone());
        assert_eq!(receiver.apply_batch(&OperationBatch::new(2, vec![button(1, &id)])).applied, 1);

        // duplicate CREATE
        registry.register(func.clone());
        assert_eq!(receiver.apply(&button(1, &id)), Err(SkipReason::DuplicateNode(1)));
        assert_eq!(registry.refcount(&id), Some(1));

        // UPDATE of an unknown node
        registry.register(func.clone());
        let stray = Operation::Update {
            id: 9,
            props: Props::from([("onPress".to_string(), SerializedValue::FunctionRef(id.clone()))]),
            removed_prop_keys: vec![],
        };
        assert_eq!(receiver.apply(&stray), Err(SkipReason::UnknownNode(9)));
        assert_eq!(registry.refcount(&id), Some(1));

        // out-of-order batch
        registry.register(func.clone());
        let report = receiver.apply_batch(&OperationBatch::new(1, vec![button(3, &id)]));
        assert_eq!(report, ApplyReport { applied: 0, ignored: 1 });
        assert_eq!(registry.refcount(&id), Some(1));

        // unsupported protocol version
        registry.register(func);
        let report = receiver.apply_batch(&OperationBatch {
            version: PROTOCOL_VERSION + 1,
            ..OperationBatch::new(7, vec![button(4, &id)])
        });
        assert_eq!(report, ApplyReport { applied: 0, ignored: 1 });
        assert_eq!(registry.refcount(&id), Some(1));

        receiver.apply(&Operation::Delete { id: 1 }).unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_tree_serializes_for_display() {
        let mut receiver = Receiver::new();
        receiver.apply(&create(1, "View")).unwrap();
        receiver.apply(&append(ROOT_ID, 1)).unwrap();
        let json = serde_json::to_value(receiver.tree()).unwrap();
        assert_eq!(json, serde_json::json!([{"id": 1, "type": "View", "props": {}, "children": []}]));
    }
}
