//! End-to-end replication tests: guest-authored operations encoded by the
//! bridge and applied by the receiver.

use rill_core::{
    Bridge, CallError, CallbackRegistry, GuestBatch, Operation, OperationBatch, Props, Receiver, RuntimeValue,
    SerializedValue, ROOT_ID,
};
use std::cell::Cell;
use std::rc::Rc;

fn setup() -> (Rc<Bridge>, Receiver) {
    let registry = Rc::new(CallbackRegistry::new());
    let bridge = Bridge::new(registry.clone());
    (bridge, Receiver::with_registry(registry))
}

fn op(fields: Vec<(&str, RuntimeValue)>) -> RuntimeValue {
    RuntimeValue::object(fields)
}

// ────────────────────────────────────────────────────────────────────────────
// View/Text scenario
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_view_with_text_child() {
    let (_bridge, mut receiver) = setup();
    let batch = OperationBatch::new(
        1,
        vec![
            Operation::Create {
                id: 1,
                node_type: "View".into(),
                props: Props::new(),
            },
            Operation::Create {
                id: 2,
                node_type: "Text".into(),
                props: Props::from([("children".to_string(), SerializedValue::from("hi"))]),
            },
            Operation::Append {
                id: 2,
                parent_id: 1,
                child_id: 2,
            },
            Operation::Append {
                id: 1,
                parent_id: ROOT_ID,
                child_id: 1,
            },
        ],
    );
    let report = receiver.apply_batch(&batch);
    assert_eq!(report.applied, 4);
    assert_eq!(receiver.root_children(), &[1]);
    assert_eq!(receiver.children(1), Some(&[2][..]));
    assert_eq!(
        receiver.node(2).unwrap().props.get("children"),
        Some(&SerializedValue::from("hi"))
    );

    let tree = serde_json::to_value(receiver.tree()).unwrap();
    assert_eq!(
        tree,
        serde_json::json!([{
            "id": 1, "type": "View", "props": {},
            "children": [{"id": 2, "type": "Text", "props": {"children": "hi"}, "children": []}]
        }])
    );
}

// ────────────────────────────────────────────────────────────────────────────
// Handle lifecycle
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_handle_released_when_node_deleted() {
    let (bridge, mut receiver) = setup();
    let presses = Rc::new(Cell::new(0));
    let counter = presses.clone();
    let on_press = RuntimeValue::function("onPress", move |_| {
        counter.set(counter.get() + 1);
        Ok(RuntimeValue::Undefined)
    });

    let guest = RuntimeValue::array([
        op(vec![
            ("op", "CREATE".into()),
            ("id", 1.into()),
            ("type", "Button".into()),
            ("props", RuntimeValue::object([("onPress", on_press)])),
        ]),
        op(vec![("op", "APPEND".into()), ("parentId", 0.into()), ("childId", 1.into())]),
    ]);
    let parsed = GuestBatch::from_runtime(&guest).unwrap();
    let batch = bridge.make_batch(1, parsed.operations).unwrap();
    receiver.apply_batch(&batch);

    let Some(SerializedValue::FunctionRef(handle)) = receiver.node(1).unwrap().props.get("onPress").cloned() else {
        panic!("onPress should be a function handle");
    };
    assert!(bridge.registry().has(&handle));
    bridge.registry().invoke(&handle, &[]).unwrap();
    assert_eq!(presses.get(), 1);

    receiver.apply_batch(&OperationBatch::new(2, vec![Operation::Delete { id: 1 }]));
    assert!(!bridge.registry().has(&handle));
    assert!(matches!(
        bridge.registry().invoke(&handle, &[]),
        Err(CallError::HandleNotFound(id)) if id == handle
    ));
}

#[test]
fn test_subtree_handles_released_children_first() {
    let (bridge, mut receiver) = setup();
    let noop = || RuntimeValue::function("noop", |_| Ok(RuntimeValue::Undefined));
    let ops = vec![
        Operation::Create {
            id: 1,
            node_type: "View".into(),
            props: Props::from([("onLayout".to_string(), noop())]),
        },
        Operation::Create {
            id: 2,
            node_type: "Button".into(),
            props: Props::from([("onPress".to_string(), noop())]),
        },
        Operation::Append {
            id: 2,
            parent_id: 1,
            child_id: 2,
        },
        Operation::Append {
            id: 1,
            parent_id: ROOT_ID,
            child_id: 1,
        },
    ];
    receiver.apply_batch(&bridge.make_batch(1, ops).unwrap());
    assert_eq!(bridge.registry().count(), 2);

    receiver.apply_batch(&OperationBatch::new(2, vec![Operation::Delete { id: 1 }]));
    assert_eq!(bridge.registry().count(), 0);
    assert!(receiver.is_empty());
}

#[test]
fn test_shared_callback_survives_partial_delete() {
    let (bridge, mut receiver) = setup();
    let shared = RuntimeValue::function("shared", |_| Ok(RuntimeValue::Undefined));
    let ops = vec![
        Operation::Create {
            id: 1,
            node_type: "Button".into(),
            props: Props::from([("onPress".to_string(), shared.clone())]),
        },
        Operation::Create {
            id: 2,
            node_type: "Button".into(),
            props: Props::from([("onPress".to_string(), shared)]),
        },
    ];
    let batch = bridge.make_batch(1, ops).unwrap();
    receiver.apply_batch(&batch);
    let handles: Vec<_> = batch.operations.iter().flat_map(props_handles).collect();
    assert_eq!(handles[0], handles[1], "deduplicated handle");
    assert_eq!(bridge.registry().refcount(&handles[0]), Some(2));

    receiver.apply_batch(&OperationBatch::new(2, vec![Operation::Delete { id: 1 }]));
    assert!(bridge.registry().has(&handles[0]));
    receiver.apply_batch(&OperationBatch::new(3, vec![Operation::Delete { id: 2 }]));
    assert!(!bridge.registry().has(&handles[0]));
}

fn props_handles(op: &Operation) -> Vec<rill_core::CallbackId> {
    match op {
        Operation::Create { props, .. } | Operation::Update { props, .. } => {
            props.values().flat_map(|v| v.function_refs()).collect()
        }
        _ => Vec::new(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Idempotence
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_replayed_batch_creates_no_duplicates() {
    let mut receiver = Receiver::new();
    let batch = OperationBatch::new(
        1,
        vec![
            Operation::Create {
                id: 1,
                node_type: "View".into(),
                props: Props::new(),
            },
            Operation::Append {
                id: 1,
                parent_id: ROOT_ID,
                child_id: 1,
            },
            Operation::Update {
                id: 1,
                props: Props::from([("color".to_string(), SerializedValue::from("red"))]),
                removed_prop_keys: vec![],
            },
        ],
    );
    receiver.apply_batch(&batch);
    let first = receiver.node(1).cloned();
    let report = receiver.apply_batch(&batch);

    assert_eq!(report.ignored, 1, "second CREATE is ignored");
    assert_eq!(receiver.len(), 1);
    assert_eq!(receiver.root_children(), &[1]);
    assert_eq!(receiver.node(1).cloned(), first);
}

#[test]
fn test_replayed_batch_with_handler_releases_on_delete() {
    let (bridge, mut receiver) = setup();
    let on_press = RuntimeValue::function("onPress", |_| Ok(RuntimeValue::Undefined));
    let ops = || {
        vec![Operation::Create {
            id: 1,
            node_type: "Button".into(),
            props: Props::from([("onPress".to_string(), on_press.clone())]),
        }]
    };

    receiver.apply_batch(&bridge.make_batch(1, ops()).unwrap());
    let report = receiver.apply_batch(&bridge.make_batch(1, ops()).unwrap());
    assert_eq!(report.ignored, 1);
    assert_eq!(bridge.registry().count(), 1);

    receiver.apply_batch(&OperationBatch::new(2, vec![Operation::Delete { id: 1 }]));
    assert_eq!(bridge.registry().count(), 0);
}

#[test]
fn test_rerender_with_same_handler_then_delete() {
    let (bridge, mut receiver) = setup();
    let on_press = RuntimeValue::function("onPress", |_| Ok(RuntimeValue::Undefined));
    let create = bridge
        .make_batch(
            1,
            vec![Operation::Create {
                id: 1,
                node_type: "Button".into(),
                props: Props::from([("onPress".to_string(), on_press.clone())]),
            }],
        )
        .unwrap();
    receiver.apply_batch(&create);
    let handle = props_handles(&create.operations[0]).remove(0);

    let rerender = bridge
        .make_batch(
            2,
            vec![Operation::Update {
                id: 1,
                props: Props::from([("onPress".to_string(), on_press)]),
                removed_prop_keys: vec![],
            }],
        )
        .unwrap();
    assert_eq!(props_handles(&rerender.operations[0]), vec![handle.clone()]);
    receiver.apply_batch(&rerender);
    assert_eq!(bridge.registry().refcount(&handle), Some(1));

    receiver.apply_batch(&OperationBatch::new(3, vec![Operation::Delete { id: 1 }]));
    assert!(!bridge.registry().has(&handle));
}

#[test]
fn test_batch_survives_wire_round_trip() {
    let (bridge, mut receiver) = setup();
    let f = RuntimeValue::function("f", |_| Ok(RuntimeValue::Undefined));
    let ops = vec![Operation::Create {
        id: 1,
        node_type: "Input".into(),
        props: Props::from([
            ("value".to_string(), RuntimeValue::Number(f64::NAN)),
            ("onChange".to_string(), f),
            ("meta".to_string(), RuntimeValue::map([(RuntimeValue::from(1), RuntimeValue::Date(0.0))])),
        ]),
    }];
    let batch = bridge.make_batch(1, ops).unwrap();
    let wire = Bridge::batch_to_wire(&batch).unwrap();
    let back = Bridge::batch_from_wire(&wire).unwrap();
    receiver.apply_batch(&back);

    let props = &receiver.node(1).unwrap().props;
    assert!(props["value"].as_f64().unwrap().is_nan());
    assert!(matches!(props["onChange"], SerializedValue::FunctionRef(_)));
    assert!(matches!(props["meta"], SerializedValue::MapValue(_)));
}
