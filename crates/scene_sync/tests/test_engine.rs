//! End-to-end replication through the engine

use scene_sync::{
    ClientId, FieldValue, HostStore, LocalOp, LockMode, PropertyNode, PropertyPath, RemoteOp, SyncError,
};
use scene_test_helpers::objects::object_ref;
use scene_test_helpers::prelude::*;

fn crate_with_speed(speed: f32) -> TestObject {
    TestObject::crate_object().with("speed", FieldValue::Float(speed))
}

/// Track a single object and let the server confirm it; returns its node id
fn tracked(
    engine: &mut scene_sync::SyncEngine,
    server: &mut FakeServer,
    scene: &mut TestScene,
    handle: scene_sync::ObjectHandle,
) -> u32 {
    engine.track(scene, handle).unwrap().unwrap();
    server.settle(engine, scene);
    engine.node(handle).unwrap().id
}

#[test]
fn test_track_creates_and_confirms() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));

    let key = engine.track(&mut scene, handle).unwrap().unwrap();
    assert_eq!(engine.track(&mut scene, handle).unwrap(), Some(key));

    let sent = server.settle(&mut engine, &mut scene);
    assert!(sent_create("Crate").eval(sent.as_slice()));
    let LocalOp::Create { properties, .. } = &sent[0] else {
        panic!("expected Create, got {:?}", sent[0]);
    };
    assert_eq!(properties["speed"], PropertyNode::from(2.0f32));
    assert!(!properties.contains_key("items"));

    let node = engine.node(handle).unwrap();
    assert_eq!(Some(node.id), server.id_for(key.0));
    assert!(node.is_confirmed());
}

#[test]
fn test_local_edit_is_sent_once() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    scene.set(handle, "speed", FieldValue::Float(3.0));
    assert!(engine.mark_dirty(handle));
    let report = engine.tick(&mut scene).unwrap();
    assert_eq!(report.changed_fields, 1);

    let sent = server.pump();
    assert!(sent_property_change(id, "speed").eval(sent.as_slice()));
    assert_eq!(property_edits(&sent).len(), 1);

    // Nothing changed since
    engine.mark_dirty(handle);
    engine.tick(&mut scene).unwrap();
    assert!(server.pump().is_empty());
}

#[test]
fn test_remote_change_is_written_without_echo() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    server.push(RemoteOp::PropertyChange {
        id,
        path: PropertyPath::field("speed"),
        value: PropertyNode::from(7.5f32),
    });
    let report = engine.tick(&mut scene).unwrap();

    assert_eq!(scene.field(handle, "speed"), Some(FieldValue::Float(7.5)));
    assert_eq!(report.notifications.len(), 1);
    assert_eq!(report.notifications[0].field, "speed");

    engine.mark_dirty(handle);
    engine.tick(&mut scene).unwrap();
    assert!(no_property_edits().eval(server.pump().as_slice()));
}

#[test]
fn test_locked_object_reverts_local_edit() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    server.push(RemoteOp::Lock {
        id,
        owner: ClientId(2),
        full: false,
    });
    engine.tick(&mut scene).unwrap();
    assert!(scene.is_locked(handle));

    scene.set(handle, "speed", FieldValue::Float(9.0));
    engine.mark_dirty(handle);
    let report = engine.tick(&mut scene).unwrap();

    assert_eq!(report.reverted, vec![handle]);
    assert_eq!(scene.field(handle, "speed"), Some(FieldValue::Float(2.0)));
    assert!(no_property_edits().eval(server.pump().as_slice()));

    server.push(RemoteOp::Unlock { id });
    engine.tick(&mut scene).unwrap();
    assert!(!scene.is_locked(handle));
}

#[test]
fn test_remote_create_spawns_host_object() {
    suppress_logs();
    let (mut engine, server) = test_engine();
    let mut scene = TestScene::new();

    server.push(RemoteOp::Create {
        id: 7,
        type_tag: "Light".into(),
        parent: None,
        child_index: 0,
        properties: [("range".to_string(), PropertyNode::from(4.0f32))].into_iter().collect(),
        lock_owner: Some(ClientId(3)),
    });
    let report = engine.tick(&mut scene).unwrap();
    assert!(!report.has_errors());

    let handle = scene.spawned[0];
    assert_eq!(scene.field(handle, "range"), Some(FieldValue::Float(4.0)));
    assert!(scene.is_locked(handle));
    assert_eq!(engine.graph().by_id(7).unwrap().handle, Some(handle));

    server.push(RemoteOp::Delete {
        id: 7,
        unsubscribed: false,
    });
    engine.tick(&mut scene).unwrap();
    assert!(!scene.contains(handle));
    assert!(engine.graph().is_empty());
}

#[test]
fn test_remote_delete_tears_down_children_first() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let root = scene.add(TestObject::transform());
    let child = scene.add_child(root, TestObject::light());
    engine.track(&mut scene, root).unwrap();
    engine.track(&mut scene, child).unwrap();
    server.settle(&mut engine, &mut scene);
    let root_id = engine.node(root).unwrap().id;

    server.push(RemoteOp::Delete {
        id: root_id,
        unsubscribed: true,
    });
    engine.tick(&mut scene).unwrap();

    assert_eq!(scene.destroyed, vec![child, root]);
    assert!(engine.graph().is_empty());
}

#[test]
fn test_unknown_type_surfaces_in_report() {
    suppress_logs();
    let (mut engine, server) = test_engine();
    let mut scene = TestScene::new();

    server.push(RemoteOp::Create {
        id: 11,
        type_tag: "Terrain".into(),
        parent: None,
        child_index: 0,
        properties: Default::default(),
        lock_owner: None,
    });
    server.push(RemoteOp::Create {
        id: 12,
        type_tag: "Light".into(),
        parent: None,
        child_index: 0,
        properties: Default::default(),
        lock_owner: None,
    });
    let report = engine.tick(&mut scene).unwrap();

    assert_eq!(report.errors.len(), 1);
    assert!(matches!(&report.errors[0], SyncError::UnknownType(tag) if tag == "Terrain"));
    assert!(engine.graph().by_id(12).is_some());
    assert!(engine.graph().by_id(11).is_none());
}

#[test]
fn test_duplicate_translator_is_rejected() {
    let (mut engine, _server) = test_engine();
    let err = engine
        .register(Box::new(scene_sync::PropertyTranslator::new("Crate")))
        .unwrap_err();
    assert!(matches!(err, SyncError::DuplicateTranslator(tag) if tag == "Crate"));
}

#[test]
fn test_child_create_waits_for_parent_confirmation() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    server.confirm_creates = false;
    let mut scene = TestScene::new();
    let parent = scene.add(TestObject::transform());
    let child = scene.add_child(parent, TestObject::crate_object());
    let parent_key = engine.track(&mut scene, parent).unwrap().unwrap();
    engine.track(&mut scene, child).unwrap();

    engine.tick(&mut scene).unwrap();
    let sent = server.pump();
    assert_eq!(sent.len(), 1);
    assert!(sent_create("Transform").eval(sent.as_slice()));
    assert_eq!(engine.pending_outbound(), 1);

    server.push(RemoteOp::ConfirmCreate {
        local_key: parent_key.0,
        id: 50,
    });
    engine.tick(&mut scene).unwrap();
    let sent = server.pump();
    assert!(matches!(
        sent.as_slice(),
        [LocalOp::Create { type_tag, parent: Some(50), .. }] if type_tag == "Crate"
    ));
}

#[test]
fn test_untrack_before_send_is_silent() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(TestObject::light());
    engine.track(&mut scene, handle).unwrap();

    engine.untrack(handle).unwrap();
    engine.tick(&mut scene).unwrap();
    assert!(server.pump().is_empty());
    assert!(engine.graph().is_empty());
}

#[test]
fn test_untrack_deletes_and_awaits_confirmation() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(TestObject::light());
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    scene.destroy(handle);
    engine.untrack(handle).unwrap();
    assert!(engine.graph().by_id(id).unwrap().deleting);

    let sent = server.settle(&mut engine, &mut scene);
    assert_eq!(sent, vec![LocalOp::Delete { id }]);
    assert!(engine.graph().is_empty());
}

#[test]
fn test_reparent_is_sent() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let a = scene.add(TestObject::transform());
    let b = scene.add(TestObject::transform());
    let a_id = tracked(&mut engine, &mut server, &mut scene, a);
    let b_id = tracked(&mut engine, &mut server, &mut scene, b);

    scene.move_to(b, Some(a), 0);
    assert!(engine.report_parent_change(b));
    engine.tick(&mut scene).unwrap();

    assert_eq!(
        server.pump(),
        vec![LocalOp::ParentChange {
            id: b_id,
            parent: Some(a_id),
            child_index: 0,
        }]
    );
    assert!(engine.history().has_pending());
}

#[test]
fn test_move_into_fully_locked_parent_is_reverted() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let a = scene.add(TestObject::transform());
    let b = scene.add(TestObject::transform());
    let a_id = tracked(&mut engine, &mut server, &mut scene, a);
    tracked(&mut engine, &mut server, &mut scene, b);

    server.push(RemoteOp::Lock {
        id: a_id,
        owner: ClientId(2),
        full: true,
    });
    engine.tick(&mut scene).unwrap();

    scene.move_to(b, Some(a), 0);
    engine.report_parent_change(b);
    let report = engine.tick(&mut scene).unwrap();

    assert_eq!(report.reverted, vec![b]);
    assert_eq!(scene.parent_of(b), None);
    assert_eq!(scene.child_index(b), 1);
    assert!(server.pump().is_empty());
}

#[test]
fn test_transient_lock_released_after_edit() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    engine.request_lock(handle, LockMode::Partial, true).unwrap();
    engine.tick(&mut scene).unwrap();
    assert_eq!(server.pump(), vec![LocalOp::Lock { id, full: false }]);
    assert!(engine.node(handle).unwrap().lock.is_lock_pending());

    scene.set(handle, "speed", FieldValue::Float(4.0));
    engine.mark_dirty(handle);
    let report = engine.tick(&mut scene).unwrap();
    assert_eq!(report.released_locks, 1);

    let sent = server.pump();
    let edit = sent.iter().position(|op| matches!(op, LocalOp::PropertyChange { .. }));
    let unlock = sent.iter().position(|op| *op == LocalOp::Unlock { id });
    assert!(edit.unwrap() < unlock.unwrap());
    assert!(!engine.node(handle).unwrap().lock.is_owned_by(ClientId(1)));
}

#[test]
fn test_transient_lock_held_until_an_edit_goes_out() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    engine.request_lock(handle, LockMode::Partial, true).unwrap();
    engine.tick(&mut scene).unwrap();
    server.pump();

    // Grant arrives with nothing edited yet
    let report = engine.tick(&mut scene).unwrap();
    assert_eq!(report.released_locks, 0);
    assert!(engine.node(handle).unwrap().lock.is_owned_by(ClientId(1)));
    assert!(server.pump().is_empty());

    scene.set(handle, "speed", FieldValue::Float(4.0));
    engine.mark_dirty(handle);
    let report = engine.tick(&mut scene).unwrap();
    assert_eq!(report.released_locks, 1);

    let sent = server.pump();
    assert_eq!(sent.len(), 2);
    assert!(sent_property_change(id, "speed").eval(&sent[..1]));
    assert_eq!(sent[1], LocalOp::Unlock { id });
}

#[test]
fn test_edit_waits_for_transient_lock_grant() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    engine.request_lock(handle, LockMode::Partial, true).unwrap();
    scene.set(handle, "speed", FieldValue::Float(4.0));
    engine.mark_dirty(handle);
    let report = engine.tick(&mut scene).unwrap();
    assert_eq!(report.changed_fields, 0);
    assert_eq!(server.pump(), vec![LocalOp::Lock { id, full: false }]);

    let report = engine.tick(&mut scene).unwrap();
    assert_eq!(report.changed_fields, 1);
    assert_eq!(report.released_locks, 1);

    let sent = server.pump();
    assert_eq!(sent.len(), 2);
    assert!(sent_property_change(id, "speed").eval(&sent[..1]));
    assert_eq!(sent[1], LocalOp::Unlock { id });
}

#[test]
fn test_denied_transient_lock_releases_held_edit() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    server.grant_locks = false;
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    engine.request_lock(handle, LockMode::Partial, true).unwrap();
    scene.set(handle, "speed", FieldValue::Float(4.0));
    engine.mark_dirty(handle);
    engine.tick(&mut scene).unwrap();
    assert!(no_property_edits().eval(server.pump().as_slice()));

    server.push(RemoteOp::DirectLockChange { id, held: false });
    engine.tick(&mut scene).unwrap();
    assert!(sent_property_change(id, "speed").eval(server.pump().as_slice()));
}

#[test]
fn test_release_cancels_pending_request() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    server.grant_locks = false;
    let mut scene = TestScene::new();
    let handle = scene.add(TestObject::light());
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    engine.request_lock(handle, LockMode::Full, false).unwrap();
    engine.release_lock(handle).unwrap();
    engine.tick(&mut scene).unwrap();

    assert_eq!(
        server.pump(),
        vec![LocalOp::Lock { id, full: true }, LocalOp::Unlock { id }]
    );
    assert!(!engine.node(handle).unwrap().lock.is_lock_pending());
}

#[test]
fn test_list_edit_patches_in_place() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let items = |values: &[i32]| FieldValue::List(values.iter().map(|v| FieldValue::Int(*v)).collect());
    let handle = scene.add(TestObject::crate_object().with("items", items(&[1, 2, 3])));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);
    let buffer = engine.node(handle).unwrap().properties["items"]
        .as_list()
        .unwrap()
        .as_ptr();

    scene.set(handle, "items", items(&[1, 3]));
    engine.mark_dirty(handle);
    engine.tick(&mut scene).unwrap();

    assert_eq!(
        server.pump(),
        vec![LocalOp::ListRemove {
            id,
            path: PropertyPath::field("items"),
            index: 1,
            count: 1,
        }]
    );
    let list = engine.node(handle).unwrap().properties["items"].as_list().unwrap();
    assert_eq!(list.as_ptr(), buffer);
}

#[test]
fn test_list_insert_sends_single_add() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let items = |values: &[i32]| FieldValue::List(values.iter().map(|v| FieldValue::Int(*v)).collect());
    let handle = scene.add(TestObject::crate_object().with("items", items(&[1, 3])));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    scene.set(handle, "items", items(&[1, 2, 3]));
    engine.mark_dirty(handle);
    engine.tick(&mut scene).unwrap();

    assert_eq!(
        server.pump(),
        vec![LocalOp::ListAdd {
            id,
            path: PropertyPath::field("items"),
            index: 1,
            values: vec![PropertyNode::from(2i32)],
        }]
    );
    let list = engine.node(handle).unwrap().properties["items"].as_list().unwrap();
    assert_eq!(list.len(), 3);
}

#[test]
fn test_field_back_at_default_is_removed() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    scene.set(handle, "speed", FieldValue::Float(1.0));
    engine.mark_dirty(handle);
    engine.tick(&mut scene).unwrap();

    assert!(sent_field_removal(id, "speed").eval(server.pump().as_slice()));
    assert!(!engine.node(handle).unwrap().properties.contains_key("speed"));
}

#[test]
fn test_full_scan_detects_unreported_edits() {
    suppress_logs();
    let mut config = test_config();
    config.properties.scan_mode = scene_config::ScanMode::Full;
    let (mut engine, mut server) = engine_with_config(config);
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    scene.set(handle, "label", FieldValue::Text("cargo".into()));
    engine.tick(&mut scene).unwrap();
    assert!(sent_property_change(id, "label").eval(server.pump().as_slice()));

    engine.tick(&mut scene).unwrap();
    assert!(server.pump().is_empty());
}

#[test]
fn test_full_scan_reverts_edit_on_locked_object() {
    suppress_logs();
    let mut config = test_config();
    config.properties.scan_mode = scene_config::ScanMode::Full;
    let (mut engine, mut server) = engine_with_config(config);
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    let id = tracked(&mut engine, &mut server, &mut scene, handle);

    server.push(RemoteOp::Lock {
        id,
        owner: ClientId(2),
        full: false,
    });
    engine.tick(&mut scene).unwrap();
    server.pump();

    // Never reported; the full scan finds it
    scene.set(handle, "speed", FieldValue::Float(9.0));
    let report = engine.tick(&mut scene).unwrap();
    assert_eq!(report.reverted, vec![handle]);
    assert_eq!(scene.field(handle, "speed"), Some(FieldValue::Float(2.0)));
    assert!(no_property_edits().eval(server.pump().as_slice()));

    let report = engine.tick(&mut scene).unwrap();
    assert!(report.reverted.is_empty());
}

#[test]
fn test_reference_resolves_after_target_confirms() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let target = scene.add(TestObject::transform());
    let light = scene.add(TestObject::light().with("cookie", object_ref(target)));
    engine.track(&mut scene, target).unwrap();
    engine.track(&mut scene, light).unwrap();

    let sent = server.settle(&mut engine, &mut scene);
    let created = sent
        .iter()
        .find_map(|op| match op {
            LocalOp::Create {
                type_tag, properties, ..
            } if type_tag == "Light" => Some(properties),
            _ => None,
        })
        .unwrap();
    assert_eq!(created["cookie"], PropertyNode::Reference(PropertyNode::KEEP_REFERENCE));

    let target_id = engine.node(target).unwrap().id;
    let light_id = engine.node(light).unwrap().id;
    assert!(sent.contains(&LocalOp::PropertyChange {
        id: light_id,
        path: PropertyPath::field("cookie"),
        value: PropertyNode::Reference(target_id),
    }));
    assert_eq!(
        engine.node(light).unwrap().properties.get("cookie"),
        Some(&PropertyNode::Reference(target_id))
    );
    // Filling in an id is not an undoable edit
    assert!(!engine.history().has_pending());

    for _ in 0..3 {
        engine.tick(&mut scene).unwrap();
    }
    assert!(server.pump().is_empty());
}

#[test]
fn test_verify_reports_drift() {
    suppress_logs();
    let (mut engine, mut server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(crate_with_speed(2.0));
    tracked(&mut engine, &mut server, &mut scene, handle);
    assert!(engine.verify(&scene, handle).unwrap());

    // Edited but never reported
    scene.set(handle, "speed", FieldValue::Float(5.0));
    assert!(!engine.verify(&scene, handle).unwrap());
}

#[test]
fn test_closed_link_disconnects() {
    suppress_logs();
    let (mut engine, server) = test_engine();
    let mut scene = TestScene::new();
    let handle = scene.add(TestObject::light());
    engine.track(&mut scene, handle).unwrap();

    drop(server);
    assert!(matches!(engine.tick(&mut scene), Err(SyncError::Closed)));
    assert!(!engine.is_connected());
}
