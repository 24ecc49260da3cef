//! Property conversion and checksums over host objects

use scene_sync::{
    ChangeSet, ChecksumEngine, ChecksumFilter, FieldValue, HostObject, HostStore, NoReferences, ObjectHandle,
    PropertyManager, PropertyNode, PropertyPath, StableIdentity, TreeChange,
};
use scene_test_helpers::objects::object_ref;
use scene_test_helpers::prelude::*;

fn tagged_light(tags: &[(&str, &str)]) -> TestObject {
    let tags = tags
        .iter()
        .map(|(k, v)| (k.to_string(), FieldValue::Text(v.to_string())))
        .collect();
    TestObject::light().with("tags", FieldValue::Map(tags))
}

#[test]
fn test_extract_then_apply_reproduces_object() {
    let mut manager = PropertyManager::new();
    let source = TestObject::light()
        .with("range", FieldValue::Float(2.5))
        .with("color", FieldValue::Color([1.0, 0.0, 0.0, 1.0]));
    let root = manager.extract_all(&source, &NoReferences);
    assert_eq!(root.len(), 2);

    let mut target = TestObject::light();
    let handle = ObjectHandle(1);
    assert_eq!(manager.apply_all(handle, &target, &root, &NoReferences), 2);
    assert_eq!(manager.flush_object(handle, &mut target).len(), 2);

    assert_eq!(target.get_field("range"), source.get_field("range"));
    assert_eq!(target.get_field("color"), source.get_field("color"));
    assert!(manager.has_same_properties(&target, &root, &NoReferences));
    assert_eq!(manager.apply_all(handle, &target, &root, &NoReferences), 0);
}

#[test]
fn test_descriptor_default_overrides_scratch() {
    let mut manager = PropertyManager::new();
    let fresh = TestObject::crate_object();
    let root = manager.extract_all(&fresh, &NoReferences);

    // A fresh crate is inactive but the standard default is active
    assert_eq!(root.keys().collect::<Vec<_>>(), vec!["active"]);
    assert_eq!(root["active"], PropertyNode::from(false));
}

#[test]
fn test_map_field_diffs_by_key() {
    let mut manager = PropertyManager::new();
    let before = tagged_light(&[("zone", "north"), ("kind", "spot")]);
    let mut root = manager.extract_all(&before, &NoReferences);

    let after = tagged_light(&[("zone", "south"), ("kind", "spot")]);
    let mut changes = ChangeSet::new();
    let deltas = manager.send_changes(&after, &mut root, &NoReferences, &mut changes);

    assert_eq!(deltas.len(), 1);
    assert_eq!(
        changes.as_slice(),
        &[TreeChange::Set {
            path: PropertyPath::field("tags").child("zone"),
            value: PropertyNode::from("south"),
        }]
    );
}

#[test]
fn test_copy_of_equal_trees_reports_nothing() {
    let mut manager = PropertyManager::new();
    let light = tagged_light(&[("zone", "north")]).with("range", FieldValue::Float(3.0));
    let root = manager.extract_all(&light, &NoReferences);

    let mut dest = PropertyNode::Dictionary(root.clone());
    let mut changes = ChangeSet::new();
    assert!(PropertyManager::copy(
        &mut dest,
        &PropertyNode::Dictionary(root),
        &PropertyPath::root(),
        &mut changes
    ));
    assert!(changes.is_empty());
}

#[test]
fn test_checksum_ignores_key_order() {
    let checksums = ChecksumEngine::default();
    let mut manager = PropertyManager::new();
    let a = manager.extract_all(&tagged_light(&[("a", "1"), ("b", "2")]), &NoReferences);
    let b = manager.extract_all(&tagged_light(&[("b", "2"), ("a", "1")]), &NoReferences);
    let c = manager.extract_all(&tagged_light(&[("a", "2"), ("b", "1")]), &NoReferences);

    assert_eq!(checksums.dictionary(&a), checksums.dictionary(&b));
    assert_ne!(checksums.dictionary(&a), checksums.dictionary(&c));
}

#[test]
fn test_object_checksum_uses_stable_identity() {
    let checksums = ChecksumEngine::default();
    let mut first = TestScene::new();
    let mut second = TestScene::new();

    // Same hierarchy position, different handles
    first.add(TestObject::transform());
    let target_a = first.add(TestObject::transform());
    let light_a = first.add(TestObject::light().with("cookie", object_ref(target_a)));
    let target_b = second.add(TestObject::transform());
    let other = second.add(TestObject::transform());
    let light_b = second.add(TestObject::light().with("cookie", object_ref(other)));

    let sum = |scene: &TestScene, handle| {
        checksums.object(scene.object(handle).unwrap(), &|h| scene.stable_identity(h))
    };
    assert_eq!(sum(&first, light_a), sum(&second, light_b));

    second.set(light_b, "cookie", object_ref(target_b));
    assert_ne!(sum(&first, light_a), sum(&second, light_b));
}

#[test]
fn test_checksum_filter_skips_bookkeeping_fields() {
    let plain = ChecksumEngine::default();
    let filtered = ChecksumEngine::new(ChecksumFilter::ignoring(["range".to_string()]));
    let near = TestObject::light().with("range", FieldValue::Float(1.0));
    let far = TestObject::light().with("range", FieldValue::Float(50.0));
    let no_identity = |_h: ObjectHandle| -> Option<StableIdentity> { None };

    assert_ne!(plain.object(&near, &no_identity), plain.object(&far, &no_identity));
    assert_eq!(filtered.object(&near, &no_identity), filtered.object(&far, &no_identity));
}

#[test]
fn test_config_loads_from_workspace() {
    let root = workspace_with_config(
        r#"
[session]
client_id = 4
max_ops_per_tick = 64

[properties]
scan_mode = "full"
checksum_ignore_fields = ["hideFlags", "range"]

[undo]
max_history = 0
"#,
    );
    let config = scene_config::Config::load(root.path()).unwrap();
    assert_eq!(config.session.client_id.0, 4);
    assert_eq!(config.properties.scan_mode, scene_config::ScanMode::Full);
    assert_eq!(config.undo.max_history, 0);
    assert!(config.undo.enabled);

    let (engine, _server) = engine_with_config(config);
    assert_eq!(engine.local_client().0, 4);
}
