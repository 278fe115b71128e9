//! Commits from a top-level context down to the data source.

mod common;

use std::sync::Arc;

use common::{
    MemoryTransaction, artist_id, domain, domain_with, gallery, gallery_with_rules, group_id,
    painting_id, seeded,
};
use rowgraph::prelude::*;
use rowgraph::{CommitErrorKind, DomainConfig, bind_transaction};

fn names(rows: &[DataRow], column: &str) -> Vec<String> {
    let mut names: Vec<String> = rows
        .iter()
        .filter_map(|r| r.value(column).as_str().map(str::to_string))
        .collect();
    names.sort();
    names
}

#[test]
fn new_objects_are_inserted_parent_first() {
    let source = seeded();
    let context = domain(&source).create_context();

    let painting = context.new_object("Painting").unwrap();
    context.write_property(&painting, "title", "Olympia").unwrap();
    let artist = context.new_object("Artist").unwrap();
    context.write_property(&artist, "name", "Manet").unwrap();
    context.set_to_one(&painting, "artist", Some(&artist)).unwrap();
    context.commit_changes().unwrap();

    assert_eq!(source.statements(), vec!["INSERT ARTIST", "INSERT PAINTING"]);
    assert_eq!(source.commits(), 1);
    let artist_key = artist.object_id().value_for("ARTIST_ID").cloned().unwrap();
    let inserted = source
        .rows("PAINTING")
        .into_iter()
        .find(|r| r.value("TITLE") == &Value::from("Olympia"))
        .unwrap();
    assert_eq!(inserted.value("ARTIST_ID"), &artist_key);
    assert_eq!(inserted.value("KIND"), &Value::Null);
    assert!(!context.has_changes());
}

#[test]
fn sub_entity_is_inserted_with_discriminator() {
    let source = seeded();
    let context = domain(&source).create_context();
    let fresco = context.new_object("Fresco").unwrap();
    context.write_property(&fresco, "title", "Last Supper").unwrap();
    context.write_property(&fresco, "wall", "refectory").unwrap();
    context.commit_changes().unwrap();

    let id = fresco.object_id();
    assert_eq!(id.entity_name(), "Painting");
    let row = source
        .rows("PAINTING")
        .into_iter()
        .find(|r| r.value("TITLE") == &Value::from("Last Supper"))
        .unwrap();
    assert_eq!(row.value("KIND"), &Value::from("F"));
    assert_eq!(row.value("WALL"), &Value::from("refectory"));

    let again = domain(&source).create_context().object_for_id(&id).unwrap().unwrap();
    assert_eq!(again.entity_name(), "Fresco");
}

#[test]
fn attribute_and_foreign_key_updates() {
    let source = seeded();
    let context = domain(&source).create_context();
    let renoir = context.object_for_id(&artist_id(2)).unwrap().unwrap();
    let monet = context.object_for_id(&artist_id(1)).unwrap().unwrap();
    let luncheon = context.object_for_id(&painting_id(20)).unwrap().unwrap();

    context.write_property(&renoir, "name", "Pierre-Auguste Renoir").unwrap();
    context.set_to_one(&luncheon, "artist", Some(&monet)).unwrap();
    assert_eq!(renoir.persistence_state(), PersistenceState::Modified);
    assert_eq!(context.read_to_many(&monet, "paintings").unwrap().len(), 3);
    assert_eq!(context.read_to_many(&renoir, "paintings").unwrap().len(), 1);
    context.commit_changes().unwrap();

    let mut statements = source.statements();
    statements.sort();
    assert_eq!(statements, vec!["UPDATE ARTIST", "UPDATE PAINTING"]);
    assert_eq!(
        names(&source.rows("ARTIST"), "ARTIST_NAME"),
        vec!["Monet", "Pierre-Auguste Renoir"]
    );
    let moved = source
        .rows("PAINTING")
        .into_iter()
        .find(|r| r.value("PAINTING_ID") == &Value::from(20i64))
        .unwrap();
    assert_eq!(moved.value("ARTIST_ID"), &Value::from(1i64));
    assert_eq!(renoir.persistence_state(), PersistenceState::Committed);
}

#[test]
fn writing_the_loaded_value_commits_nothing() {
    let source = seeded();
    let context = domain(&source).create_context();
    let artist = context.object_for_id(&artist_id(1)).unwrap().unwrap();
    context.write_property(&artist, "name", "Monet").unwrap();
    assert!(context.has_changes());

    context.commit_changes().unwrap();
    assert!(source.statements().is_empty());
    assert_eq!(source.begins(), 0);
    assert_eq!(artist.persistence_state(), PersistenceState::Committed);
    assert!(!context.has_changes());
}

#[test]
fn cascade_deletes_children_before_parent() {
    let source = seeded();
    let context = domain_with(&source, gallery_with_rules(DeleteRule::Cascade), DomainConfig::default())
        .create_context();
    let artist = context.object_for_id(&artist_id(1)).unwrap().unwrap();
    context.delete_object(&artist).unwrap();
    assert_eq!(context.deleted_objects().len(), 3);
    context.commit_changes().unwrap();

    let statements = source.statements();
    assert_eq!(statements.first().map(String::as_str), Some("DELETE ARTIST_GROUP"));
    assert_eq!(statements.last().map(String::as_str), Some("DELETE ARTIST"));
    assert_eq!(statements.iter().filter(|s| *s == "DELETE PAINTING").count(), 2);

    assert_eq!(names(&source.rows("ARTIST"), "ARTIST_NAME"), vec!["Renoir"]);
    assert_eq!(source.rows("PAINTING").len(), 2);
    assert_eq!(source.rows("ARTIST_GROUP").len(), 1);
    assert!(context.get_object(&artist_id(1)).is_none());
    assert_eq!(artist.persistence_state(), PersistenceState::Transient);
}

#[test]
fn to_many_without_reverse_updates_target_foreign_key() {
    let source = seeded();
    source.insert("GALLERY", DataRow::new().with("GALLERY_ID", 3i64).with("GALLERY_NAME", "Orsay"));
    let context = domain(&source).create_context();
    let gallery = context
        .object_for_id(&ObjectId::of("Gallery", "GALLERY_ID", 3i64))
        .unwrap()
        .unwrap();
    let painting = context.object_for_id(&painting_id(20)).unwrap().unwrap();

    context.add_to_many(&gallery, "paintings", &painting).unwrap();
    assert_eq!(painting.persistence_state(), PersistenceState::Modified);
    context.commit_changes().unwrap();

    assert_eq!(source.statements(), vec!["UPDATE PAINTING"]);
    let row = source
        .rows("PAINTING")
        .into_iter()
        .find(|r| r.value("PAINTING_ID") == &Value::from(20i64))
        .unwrap();
    assert_eq!(row.value("GALLERY_ID"), &Value::from(3i64));
    assert_eq!(row.value("ARTIST_ID"), &Value::from(2i64));
}

#[test]
fn many_to_many_link_rows() {
    let source = seeded();
    let context = domain(&source).create_context();
    let artist = context.object_for_id(&artist_id(1)).unwrap().unwrap();
    let group = context.new_object("Group").unwrap();
    context.write_property(&group, "name", "Salon des Refusés").unwrap();
    context.add_to_many(&artist, "groups", &group).unwrap();
    assert_eq!(context.read_to_many(&group, "artists").unwrap().len(), 1);
    context.commit_changes().unwrap();

    assert_eq!(source.statements(), vec!["INSERT GRP", "INSERT ARTIST_GROUP"]);
    let key = group.object_id().value_for("GROUP_ID").cloned().unwrap();
    let links: Vec<DataRow> = source
        .rows("ARTIST_GROUP")
        .into_iter()
        .filter(|r| r.value("GROUP_ID") == &key)
        .collect();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].value("ARTIST_ID"), &Value::from(1i64));

    source.clear_log();
    let existing = context.object_for_id(&group_id(5)).unwrap().unwrap();
    context.remove_to_many(&artist, "groups", &existing).unwrap();
    context.commit_changes().unwrap();
    assert_eq!(source.statements(), vec!["DELETE ARTIST_GROUP"]);
    assert_eq!(source.rows("ARTIST_GROUP").len(), 2);
}

#[test]
fn removing_and_restoring_a_link_cancels_out() {
    let source = seeded();
    let context = domain(&source).create_context();
    let artist = context.object_for_id(&artist_id(1)).unwrap().unwrap();
    let group = context.object_for_id(&group_id(5)).unwrap().unwrap();

    context.remove_to_many(&artist, "groups", &group).unwrap();
    context.add_to_many(&artist, "groups", &group).unwrap();
    context.commit_changes().unwrap();

    assert!(source.statements().is_empty());
    assert_eq!(source.rows("ARTIST_GROUP").len(), 2);
}

#[test]
fn missing_mandatory_attribute_fails_validation() {
    let source = seeded();
    let context = domain(&source).create_context();
    let artist = context.new_object("Artist").unwrap();

    match context.commit_changes() {
        Err(Error::Validation(err)) => {
            assert_eq!(err.errors.len(), 1);
            assert_eq!(err.errors[0].property, "name");
            assert_eq!(err.errors[0].object_id, artist.object_id());
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(source.begins(), 0);
    assert_eq!(artist.persistence_state(), PersistenceState::New);
}

#[test]
fn failed_commit_keeps_changes_for_retry() {
    let source = seeded();
    let context = domain(&source).create_context();
    let artist = context.new_object("Artist").unwrap();
    context.write_property(&artist, "name", "Morisot").unwrap();
    source.fail_on("ARTIST");

    let err = context.commit_changes().unwrap_err();
    match err.unwind() {
        Error::Commit(commit) => assert_eq!(commit.kind, CommitErrorKind::Constraint),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(source.rollbacks(), 1);
    assert!(artist.object_id().is_temporary());
    assert_eq!(artist.persistence_state(), PersistenceState::New);

    source.stop_failing();
    context.commit_changes().unwrap();
    assert_eq!(artist.persistence_state(), PersistenceState::Committed);
    assert_eq!(names(&source.rows("ARTIST"), "ARTIST_NAME"), vec!["Monet", "Morisot", "Renoir"]);
}

#[test]
fn concurrent_change_is_an_optimistic_lock_failure() {
    let source = seeded();
    source.insert("ACCOUNT", DataRow::new().with("ACCOUNT_ID", 1i64).with("BALANCE", 100i64));
    let context = domain(&source).create_context();
    let account = context
        .object_for_id(&ObjectId::of("Account", "ACCOUNT_ID", 1i64))
        .unwrap()
        .unwrap();
    context.write_property(&account, "balance", 150i64).unwrap();

    source.update_where("ACCOUNT", &Expression::eq("ACCOUNT_ID", 1i64), "BALANCE", 120i64);
    let err = context.commit_changes().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(account.persistence_state(), PersistenceState::Modified);
    assert_eq!(source.rows("ACCOUNT")[0].value("BALANCE"), &Value::from(120i64));

    context.rollback_changes().unwrap();
    assert_eq!(account.persistence_state(), PersistenceState::Hollow);
    context.invalidate_objects(&[account.clone()]).unwrap();
    assert_eq!(context.read_attribute(&account, "balance").unwrap(), Value::from(120i64));
    context.write_property(&account, "balance", 170i64).unwrap();
    context.commit_changes().unwrap();
    assert_eq!(source.rows("ACCOUNT")[0].value("BALANCE"), &Value::from(170i64));
}

#[test]
fn bound_transaction_is_used_and_marked_on_failure() {
    let source = seeded();
    let context = domain(&source).create_context();
    let transaction = MemoryTransaction::external(&source);
    let _binding = bind_transaction(Arc::clone(&transaction) as Arc<dyn Transaction>);

    let artist = context.object_for_id(&artist_id(1)).unwrap().unwrap();
    context.write_property(&artist, "name", "Claude Monet").unwrap();
    context.commit_changes().unwrap();
    assert_eq!(source.begins(), 0);
    assert_eq!(source.commits(), 0);
    assert!(!transaction.is_rollback_only());

    source.fail_on("ARTIST");
    context.write_property(&artist, "name", "C. Monet").unwrap();
    assert!(context.commit_changes().is_err());
    assert!(transaction.is_rollback_only());
    assert_eq!(source.rollbacks(), 0);
}

#[test]
fn commit_listener_sees_permanent_ids() {
    let source = seeded();
    let context = domain_with(&source, gallery(), DomainConfig::default()).create_context();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    context.add_commit_listener(move |event| {
        let ids: Vec<ObjectId> = event.diff.id_changes().map(|(_, new)| new.clone()).collect();
        sink.lock().unwrap().extend(ids);
    });

    let artist = context.new_object("Artist").unwrap();
    context.write_property(&artist, "name", "Sisley").unwrap();
    context.commit_changes().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![artist.object_id()]);
}

#[test]
fn committed_diff_serializes_to_json() {
    let source = seeded();
    let context = domain(&source).create_context();
    let captured = Arc::new(std::sync::Mutex::new(String::new()));
    let sink = Arc::clone(&captured);
    context.add_commit_listener(move |event| {
        *sink.lock().unwrap() = event.diff.to_json().unwrap();
    });

    let artist = context.new_object("Artist").unwrap();
    context.write_property(&artist, "name", "Bazille").unwrap();
    context.commit_changes().unwrap();

    let json: serde_json::Value = serde_json::from_str(&captured.lock().unwrap()).unwrap();
    let diffs = json["diffs"].as_array().unwrap();
    let kinds: Vec<&str> = diffs
        .iter()
        .filter_map(|d| d.as_object()?.keys().next().map(String::as_str))
        .collect();
    assert_eq!(kinds, vec!["NodeCreated", "NodePropertyChanged", "NodeIdChanged"]);
    assert_eq!(diffs[0]["NodeCreated"]["entity"], "Artist");
    assert_eq!(diffs[1]["NodePropertyChanged"]["property"], "name");
}
