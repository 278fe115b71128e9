//! Deleting objects with their relationship delete rules.

use std::collections::HashSet;

use rowgraph_core::{DeleteDeniedError, DeleteRule, Error, ObjectId, PersistenceState, Result};

use crate::context::DataContext;
use crate::graph_diff::NodeDiff;
use crate::identity_map::StoreGuard;
use crate::object::ObjectRef;

/// One delete call, possibly cascading over many objects.
pub(crate) struct DeleteAction<'c, 'g, 'a> {
    context: &'c DataContext,
    guard: &'g mut StoreGuard<'a>,
    /// Objects whose delete is in progress; cascades reaching them stop.
    deleting: HashSet<ObjectId>,
}

impl<'c, 'g, 'a> DeleteAction<'c, 'g, 'a> {
    pub(crate) fn new(context: &'c DataContext, guard: &'g mut StoreGuard<'a>) -> Self {
        Self {
            context,
            guard,
            deleting: HashSet::new(),
        }
    }

    /// Delete `object`. Returns `false` when there was nothing to do.
    ///
    /// `NoAction` leaves the relationships of persistent objects alone, but a
    /// NEW object is always unlinked: it is unregistered right after, and a
    /// related object left pointing at it would commit a foreign key to a
    /// row that is never inserted.
    pub(crate) fn perform(&mut self, object: &ObjectRef) -> Result<bool> {
        let id = object.object_id();
        if matches!(
            object.persistence_state(),
            PersistenceState::Transient | PersistenceState::Deleted
        ) || !self.deleting.insert(id.clone())
        {
            return Ok(false);
        }
        self.context.resolve_fault(self.guard, object)?;
        let was_new = object.persistence_state() == PersistenceState::New;
        let descriptor = self.guard.descriptor_of(object)?;

        for relationship in descriptor.relationships.iter().filter(|r| r.delete_rule == DeleteRule::Deny) {
            let related = self
                .context
                .related_objects(self.guard, object, relationship)?
                .iter()
                .filter(|r| r.persistence_state() != PersistenceState::Deleted)
                .count();
            if related > 0 {
                self.deleting.remove(&id);
                tracing::debug!(%id, relationship = %relationship.name, related, "delete denied");
                return Err(Error::DeleteDenied(DeleteDeniedError {
                    object_id: id,
                    relationship: relationship.name.clone(),
                    related_count: related,
                }));
            }
        }

        if !was_new {
            self.guard.register_diff(
                &id,
                NodeDiff::NodeRemoved {
                    diff_id: 0,
                    node: id.clone(),
                },
            )?;
            object.set_state(PersistenceState::Deleted);
        }

        for relationship in &descriptor.relationships {
            let flattened = relationship.is_flattened();
            let rule = relationship.delete_rule;
            if rule == DeleteRule::Deny || (rule == DeleteRule::NoAction && !flattened && !was_new) {
                continue;
            }
            for target in self.context.related_objects(self.guard, object, relationship)? {
                match rule {
                    DeleteRule::Cascade => {
                        if flattened {
                            self.context.unlink(self.guard, object, relationship, &target, true)?;
                        }
                        self.perform(&target)?;
                    }
                    DeleteRule::Nullify | DeleteRule::NoAction => {
                        self.context.unlink(self.guard, object, relationship, &target, true)?;
                    }
                    DeleteRule::Deny => {}
                }
            }
        }

        if was_new {
            self.guard.unregister_node(&id);
        }
        tracing::debug!(%id, was_new, "object deleted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rowgraph_core::{DataRow, EntityResolver, Value};

    use crate::channel::DataSource;
    use crate::config::DomainConfig;
    use crate::domain::DataDomain;
    use crate::test_support::{
        MemorySource, artist_id, artist_row, gallery_with_rules, painting_id, painting_row,
    };

    use super::*;

    fn context(resolver: Arc<EntityResolver>, source: &Arc<MemorySource>) -> Arc<DataContext> {
        let domain = DataDomain::new(
            "delete",
            Arc::clone(source) as Arc<dyn DataSource>,
            resolver,
            DomainConfig::default(),
        )
        .unwrap();
        domain.create_context()
    }

    fn seeded() -> Arc<MemorySource> {
        let source = Arc::new(MemorySource::new());
        source.insert("ARTIST", artist_row(1, "Monet"));
        source.insert("PAINTING", painting_row(10, 1, "Lilies"));
        source.insert("PAINTING", painting_row(11, 1, "Haystacks"));
        source
    }

    fn artist(context: &DataContext) -> ObjectRef {
        context.object_for_id(&artist_id(1)).unwrap().unwrap()
    }

    #[test]
    fn test_deny_leaves_object_untouched() {
        let source = seeded();
        let context = context(gallery_with_rules(DeleteRule::Deny, DeleteRule::NoAction), &source);
        let artist = artist(&context);
        let err = context.delete_object(&artist).unwrap_err();
        match err {
            Error::DeleteDenied(denied) => {
                assert_eq!(denied.relationship, "paintings");
                assert_eq!(denied.related_count, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(artist.persistence_state(), PersistenceState::Committed);
        assert!(!context.has_changes());
    }

    #[test]
    fn test_cascade_deletes_related() {
        let source = seeded();
        let context = context(gallery_with_rules(DeleteRule::Cascade, DeleteRule::NoAction), &source);
        let artist = artist(&context);
        let paintings = context.read_to_many(&artist, "paintings").unwrap();
        context.delete_object(&artist).unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Deleted);
        assert!(paintings.iter().all(|p| p.persistence_state() == PersistenceState::Deleted));
        assert_eq!(context.deleted_objects().len(), 3);

        context.commit_changes().unwrap();
        assert!(source.rows("ARTIST").is_empty());
        assert!(source.rows("PAINTING").is_empty());
    }

    #[test]
    fn test_cascade_cycle_terminates() {
        let source = seeded();
        let context = context(gallery_with_rules(DeleteRule::Cascade, DeleteRule::Cascade), &source);
        let artist = artist(&context);
        context.delete_object(&artist).unwrap();
        assert_eq!(context.deleted_objects().len(), 3);
    }

    #[test]
    fn test_nullify_clears_reverse() {
        let source = seeded();
        let context = context(gallery_with_rules(DeleteRule::Nullify, DeleteRule::NoAction), &source);
        let artist = artist(&context);
        let paintings = context.read_to_many(&artist, "paintings").unwrap();
        context.delete_object(&artist).unwrap();
        for painting in &paintings {
            assert_eq!(painting.persistence_state(), PersistenceState::Modified);
            assert!(context.read_to_one(painting, "artist").unwrap().is_none());
        }
        context.commit_changes().unwrap();
        assert!(source.rows("PAINTING").iter().all(|r| r.value("ARTIST_ID").is_null()));
        assert!(source.rows("ARTIST").is_empty());
    }

    #[test]
    fn test_deleting_new_object_unregisters_it() {
        let source = seeded();
        let context = context(gallery_with_rules(DeleteRule::NoAction, DeleteRule::NoAction), &source);
        let artist = artist(&context);
        let painting = context.new_object("Painting").unwrap();
        context.set_to_one(&painting, "artist", Some(&artist)).unwrap();
        assert_eq!(context.read_to_many(&artist, "paintings").unwrap().len(), 3);

        context.delete_object(&painting).unwrap();
        assert_eq!(painting.persistence_state(), PersistenceState::Transient);
        assert!(context.get_object(&painting.object_id()).is_none());
        assert_eq!(context.read_to_many(&artist, "paintings").unwrap().len(), 2);
    }

    #[test]
    fn test_deleting_new_target_clears_foreign_keys_to_it() {
        let source = seeded();
        let context = context(gallery_with_rules(DeleteRule::NoAction, DeleteRule::NoAction), &source);
        let artist = context.new_object("Artist").unwrap();
        let painting = context.object_for_id(&painting_id(10)).unwrap().unwrap();
        context.set_to_one(&painting, "artist", Some(&artist)).unwrap();

        context.delete_object(&artist).unwrap();
        assert_eq!(artist.persistence_state(), PersistenceState::Transient);
        assert!(context.read_to_one(&painting, "artist").unwrap().is_none());

        context.commit_changes().unwrap();
        assert!(!source.statements().contains(&"INSERT ARTIST".to_string()));
        assert_eq!(source.rows("ARTIST").len(), 1);
        let row = source
            .rows("PAINTING")
            .into_iter()
            .find(|r| r.value("PAINTING_ID") == &Value::from(10i64))
            .unwrap();
        assert!(row.value("ARTIST_ID").is_null());
    }

    #[test]
    fn test_no_action_removes_link_rows() {
        let source = seeded();
        source.insert("GRP", DataRow::new().with("GROUP_ID", 5i64).with("GROUP_NAME", "impressionists"));
        source.insert("ARTIST_GROUP", DataRow::new().with("ARTIST_ID", 1i64).with("GROUP_ID", 5i64));
        let context = context(gallery_with_rules(DeleteRule::NoAction, DeleteRule::NoAction), &source);
        let artist = artist(&context);
        context.delete_object(&artist).unwrap();
        context.commit_changes().unwrap();
        assert!(source.rows("ARTIST_GROUP").is_empty());
        assert_eq!(source.rows("GRP")[0].value("GROUP_NAME"), &Value::from("impressionists"));
    }
}
