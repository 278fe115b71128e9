//! Managed objects.
//!
//! A [`ManagedObject`] is the in-memory instance behind one [`ObjectId`] in one
//! context. Identity is reference identity of the [`ObjectRef`]: two lookups of
//! the same id in the same context return `Arc`s that are `ptr_eq`.
//!
//! Relationship values hold target *ids*, never target objects, so object
//! graphs never form reference cycles. Targets are looked up through the
//! owning context's identity map on access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rowgraph_core::{Error, IdentityErrorKind, ObjectId, PersistenceState, Result, Value};

/// Identifier of a context, unique within the process.
pub type ContextId = u64;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_context_id() -> ContextId {
    NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)
}

/// Shared handle to a managed object.
pub type ObjectRef = Arc<ManagedObject>;

/// Stored value of one property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Attribute(Value),
    ToOne(Option<ObjectId>),
    ToMany(Vec<ObjectId>),
    /// Unresolved; replaced on first access.
    Fault,
}

impl PropertyValue {
    pub fn is_fault(&self) -> bool {
        matches!(self, PropertyValue::Fault)
    }
}

#[derive(Debug)]
pub(crate) struct ObjectData {
    pub(crate) entity: String,
    pub(crate) id: ObjectId,
    pub(crate) state: PersistenceState,
    pub(crate) snapshot_version: Option<u64>,
    pub(crate) context: Option<ContextId>,
    pub(crate) values: HashMap<String, PropertyValue>,
}

impl ObjectData {
    pub(crate) fn attribute(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(PropertyValue::Attribute(v)) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn to_one(&self, name: &str) -> Option<Option<&ObjectId>> {
        match self.values.get(name) {
            Some(PropertyValue::ToOne(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Swap every reference to `old` for `new`.
    pub(crate) fn rewrite_references(&mut self, old: &ObjectId, new: &ObjectId) {
        for value in self.values.values_mut() {
            match value {
                PropertyValue::ToOne(Some(target)) if target == old => *target = new.clone(),
                PropertyValue::ToMany(targets) => {
                    for target in targets.iter_mut().filter(|t| *t == old) {
                        *target = new.clone();
                    }
                }
                _ => {}
            }
        }
    }
}

/// One object instance registered with (at most) one context.
#[derive(Debug)]
pub struct ManagedObject {
    data: RwLock<ObjectData>,
}

impl ManagedObject {
    pub(crate) fn new(entity: impl Into<String>, id: ObjectId, state: PersistenceState) -> ObjectRef {
        Arc::new(Self {
            data: RwLock::new(ObjectData {
                entity: entity.into(),
                id,
                state,
                snapshot_version: None,
                context: None,
                values: HashMap::new(),
            }),
        })
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ObjectData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ObjectData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Concrete entity name. Ids use the root entity of an inheritance
    /// hierarchy, this is the most specific one known so far: a HOLLOW
    /// object created from a relationship may be narrowed once its row is
    /// read.
    pub fn entity_name(&self) -> String {
        self.read().entity.clone()
    }

    pub fn object_id(&self) -> ObjectId {
        self.read().id.clone()
    }

    pub fn persistence_state(&self) -> PersistenceState {
        self.read().state
    }

    pub fn snapshot_version(&self) -> Option<u64> {
        self.read().snapshot_version
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.read().context
    }

    /// Raw stored value, without resolving faults.
    pub fn read_property_directly(&self, name: &str) -> Option<PropertyValue> {
        self.read().values.get(name).cloned()
    }

    /// Stored attribute value; `None` when unresolved or not an attribute.
    pub fn attribute_value(&self, name: &str) -> Option<Value> {
        self.read().attribute(name).cloned()
    }

    /// Reference identity.
    pub fn same(a: &ObjectRef, b: &ObjectRef) -> bool {
        Arc::ptr_eq(a, b)
    }

    pub(crate) fn set_state(&self, state: PersistenceState) {
        let mut data = self.write();
        if !data.state.can_transition_to(state) {
            tracing::warn!(id = %data.id, from = %data.state, to = %state, "unexpected state transition");
        }
        tracing::trace!(id = %data.id, from = %data.state, to = %state, "state transition");
        data.state = state;
    }

    /// Bind the object to `context`. An object that belongs to a different
    /// context and is still managed there cannot be adopted.
    pub(crate) fn attach(&self, context: ContextId) -> Result<()> {
        let mut data = self.write();
        match data.context {
            Some(current) if current != context && data.state.is_managed() => Err(Error::identity(
                IdentityErrorKind::ForeignContext,
                format!("{} is registered with context {}", data.id, current),
            )),
            _ => {
                data.context = Some(context);
                Ok(())
            }
        }
    }

    /// Drop the context binding and make the object TRANSIENT.
    pub(crate) fn detach(&self) {
        let mut data = self.write();
        data.context = None;
        data.state = PersistenceState::Transient;
    }

    /// Forget resolved values; the next access faults.
    pub(crate) fn make_hollow(&self) {
        let mut data = self.write();
        data.values.clear();
        data.state = PersistenceState::Hollow;
        data.snapshot_version = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist() -> ObjectRef {
        ManagedObject::new(
            "Artist",
            ObjectId::of("Artist", "ARTIST_ID", 1i64),
            PersistenceState::Committed,
        )
    }

    #[test]
    fn test_attach_is_guarded() {
        let obj = artist();
        obj.attach(1).unwrap();
        obj.attach(1).unwrap();
        let err = obj.attach(2).unwrap_err();
        assert!(matches!(err, Error::Identity(_)));

        obj.detach();
        assert_eq!(obj.persistence_state(), PersistenceState::Transient);
        obj.attach(2).unwrap();
        assert_eq!(obj.context_id(), Some(2));
    }

    #[test]
    fn test_rewrite_references() {
        let obj = artist();
        let old = ObjectId::temporary("Painting");
        let new = ObjectId::of("Painting", "PAINTING_ID", 5i64);
        {
            let mut data = obj.write();
            data.values.insert("paintings".into(), PropertyValue::ToMany(vec![old.clone()]));
            data.values.insert("favorite".into(), PropertyValue::ToOne(Some(old.clone())));
            data.rewrite_references(&old, &new);
        }
        assert_eq!(
            obj.read_property_directly("paintings"),
            Some(PropertyValue::ToMany(vec![new.clone()]))
        );
        assert_eq!(
            obj.read_property_directly("favorite"),
            Some(PropertyValue::ToOne(Some(new)))
        );
    }

    #[test]
    fn test_make_hollow_clears_values() {
        let obj = artist();
        obj.write()
            .values
            .insert("name".into(), PropertyValue::Attribute(Value::from("x")));
        obj.make_hollow();
        assert_eq!(obj.persistence_state(), PersistenceState::Hollow);
        assert!(obj.read_property_directly("name").is_none());
    }

    #[test]
    fn test_identity_is_reference_identity() {
        let a = artist();
        let b = Arc::clone(&a);
        let c = artist();
        assert!(ManagedObject::same(&a, &b));
        assert!(!ManagedObject::same(&a, &c));
    }
}
