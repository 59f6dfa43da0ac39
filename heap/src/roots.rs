//! Root sources: per-mutator root providers and global static slots.

use parking_lot::Mutex;

use crate::object::{ObjectRef, RefField};

/// Supplies the roots of one execution context.
///
/// The collector calls it either on the owning thread (during a phase
/// handshake) or on its own thread while the owner sits in a safe region,
/// so implementations synchronize internally.
pub trait RootProvider: Send + Sync {
    /// Calls `visitor` on every root slot. The visitor may rewrite a slot
    /// with the object's new address.
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef));
}

/// A shadow stack of roots, indexed by slot.
#[derive(Debug, Default)]
pub struct RootStack {
    slots: Mutex<Vec<ObjectRef>>,
}

impl RootStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes `obj` and returns its slot.
    pub fn push(&self, obj: ObjectRef) -> usize {
        let mut slots = self.slots.lock();
        slots.push(obj);
        slots.len() - 1
    }

    pub fn pop(&self) -> Option<ObjectRef> {
        self.slots.lock().pop()
    }

    #[inline]
    pub fn get(&self, slot: usize) -> ObjectRef {
        self.slots.lock()[slot]
    }

    #[inline]
    pub fn set(&self, slot: usize, obj: ObjectRef) {
        self.slots.lock()[slot] = obj;
    }

    pub fn truncate(&self, len: usize) {
        self.slots.lock().truncate(len);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ObjectRef> {
        self.slots.lock().clone()
    }
}

impl RootProvider for RootStack {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        for slot in self.slots.lock().iter_mut() {
            if !slot.is_null() {
                visitor(slot);
            }
        }
    }
}

/// Global reference slots registered by the embedder. They are traced like
/// object fields, so they may hold tagged words.
#[derive(Default)]
pub struct StaticRoots {
    fields: Mutex<Vec<&'static RefField>>,
}

impl StaticRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, field: &'static RefField) {
        self.fields.lock().push(field);
    }

    pub fn unregister(&self, field: &'static RefField) {
        self.fields
            .lock()
            .retain(|f| !std::ptr::eq(*f, field));
    }

    pub fn len(&self) -> usize {
        self.fields.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.lock().is_empty()
    }

    pub fn visit(&self, mut f: impl FnMut(&RefField)) {
        let fields = self.fields.lock().clone();
        for field in fields {
            f(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::RefWord;

    #[test]
    fn test_root_stack_visits_non_null_slots() {
        let stack = RootStack::new();
        let a = stack.push(ObjectRef::from_addr(0x1000));
        stack.push(ObjectRef::NULL);
        stack.push(ObjectRef::from_addr(0x2000));

        let mut seen = 0;
        stack.visit_roots(&mut |slot| {
            seen += 1;
            *slot = ObjectRef::from_addr(slot.addr() + 8);
        });
        assert_eq!(seen, 2);
        assert_eq!(stack.get(a), ObjectRef::from_addr(0x1008));
        assert_eq!(stack.pop(), Some(ObjectRef::from_addr(0x2008)));
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_static_roots_register_and_unregister() {
        let roots = StaticRoots::new();
        let a: &'static RefField = Box::leak(Box::new(RefField::new(RefWord::NULL)));
        let b: &'static RefField = Box::leak(Box::new(RefField::new(RefWord::NULL)));
        roots.register(a);
        roots.register(b);
        assert_eq!(roots.len(), 2);
        roots.unregister(a);
        let mut seen = Vec::new();
        roots.visit(|f| seen.push(f.addr()));
        assert_eq!(seen, vec![b.addr()]);
    }
}
