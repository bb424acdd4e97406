//! Object Registry
//!
//! Maps opaque 32-bit kernel object IDs to the objects they name. Every entry
//! carries a name tag identifying the subsystem that registered it, so a
//! handler can verify that a guest-supplied handle really belongs to it.
//!
//! The registry never owns an object: it keeps a `Weak` reference and the
//! owning subsystem decides when the object goes away. An ID whose object has
//! been dropped no longer resolves, even before it is released.
//!
//! A dead entry keeps its number until its owner calls `release`; the
//! registry never prunes it. Every owner releases its ID on teardown.
//!
//! # API Reference
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cellhle_core::runtime::id::ObjectRegistry;
//!
//! let objects = ObjectRegistry::new();
//! let thread = Arc::new(42u32);
//! let id = objects.register(&thread, "sys_ppu_thread");
//! assert!(objects.check_id_tagged(id, "sys_ppu_thread"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use log::trace;

use crate::error::IdError;

/// First ID handed out by a fresh registry. Zero is never a valid handle.
pub const FIRST_ID: u32 = 1;

type AnyObject = dyn Any + Send + Sync;

struct Entry {
    tag: Arc<str>,
    object: Weak<AnyObject>,
}

struct Table {
    entries: HashMap<u32, Entry>,
    next_id: u32,
}

impl Table {
    /// Next free ID at or after the cursor. Skips zero and live entries.
    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

/// A resolved registry entry.
#[derive(Clone)]
pub struct ObjectRef {
    pub id: u32,
    pub tag: Arc<str>,
    pub object: Arc<AnyObject>,
}

impl ObjectRef {
    /// Downcast the object to its concrete type.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, IdError> {
        let ObjectRef { id, tag, object } = self;
        object.downcast::<T>().map_err(|_| IdError::TypeMismatch {
            id,
            tag: tag.to_string(),
        })
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// Process-wide (per session) ID table.
///
/// Registration and release take the write lock; lookups share the read lock.
pub struct ObjectRegistry {
    table: RwLock<Table>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table {
                entries: HashMap::new(),
                next_id: FIRST_ID,
            }),
        }
    }

    /// Register a shared object under `tag` and return its fresh ID.
    pub fn register<T: Any + Send + Sync>(&self, object: &Arc<T>, tag: &str) -> u32 {
        self.register_weak(Arc::downgrade(object), tag)
    }

    /// Register an object by weak reference.
    ///
    /// Usable from `Arc::new_cyclic`, before the strong reference exists.
    pub fn register_weak<T: Any + Send + Sync>(&self, object: Weak<T>, tag: &str) -> u32 {
        let object: Weak<AnyObject> = object;
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let id = table.allocate();
        table.entries.insert(
            id,
            Entry {
                tag: Arc::from(tag),
                object,
            },
        );
        trace!(target: "id", "registered {} as id {}", tag, id);
        id
    }

    /// Drop the ID association. The object itself is untouched.
    pub fn release(&self, id: u32) -> Result<(), IdError> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        match table.entries.remove(&id) {
            Some(entry) => {
                trace!(target: "id", "released {} id {}", entry.tag, id);
                Ok(())
            }
            None => Err(IdError::NotFound(id)),
        }
    }

    /// Whether `id` resolves to a live object.
    pub fn check_id(&self, id: u32) -> bool {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .entries
            .get(&id)
            .is_some_and(|entry| entry.object.strong_count() > 0)
    }

    /// Whether `id` resolves to a live object registered under `tag`.
    pub fn check_id_tagged(&self, id: u32, tag: &str) -> bool {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .entries
            .get(&id)
            .is_some_and(|entry| &*entry.tag == tag && entry.object.strong_count() > 0)
    }

    /// Resolve `id` to its entry.
    pub fn lookup(&self, id: u32) -> Result<ObjectRef, IdError> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let entry = table.entries.get(&id).ok_or(IdError::NotFound(id))?;
        let object = entry.object.upgrade().ok_or(IdError::NotFound(id))?;
        Ok(ObjectRef {
            id,
            tag: entry.tag.clone(),
            object,
        })
    }

    /// Resolve `id` and downcast it to `T`.
    pub fn lookup_as<T: Any + Send + Sync>(&self, id: u32) -> Result<Arc<T>, IdError> {
        self.lookup(id)?.downcast()
    }

    /// Number of registered IDs, live or not.
    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All IDs registered under `tag`, in ascending order.
    pub fn ids_with_tag(&self, tag: &str) -> Vec<u32> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<u32> = table
            .entries
            .iter()
            .filter(|(_, entry)| &*entry.tag == tag)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}
