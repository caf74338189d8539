//! Layered name-to-value storage shared between steps.

use crate::value::Value;
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Entries = IndexMap<String, Value>;

struct Layer {
    entries: Mutex<Entries>,
    parent: Option<Scope>,
    depth: usize,
}

/// A layered mapping from names to values.
///
/// A scope reads through its parents (the closest layer wins) but always
/// writes its own layer. Writes become visible to the parent only through
/// [`Scope::merge_into_parent`], which appends the whole local layer in one
/// step under the parent's lock.
///
/// Cloning a `Scope` is cheap and yields a handle to the same layer.
///
/// # Examples
///
/// ```
/// use kumihimo_core::Scope;
/// use serde_json::json;
///
/// let root = Scope::from_entries([("user", json!("alice"))]);
/// let child = root.child();
///
/// child.insert("user", json!("bob"));
/// assert_eq!(child.get("user"), Some(json!("bob")));
/// assert_eq!(root.get("user"), Some(json!("alice")));
///
/// child.merge_into_parent();
/// assert_eq!(root.get("user"), Some(json!("bob")));
/// ```
#[derive(Clone)]
pub struct Scope {
    layer: Arc<Layer>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("depth", &self.layer.depth)
            .field("keys", &self.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Creates an empty root scope.
    pub fn new() -> Self {
        Self::with_parent(None, Entries::new())
    }

    /// Creates a root scope seeded with the given entries.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self::with_parent(None, entries)
    }

    fn with_parent(parent: Option<Scope>, entries: Entries) -> Self {
        let depth = parent.as_ref().map_or(0, |p| p.layer.depth + 1);
        Self {
            layer: Arc::new(Layer {
                entries: Mutex::new(entries),
                parent,
                depth,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.layer
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a new empty layer on top of this one.
    pub fn child(&self) -> Scope {
        Self::with_parent(Some(self.clone()), Entries::new())
    }

    /// Returns the enclosing layer, if any.
    pub fn parent(&self) -> Option<&Scope> {
        self.layer.parent.as_ref()
    }

    /// Number of layers above this one (a root has depth 0).
    pub fn depth(&self) -> usize {
        self.layer.depth
    }

    /// Writes a value into the local layer.
    pub fn insert(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.lock().insert(name.into(), value.into());
    }

    /// Writes all entries into the local layer at once.
    pub fn extend<I, K>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut local = self.lock();
        for (name, value) in entries {
            local.insert(name.into(), value);
        }
    }

    /// Looks a name up, local layer first, then each parent outward.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(value) = scope.lock().get(name) {
                return Some(value.clone());
            }
            current = scope.parent();
        }
        None
    }

    /// Returns `true` if any layer holds the name.
    pub fn contains(&self, name: &str) -> bool {
        self.lookup_depth(name).is_some()
    }

    /// Returns `true` if the local layer holds the name.
    pub fn contains_local(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Returns how many layers up the name was found (0 means local).
    pub fn lookup_depth(&self, name: &str) -> Option<usize> {
        let mut current = Some(self);
        let mut distance = 0;
        while let Some(scope) = current {
            if scope.lock().contains_key(name) {
                return Some(distance);
            }
            distance += 1;
            current = scope.parent();
        }
        None
    }

    /// Snapshot of the local layer, in insertion order.
    pub fn local_entries(&self) -> IndexMap<String, Value> {
        self.lock().clone()
    }

    /// Number of entries in the local layer.
    pub fn local_len(&self) -> usize {
        self.lock().len()
    }

    /// Appends the local layer into the parent layer.
    ///
    /// Returns the number of merged entries; a root scope merges nothing.
    pub fn merge_into_parent(&self) -> usize {
        let Some(parent) = self.parent() else {
            return 0;
        };
        let local = self.local_entries();
        let merged = local.len();
        parent.extend(local);
        merged
    }

    /// Full view of every visible name, children shadowing parents.
    pub fn flatten(&self) -> IndexMap<String, Value> {
        let mut chain = Vec::with_capacity(self.depth() + 1);
        let mut current = Some(self);
        while let Some(scope) = current {
            chain.push(scope);
            current = scope.parent();
        }

        let mut view = IndexMap::new();
        for scope in chain.into_iter().rev() {
            for (name, value) in scope.lock().iter() {
                view.insert(name.clone(), value.clone());
            }
        }
        view
    }

    /// Returns `true` if both handles point at the same layer.
    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.layer, &other.layer)
    }
}
