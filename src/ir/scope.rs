use std::{
    borrow::Borrow,
    collections::{hash_map::Entry, HashMap},
    hash::Hash,
    sync::Arc,
};

/// A map that resolves keys through a chain of enclosing scopes.
///
/// The enclosing scopes are frozen, shared snapshots; only the innermost overlay is mutable.
/// Inserting always writes the overlay. Removing a key that is only visible through the
/// parent chain copies the ancestors up to (and including) the one that binds it into the
/// overlay and re-links the overlay past them, so siblings sharing the same parent are never
/// affected.
#[derive(Debug, Clone)]
pub struct ScopedMap<K, V> {
    /// Enclosing scope, if any.
    parent: Option<Arc<ScopedMap<K, V>>>,

    items: HashMap<K, V>,
}

impl<K, V> Default for ScopedMap<K, V> {
    fn default() -> Self {
        Self {
            parent: None,
            items: HashMap::new(),
        }
    }
}

impl<K, V> ScopedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new scope nested inside `parent`.
    pub fn child(parent: &Arc<Self>) -> Self {
        Self {
            parent: Some(Arc::clone(parent)),
            items: HashMap::new(),
        }
    }

    /// Recovers a frozen scope for mutation once every child has been dropped.
    pub fn thaw(frozen: Arc<Self>) -> Self {
        Arc::try_unwrap(frozen).unwrap_or_else(|shared| (*shared).clone())
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut scope = self;
        loop {
            if let Some(value) = scope.items.get(key) {
                return Some(value);
            }
            match &scope.parent {
                Some(parent) => scope = parent,
                None => return None,
            }
        }
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Whether the key is bound in the innermost scope itself.
    pub fn contains_local<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.items.contains_key(key)
    }

    /// Binds the key in the innermost scope, returning the previous local binding.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.items.insert(key, value)
    }

    /// Binds the key in the innermost scope unless it is already visible.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        if self.contains_key(&key) {
            return false;
        }
        match self.items.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }

    /// Makes the key invisible from this scope, returning the value that was visible.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut removed = self.items.remove(key);

        while let Some(depth) = self.inherited_depth(key) {
            let mut cursor = self.parent.take();
            for _ in 0..=depth {
                let Some(scope) = cursor else {
                    unreachable!("inherited depth is bounded by the parent chain");
                };
                for (k, v) in &scope.items {
                    if k.borrow() == key {
                        if removed.is_none() {
                            removed = Some(v.clone());
                        }
                        continue;
                    }
                    self.items.entry(k.clone()).or_insert_with(|| v.clone());
                }
                cursor = scope.parent.clone();
            }
            self.parent = cursor;
        }

        removed
    }

    /// Distance (0 = direct parent) to the nearest ancestor binding the key.
    fn inherited_depth<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut depth = 0;
        let mut cursor = self.parent.as_deref();
        while let Some(scope) = cursor {
            if scope.items.contains_key(key) {
                return Some(depth);
            }
            depth += 1;
            cursor = scope.parent.as_deref();
        }
        None
    }

    /// Number of scopes in the chain, including this one.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut cursor = self.parent.as_deref();
        while let Some(scope) = cursor {
            depth += 1;
            cursor = scope.parent.as_deref();
        }
        depth
    }

    /// Collapses the chain into a plain map where inner bindings win.
    pub fn to_map(&self) -> HashMap<K, V> {
        let mut map = HashMap::new();
        let mut cursor = Some(self);
        while let Some(scope) = cursor {
            for (k, v) in &scope.items {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
            cursor = scope.parent.as_deref();
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        let mut cursor = Some(self);
        while let Some(scope) = cursor {
            if !scope.items.is_empty() {
                return false;
            }
            cursor = scope.parent.as_deref();
        }
        true
    }
}

impl<K, V> FromIterator<(K, V)> for ScopedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            parent: None,
            items: iter.into_iter().collect(),
        }
    }
}

impl<K, V> Extend<(K, V)> for ScopedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ScopedMap;

    fn chain() -> (Arc<ScopedMap<&'static str, i32>>, ScopedMap<&'static str, i32>) {
        let mut root = ScopedMap::new();
        root.insert("a", 1);
        root.insert("b", 2);
        let root = Arc::new(root);
        let mut mid = ScopedMap::child(&root);
        mid.insert("c", 3);
        let mid = Arc::new(mid);
        let leaf = ScopedMap::child(&mid);
        (mid, leaf)
    }

    #[test]
    fn lookups_walk_the_chain() {
        let (_mid, mut leaf) = chain();
        assert_eq!(leaf.get("a"), Some(&1));
        assert_eq!(leaf.get("c"), Some(&3));
        assert_eq!(leaf.get("z"), None);
        assert_eq!(leaf.depth(), 3);

        leaf.insert("a", 10);
        assert_eq!(leaf.get("a"), Some(&10));
        assert!(leaf.contains_local("a"));
        assert!(!leaf.contains_local("b"));
    }

    #[test]
    fn removing_inherited_key_leaves_siblings_alone() {
        let (mid, mut leaf) = chain();
        let sibling = ScopedMap::child(&mid);

        assert_eq!(leaf.remove("a"), Some(1));
        assert_eq!(leaf.get("a"), None);
        assert_eq!(leaf.get("b"), Some(&2));
        assert_eq!(leaf.get("c"), Some(&3));
        // The chain above the removed binding was copied into the overlay.
        assert_eq!(leaf.depth(), 1);

        assert_eq!(sibling.get("a"), Some(&1));
        assert_eq!(mid.get("a"), Some(&1));
    }

    #[test]
    fn removing_only_copies_the_needed_prefix() {
        let (_mid, mut leaf) = chain();
        assert_eq!(leaf.remove("c"), Some(3));
        assert_eq!(leaf.get("c"), None);
        assert_eq!(leaf.get("a"), Some(&1));
        // Only the middle scope was folded in; the root is still shared.
        assert_eq!(leaf.depth(), 2);
    }

    #[test]
    fn removing_shadowed_key_hides_every_binding() {
        let mut root = ScopedMap::new();
        root.insert("x", 1);
        let root = Arc::new(root);
        let mut mid = ScopedMap::child(&root);
        mid.insert("x", 2);
        let mid = Arc::new(mid);
        let mut leaf = ScopedMap::child(&mid);
        leaf.insert("x", 3);

        assert_eq!(leaf.remove("x"), Some(3));
        assert!(!leaf.contains_key("x"));
        assert_eq!(mid.get("x"), Some(&2));
    }

    #[test]
    fn thaw_recovers_unique_scope() {
        let mut map = ScopedMap::new();
        map.insert("k", 7);
        let frozen = Arc::new(map);
        {
            let child = ScopedMap::child(&frozen);
            assert_eq!(child.get("k"), Some(&7));
        }
        let mut thawed = ScopedMap::thaw(frozen);
        thawed.insert("k2", 8);
        assert_eq!(thawed.to_map().len(), 2);
    }
}
