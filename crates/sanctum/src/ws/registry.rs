//! Scope-keyed membership sets shared by all hubs.
//!
//! A hub keeps one or more [`ScopedRegistry`] values inside a single
//! `RwLock`. The registry itself does no locking and no I/O: callers collect a
//! snapshot under the lock and deliver after releasing it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// `scope -> member -> value`, with empty scopes pruned.
#[derive(Debug)]
pub struct ScopedRegistry<K, M, V> {
    scopes: HashMap<K, HashMap<M, V>>,
}

impl<K, M, V> Default for ScopedRegistry<K, M, V> {
    fn default() -> Self {
        Self {
            scopes: HashMap::new(),
        }
    }
}

impl<K, M, V> ScopedRegistry<K, M, V>
where
    K: Eq + Hash + Clone,
    M: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace `member` in `scope`, returning the value it replaced.
    pub fn register(&mut self, scope: K, member: M, value: V) -> Option<V> {
        self.scopes.entry(scope).or_default().insert(member, value)
    }

    /// Remove `member` from `scope`, pruning the scope once it is empty.
    pub fn unregister(&mut self, scope: &K, member: &M) -> Option<V> {
        self.unregister_if(scope, member, |_| true)
    }

    /// Remove `member` only when `matches` accepts its current value.
    ///
    /// Used to avoid evicting a newer registration that replaced the one
    /// being torn down.
    pub fn unregister_if(
        &mut self,
        scope: &K,
        member: &M,
        matches: impl FnOnce(&V) -> bool,
    ) -> Option<V> {
        let members = self.scopes.get_mut(scope)?;
        let removed = if members.get(member).is_some_and(matches) {
            members.remove(member)
        } else {
            None
        };
        if members.is_empty() {
            self.scopes.remove(scope);
        }
        removed
    }

    /// Drop a whole scope.
    pub fn remove_scope(&mut self, scope: &K) -> Option<HashMap<M, V>> {
        self.scopes.remove(scope)
    }

    pub fn get(&self, scope: &K, member: &M) -> Option<&V> {
        self.scopes.get(scope)?.get(member)
    }

    pub fn contains(&self, scope: &K, member: &M) -> bool {
        self.get(scope, member).is_some()
    }

    pub fn contains_scope(&self, scope: &K) -> bool {
        self.scopes.contains_key(scope)
    }

    /// Number of members in `scope`.
    pub fn scope_len(&self, scope: &K) -> usize {
        self.scopes.get(scope).map_or(0, HashMap::len)
    }

    /// Number of non-empty scopes.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Number of members across all scopes.
    pub fn member_count(&self) -> usize {
        self.scopes.values().map(HashMap::len).sum()
    }

    pub fn scopes(&self) -> impl Iterator<Item = &K> {
        self.scopes.keys()
    }

    pub fn members(&self, scope: &K) -> Vec<M> {
        self.scopes
            .get(scope)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn for_each_in_scope(&self, scope: &K, mut f: impl FnMut(&M, &V)) {
        if let Some(members) = self.scopes.get(scope) {
            for (member, value) in members {
                f(member, value);
            }
        }
    }

    /// Clone the values registered under `scope`.
    pub fn snapshot(&self, scope: &K) -> Vec<V>
    where
        V: Clone,
    {
        self.scopes
            .get(scope)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &M, &V)> {
        self.scopes
            .iter()
            .flat_map(|(scope, members)| members.iter().map(move |(m, v)| (scope, m, v)))
    }

    /// Empty the registry, handing back every value.
    pub fn drain(&mut self) -> Vec<(K, M, V)> {
        self.scopes
            .drain()
            .flat_map(|(scope, members)| {
                members
                    .into_iter()
                    .map(move |(member, value)| (scope.clone(), member, value))
            })
            .collect()
    }
}

/// Read-lock a hub's state, recovering the data if a writer panicked.
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock a hub's state, recovering the data if a writer panicked.
pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
