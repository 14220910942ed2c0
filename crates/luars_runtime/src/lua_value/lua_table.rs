// Table storage: array part for the 1..n sequence plus an insertion-ordered
// hash part

use ahash::RandomState;
use indexmap::IndexMap;

use crate::gc::GcRef;
use crate::lua_value::LuaValue;

const VALUE_SIZE: usize = std::mem::size_of::<LuaValue>();

#[derive(Debug, Default)]
pub struct LuaTable {
    array: Vec<LuaValue>,
    hash: IndexMap<LuaValue, LuaValue, RandomState>,
    pub(crate) metatable: Option<GcRef>,
}

impl LuaTable {
    pub fn new(narr: usize, nrec: usize) -> Self {
        Self {
            array: Vec::with_capacity(narr),
            hash: IndexMap::with_capacity_and_hasher(nrec, RandomState::new()),
            metatable: None,
        }
    }

    #[inline]
    fn array_index(key: &LuaValue) -> Option<usize> {
        match *key {
            LuaValue::Number(n) if n >= 1.0 && n.fract() == 0.0 && n <= usize::MAX as f64 => {
                Some(n as usize - 1)
            }
            _ => None,
        }
    }

    pub fn get(&self, key: &LuaValue) -> LuaValue {
        if let Some(i) = Self::array_index(key) {
            if let Some(v) = self.array.get(i) {
                return *v;
            }
        }
        self.hash.get(key).copied().unwrap_or_default()
    }

    /// Raw assignment. The caller rejects nil and NaN keys.
    pub fn set(&mut self, key: LuaValue, value: LuaValue) {
        if let Some(i) = Self::array_index(&key) {
            if i < self.array.len() {
                self.array[i] = value;
                self.trim_array();
                return;
            }
            if i == self.array.len() && !value.is_nil() {
                self.hash.swap_remove(&key);
                self.array.push(value);
                self.migrate_from_hash();
                return;
            }
        }
        if value.is_nil() {
            self.hash.swap_remove(&key);
        } else {
            self.hash.insert(key, value);
        }
    }

    /// Move keys n+1, n+2, ... that sit in the hash part into the array.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = LuaValue::Number((self.array.len() + 1) as f64);
            match self.hash.swap_remove(&next) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    fn trim_array(&mut self) {
        while matches!(self.array.last(), Some(LuaValue::Nil)) {
            self.array.pop();
        }
    }

    /// Border of the array part.
    #[inline]
    pub fn len(&self) -> usize {
        self.array.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// Number of non-nil entries.
    pub fn entry_count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.hash.len()
    }

    #[inline]
    pub fn metatable(&self) -> Option<GcRef> {
        self.metatable
    }

    pub fn array_values(&self) -> &[LuaValue] {
        &self.array
    }

    pub fn hash_entries(&self) -> impl Iterator<Item = (&LuaValue, &LuaValue)> {
        self.hash.iter()
    }

    /// Drop entries for which `keep(key, value)` is false.
    /// Returns the number of entries removed.
    pub fn retain_entries(&mut self, mut keep: impl FnMut(&LuaValue, &LuaValue) -> bool) -> usize {
        let mut removed = 0;
        for (i, v) in self.array.iter_mut().enumerate() {
            if v.is_nil() {
                continue;
            }
            let key = LuaValue::Number((i + 1) as f64);
            if !keep(&key, v) {
                *v = LuaValue::Nil;
                removed += 1;
            }
        }
        self.trim_array();

        let before = self.hash.len();
        self.hash.retain(|k, v| keep(k, v));
        removed + (before - self.hash.len())
    }

    /// Bytes accounted to this table.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<LuaTable>()
            + self.array.len() * VALUE_SIZE
            + self.hash.len() * 2 * VALUE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_and_hash_parts() {
        let mut t = LuaTable::new(0, 0);
        t.set(LuaValue::from(2), LuaValue::from(20));
        assert_eq!(t.len(), 0);
        t.set(LuaValue::from(1), LuaValue::from(10));
        // 2 migrated from the hash part
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&LuaValue::from(2)), LuaValue::from(20));

        t.set(LuaValue::from(2), LuaValue::Nil);
        assert_eq!(t.len(), 1);
        t.set(LuaValue::Boolean(true), LuaValue::from(1));
        assert_eq!(t.entry_count(), 2);
        t.set(LuaValue::Boolean(true), LuaValue::Nil);
        assert_eq!(t.get(&LuaValue::Boolean(true)), LuaValue::Nil);
        assert_eq!(t.entry_count(), 1);
    }

    #[test]
    fn test_retain_entries() {
        let mut t = LuaTable::new(4, 4);
        for i in 1..=4 {
            t.set(LuaValue::from(i), LuaValue::from(i * 10));
        }
        t.set(LuaValue::from(0.5), LuaValue::from(5));
        let removed = t.retain_entries(|_, v| v.as_number() != Some(40.0));
        assert_eq!(removed, 1);
        assert_eq!(t.len(), 3);
        assert_eq!(t.get(&LuaValue::from(0.5)), LuaValue::from(5));
    }
}
