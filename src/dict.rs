//! Incrementally rehashing chained hash table — the primary keyspace
//! structure. Growth work is amortised one bucket at a time across
//! subsequent operations so no single call stalls the event loop.

use std::cell::RefCell;

use rand::Rng;

use crate::obj::Obj;

pub const INIT_SIZE: usize = 8;
pub const FORCE_RATIO: usize = 2;
pub const GROW_RATIO: usize = 2;

pub type HashFn = fn(&Obj) -> u64;
pub type EqFn = fn(&Obj, &Obj) -> bool;

#[derive(Debug, PartialEq, Eq)]
pub enum DictError {
    ExpandErr,
    ExistsErr,
    NoKey,
}

struct Entry {
    key: Obj,
    val: RefCell<Obj>,
    next: Option<Box<Entry>>,
}

struct Table {
    buckets: Vec<Option<Box<Entry>>>,
    size: usize,
    mask: u64,
    used: usize,
}

impl Table {
    fn empty() -> Table {
        Table { buckets: Vec::new(), size: 0, mask: 0, used: 0 }
    }

    fn with_size(size: usize) -> Table {
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Table { buckets, size, mask: (size - 1) as u64, used: 0 }
    }
}

pub struct Dict {
    ht: [Table; 2],
    rehashidx: i64,
    hash_fn: HashFn,
    eq_fn: EqFn,
}

fn next_pow2(n: usize) -> usize {
    let mut size = INIT_SIZE;
    while size < n {
        size *= 2;
    }
    size
}

impl Dict {
    pub fn new(hash_fn: HashFn, eq_fn: EqFn) -> Dict {
        Dict { ht: [Table::empty(), Table::empty()], rehashidx: -1, hash_fn, eq_fn }
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehashidx != -1
    }

    pub fn len(&self) -> usize {
        self.ht[0].used + self.ht[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ht[0].size + self.ht[1].size
    }

    /// Migrates the chain at `ht[0].table[rehashidx]` (skipping leading empty
    /// buckets) to `ht[1]` and advances the cursor by one.
    pub fn rehash_step(&mut self) {
        if !self.is_rehashing() {
            return;
        }
        while (self.rehashidx as usize) < self.ht[0].size
            && self.ht[0].buckets[self.rehashidx as usize].is_none()
        {
            self.rehashidx += 1;
        }
        if self.rehashidx as usize >= self.ht[0].size {
            return;
        }

        let idx = self.rehashidx as usize;
        let mut chain = self.ht[0].buckets[idx].take();
        while let Some(mut entry) = chain {
            chain = entry.next.take();
            let dest = ((self.hash_fn)(&entry.key) & self.ht[1].mask) as usize;
            entry.next = self.ht[1].buckets[dest].take();
            self.ht[0].used -= 1;
            self.ht[1].used += 1;
            self.ht[1].buckets[dest] = Some(entry);
        }
        self.rehashidx += 1;

        if self.ht[0].used == 0 {
            self.ht[0] = std::mem::replace(&mut self.ht[1], Table::empty());
            self.rehashidx = -1;
        }
    }

    fn expand(&mut self, size_hint: usize) -> Result<(), DictError> {
        let new_size = next_pow2(size_hint);
        if self.is_rehashing() && new_size <= self.ht[0].size {
            return Err(DictError::ExpandErr);
        }
        if self.ht[0].size == 0 {
            self.ht[0] = Table::with_size(new_size);
        } else {
            self.ht[1] = Table::with_size(new_size);
            self.rehashidx = 0;
        }
        Ok(())
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.ht[0].size == 0 {
            self.expand(INIT_SIZE).expect("initial expand cannot fail");
        } else if self.ht[0].used > self.ht[0].size && self.ht[0].used / self.ht[0].size > FORCE_RATIO {
            self.expand(self.ht[0].size * GROW_RATIO).expect("growth expand cannot fail");
        }
    }

    fn find_entry(&self, key: &Obj) -> Option<&Entry> {
        if self.ht[0].size == 0 {
            return None;
        }
        let hash = (self.hash_fn)(key);

        let idx0 = (hash & self.ht[0].mask) as usize;
        let mut cur = self.ht[0].buckets[idx0].as_deref();
        while let Some(e) = cur {
            if (self.eq_fn)(&e.key, key) {
                return Some(e);
            }
            cur = e.next.as_deref();
        }

        if self.is_rehashing() {
            let idx1 = (hash & self.ht[1].mask) as usize;
            let mut cur = self.ht[1].buckets[idx1].as_deref();
            while let Some(e) = cur {
                if (self.eq_fn)(&e.key, key) {
                    return Some(e);
                }
                cur = e.next.as_deref();
            }
        }
        None
    }

    /// Looks up `key`, returning the entry's value object (`Find`/`Get`).
    pub fn find(&mut self, key: &Obj) -> Option<Obj> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.find_entry(key).map(|e| e.val.borrow().clone())
    }

    pub fn contains(&mut self, key: &Obj) -> bool {
        self.find(key).is_some()
    }

    /// Inserts a new entry for `key`/`val`, failing with `ExistsErr` on
    /// duplicate. This implementation folds the C-style two-phase
    /// AddRaw-then-fill-in-value into a single pass since the value is
    /// always known at the call site here; `add` delegates to it directly.
    pub fn add_raw(&mut self, key: Obj, val: Obj) -> Result<(), DictError> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.expand_if_needed();

        let hash = (self.hash_fn)(&key);
        let table_idx = if self.is_rehashing() { 1 } else { 0 };
        let bucket_idx = (hash & self.ht[table_idx].mask) as usize;

        let mut cur = self.ht[table_idx].buckets[bucket_idx].as_deref();
        while let Some(e) = cur {
            if (self.eq_fn)(&e.key, &key) {
                return Err(DictError::ExistsErr);
            }
            cur = e.next.as_deref();
        }

        let entry = Box::new(Entry {
            key,
            val: RefCell::new(val),
            next: self.ht[table_idx].buckets[bucket_idx].take(),
        });
        self.ht[table_idx].buckets[bucket_idx] = Some(entry);
        self.ht[table_idx].used += 1;
        Ok(())
    }

    pub fn add(&mut self, key: Obj, val: Obj) -> Result<(), DictError> {
        self.add_raw(key, val)
    }

    /// Inserts, or replaces the value of an existing entry in place.
    pub fn set(&mut self, key: Obj, val: Obj) {
        match self.add(key.clone(), val.clone()) {
            Ok(()) => {}
            Err(DictError::ExistsErr) => {
                if let Some(entry) = self.find_entry(&key) {
                    entry.val.replace(val);
                }
            }
            Err(e) => unreachable!("add() cannot fail with {:?}", e),
        }
    }

    fn remove_from_table(table: &mut Table, bucket_idx: usize, eq_fn: EqFn, key: &Obj) -> Option<Box<Entry>> {
        let mut cur = &mut table.buckets[bucket_idx];
        loop {
            match cur {
                None => return None,
                Some(entry) => {
                    if eq_fn(&entry.key, key) {
                        let mut taken = cur.take().unwrap();
                        *cur = taken.next.take();
                        table.used -= 1;
                        return Some(taken);
                    }
                    cur = &mut cur.as_mut().unwrap().next;
                }
            }
        }
    }

    pub fn delete(&mut self, key: &Obj) -> Result<(), DictError> {
        if self.ht[0].size == 0 {
            return Err(DictError::NoKey);
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = (self.hash_fn)(key);

        let idx0 = (hash & self.ht[0].mask) as usize;
        if Dict::remove_from_table(&mut self.ht[0], idx0, self.eq_fn, key).is_some() {
            return Ok(());
        }
        if self.is_rehashing() {
            let idx1 = (hash & self.ht[1].mask) as usize;
            if Dict::remove_from_table(&mut self.ht[1], idx1, self.eq_fn, key).is_some() {
                return Ok(());
            }
        }
        Err(DictError::NoKey)
    }

    /// Samples a uniformly random entry, biased toward short chains — used
    /// by the expiration cron, not as a general uniform-entry primitive.
    pub fn random_get(&mut self) -> Option<(Obj, Obj)> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }

        let table_idx = if self.is_rehashing() && self.ht[1].used > self.ht[0].used { 1 } else { 0 };
        if self.ht[table_idx].size == 0 {
            return None;
        }

        let mut rng = rand::thread_rng();
        let mut bucket: Option<&Entry> = None;
        for _ in 0..1000 {
            let idx = rng.gen_range(0..self.ht[table_idx].size);
            if let Some(e) = self.ht[table_idx].buckets[idx].as_deref() {
                bucket = Some(e);
                break;
            }
        }
        let head = bucket?;

        let mut len = 0usize;
        let mut cur = Some(head);
        while let Some(e) = cur {
            len += 1;
            cur = e.next.as_deref();
        }
        let target = rng.gen_range(0..len);
        let mut cur = Some(head);
        for _ in 0..target {
            cur = cur.unwrap().next.as_deref();
        }
        let entry = cur.unwrap();
        Some((entry.key.clone(), entry.val.borrow().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::{fnv_hash, from_str, str_eq};

    fn new_dict() -> Dict {
        Dict::new(fnv_hash, str_eq)
    }

    #[test]
    fn add_then_find_until_delete() {
        let mut d = new_dict();
        let k = from_str("k");
        let v = from_str("v");
        d.add(k.clone(), v.clone()).unwrap();
        assert!(d.find(&k).is_some());
        d.delete(&k).unwrap();
        assert!(d.find(&k).is_none());
    }

    #[test]
    fn set_is_idempotent_on_observed_value() {
        let mut d = new_dict();
        let k = from_str("k");
        d.set(k.clone(), from_str("v1"));
        d.set(k.clone(), from_str("v2"));
        let got = d.find(&k).unwrap();
        assert_eq!(crate::obj::bytes(&got), b"v2");
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn add_raw_rejects_duplicate() {
        let mut d = new_dict();
        let k = from_str("k");
        d.add(k.clone(), from_str("v")).unwrap();
        let err = d.add(k.clone(), from_str("v2")).unwrap_err();
        assert_eq!(err, DictError::ExistsErr);
    }

    #[test]
    fn delete_missing_key_fails() {
        let mut d = new_dict();
        assert_eq!(d.delete(&from_str("missing")).unwrap_err(), DictError::NoKey);
    }

    #[test]
    fn refcount_balances_across_insert_delete() {
        let mut d = new_dict();
        let k = from_str("k");
        let v = from_str("v");
        assert_eq!(std::rc::Rc::strong_count(&v), 1);
        d.add(k.clone(), v.clone()).unwrap();
        assert_eq!(std::rc::Rc::strong_count(&v), 2);
        d.delete(&k).unwrap();
        assert_eq!(std::rc::Rc::strong_count(&v), 1);
    }

    #[test]
    fn force_rehash_threshold_crossed() {
        let mut d = new_dict();
        // `expand_if_needed` checks the *pre-insert* used/size ratio, so
        // after `INIT_SIZE * (FORCE_RATIO + 1)` inserts (used=24, size=8,
        // 24/8=3>2) the threshold hasn't been checked against yet — it's the
        // next insert's pre-check that trips it.
        let threshold = INIT_SIZE * (FORCE_RATIO + 1);
        for i in 0..threshold {
            d.add(from_str(&format!("k{i}")), from_str("v")).unwrap();
        }
        assert!(!d.is_rehashing());
        d.add(from_str("trigger"), from_str("v")).unwrap();
        assert!(d.is_rehashing());
        assert_eq!(d.ht[1].size, INIT_SIZE * GROW_RATIO);
    }

    #[test]
    fn rehash_completes_and_keys_remain_findable() {
        let mut d = new_dict();
        let n = 200;
        let mut keys = Vec::new();
        for i in 0..n {
            let k = from_str(&format!("key{i}"));
            d.add(k.clone(), from_str(&format!("val{i}"))).unwrap();
            keys.push(k);
        }
        // Drive enough operations (each performs one rehash step) to finish.
        for _ in 0..10_000 {
            if !d.is_rehashing() {
                break;
            }
            d.find(&from_str("nonexistent-probe"));
        }
        assert!(!d.is_rehashing());
        for (i, k) in keys.iter().enumerate() {
            let v = d.find(k).unwrap();
            assert_eq!(crate::obj::bytes(&v), format!("val{i}").as_bytes());
        }
    }

    #[test]
    fn random_get_returns_present_entry() {
        let mut d = new_dict();
        d.add(from_str("only"), from_str("v")).unwrap();
        let (k, _v) = d.random_get().unwrap();
        assert_eq!(crate::obj::bytes(&k), b"only");
    }

    #[test]
    fn random_get_on_empty_dict_is_none() {
        let mut d = new_dict();
        assert!(d.random_get().is_none());
    }

    #[test]
    fn expand_err_when_rehashing_with_smaller_size() {
        let mut d = new_dict();
        for i in 0..(INIT_SIZE * (FORCE_RATIO + 1) + 1) {
            d.add(from_str(&format!("k{i}")), from_str("v")).unwrap();
        }
        assert!(d.is_rehashing());
        assert_eq!(d.expand(1).unwrap_err(), DictError::ExpandErr);
    }
}
