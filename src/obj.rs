//! Value objects: the unified, tagged, reference-counted carrier for all
//! user-visible data. Only the string variant is constructed today; list,
//! set, hash and zset tags are reserved by the data model but unused by the
//! required command set.

use std::rc::Rc;

use once_cell::unsync::Lazy;

#[derive(Debug, PartialEq, Eq)]
pub enum ObjData {
    Str(Vec<u8>),
}

/// Shared-ownership handle. `Rc::strong_count` on the inner pointer *is* the
/// reference count described by the data model: every container that holds
/// an `Obj` contributes exactly one count, and dropping the last clone
/// releases the payload. No hand-rolled counter is needed on top of `Rc`.
pub type Obj = Rc<ObjData>;

pub fn new_str(bytes: Vec<u8>) -> Obj {
    Rc::new(ObjData::Str(bytes))
}

pub fn from_str(s: &str) -> Obj {
    new_str(s.as_bytes().to_vec())
}

/// Byte content of a string object, for keys and values alike.
pub fn bytes(obj: &Obj) -> &[u8] {
    match obj.as_ref() {
        ObjData::Str(b) => b,
    }
}

/// Integer view of a string object. Empty or unparsable content parses to 0,
/// per the data model's "integer values are stored as decimal strings"
/// clause.
pub fn as_int(obj: &Obj) -> i64 {
    std::str::from_utf8(bytes(obj))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

pub fn str_eq(a: &Obj, b: &Obj) -> bool {
    bytes(a) == bytes(b)
}

/// FNV-1a over raw bytes, matching the "equality and hashing for strings
/// operate on the raw byte content" invariant.
pub fn fnv_hash(obj: &Obj) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes(obj) {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// `Obj = Rc<ObjData>` is never `Sync`, so these shared constant replies can't
// live in a `static`, `once_cell::sync::Lazy` included — a `static` item's
// type must be `Sync` regardless of which `Lazy` wraps it. `thread_local!`
// has no such requirement (each thread gets its own storage), which is
// exactly what a single-threaded event loop needs: one shared `Obj` per
// reply, built once, cloned (an `Rc` bump) on every use.
thread_local! {
    static OK: Lazy<Obj> = Lazy::new(|| from_str("+OK\r\n"));
    static PONG: Lazy<Obj> = Lazy::new(|| from_str("+PONG\r\n"));
    static NULL_BULK: Lazy<Obj> = Lazy::new(|| from_str("$-1\r\n"));
    static WRONG_TYPE_ERR: Lazy<Obj> =
        Lazy::new(|| from_str("-ERR Operation against a key holding the wrong kind of value\r\n"));
    static UNKNOWN_COMMAND_ERR: Lazy<Obj> = Lazy::new(|| from_str("-ERR unknown command\r\n"));
    static WRONG_ARITY_ERR: Lazy<Obj> = Lazy::new(|| from_str("-ERR wrong number of args\r\n"));
}

pub fn ok() -> Obj {
    OK.with(|o| (**o).clone())
}

pub fn pong() -> Obj {
    PONG.with(|o| (**o).clone())
}

pub fn null_bulk() -> Obj {
    NULL_BULK.with(|o| (**o).clone())
}

pub fn wrong_type_err() -> Obj {
    WRONG_TYPE_ERR.with(|o| (**o).clone())
}

pub fn unknown_command_err() -> Obj {
    UNKNOWN_COMMAND_ERR.with(|o| (**o).clone())
}

pub fn wrong_arity_err() -> Obj {
    WRONG_ARITY_ERR.with(|o| (**o).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_strong_count_is_the_refcount() {
        let o = from_str("hello");
        assert_eq!(Rc::strong_count(&o), 1);
        let o2 = o.clone();
        assert_eq!(Rc::strong_count(&o), 2);
        drop(o2);
        assert_eq!(Rc::strong_count(&o), 1);
    }

    #[test]
    fn int_view_parses_decimal() {
        assert_eq!(as_int(&from_str("42")), 42);
        assert_eq!(as_int(&from_str("")), 0);
        assert_eq!(as_int(&from_str("not a number")), 0);
    }

    #[test]
    fn byte_equality_is_binary_safe() {
        let a = new_str(vec![0, 1, 2, 255]);
        let b = new_str(vec![0, 1, 2, 255]);
        assert!(str_eq(&a, &b));
    }
}
