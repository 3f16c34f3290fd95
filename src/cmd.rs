//! Command table: name/arity/handler triples dispatched against the
//! keyspace and expiry dictionaries. Handlers return pre-encoded RESP reply
//! objects, matching the shared constant replies in `obj.rs`.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::dict::Dict;
use crate::obj::{as_int, bytes, from_str, new_str, null_bulk, ok, pong, Obj};
use crate::util::now_ms;

pub type CommandProc = fn(&mut Dict, &mut Dict, &[Obj]) -> Obj;

pub struct Command {
    pub name: &'static str,
    /// Positive: exact argc (including the command name). Negative: the
    /// minimum argc, `-arity`, for variadic commands (unused today).
    pub arity: i32,
    pub proc: CommandProc,
}

fn bulk_reply(payload: &[u8]) -> Obj {
    let mut out = format!("${}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    new_str(out)
}

fn int_reply(n: i64) -> Obj {
    from_str(&format!(":{n}\r\n"))
}

/// Lazily evicts `key` if its TTL has passed. Deadlines are always stored
/// and compared in milliseconds.
fn expire_if_needed(keyspace: &mut Dict, expires: &mut Dict, key: &Obj) {
    if let Some(deadline) = expires.find(key) {
        if (as_int(&deadline) as u128) <= now_ms() {
            let _ = keyspace.delete(key);
            let _ = expires.delete(key);
        }
    }
}

fn get_command(keyspace: &mut Dict, expires: &mut Dict, argv: &[Obj]) -> Obj {
    let key = &argv[1];
    expire_if_needed(keyspace, expires, key);
    match keyspace.find(key) {
        Some(val) => bulk_reply(bytes(&val)),
        None => null_bulk(),
    }
}

fn set_command(keyspace: &mut Dict, expires: &mut Dict, argv: &[Obj]) -> Obj {
    let key = argv[1].clone();
    let val = argv[2].clone();
    keyspace.set(key.clone(), val);
    let _ = expires.delete(&key);
    ok()
}

fn expire_command(keyspace: &mut Dict, expires: &mut Dict, argv: &[Obj]) -> Obj {
    let key = &argv[1];
    expire_if_needed(keyspace, expires, key);
    if keyspace.find(key).is_none() {
        return int_reply(0);
    }
    let seconds = as_int(&argv[2]).max(0) as u128;
    let deadline = now_ms() + seconds * 1000;
    expires.set(key.clone(), from_str(&deadline.to_string()));
    int_reply(1)
}

fn del_command(keyspace: &mut Dict, expires: &mut Dict, argv: &[Obj]) -> Obj {
    let key = &argv[1];
    expire_if_needed(keyspace, expires, key);
    match keyspace.delete(key) {
        Ok(()) => {
            let _ = expires.delete(key);
            int_reply(1)
        }
        Err(_) => int_reply(0),
    }
}

fn ping_command(_keyspace: &mut Dict, _expires: &mut Dict, _argv: &[Obj]) -> Obj {
    pong()
}

fn quit_command(_keyspace: &mut Dict, _expires: &mut Dict, _argv: &[Obj]) -> Obj {
    ok()
}

pub static COMMANDS: Lazy<HashMap<&'static str, Command>> = Lazy::new(|| {
    let table = [
        Command { name: "get", arity: 2, proc: get_command },
        Command { name: "set", arity: 3, proc: set_command },
        Command { name: "expire", arity: 3, proc: expire_command },
        Command { name: "del", arity: 2, proc: del_command },
        Command { name: "ping", arity: 1, proc: ping_command },
        Command { name: "quit", arity: 1, proc: quit_command },
    ];
    table.into_iter().map(|c| (c.name, c)).collect()
});

pub fn lookup_command(name: &str) -> Option<&'static Command> {
    COMMANDS.get(name)
}

fn arity_matches(cmd: &Command, argc: usize) -> bool {
    if cmd.arity >= 0 {
        argc as i32 == cmd.arity
    } else {
        argc as i32 >= -cmd.arity
    }
}

/// Dispatches one already-parsed command against the keyspace. Returns the
/// reply and whether the connection should close after it's flushed.
pub fn dispatch(keyspace: &mut Dict, expires: &mut Dict, argv: &[Obj]) -> (Obj, bool) {
    if argv.is_empty() {
        return (crate::obj::unknown_command_err(), false);
    }
    let name = String::from_utf8_lossy(bytes(&argv[0])).to_lowercase();

    match lookup_command(&name) {
        None => (crate::obj::unknown_command_err(), false),
        Some(cmd) => {
            if !arity_matches(cmd, argv.len()) {
                return (crate::obj::wrong_arity_err(), false);
            }
            let reply = (cmd.proc)(keyspace, expires, argv);
            (reply, name == "quit")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::{fnv_hash, str_eq};

    fn argv(parts: &[&str]) -> Vec<Obj> {
        parts.iter().map(|p| from_str(p)).collect()
    }

    fn dicts() -> (Dict, Dict) {
        (Dict::new(fnv_hash, str_eq), Dict::new(fnv_hash, str_eq))
    }

    #[test]
    fn get_on_missing_key_is_null_bulk() {
        let (mut ks, mut ex) = dicts();
        let (reply, closed) = dispatch(&mut ks, &mut ex, &argv(&["GET", "k"]));
        assert!(!closed);
        assert_eq!(bytes(&reply), b"$-1\r\n");
    }

    #[test]
    fn set_then_get_round_trips_with_correct_framing() {
        let (mut ks, mut ex) = dicts();
        dispatch(&mut ks, &mut ex, &argv(&["SET", "k", "v"]));
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["GET", "k"]));
        assert_eq!(bytes(&reply), b"$1\r\nv\r\n");
    }

    #[test]
    fn set_replies_ok() {
        let (mut ks, mut ex) = dicts();
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["SET", "k", "v"]));
        assert_eq!(bytes(&reply), b"+OK\r\n");
    }

    #[test]
    fn expire_on_missing_key_replies_zero() {
        let (mut ks, mut ex) = dicts();
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["EXPIRE", "k", "100"]));
        assert_eq!(bytes(&reply), b":0\r\n");
    }

    #[test]
    fn expire_then_immediate_get_still_finds_key() {
        let (mut ks, mut ex) = dicts();
        dispatch(&mut ks, &mut ex, &argv(&["SET", "k", "v"]));
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["EXPIRE", "k", "100"]));
        assert_eq!(bytes(&reply), b":1\r\n");
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["GET", "k"]));
        assert_eq!(bytes(&reply), b"$1\r\nv\r\n");
    }

    #[test]
    fn expired_key_is_lazily_evicted_on_get() {
        let (mut ks, mut ex) = dicts();
        dispatch(&mut ks, &mut ex, &argv(&["SET", "k", "v"]));
        ex.set(from_str("k"), from_str("0"));
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["GET", "k"]));
        assert_eq!(bytes(&reply), b"$-1\r\n");
        assert!(ks.find(&from_str("k")).is_none());
    }

    #[test]
    fn del_removes_key_and_its_ttl() {
        let (mut ks, mut ex) = dicts();
        dispatch(&mut ks, &mut ex, &argv(&["SET", "k", "v"]));
        dispatch(&mut ks, &mut ex, &argv(&["EXPIRE", "k", "100"]));
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["DEL", "k"]));
        assert_eq!(bytes(&reply), b":1\r\n");
        assert!(ex.find(&from_str("k")).is_none());
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["DEL", "k"]));
        assert_eq!(bytes(&reply), b":0\r\n");
    }

    #[test]
    fn ping_and_quit() {
        let (mut ks, mut ex) = dicts();
        let (reply, closed) = dispatch(&mut ks, &mut ex, &argv(&["PING"]));
        assert_eq!(bytes(&reply), b"+PONG\r\n");
        assert!(!closed);

        let (reply, closed) = dispatch(&mut ks, &mut ex, &argv(&["QUIT"]));
        assert_eq!(bytes(&reply), b"+OK\r\n");
        assert!(closed);
    }

    #[test]
    fn unknown_command_and_wrong_arity() {
        let (mut ks, mut ex) = dicts();
        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["NOPE"]));
        assert_eq!(bytes(&reply), crate::obj::bytes(&crate::obj::unknown_command_err()));

        let (reply, _) = dispatch(&mut ks, &mut ex, &argv(&["GET"]));
        assert_eq!(bytes(&reply), crate::obj::bytes(&crate::obj::wrong_arity_err()));
    }
}
