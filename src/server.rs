//! Server state: listening socket, keyspace, expiry dictionary and the
//! connected-client table. Owned as `Rc<RefCell<Server>>` and captured by
//! the event loop's callback closures rather than held in a global
//! singleton — see `SPEC_FULL.md`'s "Server state ownership" note.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::client::Client;
use crate::dict::Dict;
use crate::net;
use crate::obj::{fnv_hash, str_eq};
use crate::util::{log, LogLevel};

const DEFAULT_MAX_CLIENTS: u32 = 10_000;

pub struct Server {
    pub fd: i32,
    pub port: u16,
    pub keyspace: Dict,
    pub expires: Dict,
    pub clients: HashMap<i32, Rc<RefCell<Client>>>,
    pub cron_loops: u64,
    pub max_clients: u32,
    pub loglevel: LogLevel,
    pub logfile: String,
}

impl Server {
    pub fn new(port: u16, bind: &str, loglevel: LogLevel, logfile: String) -> Result<Rc<RefCell<Server>>, String> {
        let fd = net::tcp_server(port, bind)?;
        net::nonblock(fd)?;

        Ok(Rc::new(RefCell::new(Server {
            fd,
            port,
            keyspace: Dict::new(fnv_hash, str_eq),
            expires: Dict::new(fnv_hash, str_eq),
            clients: HashMap::new(),
            cron_loops: 0,
            max_clients: DEFAULT_MAX_CLIENTS,
            loglevel,
            logfile,
        })))
    }

    pub fn log_msg(&self, level: LogLevel, body: &str) {
        log(self.loglevel, level, &self.logfile, body);
    }
}
