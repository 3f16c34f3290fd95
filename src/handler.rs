//! Event-loop callback wiring: accepting connections, reading and writing
//! client sockets, and the periodic cron that drives active expiration.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::client::{Client, IO_BUF_LEN};
use crate::cmd;
use crate::eventloop::{EventLoop, Mask};
use crate::net;
use crate::obj::as_int;
use crate::server::Server;
use crate::util::{errno, errno_str, now_ms, LogLevel};

const MAX_WRITE_PER_EVENT: usize = 1024 * 64;
const EXPIRE_CHECK_COUNT: usize = 100;
const CRON_INTERVAL_MS: i32 = 100;

/// Runs before the loop goes back to sleep waiting for readiness. Client
/// teardown happens synchronously in `free_client`, so there's nothing left
/// to reconcile here; kept as a wired hook for parity with the rest of the
/// event-loop architecture.
pub fn before_sleep(_srv: &Rc<RefCell<Server>>, _el: &mut EventLoop) {}

pub fn server_cron(srv: &Rc<RefCell<Server>>, _el: &mut EventLoop, _id: u128) -> i32 {
    let mut server = srv.borrow_mut();
    server.cron_loops += 1;
    let loops = server.cron_loops;

    if loops % 50 == 0 {
        let used = server.keyspace.len();
        let vkeys = server.expires.len();
        if used != 0 || vkeys != 0 {
            server.log_msg(
                LogLevel::Verbose,
                &format!(
                    "{used} keys ({vkeys} volatile) in {} slots HT, {} clients connected",
                    server.keyspace.capacity(),
                    server.clients.len()
                ),
            );
        }
    }

    for _ in 0..EXPIRE_CHECK_COUNT {
        let Some((key, deadline)) = server.expires.random_get() else {
            break;
        };
        if (as_int(&deadline) as u128) <= now_ms() {
            let _ = server.keyspace.delete(&key);
            let _ = server.expires.delete(&key);
        }
    }

    CRON_INTERVAL_MS
}

pub fn accept_handler(srv: &Rc<RefCell<Server>>, el: &mut EventLoop, fd: i32, _mask: Mask) {
    let (c_fd, c_ip, c_port) = match net::accept(fd) {
        Ok(t) => t,
        Err(e) => {
            srv.borrow().log_msg(LogLevel::Warning, &format!("accepting client connection: {e}"));
            return;
        }
    };

    if let Err(e) = net::nonblock(c_fd) {
        srv.borrow().log_msg(LogLevel::Warning, &format!("setting client nonblocking: {e}"));
        net::close_fd(c_fd);
        return;
    }
    let _ = net::tcp_no_delay(c_fd);

    {
        let mut server = srv.borrow_mut();
        if server.max_clients > 0 && server.clients.len() as u32 >= server.max_clients {
            drop(server);
            let msg = b"-ERR max number of clients reached\r\n";
            unsafe {
                libc::write(c_fd, msg.as_ptr() as *const libc::c_void, msg.len());
            }
            net::close_fd(c_fd);
            return;
        }
        server.clients.insert(c_fd, Rc::new(RefCell::new(Client::new(c_fd))));
    }

    let srv_for_read = srv.clone();
    if let Err(e) = el.create_file_event(
        c_fd,
        Mask::Readable,
        Rc::new(move |el, fd, mask| read_query_from_client(&srv_for_read, el, fd, mask)),
    ) {
        srv.borrow().log_msg(LogLevel::Warning, &format!("registering read event: {e}"));
    }

    srv.borrow()
        .log_msg(LogLevel::Verbose, &format!("accepted {}:{}", Ipv4Addr::from(c_ip), c_port));
}

fn free_client(srv: &Rc<RefCell<Server>>, el: &mut EventLoop, fd: i32) {
    el.delete_file_event(fd, Mask::ReadWritable);
    srv.borrow_mut().clients.remove(&fd);
    net::close_fd(fd);
}

pub fn read_query_from_client(srv: &Rc<RefCell<Server>>, el: &mut EventLoop, fd: i32, _mask: Mask) {
    let Some(client_rc) = srv.borrow().clients.get(&fd).cloned() else {
        return;
    };

    let mut buf = [0u8; IO_BUF_LEN];
    let nread = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, IO_BUF_LEN) };

    if nread < 0 {
        let err = errno();
        if err == libc::EAGAIN {
            return;
        }
        srv.borrow().log_msg(LogLevel::Verbose, &format!("reading from client: {}", errno_str(err)));
        free_client(srv, el, fd);
        return;
    }
    if nread == 0 {
        srv.borrow().log_msg(LogLevel::Verbose, "client closed connection");
        free_client(srv, el, fd);
        return;
    }

    client_rc.borrow_mut().feed(&buf[..nread as usize]);

    loop {
        let parsed = client_rc.borrow_mut().try_parse_command();
        match parsed {
            Ok(None) => break,
            Err(e) => {
                srv.borrow().log_msg(LogLevel::Warning, &format!("protocol error from client: {e}"));
                free_client(srv, el, fd);
                return;
            }
            Ok(Some(argv)) => {
                if argv.is_empty() {
                    continue;
                }
                let (reply, should_close) = {
                    let mut server = srv.borrow_mut();
                    cmd::dispatch(&mut server.keyspace, &mut server.expires, &argv)
                };
                client_rc.borrow_mut().add_reply(reply);
                if should_close {
                    client_rc.borrow_mut().closed = true;
                }
            }
        }
    }

    if client_rc.borrow().has_reply() {
        let srv_for_write = srv.clone();
        if let Err(e) = el.create_file_event(
            fd,
            Mask::Writable,
            Rc::new(move |el, fd, mask| send_reply_to_client(&srv_for_write, el, fd, mask)),
        ) {
            srv.borrow().log_msg(LogLevel::Warning, &format!("registering write event: {e}"));
        }
    } else if client_rc.borrow().closed {
        free_client(srv, el, fd);
    }
}

pub fn send_reply_to_client(srv: &Rc<RefCell<Server>>, el: &mut EventLoop, fd: i32, _mask: Mask) {
    let Some(client_rc) = srv.borrow().clients.get(&fd).cloned() else {
        return;
    };

    let mut tot_written: usize = 0;
    loop {
        let Some(node) = client_rc.borrow().reply.first() else {
            break;
        };
        let obj = node.borrow().value().expect("reply queue nodes always hold a value");
        let payload = crate::obj::bytes(&obj).to_vec();

        if payload.is_empty() {
            client_rc.borrow_mut().reply.del_node(node);
            continue;
        }

        let sent_len = client_rc.borrow().sent_len;
        let n_written = unsafe {
            libc::write(fd, payload[sent_len..].as_ptr() as *const libc::c_void, payload.len() - sent_len)
        };

        if n_written < 0 {
            let err = errno();
            if err == libc::EAGAIN {
                break;
            }
            srv.borrow().log_msg(LogLevel::Verbose, &format!("writing to client: {}", errno_str(err)));
            free_client(srv, el, fd);
            return;
        }

        let n_written = n_written as usize;
        client_rc.borrow_mut().sent_len += n_written;
        tot_written += n_written;

        if client_rc.borrow().sent_len == payload.len() {
            client_rc.borrow_mut().reply.del_node(node);
            client_rc.borrow_mut().sent_len = 0;
        }

        // A single-threaded server shouldn't let one very fast client starve
        // the rest: cap bytes written per invocation.
        if tot_written > MAX_WRITE_PER_EVENT {
            break;
        }
        if n_written == 0 {
            break;
        }
    }

    if !client_rc.borrow().has_reply() {
        client_rc.borrow_mut().sent_len = 0;
        el.delete_file_event(fd, Mask::Writable);
        if client_rc.borrow().closed {
            free_client(srv, el, fd);
        }
    }
}
