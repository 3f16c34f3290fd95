//! Basic TCP socket stuff made a bit less boring.

use std::mem::{size_of, size_of_val, zeroed};
use std::net::Ipv4Addr;

use libc::{
    bind, c_void, close, fcntl, listen, setsockopt, sockaddr, sockaddr_in, socket, AF_INET, EINTR, F_GETFL, F_SETFL,
    INADDR_ANY, IPPROTO_TCP, O_NONBLOCK, SOCK_STREAM, SOL_SOCKET, SO_REUSEADDR, SO_REUSEPORT, TCP_NODELAY,
};

use crate::util::{errno, errno_str};

const BACKLOG: i32 = 64;

pub fn tcp_server(port: u16, bindaddr: &str) -> Result<i32, String> {
    let sock;
    let on: i32 = 1;
    let mut sa: sockaddr_in;

    unsafe {
        sock = socket(AF_INET, SOCK_STREAM, 0);
        if sock == -1 {
            return Err(format!("socket: {}", errno_str(errno())));
        }
        if setsockopt(sock, SOL_SOCKET, SO_REUSEADDR, &on as *const _ as *const c_void, size_of::<i32>() as u32) == -1 {
            close(sock);
            return Err(format!("setsockopt SO_REUSEADDR: {}", errno_str(errno())));
        }
        if setsockopt(sock, SOL_SOCKET, SO_REUSEPORT, &on as *const _ as *const c_void, size_of::<i32>() as u32) == -1 {
            close(sock);
            return Err(format!("setsockopt SO_REUSEPORT: {}", errno_str(errno())));
        }

        sa = zeroed();
        sa.sin_family = AF_INET as u16;
        sa.sin_port = port.to_be();
        sa.sin_addr.s_addr = INADDR_ANY.to_be();
        if !bindaddr.is_empty() {
            match bindaddr.parse::<Ipv4Addr>() {
                Ok(addr) => sa.sin_addr.s_addr = u32::from(addr).to_be(),
                Err(e) => {
                    close(sock);
                    return Err(format!("invalid bind address '{bindaddr}': {e}"));
                }
            }
        }

        if bind(sock, &sa as *const _ as *const sockaddr, size_of::<sockaddr>() as u32) == -1 {
            close(sock);
            return Err(format!("bind: {}", errno_str(errno())));
        }

        if listen(sock, BACKLOG) == -1 {
            close(sock);
            return Err(format!("listen: {}", errno_str(errno())));
        }
    }
    Ok(sock)
}

pub fn accept(serversock: i32) -> Result<(i32, u32, u16), String> {
    let fd;
    let mut sa: sockaddr_in;
    loop {
        unsafe {
            sa = zeroed();
            let mut len = size_of::<sockaddr>() as u32;
            fd = libc::accept(serversock, &mut sa as *mut _ as *mut sockaddr, &mut len);
            if fd == -1 {
                if errno() == EINTR {
                    continue;
                }
                return Err(format!("accept: {}", errno_str(errno())));
            }
            break;
        }
    }

    let c_ip = u32::from_be(sa.sin_addr.s_addr);
    let c_port = u16::from_be(sa.sin_port);
    Ok((fd, c_ip, c_port))
}

/// Sets the socket nonblocking. `fcntl(2)` with `F_GETFL`/`F_SETFL` can't be
/// interrupted by a signal.
pub fn nonblock(fd: i32) -> Result<(), String> {
    unsafe {
        let flag = fcntl(fd, F_GETFL);
        if flag == -1 {
            return Err(format!("fcntl(F_GETFL): {}", errno_str(errno())));
        }
        if fcntl(fd, F_SETFL, flag | O_NONBLOCK) == -1 {
            return Err(format!("fcntl(F_SETFL,O_NONBLOCK): {}", errno_str(errno())));
        }
    }
    Ok(())
}

pub fn tcp_no_delay(fd: i32) -> Result<(), String> {
    let yes: i32 = 1;
    unsafe {
        if setsockopt(fd, IPPROTO_TCP, TCP_NODELAY, &yes as *const _ as *const c_void, size_of_val(&yes) as u32) == -1 {
            return Err(format!("setsockopt TCP_NODELAY: {}", errno_str(errno())));
        }
    }
    Ok(())
}

pub fn close_fd(fd: i32) {
    unsafe {
        close(fd);
    }
}
