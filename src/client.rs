//! Per-connection protocol state machine: buffers raw bytes off the wire,
//! parses inline and multi-bulk RESP requests, and queues reply objects for
//! the write side to drain.

use crate::list::List;
use crate::obj::{new_str, Obj, ObjData};

pub const IO_BUF_LEN: usize = 16 * 1024;
const MAX_INLINE_LEN: usize = 4 * 1024;
const MAX_BULK_LEN: usize = 4 * 1024;

#[derive(Clone, Copy, PartialEq, Eq)]
enum CmdType {
    Unknown,
    Inline,
    Bulk,
}

pub struct Client {
    pub fd: i32,
    query_buf: Vec<u8>,
    cmd_type: CmdType,
    bulk_num: i32,
    bulk_len: i32,
    argv: Vec<Obj>,
    pub reply: List<ObjData>,
    pub sent_len: usize,
    pub closed: bool,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

impl Client {
    pub fn new(fd: i32) -> Client {
        Client {
            fd,
            query_buf: Vec::with_capacity(IO_BUF_LEN),
            cmd_type: CmdType::Unknown,
            bulk_num: 0,
            bulk_len: -1,
            argv: Vec::new(),
            reply: List::new(),
            sent_len: 0,
            closed: false,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.query_buf.extend_from_slice(bytes);
    }

    pub fn has_reply(&self) -> bool {
        !self.reply.is_empty()
    }

    pub fn add_reply(&mut self, obj: Obj) {
        self.reply.add_node_tail(obj);
    }

    fn reset_for_next_command(&mut self) {
        self.cmd_type = CmdType::Unknown;
        self.bulk_num = 0;
        self.bulk_len = -1;
        self.argv = Vec::new();
    }

    /// Parses at most one complete command from the front of the query
    /// buffer, consuming its bytes. Returns `Ok(None)` when the buffer holds
    /// an incomplete command and more bytes are needed.
    pub fn try_parse_command(&mut self) -> Result<Option<Vec<Obj>>, String> {
        if self.cmd_type == CmdType::Unknown {
            if self.query_buf.is_empty() {
                return Ok(None);
            }
            self.cmd_type = if self.query_buf[0] == b'*' { CmdType::Bulk } else { CmdType::Inline };
        }

        match self.cmd_type {
            CmdType::Inline => self.try_parse_inline(),
            CmdType::Bulk => self.try_parse_bulk(),
            CmdType::Unknown => unreachable!(),
        }
    }

    fn try_parse_inline(&mut self) -> Result<Option<Vec<Obj>>, String> {
        let Some(pos) = find_crlf(&self.query_buf) else {
            if self.query_buf.len() > MAX_INLINE_LEN {
                return Err("too big inline request".to_string());
            }
            return Ok(None);
        };

        let line: Vec<u8> = self.query_buf.drain(..pos + 2).take(pos).collect();
        let argv: Vec<Obj> = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|tok| !tok.is_empty())
            .map(|tok| new_str(tok.to_vec()))
            .collect();

        self.reset_for_next_command();
        Ok(Some(argv))
    }

    fn try_parse_bulk(&mut self) -> Result<Option<Vec<Obj>>, String> {
        loop {
            if self.bulk_num == 0 {
                let Some(pos) = find_crlf(&self.query_buf) else {
                    return Ok(None);
                };
                let header = std::str::from_utf8(&self.query_buf[1..pos])
                    .map_err(|_| "invalid multibulk length".to_string())?;
                let num: i32 = header.parse().map_err(|_| "invalid multibulk length".to_string())?;
                self.query_buf.drain(..pos + 2);

                if num <= 0 {
                    self.reset_for_next_command();
                    return Ok(Some(Vec::new()));
                }
                self.bulk_num = num;
                self.argv = Vec::with_capacity(num as usize);
                self.bulk_len = -1;
            }

            while self.bulk_num > 0 {
                if self.bulk_len == -1 {
                    let Some(pos) = find_crlf(&self.query_buf) else {
                        return Ok(None);
                    };
                    if self.query_buf.first() != Some(&b'$') {
                        return Err("expected '$', got something else".to_string());
                    }
                    let header = std::str::from_utf8(&self.query_buf[1..pos])
                        .map_err(|_| "invalid bulk length".to_string())?;
                    let len: i32 = header.parse().map_err(|_| "invalid bulk length".to_string())?;
                    if len < 0 || len as usize > MAX_BULK_LEN {
                        return Err("invalid bulk length".to_string());
                    }
                    self.query_buf.drain(..pos + 2);
                    self.bulk_len = len;
                }

                let need = self.bulk_len as usize + 2;
                if self.query_buf.len() < need {
                    return Ok(None);
                }
                if &self.query_buf[self.bulk_len as usize..need] != b"\r\n" {
                    return Err("expected CRLF after bulk payload".to_string());
                }
                let payload: Vec<u8> = self.query_buf.drain(..need).take(self.bulk_len as usize).collect();
                self.argv.push(new_str_bytes(payload));
                self.bulk_num -= 1;
                self.bulk_len = -1;
            }

            let argv = std::mem::take(&mut self.argv);
            self.reset_for_next_command();
            return Ok(Some(argv));
        }
    }
}

fn new_str_bytes(bytes: Vec<u8>) -> Obj {
    new_str(bytes)
}
