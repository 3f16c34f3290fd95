//! Readiness-based event loop: file events (multiplexed via epoll) and a
//! singly linked list of time events, processed from `main`'s own thread.
//! Timers fire before file events within an iteration, per `process_events`
//! below.

use std::cell::RefCell;
use std::collections::HashSet;
use std::ops::{BitOr, Deref};
use std::rc::Rc;

use crate::util::{add_ms_to_now, now_ms};

const SET_SIZE: usize = 1024 * 10;
const NO_MORE: i32 = -1;

pub type FileProc = Rc<dyn Fn(&mut EventLoop, i32, Mask)>;
pub type TimeProc = Rc<dyn Fn(&mut EventLoop, u128) -> i32>;
pub type EventFinalizerProc = Rc<dyn Fn(&mut EventLoop)>;
pub type BeforeSleepProc = Rc<dyn Fn(&mut EventLoop)>;

fn todo_proc(_el: &mut EventLoop, _fd: i32, _mask: Mask) {}

#[derive(Clone, Copy, PartialEq)]
pub struct EventFlag(u8);

impl EventFlag {
    pub fn none() -> Self {
        EventFlag(0)
    }
    pub fn file_event() -> Self {
        EventFlag(1)
    }
    pub fn time_event() -> Self {
        EventFlag(2)
    }
    pub fn all_events() -> Self {
        EventFlag(3)
    }
    pub fn dont_wait() -> Self {
        EventFlag(4)
    }
    pub fn contains_time_event(&self) -> bool {
        (self.0 & Self::time_event().0) != 0
    }
    pub fn is_waiting(&self) -> bool {
        (self.0 & Self::dont_wait().0) == 0
    }
}

impl std::ops::BitAnd for EventFlag {
    type Output = EventFlag;
    fn bitand(self, rhs: Self) -> Self::Output {
        EventFlag(self.0 & rhs.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mask {
    None,
    Readable,
    Writable,
    ReadWritable,
}

impl Mask {
    pub fn is_readable(&self) -> bool {
        *self == Self::Readable || *self == Self::ReadWritable
    }

    pub fn is_writable(&self) -> bool {
        *self == Self::Writable || *self == Self::ReadWritable
    }

    /// True if every direction set in `mask` is already set in `self`.
    pub fn contains(&self, mask: Self) -> bool {
        match mask {
            Self::None => true,
            Self::Readable => self.is_readable(),
            Self::Writable => self.is_writable(),
            Self::ReadWritable => *self == Self::ReadWritable,
        }
    }

    pub fn disable(&mut self, mask: Self) {
        match (*self, mask) {
            (_, Self::None) => {}
            (Self::None, _) => {}
            (_, Self::ReadWritable) => *self = Self::None,
            (Self::Readable, Self::Readable) => *self = Self::None,
            (Self::ReadWritable, Self::Readable) => *self = Self::Writable,
            (Self::Writable, Self::Writable) => *self = Self::None,
            (Self::ReadWritable, Self::Writable) => *self = Self::Readable,
            (_, _) => {}
        }
    }
}

impl BitOr for Mask {
    type Output = Mask;
    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::None, r) => r,
            (l, Self::None) => l,
            (Self::ReadWritable, _) | (_, Self::ReadWritable) => Self::ReadWritable,
            (Self::Readable, Self::Writable) | (Self::Writable, Self::Readable) => Self::ReadWritable,
            (l, _) => l,
        }
    }
}

struct FileEvent {
    mask: Mask,
    r_file_proc: FileProc,
    w_file_proc: FileProc,
}

struct TimeEvent {
    id: u128,
    when_ms: u128,
    time_proc: TimeProc,
    finalizer_proc: Option<EventFinalizerProc>,
    next: Option<Rc<RefCell<TimeEvent>>>,
}

#[derive(Clone, Copy)]
struct FiredEvent {
    fd: i32,
    mask: Mask,
}

pub struct EventLoop {
    max_fd: i32,
    time_event_next_id: u128,
    events: Vec<FileEvent>,
    fired: Vec<FiredEvent>,
    time_event_head: Option<Rc<RefCell<TimeEvent>>>,
    stop: bool,
    api_data: RefCell<ApiState>,
    before_sleep: Option<BeforeSleepProc>,
}

impl EventLoop {
    pub fn create() -> Result<EventLoop, String> {
        let api_state = ApiState::create()?;
        let mut events = Vec::with_capacity(SET_SIZE);
        let mut fired = Vec::with_capacity(SET_SIZE);
        for _ in 0..SET_SIZE {
            events.push(FileEvent { mask: Mask::None, r_file_proc: Rc::new(todo_proc), w_file_proc: Rc::new(todo_proc) });
            fired.push(FiredEvent { fd: -1, mask: Mask::None });
        }
        Ok(EventLoop {
            max_fd: -1,
            time_event_next_id: 0,
            events,
            fired,
            time_event_head: None,
            stop: false,
            api_data: RefCell::new(api_state),
            before_sleep: None,
        })
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn set_before_sleep_proc(&mut self, proc: Option<BeforeSleepProc>) {
        self.before_sleep = proc;
    }

    pub fn create_file_event(&mut self, fd: i32, mask: Mask, proc: FileProc) -> Result<(), String> {
        if fd >= SET_SIZE as i32 {
            return Err(format!("fd should be less than {SET_SIZE}"));
        }
        if self.events[fd as usize].mask.contains(mask) {
            return Ok(());
        }
        let fe = &mut self.events[fd as usize];
        let new_mask = fe.mask | mask;
        self.api_data.borrow_mut().add_event(fd, new_mask)?;

        let fe = &mut self.events[fd as usize];
        fe.mask = new_mask;
        if mask.is_readable() {
            fe.r_file_proc = proc.clone();
        }
        if mask.is_writable() {
            fe.w_file_proc = proc;
        }
        if fd > self.max_fd {
            self.max_fd = fd;
        }
        Ok(())
    }

    pub fn delete_file_event(&mut self, fd: i32, mask: Mask) {
        if fd >= SET_SIZE as i32 {
            return;
        }
        let fe = &mut self.events[fd as usize];
        if fe.mask == Mask::None {
            return;
        }
        fe.mask.disable(mask);
        let remaining = fe.mask;

        if fd == self.max_fd && remaining == Mask::None {
            let mut j = self.max_fd - 1;
            while j >= 0 {
                if self.events[j as usize].mask != Mask::None {
                    break;
                }
                j -= 1;
            }
            self.max_fd = j;
        }

        if let Err(err) = self.api_data.borrow_mut().del_event(fd, remaining) {
            eprintln!("{err}");
        }
    }

    pub fn create_time_event(&mut self, milliseconds: u128, proc: TimeProc, finalizer_proc: Option<EventFinalizerProc>) -> u128 {
        let id = self.time_event_next_id;
        self.time_event_next_id += 1;
        let te = Rc::new(RefCell::new(TimeEvent {
            id,
            when_ms: add_ms_to_now(milliseconds),
            time_proc: proc,
            finalizer_proc,
            next: self.time_event_head.take(),
        }));
        self.time_event_head = Some(te);
        id
    }

    pub fn delete_time_event(&mut self, id: u128) -> Result<(), String> {
        let mut cur = self.time_event_head.clone();
        let mut prev: Option<Rc<RefCell<TimeEvent>>> = None;

        while let Some(e) = cur.clone() {
            if e.borrow().id == id {
                let next = e.borrow().next.clone();
                match prev {
                    Some(p) => p.borrow_mut().next = next,
                    None => self.time_event_head = next,
                }
                let finalizer = e.borrow().finalizer_proc.clone();
                if let Some(f) = finalizer {
                    f(self);
                }
                return Ok(());
            }
            prev = cur;
            cur = e.borrow().next.clone();
        }
        Err(format!("no event with the specified ID ({id}) found"))
    }

    /// Processes pending time events, then pending file events. Timers
    /// before files within an iteration; default wait when a cron exists is
    /// `max(0, next_fire - now)`, otherwise the call blocks forever.
    pub fn process_events(&mut self, flags: EventFlag) -> u32 {
        let mut processed = 0u32;
        if (flags & EventFlag::all_events()) == EventFlag::none() {
            return processed;
        }

        if self.max_fd != -1 || (flags.contains_time_event() && flags.is_waiting()) {
            let mut timeout_ms: Option<i32> = None;

            let shortest = if flags.contains_time_event() && flags.is_waiting() {
                self.search_nearest_timer()
            } else {
                None
            };

            if let Some(shortest) = shortest {
                let now = now_ms();
                let when = shortest.borrow().when_ms;
                timeout_ms = Some(if when <= now { 0 } else { (when - now) as i32 });
            } else if !flags.is_waiting() {
                timeout_ms = Some(0);
            }

            let num_events = self.api_data.borrow_mut().poll(&mut self.fired, timeout_ms);
            for j in 0..num_events {
                let fd = self.fired[j as usize].fd;
                let mask = self.fired[j as usize].mask;
                let fe_mask = self.events[fd as usize].mask;
                let mut rfired = false;

                if fe_mask.is_readable() && mask.is_readable() {
                    rfired = true;
                    let f = self.events[fd as usize].r_file_proc.clone();
                    f(self, fd, mask);
                }
                if fe_mask.is_writable() && mask.is_writable() {
                    let r_proc = self.events[fd as usize].r_file_proc.clone();
                    let w_proc = self.events[fd as usize].w_file_proc.clone();
                    if !rfired || !Rc::ptr_eq(&r_proc, &w_proc) {
                        w_proc(self, fd, mask);
                    }
                }
                processed += 1;
            }
        }

        if flags.contains_time_event() {
            processed += self.process_time_events();
        }
        processed
    }

    pub fn main(&mut self) {
        self.stop = false;
        while !self.stop {
            if let Some(f) = self.before_sleep.clone() {
                f(self);
            }
            self.process_events(EventFlag::all_events());
        }
    }

    pub fn get_api_name(&self) -> String {
        ApiState::name()
    }

    fn search_nearest_timer(&self) -> Option<Rc<RefCell<TimeEvent>>> {
        let mut cur = self.time_event_head.clone();
        let mut nearest: Option<Rc<RefCell<TimeEvent>>> = None;
        while let Some(e) = cur.clone() {
            let sooner = match &nearest {
                Some(n) => e.borrow().when_ms < n.borrow().when_ms,
                None => true,
            };
            if sooner {
                nearest = Some(e.clone());
            }
            cur = e.borrow().next.clone();
        }
        nearest
    }

    fn process_time_events(&mut self) -> u32 {
        let mut processed = 0u32;
        let mut cur = self.time_event_head.clone();
        let max_id = self.time_event_next_id.saturating_sub(1);

        while let Some(e) = cur.clone() {
            let id = e.borrow().id;
            if id > max_id {
                cur = e.borrow().next.clone();
                continue;
            }
            if e.borrow().when_ms <= now_ms() {
                let time_proc = e.borrow().time_proc.clone();
                let ret_val = time_proc(self, id);
                processed += 1;
                if ret_val != NO_MORE {
                    e.borrow_mut().when_ms = add_ms_to_now(ret_val as u128);
                } else if let Err(err) = self.delete_time_event(id) {
                    eprintln!("{err}");
                }
                cur = self.time_event_head.clone();
            } else {
                cur = e.deref().borrow().next.clone();
            }
        }
        processed
    }
}

struct ApiState {
    epfd: i32,
    registered: HashSet<i32>,
    events: Vec<libc::epoll_event>,
}

impl ApiState {
    fn create() -> Result<ApiState, String> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd == -1 {
            return Err(crate::util::errno_str(crate::util::errno()));
        }
        Ok(ApiState { epfd, registered: HashSet::new(), events: vec![unsafe { std::mem::zeroed() }; SET_SIZE] })
    }

    fn to_epoll_bits(mask: Mask) -> u32 {
        let mut bits = 0u32;
        if mask.is_readable() {
            bits |= libc::EPOLLIN as u32;
        }
        if mask.is_writable() {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    fn add_event(&mut self, fd: i32, full_mask: Mask) -> Result<(), String> {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.u64 = fd as u64;
        ev.events = Self::to_epoll_bits(full_mask);

        let op = if self.registered.contains(&fd) { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret == -1 {
            return Err(format!("ApiState.add_event: {}", crate::util::errno_str(crate::util::errno())));
        }
        self.registered.insert(fd);
        Ok(())
    }

    fn del_event(&mut self, fd: i32, remaining_mask: Mask) -> Result<(), String> {
        if remaining_mask == Mask::None {
            let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
            self.registered.remove(&fd);
            if ret == -1 {
                return Err(format!("ApiState.del_event: {}", crate::util::errno_str(crate::util::errno())));
            }
            Ok(())
        } else {
            self.add_event(fd, remaining_mask)
        }
    }

    fn poll(&mut self, fired: &mut [FiredEvent], timeout_ms: Option<i32>) -> i32 {
        let ret_val = unsafe {
            libc::epoll_wait(self.epfd, self.events.as_mut_ptr(), self.events.len() as i32, timeout_ms.unwrap_or(-1))
        };

        let mut num_events = 0;
        if ret_val > 0 {
            num_events = ret_val;
            for j in 0..num_events {
                let e = &self.events[j as usize];
                let mut mask = Mask::None;
                if e.events & (libc::EPOLLIN as u32) != 0 {
                    mask = mask | Mask::Readable;
                }
                if e.events & (libc::EPOLLOUT as u32) != 0 {
                    mask = mask | Mask::Writable;
                }
                fired[j as usize].fd = e.u64 as i32;
                fired[j as usize].mask = mask;
            }
        }
        num_events
    }

    fn name() -> String {
        "epoll".to_string()
    }
}

impl Drop for ApiState {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epfd) } == -1 {
            eprintln!("ApiState.drop failed: {}", crate::util::errno_str(crate::util::errno()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn mask_disable_narrows_readwrite_to_one_side() {
        let mut mask = Mask::ReadWritable;
        mask.disable(Mask::Readable);
        assert!(mask == Mask::Writable);
        mask.disable(Mask::None);
        assert!(mask == Mask::Writable);
        mask.disable(Mask::Writable);
        assert!(mask == Mask::None);
    }

    #[test]
    fn mask_bitor_combines() {
        assert!(Mask::Readable | Mask::Writable == Mask::ReadWritable);
        assert!(Mask::None | Mask::Readable == Mask::Readable);
    }

    #[test]
    fn mask_contains_checks_direction_subset() {
        assert!(Mask::ReadWritable.contains(Mask::Readable));
        assert!(Mask::ReadWritable.contains(Mask::Writable));
        assert!(!Mask::Readable.contains(Mask::Writable));
        assert!(Mask::Readable.contains(Mask::None));
    }

    #[test]
    fn create_file_event_same_direction_is_noop() {
        let mut el = EventLoop::create().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let first_calls = Rc::new(Cell::new(0));
        let first_calls_clone = first_calls.clone();
        el.create_file_event(
            read_fd,
            Mask::Readable,
            Rc::new(move |_el, _fd, _mask| first_calls_clone.set(first_calls_clone.get() + 1)),
        )
        .unwrap();

        let second_calls = Rc::new(Cell::new(0));
        let second_calls_clone = second_calls.clone();
        el.create_file_event(
            read_fd,
            Mask::Readable,
            Rc::new(move |_el, _fd, _mask| second_calls_clone.set(second_calls_clone.get() + 1)),
        )
        .unwrap();

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        el.process_events(EventFlag::file_event() | EventFlag::dont_wait());

        assert_eq!(first_calls.get(), 1);
        assert_eq!(second_calls.get(), 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn once_time_event_fires_single_time() {
        let mut el = EventLoop::create().unwrap();
        let fired = Rc::new(Cell::new(0));
        let fired_clone = fired.clone();
        el.create_time_event(
            0,
            Rc::new(move |_el, _id| {
                fired_clone.set(fired_clone.get() + 1);
                NO_MORE
            }),
            None,
        );
        el.process_events(EventFlag::time_event());
        el.process_events(EventFlag::time_event() | EventFlag::dont_wait());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn periodic_time_event_reschedules() {
        let mut el = EventLoop::create().unwrap();
        let fired = Rc::new(Cell::new(0));
        let fired_clone = fired.clone();
        el.create_time_event(
            0,
            Rc::new(move |_el, _id| {
                fired_clone.set(fired_clone.get() + 1);
                if fired_clone.get() < 3 {
                    0
                } else {
                    NO_MORE
                }
            }),
            None,
        );
        for _ in 0..5 {
            el.process_events(EventFlag::time_event() | EventFlag::dont_wait());
        }
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn delete_time_event_invokes_finalizer() {
        let mut el = EventLoop::create().unwrap();
        let finalized = Rc::new(Cell::new(false));
        let finalized_clone = finalized.clone();
        let id = el.create_time_event(
            10_000,
            Rc::new(|_el, _id| NO_MORE),
            Some(Rc::new(move |_el: &mut EventLoop| {
                finalized_clone.set(true);
            })),
        );
        el.delete_time_event(id).unwrap();
        assert!(finalized.get());
    }
}
