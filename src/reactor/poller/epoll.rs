use crate::error::{Error, cvt};
use crate::reactor::event::{Readiness, ReadinessEvent};
use crate::reactor::interest::{Action, Flags, Interest, Subscription, Target};
use crate::utils::lock;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLET, EPOLLHUP,
    EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP, epoll_event,
};
use std::collections::HashMap;
use std::ffi::CString;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace, warn};

// The epoll data word carries the registration kind in its high half and
// the descriptor or pid in its low half.
const KIND_DESCRIPTOR: u64 = 1;
const KIND_PROCESS: u64 = 2;
const KIND_INOTIFY: u64 = 3;
const KIND_WAKE: u64 = 4;

const fn key(kind: u64, value: u32) -> u64 {
    (kind << 32) | value as u64
}

const INOTIFY_BUF: usize = 4096;

pub(crate) struct RawEvents(Vec<epoll_event>);

impl RawEvents {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        RawEvents(vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)])
    }
}

struct Registration {
    tag: u64,
}

struct ProcessWatch {
    pidfd: OwnedFd,
    tag: u64,
}

struct FileWatch {
    wd: i32,
    inode: Inode,
    interest: Interest,
    tag: u64,
}

// (st_dev, st_ino). inotify keeps one watch per inode per instance.
type Inode = (u64, u64);

#[derive(Default)]
struct State {
    descriptors: HashMap<RawFd, Registration>,
    processes: HashMap<libc::pid_t, ProcessWatch>,
    files: HashMap<RawFd, FileWatch>,
    watches: HashMap<i32, RawFd>,
    inodes: HashMap<Inode, RawFd>,
    inotify: Option<OwnedFd>,
}

pub(crate) struct EpollPoller {
    epoll: OwnedFd,
    wake: OwnedFd,
    state: Mutex<State>,
}

impl EpollPoller {
    /// `size_hint` only presizes the bookkeeping; the kernel ignores it.
    pub(crate) fn new(size_hint: usize) -> Result<Self, Error> {
        let epoll = cvt(unsafe { libc::epoll_create1(EPOLL_CLOEXEC) }).map_err(Error::allocation)?;
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let wake = cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })
            .map_err(Error::allocation)?;
        let wake = unsafe { OwnedFd::from_raw_fd(wake) };

        ctl(
            epoll.as_raw_fd(),
            EPOLL_CTL_ADD,
            wake.as_raw_fd(),
            EPOLLIN as u32,
            key(KIND_WAKE, 0),
        )
        .map_err(Error::allocation)?;

        let state = State {
            descriptors: HashMap::with_capacity(size_hint.min(1024)),
            ..State::default()
        };

        debug!(epfd = epoll.as_raw_fd(), size_hint, "created epoll queue");

        Ok(Self {
            epoll,
            wake,
            state: Mutex::new(state),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    pub(crate) fn submit(&self, subscription: &Subscription) -> Result<(), Error> {
        let mut state = lock(&self.state);

        match subscription.target {
            Target::Descriptor(fd) => self.submit_descriptor(&mut state, fd, subscription),
            Target::File(fd) => self.submit_file(&mut state, fd, subscription),
            Target::Process(pid) => self.submit_process(&mut state, pid, subscription),
            Target::Signal(_) => Err(Error::Unsupported {
                target: "signal",
                backend: "epoll",
            }),
        }
    }

    fn submit_descriptor(
        &self,
        state: &mut State,
        fd: RawFd,
        subscription: &Subscription,
    ) -> Result<(), Error> {
        if subscription
            .interest
            .intersects(Interest::FILE_ANY | Interest::PROC_ANY | Interest::SIGNAL)
        {
            return Err(Error::os(libc::EINVAL));
        }

        let epfd = self.epoll.as_raw_fd();
        let data = key(KIND_DESCRIPTOR, fd as u32);
        let mask = descriptor_mask(subscription.interest, subscription.flags);

        match subscription.action {
            Action::Add => {
                ctl(epfd, EPOLL_CTL_ADD, fd, mask, data).map_err(Error::os)?;
                state.descriptors.insert(
                    fd,
                    Registration {
                        tag: subscription.tag,
                    },
                );
            }
            Action::Modify => {
                ctl(epfd, EPOLL_CTL_MOD, fd, mask, data).map_err(Error::os)?;
                state.descriptors.insert(
                    fd,
                    Registration {
                        tag: subscription.tag,
                    },
                );
            }
            Action::Delete => {
                let result = ctl(epfd, EPOLL_CTL_DEL, fd, 0, 0);
                // A closed descriptor has already left the epoll set.
                state.descriptors.remove(&fd);
                result.map_err(Error::os)?;
            }
        }

        trace!(fd, action = ?subscription.action, mask, "epoll_ctl");
        Ok(())
    }

    fn submit_process(
        &self,
        state: &mut State,
        pid: libc::pid_t,
        subscription: &Subscription,
    ) -> Result<(), Error> {
        if subscription
            .interest
            .intersects(Interest::PROC_FORK | Interest::PROC_EXEC)
        {
            return Err(Error::Unsupported {
                target: "process fork/exec",
                backend: "epoll",
            });
        }

        let epfd = self.epoll.as_raw_fd();
        let data = key(KIND_PROCESS, pid as u32);
        let mut mask = EPOLLIN as u32;
        if subscription.flags.contains(Flags::DISABLED) {
            mask = 0;
        }

        match subscription.action {
            Action::Add => {
                if state.processes.contains_key(&pid) {
                    return Err(Error::os(libc::EEXIST));
                }

                let pidfd = cvt(unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) })
                    .map_err(Error::os)?;
                let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };

                ctl(epfd, EPOLL_CTL_ADD, pidfd.as_raw_fd(), mask, data).map_err(Error::os)?;
                state.processes.insert(
                    pid,
                    ProcessWatch {
                        pidfd,
                        tag: subscription.tag,
                    },
                );
            }
            Action::Modify => {
                let watch = state
                    .processes
                    .get_mut(&pid)
                    .ok_or(Error::os(libc::ENOENT))?;

                ctl(epfd, EPOLL_CTL_MOD, watch.pidfd.as_raw_fd(), mask, data)
                    .map_err(Error::os)?;
                watch.tag = subscription.tag;
            }
            Action::Delete => {
                let watch = state
                    .processes
                    .remove(&pid)
                    .ok_or(Error::os(libc::ENOENT))?;

                ctl(epfd, EPOLL_CTL_DEL, watch.pidfd.as_raw_fd(), 0, 0).map_err(Error::os)?;
            }
        }

        trace!(pid, action = ?subscription.action, "pidfd watch");
        Ok(())
    }

    fn submit_file(
        &self,
        state: &mut State,
        fd: RawFd,
        subscription: &Subscription,
    ) -> Result<(), Error> {
        if subscription.flags.contains(Flags::DISABLED) {
            return Err(Error::Unsupported {
                target: "disabled file",
                backend: "epoll",
            });
        }

        match subscription.action {
            Action::Add | Action::Modify => {
                let exists = state.files.contains_key(&fd);
                if subscription.action == Action::Add && exists {
                    return Err(Error::os(libc::EEXIST));
                }
                if subscription.action == Action::Modify && !exists {
                    return Err(Error::os(libc::ENOENT));
                }

                // Adding a watch for an inode that is already watched would
                // overwrite the existing watch's mask in the kernel, so
                // reject it before touching anything.
                let inode = inode(fd).map_err(Error::os)?;
                if let Some(&other) = state.inodes.get(&inode)
                    && other != fd
                {
                    trace!(fd, other, "inode already watched");
                    return Err(Error::os(libc::EEXIST));
                }

                let inotify = self.inotify(state)?;
                let path = CString::new(format!("/proc/self/fd/{fd}"))
                    .map_err(|_| Error::os(libc::EINVAL))?;
                let mask = inotify_mask(subscription.interest, subscription.flags);

                let wd = cvt(unsafe { libc::inotify_add_watch(inotify, path.as_ptr(), mask) })
                    .map_err(Error::os)?;

                if let Some(previous) = state.files.get(&fd)
                    && previous.inode != inode
                {
                    // The descriptor was reopened onto another file.
                    state.inodes.remove(&previous.inode);
                    state.watches.remove(&previous.wd);
                }

                state.watches.insert(wd, fd);
                state.inodes.insert(inode, fd);
                state.files.insert(
                    fd,
                    FileWatch {
                        wd,
                        inode,
                        interest: subscription.interest,
                        tag: subscription.tag,
                    },
                );

                trace!(fd, wd, mask, "inotify watch");
            }
            Action::Delete => {
                let watch = state.files.remove(&fd).ok_or(Error::os(libc::ENOENT))?;
                state.watches.remove(&watch.wd);
                state.inodes.remove(&watch.inode);

                if let Some(inotify) = &state.inotify {
                    // EINVAL means the kernel already dropped the watch.
                    match cvt(unsafe { libc::inotify_rm_watch(inotify.as_raw_fd(), watch.wd) }) {
                        Ok(_) | Err(libc::EINVAL) => {}
                        Err(code) => return Err(Error::os(code)),
                    }
                }
            }
        }

        Ok(())
    }

    // Lazily creates the inotify instance and nests it in the epoll set.
    fn inotify(&self, state: &mut State) -> Result<RawFd, Error> {
        if let Some(inotify) = &state.inotify {
            return Ok(inotify.as_raw_fd());
        }

        let fd = cvt(unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) })
            .map_err(Error::allocation)?;
        let inotify = unsafe { OwnedFd::from_raw_fd(fd) };

        ctl(
            self.epoll.as_raw_fd(),
            EPOLL_CTL_ADD,
            fd,
            EPOLLIN as u32,
            key(KIND_INOTIFY, 0),
        )
        .map_err(Error::os)?;

        debug!(fd, "created inotify instance");
        state.inotify = Some(inotify);

        Ok(fd)
    }

    pub(crate) fn wait_raw(
        &self,
        events: &mut RawEvents,
        timeout: Option<Duration>,
    ) -> Result<usize, i32> {
        let n = cvt(unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.0.as_mut_ptr(),
                events.0.len() as i32,
                timeout_ms(timeout),
            )
        })?;

        Ok(n as usize)
    }

    pub(crate) fn collect(
        &self,
        events: &RawEvents,
        n: usize,
        out: &mut Vec<ReadinessEvent>,
    ) -> bool {
        let mut state = lock(&self.state);
        let mut woken = false;

        for event in events.0.iter().take(n) {
            let data = event.u64;
            let bits = event.events;
            let value = data as u32;

            match data >> 32 {
                KIND_WAKE => {
                    self.drain_wake();
                    woken = true;
                }
                KIND_DESCRIPTOR => {
                    let fd = value as RawFd;
                    match state.descriptors.get(&fd) {
                        Some(registration) => out.push(ReadinessEvent {
                            target: Target::Descriptor(fd),
                            readiness: readiness(bits),
                            tag: registration.tag,
                            data: 0,
                        }),
                        None => trace!(fd, "dropping event for removed descriptor"),
                    }
                }
                KIND_PROCESS => {
                    let pid = value as libc::pid_t;
                    // Exit is final; the watch goes away with it.
                    if let Some(watch) = state.processes.remove(&pid) {
                        let _ = ctl(
                            self.epoll.as_raw_fd(),
                            EPOLL_CTL_DEL,
                            watch.pidfd.as_raw_fd(),
                            0,
                            0,
                        );

                        out.push(ReadinessEvent {
                            target: Target::Process(pid),
                            readiness: Readiness::PROC_EXIT,
                            tag: watch.tag,
                            data: 0,
                        });
                    }
                }
                KIND_INOTIFY => drain_inotify(&mut state, out),
                kind => warn!(kind, "unknown epoll registration kind"),
            }
        }

        woken
    }

    fn drain_wake(&self) {
        let mut counter = 0u64;
        unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                &mut counter as *mut u64 as *mut _,
                mem::size_of::<u64>(),
            );
        }
    }

    pub(crate) fn wake(&self) -> Result<(), i32> {
        let one = 1u64;
        let result = cvt(unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const _,
                mem::size_of::<u64>(),
            )
        });

        match result {
            // A saturated counter is already pending a wake.
            Ok(_) | Err(libc::EAGAIN) => Ok(()),
            Err(code) => Err(code),
        }
    }

    pub(crate) fn registered(&self) -> usize {
        let state = lock(&self.state);
        state.descriptors.len() + state.processes.len() + state.files.len()
    }
}

fn ctl(epfd: RawFd, op: i32, fd: RawFd, events: u32, data: u64) -> Result<(), i32> {
    let mut event = epoll_event { events, u64: data };
    let event_ptr = if op == EPOLL_CTL_DEL {
        ptr::null_mut()
    } else {
        &mut event as *mut epoll_event
    };

    cvt(unsafe { libc::epoll_ctl(epfd, op, fd, event_ptr) })?;
    Ok(())
}

fn inode(fd: RawFd) -> Result<Inode, i32> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    cvt(unsafe { libc::fstat(fd, &mut stat) })?;

    Ok((stat.st_dev as u64, stat.st_ino as u64))
}

fn descriptor_mask(interest: Interest, flags: Flags) -> u32 {
    let mut mask = 0;

    if !flags.contains(Flags::DISABLED) {
        if interest.contains(Interest::READABLE) {
            mask |= EPOLLIN;
        }
        if interest.contains(Interest::WRITABLE) {
            mask |= EPOLLOUT;
        }
        if interest.contains(Interest::PRIORITY) {
            mask |= EPOLLPRI;
        }
        if interest.contains(Interest::READ_CLOSED) {
            mask |= EPOLLRDHUP;
        }
    }

    if flags.contains(Flags::ONESHOT) {
        mask |= EPOLLONESHOT;
    }
    if flags.contains(Flags::EDGE) {
        mask |= EPOLLET;
    }

    mask as u32
}

fn readiness(bits: u32) -> Readiness {
    let bits = bits as i32;
    let mut readiness = Readiness::empty();

    if bits & EPOLLIN != 0 {
        readiness |= Readiness::READABLE;
    }
    if bits & EPOLLOUT != 0 {
        readiness |= Readiness::WRITABLE;
    }
    if bits & EPOLLPRI != 0 {
        readiness |= Readiness::PRIORITY;
    }
    if bits & EPOLLRDHUP != 0 {
        readiness |= Readiness::READ_CLOSED;
    }
    if bits & EPOLLERR != 0 {
        readiness |= Readiness::ERROR;
    }
    if bits & EPOLLHUP != 0 {
        readiness |= Readiness::HANGUP;
    }

    readiness
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        // Round up so a sub-millisecond timeout still sleeps.
        Some(timeout) => timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .min(i32::MAX as u128) as i32,
    }
}

fn inotify_mask(interest: Interest, flags: Flags) -> u32 {
    let mut mask = 0;

    if interest.intersects(Interest::FILE_WRITE | Interest::FILE_EXTEND) {
        mask |= libc::IN_MODIFY;
    }
    if interest.intersects(Interest::FILE_ATTRIB | Interest::FILE_LINK) {
        mask |= libc::IN_ATTRIB;
    }
    if interest.contains(Interest::FILE_DELETE) {
        mask |= libc::IN_DELETE_SELF;
    }
    if interest.contains(Interest::FILE_RENAME) {
        mask |= libc::IN_MOVE_SELF;
    }
    if interest.contains(Interest::FILE_REVOKE) {
        mask |= libc::IN_UNMOUNT;
    }
    if flags.contains(Flags::ONESHOT) {
        mask |= libc::IN_ONESHOT;
    }

    mask
}

// Maps one inotify mask onto the file conditions the watch asked for.
fn file_readiness(mask: u32, interest: Interest) -> Readiness {
    let wanted = Readiness::from(interest);
    let mut readiness = Readiness::empty();

    let mut report = |observed: Readiness, fallback: Readiness| {
        let matched = observed & wanted;
        readiness |= if matched.is_empty() { fallback } else { matched };
    };

    if mask & libc::IN_MODIFY != 0 {
        report(
            Readiness::FILE_WRITE | Readiness::FILE_EXTEND,
            Readiness::FILE_WRITE,
        );
    }
    if mask & libc::IN_ATTRIB != 0 {
        report(
            Readiness::FILE_ATTRIB | Readiness::FILE_LINK,
            Readiness::FILE_ATTRIB,
        );
    }
    if mask & libc::IN_DELETE_SELF != 0 {
        readiness |= Readiness::FILE_DELETE;
    }
    if mask & libc::IN_MOVE_SELF != 0 {
        readiness |= Readiness::FILE_RENAME;
    }
    if mask & libc::IN_UNMOUNT != 0 {
        readiness |= Readiness::FILE_REVOKE;
    }

    readiness
}

// Reads every pending inotify record and folds them into one event per
// watched descriptor, in order of first appearance.
fn drain_inotify(state: &mut State, out: &mut Vec<ReadinessEvent>) {
    let Some(inotify) = state.inotify.as_ref().map(AsRawFd::as_raw_fd) else {
        return;
    };

    let start = out.len();
    let mut buf = [0u64; INOTIFY_BUF / 8];
    let header = mem::size_of::<libc::inotify_event>();

    loop {
        let n = unsafe { libc::read(inotify, buf.as_mut_ptr() as *mut _, INOTIFY_BUF) };
        if n <= 0 {
            break;
        }

        let bytes = buf.as_ptr() as *const u8;
        let mut offset = 0usize;

        while offset + header <= n as usize {
            let record: libc::inotify_event =
                unsafe { ptr::read_unaligned(bytes.add(offset) as *const libc::inotify_event) };
            offset += header + record.len as usize;

            if record.mask & libc::IN_Q_OVERFLOW != 0 {
                warn!("inotify queue overflowed, file events were lost");
                continue;
            }

            let Some(&fd) = state.watches.get(&record.wd) else {
                continue;
            };

            if record.mask & libc::IN_IGNORED != 0 {
                state.watches.remove(&record.wd);
                if let Some(watch) = state.files.remove(&fd) {
                    state.inodes.remove(&watch.inode);
                }
                continue;
            }

            let Some(watch) = state.files.get(&fd) else {
                continue;
            };

            let readiness = file_readiness(record.mask, watch.interest);
            if readiness.is_empty() {
                continue;
            }

            let target = Target::File(fd);
            match out[start..].iter().position(|event| event.target == target) {
                Some(index) => out[start + index].readiness |= readiness,
                None => out.push(ReadinessEvent {
                    target,
                    readiness,
                    tag: watch.tag,
                    data: 0,
                }),
            }
        }
    }
}
