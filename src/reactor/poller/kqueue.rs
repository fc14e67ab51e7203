use crate::error::{Error, cvt};
use crate::reactor::event::{Readiness, ReadinessEvent};
use crate::reactor::interest::{Action, Flags, Interest, Subscription, Target};
use crate::utils::lock;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_DISABLE, EV_ENABLE, EV_EOF, EV_ERROR, EV_ONESHOT, EV_RECEIPT,
    EVFILT_PROC, EVFILT_READ, EVFILT_SIGNAL, EVFILT_USER, EVFILT_VNODE, EVFILT_WRITE, NOTE_ATTRIB,
    NOTE_DELETE, NOTE_EXEC, NOTE_EXIT, NOTE_EXTEND, NOTE_FORK, NOTE_LINK, NOTE_RENAME,
    NOTE_REVOKE, NOTE_TRIGGER, NOTE_WRITE, kevent,
};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace, warn};

const WAKE_IDENT: usize = 1;

pub(crate) struct RawEvents(Vec<kevent>);

// `kevent::udata` is a raw pointer, but this crate only ever stores the
// subscription tag in it.
unsafe impl Send for RawEvents {}

impl RawEvents {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        RawEvents(vec![change(0, 0, 0, 0, 0); capacity.max(1)])
    }
}

struct Registration {
    target: Target,
    flags: Flags,
}

pub(crate) struct KqueuePoller {
    kqueue: OwnedFd,
    // Keyed by (filter, ident): kqueue registers each filter separately.
    filters: Mutex<HashMap<(i16, usize), Registration>>,
}

impl KqueuePoller {
    pub(crate) fn new(size_hint: usize) -> Result<Self, Error> {
        let kq = cvt(unsafe { libc::kqueue() }).map_err(Error::allocation)?;
        let kqueue = unsafe { OwnedFd::from_raw_fd(kq) };

        let wake = change(WAKE_IDENT, EVFILT_USER, EV_ADD | EV_ENABLE | EV_CLEAR, 0, 0);
        cvt(unsafe { libc::kevent(kq, &wake, 1, ptr::null_mut(), 0, ptr::null()) })
            .map_err(Error::allocation)?;

        debug!(kqfd = kq, size_hint, "created kqueue");

        Ok(Self {
            kqueue,
            filters: Mutex::new(HashMap::with_capacity(size_hint.min(1024))),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.kqueue.as_raw_fd()
    }

    pub(crate) fn submit(&self, subscription: &Subscription) -> Result<(), Error> {
        let mut filters = lock(&self.filters);
        let target = subscription.target;
        let ident = target.ident();
        let tag = subscription.tag;
        let wanted = wanted_filters(target, subscription.interest);

        let registered: Vec<i16> = filters
            .iter()
            .filter(|(key, registration)| key.1 == ident && registration.target == target)
            .map(|(key, _)| key.0)
            .collect();

        let mut changes = Vec::with_capacity(2);
        match subscription.action {
            Action::Add | Action::Modify => {
                if subscription.action == Action::Modify && registered.is_empty() {
                    return Err(Error::os(libc::ENOENT));
                }

                let flags = add_flags(target, subscription.flags);
                for &(filter, fflags) in &wanted {
                    changes.push(change(ident, filter, flags, fflags, tag));
                }

                if subscription.action == Action::Modify {
                    for &filter in &registered {
                        if !wanted.iter().any(|&(f, _)| f == filter) {
                            changes.push(change(ident, filter, EV_DELETE, 0, 0));
                        }
                    }
                }
            }
            Action::Delete => {
                if registered.is_empty() {
                    return Err(Error::os(libc::ENOENT));
                }

                for &filter in &registered {
                    changes.push(change(ident, filter, EV_DELETE, 0, 0));
                }
            }
        }

        let codes = self.apply(&changes)?;

        // Bookkeeping follows what the kernel accepted, change by change.
        for (applied, &code) in changes.iter().zip(&codes) {
            let key = (applied.filter, ident);

            if applied.flags & EV_DELETE != 0 {
                // ENOENT and EBADF mean the kernel dropped the filter already.
                if matches!(code, 0 | libc::ENOENT | libc::EBADF) {
                    filters.remove(&key);
                }
            } else if code == 0 {
                filters.insert(
                    key,
                    Registration {
                        target,
                        flags: subscription.flags,
                    },
                );
            }
        }

        if let Some(&code) = codes.iter().find(|&&code| code != 0) {
            if subscription.action == Action::Add {
                self.roll_back(&mut filters, ident, &registered, &changes, &codes);
            }

            debug!(ident, action = ?subscription.action, code, "kevent change rejected");
            return Err(Error::os(code));
        }

        trace!(ident, action = ?subscription.action, changes = changes.len(), "kevent changelist");
        Ok(())
    }

    // Submits `changes` with EV_RECEIPT so each one reports its own result.
    // Returns one errno per change, 0 where it was applied.
    fn apply(&self, changes: &[kevent]) -> Result<Vec<i32>, Error> {
        let mut codes = vec![0; changes.len()];
        if changes.is_empty() {
            return Ok(codes);
        }

        let receipts: Vec<kevent> = changes
            .iter()
            .map(|change| {
                let mut change = *change;
                change.flags |= EV_RECEIPT;
                change
            })
            .collect();
        let mut results = vec![change(0, 0, 0, 0, 0); receipts.len()];

        let n = cvt(unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                receipts.as_ptr(),
                receipts.len() as i32,
                results.as_mut_ptr(),
                results.len() as i32,
                ptr::null(),
            )
        })
        .map_err(Error::os)?;

        for result in results.iter().take(n as usize) {
            if result.flags & EV_ERROR == 0 {
                continue;
            }

            let index = changes
                .iter()
                .position(|change| change.filter == result.filter && change.ident == result.ident);
            if let Some(index) = index {
                codes[index] = result.data as i32;
            }
        }

        Ok(codes)
    }

    // Removes the filters a failed add managed to install, so the target is
    // either fully registered or not at all. Filters that were registered
    // before the add are left alone.
    fn roll_back(
        &self,
        filters: &mut HashMap<(i16, usize), Registration>,
        ident: usize,
        registered: &[i16],
        changes: &[kevent],
        codes: &[i32],
    ) {
        let undo: Vec<kevent> = changes
            .iter()
            .zip(codes)
            .filter(|(change, code)| {
                **code == 0 && change.flags & EV_DELETE == 0 && !registered.contains(&change.filter)
            })
            .map(|(added, _)| change(ident, added.filter, EV_DELETE, 0, 0))
            .collect();

        if undo.is_empty() {
            return;
        }

        match self.apply(&undo) {
            Ok(codes) => {
                for (change, code) in undo.iter().zip(codes) {
                    if code == 0 {
                        filters.remove(&(change.filter, ident));
                    }
                }
            }
            Err(error) => warn!(ident, %error, "failed to roll back partial registration"),
        }
    }

    pub(crate) fn wait_raw(
        &self,
        events: &mut RawEvents,
        timeout: Option<Duration>,
    ) -> Result<usize, i32> {
        let timespec = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(ptr::null(), |ts| ts as *const libc::timespec);

        let n = cvt(unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                events.0.as_mut_ptr(),
                events.0.len() as i32,
                timespec_ptr,
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
        let mut filters = lock(&self.filters);
        let mut woken = false;

        for event in events.0.iter().take(n) {
            let filter = event.filter;
            let ident = event.ident;

            if filter == EVFILT_USER && ident == WAKE_IDENT {
                woken = true;
                continue;
            }

            let Some(registration) = filters.get(&(filter, ident)) else {
                trace!(ident, filter, "dropping event for removed registration");
                continue;
            };

            let mut readiness = readiness(filter, event.fflags);
            if event.flags & EV_EOF != 0 {
                readiness |= if filter == EVFILT_READ {
                    Readiness::READ_CLOSED
                } else {
                    Readiness::HANGUP
                };
            }
            if event.flags & EV_ERROR != 0 {
                readiness |= Readiness::ERROR;
            }

            out.push(ReadinessEvent {
                target: registration.target,
                readiness,
                tag: event.udata as usize as u64,
                data: event.data as i64,
            });

            let finished = registration.flags.contains(Flags::ONESHOT)
                || (filter == EVFILT_PROC && event.fflags & NOTE_EXIT != 0);
            if finished {
                filters.remove(&(filter, ident));
            }
        }

        woken
    }

    pub(crate) fn wake(&self) -> Result<(), i32> {
        let trigger = change(WAKE_IDENT, EVFILT_USER, 0, NOTE_TRIGGER, 0);
        cvt(unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                &trigger,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })?;

        Ok(())
    }

    pub(crate) fn registered(&self) -> usize {
        let filters = lock(&self.filters);
        let mut targets: Vec<Target> = filters.values().map(|r| r.target).collect();
        targets.sort_by_key(|target| (target.kind(), target.ident()));
        targets.dedup();
        targets.len()
    }
}

fn change(ident: usize, filter: i16, flags: u16, fflags: u32, tag: u64) -> kevent {
    let mut event: kevent = unsafe { std::mem::zeroed() };
    event.ident = ident;
    event.filter = filter;
    event.flags = flags;
    event.fflags = fflags;
    event.udata = tag as usize as *mut libc::c_void;
    event
}

fn add_flags(target: Target, flags: Flags) -> u16 {
    let mut kflags = EV_ADD;

    kflags |= if flags.contains(Flags::DISABLED) {
        EV_DISABLE
    } else {
        EV_ENABLE
    };
    if flags.contains(Flags::ONESHOT) {
        kflags |= EV_ONESHOT;
    }
    // Vnode and process filters report transitions unless told otherwise.
    if flags.contains(Flags::EDGE) || matches!(target, Target::File(_) | Target::Process(_)) {
        kflags |= EV_CLEAR;
    }

    kflags
}

fn wanted_filters(target: Target, interest: Interest) -> Vec<(i16, u32)> {
    match target {
        Target::Descriptor(_) => {
            let mut filters = Vec::with_capacity(2);
            if interest.intersects(Interest::READABLE | Interest::PRIORITY | Interest::READ_CLOSED)
            {
                filters.push((EVFILT_READ, 0));
            }
            if interest.contains(Interest::WRITABLE) {
                filters.push((EVFILT_WRITE, 0));
            }
            filters
        }
        Target::File(_) => vec![(EVFILT_VNODE, vnode_fflags(interest))],
        Target::Process(_) => vec![(EVFILT_PROC, proc_fflags(interest))],
        Target::Signal(_) => vec![(EVFILT_SIGNAL, 0)],
    }
}

const VNODE_NOTES: [(Interest, u32); 7] = [
    (Interest::FILE_DELETE, NOTE_DELETE),
    (Interest::FILE_WRITE, NOTE_WRITE),
    (Interest::FILE_EXTEND, NOTE_EXTEND),
    (Interest::FILE_ATTRIB, NOTE_ATTRIB),
    (Interest::FILE_LINK, NOTE_LINK),
    (Interest::FILE_RENAME, NOTE_RENAME),
    (Interest::FILE_REVOKE, NOTE_REVOKE),
];

const PROC_NOTES: [(Interest, u32); 3] = [
    (Interest::PROC_EXIT, NOTE_EXIT),
    (Interest::PROC_FORK, NOTE_FORK),
    (Interest::PROC_EXEC, NOTE_EXEC),
];

fn vnode_fflags(interest: Interest) -> u32 {
    VNODE_NOTES
        .iter()
        .filter(|(bit, _)| interest.contains(*bit))
        .fold(0, |acc, (_, note)| acc | note)
}

fn proc_fflags(interest: Interest) -> u32 {
    let fflags = PROC_NOTES
        .iter()
        .filter(|(bit, _)| interest.contains(*bit))
        .fold(0, |acc, (_, note)| acc | note);

    if fflags == 0 { NOTE_EXIT } else { fflags }
}

fn readiness(filter: i16, fflags: u32) -> Readiness {
    let notes: &[(Interest, u32)] = match filter {
        EVFILT_READ => return Readiness::READABLE,
        EVFILT_WRITE => return Readiness::WRITABLE,
        EVFILT_SIGNAL => return Readiness::SIGNAL,
        EVFILT_VNODE => &VNODE_NOTES,
        EVFILT_PROC => &PROC_NOTES,
        _ => return Readiness::empty(),
    };

    notes
        .iter()
        .filter(|(_, note)| fflags & note != 0)
        .fold(Readiness::empty(), |acc, (bit, _)| acc | Readiness::from(*bit))
}
