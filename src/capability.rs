//! Reports which kernel notification facilities this build can use.
//!
//! The answers are fixed at compile time and never change while the
//! process runs. Higher layers use [`Backend::detect`] to pick the
//! readiness queue backend once instead of checking platforms at every
//! call site.

use std::fmt;

/// A kernel notification facility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Facility {
    /// Linux `epoll(7)`.
    Epoll,
    /// BSD/macOS `kqueue(2)`.
    Kqueue,
    /// File change notification (inotify on Linux, `EVFILT_VNODE` on kqueue).
    FileWatch,
    /// Linux netlink sockets.
    Netlink,
}

impl Facility {
    pub const ALL: [Facility; 4] = [
        Facility::Epoll,
        Facility::Kqueue,
        Facility::FileWatch,
        Facility::Netlink,
    ];
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Facility::Epoll => "epoll",
            Facility::Kqueue => "kqueue",
            Facility::FileWatch => "file-watch",
            Facility::Netlink => "netlink",
        };

        f.write_str(name)
    }
}

/// The set of facilities compiled into this build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapabilitySet {
    epoll: bool,
    kqueue: bool,
    file_watch: bool,
    netlink: bool,
}

impl CapabilitySet {
    /// Capabilities of the running build.
    pub const fn current() -> Self {
        Self {
            epoll: cfg!(any(target_os = "linux", target_os = "android")),
            kqueue: cfg!(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            )),
            file_watch: cfg!(any(
                target_os = "linux",
                target_os = "android",
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            )),
            netlink: cfg!(any(target_os = "linux", target_os = "android")),
        }
    }

    pub const fn supports(&self, facility: Facility) -> bool {
        match facility {
            Facility::Epoll => self.epoll,
            Facility::Kqueue => self.kqueue,
            Facility::FileWatch => self.file_watch,
            Facility::Netlink => self.netlink,
        }
    }

    /// Iterates over the supported facilities.
    pub fn iter(&self) -> impl Iterator<Item = Facility> + '_ {
        Facility::ALL
            .into_iter()
            .filter(move |facility| self.supports(*facility))
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::current()
    }
}

/// Returns whether this build supports `facility`.
pub fn supports(facility: Facility) -> bool {
    CapabilitySet::current().supports(facility)
}

pub fn have_epoll() -> bool {
    supports(Facility::Epoll)
}

pub fn have_kqueue() -> bool {
    supports(Facility::Kqueue)
}

pub fn have_file_watch() -> bool {
    supports(Facility::FileWatch)
}

pub fn have_netlink() -> bool {
    supports(Facility::Netlink)
}

/// Readiness queue backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    Epoll,
    Kqueue,
}

impl Backend {
    /// Picks the backend for a capability set, preferring epoll.
    pub fn select(capabilities: CapabilitySet) -> Option<Backend> {
        if capabilities.supports(Facility::Epoll) {
            Some(Backend::Epoll)
        } else if capabilities.supports(Facility::Kqueue) {
            Some(Backend::Kqueue)
        } else {
            None
        }
    }

    /// Backend for the running build.
    pub fn detect() -> Option<Backend> {
        Self::select(CapabilitySet::current())
    }

    pub fn facility(self) -> Facility {
        match self {
            Backend::Epoll => Facility::Epoll,
            Backend::Kqueue => Facility::Kqueue,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Backend::Epoll => "epoll",
            Backend::Kqueue => "kqueue",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
