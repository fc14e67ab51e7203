use crate::reactor::interest::{Interest, Target, bits};

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

bits! {
    /// Conditions the kernel observed on a target.
    ///
    /// Shares bit values with [`Interest`], plus conditions that are
    /// always reported whether asked for or not.
    pub struct Readiness {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const PRIORITY = 1 << 2;
        const READ_CLOSED = 1 << 3;
        const ERROR = 1 << 4;
        const HANGUP = 1 << 5;

        const FILE_DELETE = 1 << 8;
        const FILE_WRITE = 1 << 9;
        const FILE_EXTEND = 1 << 10;
        const FILE_ATTRIB = 1 << 11;
        const FILE_LINK = 1 << 12;
        const FILE_RENAME = 1 << 13;
        const FILE_REVOKE = 1 << 14;

        const PROC_EXIT = 1 << 16;
        const PROC_FORK = 1 << 17;
        const PROC_EXEC = 1 << 18;

        const SIGNAL = 1 << 20;
    }
}

impl From<Interest> for Readiness {
    fn from(interest: Interest) -> Self {
        Readiness(interest.bits())
    }
}

/// One entry returned by a wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub target: Target,
    pub readiness: Readiness,
    /// The tag given when the target was subscribed.
    pub tag: u64,
    /// Backend-specific payload: bytes available on kqueue read filters,
    /// delivery count for signals, 0 where the backend has none.
    pub data: i64,
}

impl ReadinessEvent {
    pub fn is_readable(&self) -> bool {
        self.readiness.contains(Readiness::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.readiness.contains(Readiness::WRITABLE)
    }

    /// Error or hangup: the target will not become usable again.
    pub fn is_closed(&self) -> bool {
        self.readiness
            .intersects(Readiness::ERROR | Readiness::HANGUP | Readiness::READ_CLOSED)
    }
}
