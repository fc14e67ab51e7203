//! Subscription types: what to watch, for which conditions, and how.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;

macro_rules! bits {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$flag_meta:meta])* const $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$flag_meta])* pub const $flag: $name = $name($value); )*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn remove(self, other: Self) -> Self {
                $name(self.0 & !other.0)
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;

            fn bitand(self, other: Self) -> Self {
                $name(self.0 & other.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut set = f.debug_set();
                $(
                    if self.contains($name::$flag) && $value != 0 {
                        set.entry(&format_args!(stringify!($flag)));
                    }
                )*
                set.finish()
            }
        }
    };
}

pub(crate) use bits;

bits! {
    /// Conditions a subscription asks the kernel to report.
    pub struct Interest {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Urgent (out-of-band) data.
        const PRIORITY = 1 << 2;
        /// Peer closed its writing half.
        const READ_CLOSED = 1 << 3;

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

impl Interest {
    pub const FILE_ANY: Interest = Interest(0x7f << 8);
    pub const PROC_ANY: Interest = Interest(0x7 << 16);
}

bits! {
    /// Registration behavior.
    pub struct Flags {
        /// Report once, then stop until re-armed (or removed, on kqueue).
        const ONESHOT = 1 << 0;
        /// Edge-triggered: report transitions only.
        const EDGE = 1 << 1;
        /// Register without enabling reports.
        const DISABLED = 1 << 2;
    }
}

/// The resource a subscription watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// A socket, pipe or other pollable descriptor.
    Descriptor(RawFd),
    /// An open regular file or directory, watched for changes.
    File(RawFd),
    /// A process id.
    Process(libc::pid_t),
    /// A signal number.
    Signal(i32),
}

impl Target {
    /// Kernel identifier of the watched resource.
    pub fn ident(&self) -> usize {
        match *self {
            Target::Descriptor(fd) | Target::File(fd) => fd as usize,
            Target::Process(pid) => pid as usize,
            Target::Signal(signo) => signo as usize,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Target::Descriptor(_) => "descriptor",
            Target::File(_) => "file",
            Target::Process(_) => "process",
            Target::Signal(_) => "signal",
        }
    }
}

/// What a subscription does to the queue's registrations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Modify,
    Delete,
}

/// One registration request submitted through
/// [`ReadinessQueue::update`](crate::ReadinessQueue::update).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub target: Target,
    pub interest: Interest,
    pub flags: Flags,
    pub action: Action,
    /// Opaque value echoed back in every event for this target.
    pub tag: u64,
}

impl Subscription {
    pub fn add(target: Target, interest: Interest) -> Self {
        Self {
            target,
            interest,
            flags: Flags::empty(),
            action: Action::Add,
            tag: 0,
        }
    }

    pub fn modify(target: Target, interest: Interest) -> Self {
        Self {
            action: Action::Modify,
            ..Self::add(target, interest)
        }
    }

    pub fn delete(target: Target) -> Self {
        Self {
            action: Action::Delete,
            ..Self::add(target, Interest::empty())
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_operations() {
        let interest = Interest::READABLE | Interest::WRITABLE;

        assert!(interest.contains(Interest::READABLE));
        assert!(!interest.contains(Interest::READABLE | Interest::PRIORITY));
        assert!(interest.intersects(Interest::WRITABLE | Interest::PRIORITY));
        assert_eq!(interest.remove(Interest::WRITABLE), Interest::READABLE);
        assert!(Interest::FILE_ANY.contains(Interest::FILE_REVOKE));
        assert!(!Interest::FILE_ANY.intersects(Interest::PROC_ANY));
    }

    #[test]
    fn debug_lists_flag_names() {
        let text = format!("{:?}", Flags::ONESHOT | Flags::EDGE);
        assert_eq!(text, "{ONESHOT, EDGE}");
    }

    #[test]
    fn subscription_builders() {
        let sub = Subscription::add(Target::Descriptor(3), Interest::READABLE)
            .with_flags(Flags::EDGE)
            .with_tag(7);

        assert_eq!(sub.action, Action::Add);
        assert_eq!(sub.tag, 7);
        assert_eq!(sub.flags, Flags::EDGE);

        let del = Subscription::delete(Target::Descriptor(3));
        assert_eq!(del.action, Action::Delete);
        assert!(del.interest.is_empty());
    }
}
