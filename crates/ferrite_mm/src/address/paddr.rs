use core::fmt;
use core::ops::{Add, Sub};

use super::addr::Addr;

#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PAddr(usize);

impl PAddr {
    pub const fn from_val(v: usize) -> Self {
        Self(v)
    }
}

impl From<usize> for PAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl Sub for PAddr {
    type Output = usize;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Add<usize> for PAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        PAddr(self.0 + rhs)
    }
}

impl fmt::Debug for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PAddr({:#x})", self.0)
    }
}

impl Addr for PAddr {
    fn addr(self) -> usize {
        self.0
    }

    fn from_addr(addr: usize) -> Self {
        Self(addr)
    }
}
