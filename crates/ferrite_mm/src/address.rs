mod addr;
mod addr_range;
mod paddr;
mod vaddr;

pub use addr::{Addr, AddrOps};
pub use addr_range::{PRange, VRange};
pub use paddr::PAddr;
pub use vaddr::VAddr;
