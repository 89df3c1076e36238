//! Page-fault error-code decoding.
//!
//! The architecture's fault path supplies the faulting virtual address (CR2
//! on x86) and a hardware error code; [`PageFault::decode`] turns them into
//! a structured report. The kernel-side handler prints the report and halts
//! — copy-on-write hook points exist but are not implemented in this
//! version.

use core::fmt;

use meson_core::addr::VirtAddr;

/// A decoded page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting virtual address.
    pub addr: VirtAddr,
    /// The fault was a protection violation on a present page (clear means
    /// the page was not present).
    pub present: bool,
    /// The faulting access was a write.
    pub write: bool,
    /// The fault occurred in user mode.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved: bool,
}

impl PageFault {
    /// Decodes the architecture error code for a fault at `addr`.
    pub fn decode(addr: VirtAddr, err_code: u32) -> Self {
        Self {
            addr,
            present: err_code & 0x1 != 0,
            write: err_code & 0x2 != 0,
            user: err_code & 0x4 != 0,
            reserved: err_code & 0x8 != 0,
        }
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page fault at {} (", self.addr)?;
        if !self.present {
            f.write_str("not-present ")?;
        }
        if self.write {
            f.write_str("write ")?;
        } else {
            f.write_str("read ")?;
        }
        if self.user {
            f.write_str("user-mode ")?;
        }
        if self.reserved {
            f.write_str("reserved ")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_not_present_read() {
        let fault = PageFault::decode(VirtAddr::new(0xDEAD_B000), 0);
        assert!(!fault.present);
        assert!(!fault.write);
        assert!(!fault.user);
        assert!(!fault.reserved);
    }

    #[test]
    fn decode_user_write_protection() {
        let fault = PageFault::decode(VirtAddr::new(0x1000), 0b0111);
        assert!(fault.present);
        assert!(fault.write);
        assert!(fault.user);
        assert!(!fault.reserved);
    }

    #[test]
    fn display_names_fault_kind() {
        let fault = PageFault::decode(VirtAddr::new(0x1000), 0b0010);
        let text = fault.to_string();
        assert!(text.contains("not-present"));
        assert!(text.contains("write"));
    }
}
