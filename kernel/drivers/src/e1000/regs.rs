//! Intel e1000 register map, bit definitions and hardware descriptors.

bitflags::bitflags! {
    /// Device Control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ctrl: u32 {
        /// Full duplex.
        const FD   = 1 << 0;
        /// Auto-speed detection enable.
        const ASDE = 1 << 5;
        /// Set link up.
        const SLU  = 1 << 6;
        /// Device reset; self-clears when the reset completes.
        const RST  = 1 << 26;
    }
}

bitflags::bitflags! {
    /// Device Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        /// Full-duplex link.
        const FD = 1 << 0;
        /// Link up.
        const LU = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Receive Control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rctl: u32 {
        /// Receiver enable.
        const EN    = 1 << 1;
        /// Store bad packets.
        const SBP   = 1 << 2;
        /// Unicast promiscuous.
        const UPE   = 1 << 3;
        /// Multicast promiscuous.
        const MPE   = 1 << 4;
        /// Broadcast accept mode.
        const BAM   = 1 << 15;
        /// Strip the Ethernet CRC from received frames.
        const SECRC = 1 << 26;
    }
}

bitflags::bitflags! {
    /// Transmit Control register bits (CT/COLD occupy the shifted fields).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Tctl: u32 {
        /// Transmitter enable.
        const EN  = 1 << 1;
        /// Pad short packets.
        const PSP = 1 << 3;
    }
}

/// Collision Threshold field shift inside TCTL.
pub const TCTL_CT_SHIFT: u32 = 4;
/// Collision Distance field shift inside TCTL.
pub const TCTL_COLD_SHIFT: u32 = 12;

/// Interrupt cause bits (shared by ICR / IMS / IMC).
pub const ICR_TXDW: u32 = 1 << 0;
/// Transmit queue empty.
pub const ICR_TXQE: u32 = 1 << 1;
/// Link status change.
pub const ICR_LSC: u32 = 1 << 2;
/// Receive descriptor minimum threshold.
pub const ICR_RXDMT0: u32 = 1 << 4;
/// Receiver overrun.
pub const ICR_RXO: u32 = 1 << 6;
/// Receiver timer interrupt.
pub const ICR_RXT0: u32 = 1 << 7;

/// Register offsets from the MMIO base.
pub const CTRL: usize = 0x0000;
/// Device Status.
pub const STATUS: usize = 0x0008;
/// EEPROM Read.
pub const EERD: usize = 0x0014;
/// Interrupt Cause Read (read-to-clear).
pub const ICR: usize = 0x00C0;
/// Interrupt Mask Set.
pub const IMS: usize = 0x00D0;
/// Interrupt Mask Clear.
pub const IMC: usize = 0x00D8;
/// Receive Control.
pub const RCTL: usize = 0x0100;
/// Transmit Control.
pub const TCTL: usize = 0x0400;
/// Receive Descriptor Base Low.
pub const RDBAL: usize = 0x2800;
/// Receive Descriptor Base High.
pub const RDBAH: usize = 0x2804;
/// Receive Descriptor Length.
pub const RDLEN: usize = 0x2808;
/// Receive Descriptor Head.
pub const RDH: usize = 0x2810;
/// Receive Descriptor Tail.
pub const RDT: usize = 0x2818;
/// Transmit Descriptor Base Low.
pub const TDBAL: usize = 0x3800;
/// Transmit Descriptor Base High.
pub const TDBAH: usize = 0x3804;
/// Transmit Descriptor Length.
pub const TDLEN: usize = 0x3808;
/// Transmit Descriptor Head.
pub const TDH: usize = 0x3810;
/// Transmit Descriptor Tail.
pub const TDT: usize = 0x3818;
/// Multicast Table Array base (128 entries).
pub const MTA: usize = 0x5200;
/// Number of MTA entries.
pub const MTA_COUNT: usize = 128;
/// Receive Address Low (MAC bytes 0..3).
pub const RAL: usize = 0x5400;
/// Receive Address High (MAC bytes 4..5 + valid bit).
pub const RAH: usize = 0x5404;

/// EERD start bit.
pub const EERD_START: u32 = 1 << 0;
/// EERD done bit.
pub const EERD_DONE: u32 = 1 << 4;
/// EERD word-address shift.
pub const EERD_ADDR_SHIFT: u32 = 8;
/// EERD data shift.
pub const EERD_DATA_SHIFT: u32 = 16;

/// Receive descriptor done status bit.
pub const RXD_STAT_DD: u8 = 1 << 0;
/// End-of-packet status bit.
pub const RXD_STAT_EOP: u8 = 1 << 1;

/// Transmit command: end of packet.
pub const TXD_CMD_EOP: u8 = 1 << 0;
/// Transmit command: insert FCS.
pub const TXD_CMD_IFCS: u8 = 1 << 1;
/// Transmit command: report status.
pub const TXD_CMD_RS: u8 = 1 << 3;
/// Transmit descriptor done status bit.
pub const TXD_STAT_DD: u8 = 1 << 0;

/// Legacy 16-byte receive descriptor.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RxDesc {
    /// Physical address of the receive buffer.
    pub addr: u64,
    /// Length of the received frame.
    pub length: u16,
    /// Packet checksum (unused).
    pub checksum: u16,
    /// Descriptor status (DD, EOP, ...).
    pub status: u8,
    /// Receive errors.
    pub errors: u8,
    /// VLAN tag (unused).
    pub special: u16,
}

/// Legacy 16-byte transmit descriptor.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TxDesc {
    /// Physical address of the frame to transmit.
    pub addr: u64,
    /// Frame length.
    pub length: u16,
    /// Checksum offset (unused).
    pub cso: u8,
    /// Command bits (EOP, IFCS, RS).
    pub cmd: u8,
    /// Descriptor status (DD once transmitted).
    pub status: u8,
    /// Checksum start (unused).
    pub css: u8,
    /// VLAN tag (unused).
    pub special: u16,
}

static_assertions::const_assert_eq!(core::mem::size_of::<RxDesc>(), 16);
static_assertions::const_assert_eq!(core::mem::size_of::<TxDesc>(), 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_field_offsets() {
        assert_eq!(core::mem::offset_of!(RxDesc, length), 8);
        assert_eq!(core::mem::offset_of!(RxDesc, status), 12);
        assert_eq!(core::mem::offset_of!(TxDesc, cmd), 11);
        assert_eq!(core::mem::offset_of!(TxDesc, status), 12);
    }

    #[test]
    fn interrupt_bits_are_distinct() {
        let bits = [ICR_TXDW, ICR_TXQE, ICR_LSC, ICR_RXDMT0, ICR_RXO, ICR_RXT0];
        for (i, a) in bits.iter().enumerate() {
            for (j, b) in bits.iter().enumerate() {
                if i != j {
                    assert_eq!(a & b, 0);
                }
            }
        }
    }
}
