//! Peripheral register interface
//!
//! The engine never touches memory-mapped registers itself. A chip support
//! crate implements [`Registers`] for its shift-register block (one instance
//! per channel) and the engine only ever talks to that trait.
//!
//! All FIFO quantities are in **bytes**. A frame ("unit") of up to 8 bits
//! occupies one byte of FIFO space, a frame of 9 to 16 bits occupies two. The
//! engine only ever moves whole frames, so an implementation never sees half
//! of a 16-bit frame.

use crate::spimss::Config;

bitflags::bitflags! {
    /// Interrupt/status flags reported by the peripheral.
    ///
    /// The layout follows the usual SPIMSS `INT_FL` register. Only the engine's
    /// interpretation of the bits matters, an implementation may translate
    /// from whatever its hardware reports.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Default)]
    pub struct Status: u32 {
        /// A transmission has started and is still shifting.
        const TX_STARTED = 1 << 0;
        /// Slave mode: the master clocked a frame while the transmit FIFO was empty.
        const TX_UNDERRUN = 1 << 1;
        /// A frame arrived while the receive FIFO was full and was lost.
        const RX_OVERRUN = 1 << 2;
        /// Slave select was deasserted in the middle of a frame / multi-master conflict.
        const MODE_FAULT = 1 << 3;
        /// Bus collision detected.
        const COLLISION = 1 << 4;
        /// A frame was written to a full transmit FIFO.
        const TX_OVERRUN = 1 << 5;
        /// Summary interrupt request bit.
        const IRQ = 1 << 7;
    }
}

/// One of the two FIFOs of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FifoSide {
    /// Transmit FIFO: frames waiting to be shifted out.
    Transmit,
    /// Receive FIFO: frames shifted in and waiting to be read.
    Receive,
}

/// Capabilities the engine needs from one shift-register peripheral.
///
/// Methods are called with the channel's critical section held, either from
/// thread mode or from the channel's interrupt handler, never from both at
/// once.
pub trait Registers {
    /// Size of each FIFO, in bytes.
    const FIFO_DEPTH: usize;

    /// Apply clock polarity/phase, frame width, role and bit rate.
    ///
    /// Only called while the channel is disabled.
    fn configure(&mut self, config: &Config);

    /// Enable or disable the shifter.
    ///
    /// Enabling an already enabled channel must be harmless.
    fn enable(&mut self, enabled: bool);

    /// Arm or disarm the channel's FIFO interrupt.
    fn set_interrupt_enable(&mut self, enabled: bool);

    /// Read the current status flags.
    fn read_status_flags(&mut self) -> Status;

    /// Clear the given status flags (write-one-to-clear).
    fn clear_status_flags(&mut self, flags: Status);

    /// Free space in the transmit FIFO, in bytes.
    fn transmit_fifo_free_count(&mut self) -> usize;

    /// Occupied space in the receive FIFO, in bytes.
    fn receive_fifo_occupied_count(&mut self) -> usize;

    /// Push one frame into the transmit FIFO.
    ///
    /// Frames of up to 8 bits are passed in the low byte.
    fn push_unit(&mut self, unit: u16);

    /// Pop one frame from the receive FIFO.
    fn pop_unit(&mut self) -> u16;

    /// Program the FIFO notification level, in bytes.
    ///
    /// For [`FifoSide::Receive`] the interrupt should fire once the occupancy
    /// exceeds `level`; for [`FifoSide::Transmit`] once at least `level` bytes
    /// are free. A level above [`FIFO_DEPTH`](Self::FIFO_DEPTH) turns that
    /// side's notification off.
    fn set_notify_threshold(&mut self, side: FifoSide, level: usize);

    /// Drop the contents of both FIFOs.
    fn clear_fifos(&mut self);

    /// Drive the slave select output (master role only).
    ///
    /// The default implementation does nothing, for peripherals where slave
    /// select is handled by a GPIO outside the engine.
    fn set_slave_select(&mut self, _asserted: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_register_value() {
        let s = Status::RX_OVERRUN | Status::IRQ;
        assert_eq!(s.bits(), 0b1000_0100);
        assert!(!s.contains(Status::MODE_FAULT));
    }

    #[test]
    fn masking() {
        let s = Status::from_bits_truncate(0xffff_ffff);
        assert_eq!(s, Status::all());
        assert_eq!(s.bits(), 0b1011_1111);
        assert!(s.contains(Status::COLLISION | Status::TX_OVERRUN));
        assert_eq!(s & !Status::IRQ, Status::from_bits_truncate(0b0011_1111));
        assert!(!(Status::TX_STARTED & Status::RX_OVERRUN).intersects(Status::all()));
        assert!(Status::empty().is_empty());
    }
}
