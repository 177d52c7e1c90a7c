//! Software loopback peripheral
//!
//! [`Loopback`] models a shift-register block whose data output is wired
//! straight back to its input: every frame shifted out of the transmit FIFO
//! lands in the receive FIFO. The shifter has no timing of its own; it runs
//! whenever the FIFO levels are sampled while the channel is enabled, which
//! is exactly when the engine looks at them.
//!
//! Besides driving the engine's tests it is handy when bringing an
//! application up before the hardware is there.
//!
//! ```
//! use spimss_hal::{sim::Loopback, Config, Spimss, Transaction};
//!
//! let engine = Spimss::new([Loopback::<8>::new()]);
//! engine.initialize(0, Config::default()).unwrap();
//!
//! let tx = [1u8, 2, 3, 4];
//! let mut rx = [0u8; 4];
//! engine
//!     .submit_blocking(0, &mut Transaction::transfer(&tx, &mut rx))
//!     .unwrap();
//! assert_eq!(rx, tx);
//! ```

use heapless::Deque;

use crate::{
    regs::{FifoSide, Registers, Status},
    spimss::Config,
};

/// A loopback peripheral with `DEPTH` bytes in each FIFO.
#[derive(Debug)]
pub struct Loopback<const DEPTH: usize> {
    tx: Deque<u16, DEPTH>,
    rx: Deque<u16, DEPTH>,
    config: Option<Config>,
    enabled: bool,
    interrupt_enabled: bool,
    slave_selected: bool,
    held: bool,
    flags: Status,
    transmit_level: usize,
    receive_level: usize,
    pushed: usize,
    popped: usize,
}

impl<const DEPTH: usize> Default for Loopback<DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DEPTH: usize> Loopback<DEPTH> {
    /// An idle, unconfigured peripheral with empty FIFOs.
    pub const fn new() -> Self {
        Loopback {
            tx: Deque::new(),
            rx: Deque::new(),
            config: None,
            enabled: false,
            interrupt_enabled: false,
            slave_selected: false,
            held: false,
            flags: Status::empty(),
            transmit_level: DEPTH + 1,
            receive_level: DEPTH + 1,
            pushed: 0,
            popped: 0,
        }
    }

    fn unit_bytes(&self) -> usize {
        match self.config {
            Some(config) if config.bits > 8 => 2,
            _ => 1,
        }
    }

    fn mask(&self) -> u16 {
        let bits = self.config.map_or(16, |config| config.bits.min(16));
        (((1u32 << bits) - 1) & 0xffff) as u16
    }

    fn transmit_bytes(&self) -> usize {
        self.tx.len() * self.unit_bytes()
    }

    fn receive_bytes(&self) -> usize {
        self.rx.len() * self.unit_bytes()
    }

    fn deliver(&mut self, frame: u16) {
        if self.receive_bytes() + self.unit_bytes() > DEPTH {
            self.flags |= Status::RX_OVERRUN;
        } else {
            let _ = self.rx.push_back(frame);
        }
    }

    fn shift(&mut self) {
        if !self.enabled || self.held {
            return;
        }
        let mask = self.mask();
        while let Some(frame) = self.tx.pop_front() {
            self.deliver(frame & mask);
        }
    }

    /// Stop (`true`) or restart (`false`) the shifter, as if the clock stalled.
    pub fn hold(&mut self, held: bool) {
        self.held = held;
    }

    /// Raise status flags, e.g. to simulate a transport error.
    pub fn inject(&mut self, flags: Status) {
        self.flags |= flags;
    }

    /// Deliver frames from a remote master straight into the receive FIFO.
    ///
    /// Frames that don't fit are lost and raise [`Status::RX_OVERRUN`].
    pub fn feed(&mut self, frames: &[u16]) {
        for &frame in frames {
            self.deliver(frame);
        }
    }

    /// Check if the interrupt line is asserted.
    ///
    /// Samples the FIFO levels, so the shifter runs first.
    pub fn pending_interrupt(&mut self) -> bool {
        self.shift();
        let free = DEPTH - self.transmit_bytes();
        self.interrupt_enabled
            && (!self.flags.is_empty()
                || self.receive_bytes() > self.receive_level
                || free >= self.transmit_level)
    }

    /// Current status flags, without running the shifter.
    pub fn status(&self) -> Status {
        self.flags
    }

    /// Configuration last applied by the engine.
    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    /// Check if the shifter is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check if the FIFO interrupt is armed.
    pub fn is_interrupt_enabled(&self) -> bool {
        self.interrupt_enabled
    }

    /// Check if slave select is asserted.
    pub fn is_slave_selected(&self) -> bool {
        self.slave_selected
    }

    /// Programmed transmit notification level, in bytes.
    pub fn transmit_level(&self) -> usize {
        self.transmit_level
    }

    /// Programmed receive notification level, in bytes.
    pub fn receive_level(&self) -> usize {
        self.receive_level
    }

    /// Frames pushed into the transmit FIFO so far.
    pub fn pushed(&self) -> usize {
        self.pushed
    }

    /// Frames popped from the receive FIFO so far.
    pub fn popped(&self) -> usize {
        self.popped
    }
}

impl<const DEPTH: usize> Registers for Loopback<DEPTH> {
    const FIFO_DEPTH: usize = DEPTH;

    fn configure(&mut self, config: &Config) {
        self.config = Some(*config);
    }

    fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn set_interrupt_enable(&mut self, enabled: bool) {
        self.interrupt_enabled = enabled;
    }

    fn read_status_flags(&mut self) -> Status {
        self.shift();
        self.flags
    }

    fn clear_status_flags(&mut self, flags: Status) {
        self.flags &= !flags;
    }

    fn transmit_fifo_free_count(&mut self) -> usize {
        self.shift();
        DEPTH - self.transmit_bytes()
    }

    fn receive_fifo_occupied_count(&mut self) -> usize {
        self.shift();
        self.receive_bytes()
    }

    fn push_unit(&mut self, unit: u16) {
        self.pushed += 1;
        if self.transmit_bytes() + self.unit_bytes() > DEPTH {
            self.flags |= Status::TX_OVERRUN;
        } else {
            let _ = self.tx.push_back(unit);
        }
    }

    fn pop_unit(&mut self) -> u16 {
        match self.rx.pop_front() {
            Some(frame) => {
                self.popped += 1;
                frame
            }
            None => 0,
        }
    }

    fn set_notify_threshold(&mut self, side: FifoSide, level: usize) {
        match side {
            FifoSide::Transmit => self.transmit_level = level,
            FifoSide::Receive => self.receive_level = level,
        }
    }

    fn clear_fifos(&mut self) {
        self.tx.clear();
        self.rx.clear();
    }

    fn set_slave_select(&mut self, asserted: bool) {
        self.slave_selected = asserted;
    }
}
