//! Transfer engine
//!
//! [`Spimss`] owns `N` channels, each one a shift-register peripheral behind
//! the [`Registers`] trait. At most one transaction is bound to a channel at
//! any time; a second submission is turned away with [`TransferError::Busy`]
//! rather than queued.
//!
//! ## Usage
//!
//! ```no_run
//! use spimss_hal::{sim::Loopback, Completion, Config, Spimss, Transaction};
//!
//! let tx = [0xaa_u8; 10];
//! let mut rx = [0u8; 10];
//! let done = |c: Completion<'_>| assert!(c.result.is_ok());
//!
//! let engine = Spimss::new([Loopback::<8>::new()]);
//! engine.initialize(0, Config::default()).unwrap();
//! let txn = Transaction::transfer(&tx, &mut rx).with_callback(&done);
//! let _handle = engine.submit_async(0, txn).unwrap();
//!
//! // from the channel's interrupt handler:
//! engine.on_interrupt(0);
//! ```
//!
//! Blocking transfers run the same pump in a polling loop:
//!
//! ```no_run
//! # use spimss_hal::{sim::Loopback, Config, Spimss, Transaction};
//! # let engine = Spimss::new([Loopback::<8>::new()]);
//! # engine.initialize(0, Config::default()).unwrap();
//! let tx = [1u8, 2, 3];
//! engine.submit_blocking(0, &mut Transaction::write(&tx)).unwrap();
//! ```

use core::{cell::RefCell, num::NonZeroU32};

use critical_section::Mutex;
use embedded_hal::spi::{ErrorKind, Mode, MODE_0};
use fugit::HertzU32;
use portable_atomic::{AtomicU32, Ordering};

use crate::{
    lock::Lock,
    regs::{Registers, Status},
};

mod bus;
mod pump;
mod transaction;

use pump::Progress;
use transaction::Frame;

pub use bus::SpimssBus;

pub use transaction::{Callback, Completion, Handle, ReadBuf, Transaction, Word, WriteBuf};

/// Lock token held while `initialize` reconfigures a channel.
const RESERVED: NonZeroU32 = NonZeroU32::MAX;

/// Which end of the bus drives the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Drive the clock and slave select.
    #[default]
    Master,
    /// Follow a remote master.
    Slave,
}

/// Channel configuration
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct Config {
    /// Clock polarity and phase.
    pub mode: Mode,
    /// Default frame width, 1 to 16 bits.
    pub bits: u8,
    /// Default role of transactions on this channel.
    pub role: Role,
    /// Requested bit rate, handed to the peripheral as is.
    pub baudrate: HertzU32,
}

impl Config {
    /// Create a new instance of Config
    pub const fn new(mode: Mode, bits: u8, role: Role, baudrate: HertzU32) -> Config {
        Config {
            mode,
            bits,
            role,
            baudrate,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), TransferError> {
        if !(1..=16).contains(&self.bits) || self.baudrate.raw() == 0 {
            return Err(TransferError::BadParam);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mode: MODE_0,
            bits: 8,
            role: Role::Master,
            baudrate: HertzU32::MHz(1),
        }
    }
}

/// Engine error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum TransferError {
    /// The channel already has a transaction bound.
    Busy,
    /// Invalid argument: unknown channel, uninitialized channel, buffer too
    /// short for the requested length or of the wrong width, bad frame width.
    BadParam,
    /// `initialize` was called while a transaction is bound.
    AlreadyInUse,
    /// The transaction was cancelled by [`Spimss::abort`].
    Aborted,
    /// The transaction was torn down by [`Spimss::shutdown`].
    ShutDown,
    /// The peripheral reported a transport error.
    HardwareFault(Status),
    /// No channel holds the transaction passed to [`Spimss::abort`].
    NotFound,
}

impl embedded_hal::spi::Error for TransferError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransferError::HardwareFault(flags) if flags.contains(Status::RX_OVERRUN) => {
                ErrorKind::Overrun
            }
            TransferError::HardwareFault(flags) if flags.contains(Status::MODE_FAULT) => {
                ErrorKind::ModeFault
            }
            _ => ErrorKind::Other,
        }
    }
}

/// A transaction turned away by [`Spimss::submit_async`], handed back to the caller.
#[derive(Debug)]
pub struct Rejected<'a> {
    /// Why it was rejected: [`Busy`](TransferError::Busy) or [`BadParam`](TransferError::BadParam).
    pub error: TransferError,
    /// The transaction, buffers untouched.
    pub transaction: Transaction<'a>,
}

struct Bound<'a> {
    handle: Handle,
    transaction: Transaction<'a>,
}

struct State<'a, R> {
    regs: R,
    config: Option<Config>,
    bound: Option<Bound<'a>>,
}

impl<'a, R: Registers> State<'a, R> {
    fn settings(&self, txn: &Transaction<'_>) -> Result<Config, TransferError> {
        let config = self.config.as_ref().ok_or(TransferError::BadParam)?;
        let settings = txn.settings(config)?;
        let unit = if settings.bits > 8 { 2 } else { 1 };
        if R::FIFO_DEPTH / unit == 0 {
            return Err(TransferError::BadParam);
        }
        Ok(settings)
    }

    fn setup(&mut self, settings: &Config, txn: &mut Transaction<'_>) {
        self.regs.enable(false);
        self.regs.set_interrupt_enable(false);
        self.regs.configure(settings);
        self.regs.clear_fifos();
        let stale = self.regs.read_status_flags();
        self.regs.clear_status_flags(stale);
        txn.begin(settings);
    }

    fn start(&mut self, frame: Frame) {
        if frame.role == Role::Master && frame.select {
            self.regs.set_slave_select(true);
        }
        self.regs.enable(true);
    }

    fn stop(&mut self, frame: Frame) {
        self.regs.set_interrupt_enable(false);
        if frame.role == Role::Master && frame.select {
            self.regs.set_slave_select(false);
        }
        self.regs.enable(false);
        self.regs.clear_fifos();
        self.restore();
    }

    /// Put the channel's own settings back after a transaction overrode them.
    fn restore(&mut self) {
        if let Some(config) = self.config {
            self.regs.configure(&config);
        }
    }
}

struct Channel<'a, R> {
    lock: Lock,
    state: Mutex<RefCell<State<'a, R>>>,
}

impl<'a, R> Channel<'a, R> {
    fn new(regs: R) -> Self {
        Channel {
            lock: Lock::new(),
            state: Mutex::new(RefCell::new(State {
                regs,
                config: None,
                bound: None,
            })),
        }
    }
}

/// The transfer engine.
///
/// Share it between thread mode and the interrupt handlers (for instance in
/// a `static`); every method takes `&self`.
pub struct Spimss<'a, R, const N: usize> {
    channels: [Channel<'a, R>; N],
    next_token: AtomicU32,
}

impl<'a, R: Registers, const N: usize> Spimss<'a, R, N> {
    /// Take ownership of one register block per channel.
    ///
    /// Channels start uninitialized.
    pub fn new(regs: [R; N]) -> Self {
        Spimss {
            channels: regs.map(Channel::new),
            next_token: AtomicU32::new(1),
        }
    }

    /// Give the register blocks back.
    pub fn release(self) -> [R; N] {
        self.channels
            .map(|channel| channel.state.into_inner().into_inner().regs)
    }

    fn channel(&self, channel: usize) -> Result<&Channel<'a, R>, TransferError> {
        self.channels.get(channel).ok_or(TransferError::BadParam)
    }

    fn issue(&self) -> NonZeroU32 {
        loop {
            let raw = self.next_token.fetch_add(1, Ordering::Relaxed);
            match NonZeroU32::new(raw) {
                Some(token) if token != RESERVED => return token,
                _ => continue,
            }
        }
    }

    /// Apply `config` to a channel.
    ///
    /// Disables the channel and clears its status flags while doing so. Can be
    /// repeated any number of times, but not while a transaction is bound.
    pub fn initialize(&self, channel: usize, config: Config) -> Result<(), TransferError> {
        config.validate()?;
        let ch = self.channel(channel)?;
        if !ch.lock.try_acquire(RESERVED) {
            return Err(TransferError::AlreadyInUse);
        }
        critical_section::with(|cs| {
            let mut state = ch.state.borrow_ref_mut(cs);
            state.regs.set_interrupt_enable(false);
            state.regs.enable(false);
            let flags = state.regs.read_status_flags();
            state.regs.clear_status_flags(flags);
            state.regs.configure(&config);
            state.config = Some(config);
        });
        ch.lock.release_if(RESERVED);
        debug!("spimss{}: initialized, {} bit frames", channel, config.bits);
        Ok(())
    }

    /// Check if a transaction (or `initialize`) currently holds the channel.
    ///
    /// Unknown channels are never busy.
    pub fn is_busy(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|ch| ch.lock.is_locked())
    }

    /// Run `f` on a channel's register block.
    pub fn registers<T>(
        &self,
        channel: usize,
        f: impl FnOnce(&mut R) -> T,
    ) -> Result<T, TransferError> {
        let ch = self.channel(channel)?;
        Ok(critical_section::with(|cs| {
            f(&mut ch.state.borrow_ref_mut(cs).regs)
        }))
    }

    /// Borrow a channel as an `embedded-hal` bus.
    pub fn bus(&self, channel: usize) -> Result<SpimssBus<'_, 'a, R, N>, TransferError> {
        self.channel(channel)?;
        Ok(SpimssBus::new(self, channel))
    }

    /// Run a transaction to completion, polling the FIFOs.
    ///
    /// The completion callback, if any, is not invoked. Progress counters are
    /// left in `transaction`; on error they show how far it got.
    pub fn submit_blocking(
        &self,
        channel: usize,
        transaction: &mut Transaction<'_>,
    ) -> Result<(), TransferError> {
        let ch = self.channel(channel)?;
        transaction.check_buffers()?;
        if transaction.is_empty() {
            transaction.restart();
            return Ok(());
        }

        let token = self.issue();
        if !ch.lock.try_acquire(token) {
            return Err(TransferError::Busy);
        }

        let setup = critical_section::with(|cs| {
            if ch.lock.owner() != Some(token) {
                return Err(TransferError::ShutDown);
            }
            let mut state = ch.state.borrow_ref_mut(cs);
            let settings = state.settings(transaction)?;
            state.setup(&settings, transaction);
            state.start(transaction.frame);
            Ok(transaction.frame)
        });
        let frame = match setup {
            Ok(frame) => frame,
            Err(e) => {
                ch.lock.release_if(token);
                return Err(e);
            }
        };
        trace!("spimss{}: blocking transfer of {} frames", channel, transaction.len());

        let mut flushing = false;
        let result = loop {
            let step = critical_section::with(|cs| {
                // gone if the channel was shut down under our feet
                if ch.lock.owner() != Some(token) {
                    return Err(TransferError::ShutDown);
                }
                let mut state = ch.state.borrow_ref_mut(cs);
                let flags = state.regs.read_status_flags();
                let faults = flags & transaction.fault_mask();
                if !faults.is_empty() {
                    state.regs.clear_status_flags(flags);
                    return Err(TransferError::HardwareFault(faults));
                }
                if flushing {
                    return Ok(pump::flushed(&mut state.regs, transaction));
                }
                let progress = pump::pump(&mut state.regs, transaction);
                if frame.role == Role::Slave {
                    state.regs.enable(true);
                }
                Ok(progress == Progress::Complete)
            });
            match step {
                Ok(true) if flushing => break Ok(()),
                Ok(true) => flushing = true,
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };

        if result != Err(TransferError::ShutDown) {
            critical_section::with(|cs| ch.state.borrow_ref_mut(cs).stop(frame));
            ch.lock.release_if(token);
        }
        if let Err(e) = result {
            warn!("spimss{}: blocking transfer failed: {:?}", channel, e);
        }
        result
    }

    /// Start a transaction and return without waiting for it.
    ///
    /// The transaction is driven from [`on_interrupt`](Self::on_interrupt)
    /// and its callback fires exactly once, possibly before this returns if
    /// the FIFOs can swallow it whole. Zero-length transactions complete
    /// immediately without touching the channel.
    pub fn submit_async(
        &self,
        channel: usize,
        mut transaction: Transaction<'a>,
    ) -> Result<Handle, Rejected<'a>> {
        let ch = match self.channel(channel) {
            Ok(ch) => ch,
            Err(error) => return Err(Rejected { error, transaction }),
        };
        if let Err(error) = transaction.check_buffers() {
            return Err(Rejected { error, transaction });
        }

        let handle = Handle::new(self.issue());
        if transaction.is_empty() {
            transaction.restart();
            transaction.notify(handle, Ok(()));
            return Ok(handle);
        }
        if !ch.lock.try_acquire(handle.token()) {
            return Err(Rejected {
                error: TransferError::Busy,
                transaction,
            });
        }

        let finished = critical_section::with(|cs| {
            let mut state = ch.state.borrow_ref_mut(cs);
            let settings = match state.settings(&transaction) {
                Ok(settings) => settings,
                Err(error) => {
                    ch.lock.release_if(handle.token());
                    return Err(Rejected { error, transaction });
                }
            };
            state.setup(&settings, &mut transaction);
            let progress = pump::pump(&mut state.regs, &mut transaction);
            state.start(transaction.frame);

            if progress == Progress::Complete {
                if pump::flushed(&mut state.regs, &transaction) {
                    state.stop(transaction.frame);
                    ch.lock.release_if(handle.token());
                    return Ok(Some(transaction));
                }
                pump::await_flush(&mut state.regs);
            }
            state.bound = Some(Bound {
                handle,
                transaction,
            });
            state.regs.set_interrupt_enable(true);
            Ok(None)
        })?;

        trace!("spimss{}: accepted transaction {}", channel, handle.id());
        if let Some(transaction) = finished {
            transaction.notify(handle, Ok(()));
        }
        Ok(handle)
    }

    /// Service a channel's interrupt.
    ///
    /// Call this from the peripheral's interrupt handler. Spurious calls, and
    /// calls for unknown channels, are harmless.
    pub fn on_interrupt(&self, channel: usize) {
        let Some(ch) = self.channels.get(channel) else {
            return;
        };

        let finished = critical_section::with(|cs| {
            let mut state = ch.state.borrow_ref_mut(cs);
            let state = &mut *state;
            state.regs.set_interrupt_enable(false);
            let flags = state.regs.read_status_flags();
            state.regs.clear_status_flags(flags);

            let bound = state.bound.as_mut()?;
            let txn = &mut bound.transaction;
            let faults = flags & txn.fault_mask();
            let result = if !faults.is_empty() {
                Some(Err(TransferError::HardwareFault(faults)))
            } else if txn.is_complete() || pump::pump(&mut state.regs, txn) == Progress::Complete {
                if pump::flushed(&mut state.regs, txn) {
                    Some(Ok(()))
                } else {
                    pump::await_flush(&mut state.regs);
                    None
                }
            } else {
                None
            };

            match result {
                None => {
                    state.regs.set_interrupt_enable(true);
                    None
                }
                Some(result) => {
                    let bound = state.bound.take()?;
                    state.stop(bound.transaction.frame);
                    ch.lock.release_if(bound.handle.token());
                    Some((bound, result))
                }
            }
        });

        if let Some((bound, result)) = finished {
            match result {
                Ok(()) => debug!("spimss{}: transaction {} done", channel, bound.handle.id()),
                Err(e) => warn!(
                    "spimss{}: transaction {} failed: {:?}",
                    channel,
                    bound.handle.id(),
                    e
                ),
            }
            bound.transaction.notify(bound.handle, result);
        }
    }

    /// Cancel an asynchronous transaction.
    ///
    /// Its callback fires with [`TransferError::Aborted`]; the receive buffer
    /// keeps what was read so far. Fails with [`TransferError::NotFound`] if
    /// the transaction already finished.
    pub fn abort(&self, handle: Handle) -> Result<(), TransferError> {
        for (index, ch) in self.channels.iter().enumerate() {
            if ch.lock.owner() != Some(handle.token()) {
                continue;
            }
            let taken = critical_section::with(|cs| {
                let mut state = ch.state.borrow_ref_mut(cs);
                // interrupts off before the binding goes away
                state.regs.set_interrupt_enable(false);
                match state.bound.take() {
                    Some(bound) if bound.handle == handle => {
                        state.stop(bound.transaction.frame);
                        ch.lock.release_if(handle.token());
                        Some(bound)
                    }
                    other => {
                        if other.is_some() {
                            state.regs.set_interrupt_enable(true);
                        }
                        state.bound = other;
                        None
                    }
                }
            });
            if let Some(bound) = taken {
                debug!("spimss{}: transaction {} aborted", index, handle.id());
                bound.transaction.notify(handle, Err(TransferError::Aborted));
                return Ok(());
            }
        }
        Err(TransferError::NotFound)
    }

    /// Tear a channel down, whatever it is doing.
    ///
    /// Disables the channel and its interrupt, empties both FIFOs, clears
    /// every status flag and frees the lock. A bound transaction completes
    /// with [`TransferError::ShutDown`], a blocking transfer in progress
    /// returns the same error. The configuration survives, so the channel
    /// can be used again right away. Calling this on an idle channel does
    /// nothing beyond resetting the hardware.
    pub fn shutdown(&self, channel: usize) -> Result<(), TransferError> {
        let ch = self.channel(channel)?;
        let bound = critical_section::with(|cs| {
            let mut state = ch.state.borrow_ref_mut(cs);
            state.regs.set_interrupt_enable(false);
            state.regs.enable(false);
            state.regs.set_slave_select(false);
            state.regs.clear_fifos();
            state.regs.clear_status_flags(Status::all());
            state.restore();
            let bound = state.bound.take();
            ch.lock.release();
            bound
        });
        debug!("spimss{}: shut down", channel);
        if let Some(bound) = bound {
            bound
                .transaction
                .notify(bound.handle, Err(TransferError::ShutDown));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::spi::Error as _;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.mode, MODE_0);
        assert_eq!(config.bits, 8);
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.baudrate, HertzU32::MHz(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn frame_width_is_validated() {
        for bits in [0, 17, 32] {
            let config = Config::new(MODE_0, bits, Role::Master, HertzU32::MHz(1));
            assert_eq!(config.validate(), Err(TransferError::BadParam));
        }
        let config = Config::new(MODE_0, 8, Role::Slave, HertzU32::from_raw(0));
        assert_eq!(config.validate(), Err(TransferError::BadParam));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            TransferError::HardwareFault(Status::RX_OVERRUN).kind(),
            ErrorKind::Overrun
        );
        assert_eq!(
            TransferError::HardwareFault(Status::MODE_FAULT).kind(),
            ErrorKind::ModeFault
        );
        assert_eq!(TransferError::Busy.kind(), ErrorKind::Other);
    }
}
