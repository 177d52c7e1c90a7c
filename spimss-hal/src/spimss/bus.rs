//! `embedded-hal` adapters
//!
//! [`SpimssBus`] exposes one channel through the `embedded-hal` 1.0
//! [`SpiBus`](embedded_hal::spi::SpiBus) trait, with every call mapped onto a
//! blocking transaction, and through `embedded-hal-nb`
//! [`FullDuplex`](embedded_hal_nb::spi::FullDuplex) for frame-by-frame access.
//!
//! Frames go out with the channel's configured width: `u8` words need a width
//! of 8 bits or less, `u16` words a width above 8 bits.
//!
//! As `SpiBus` requires, the bus never drives slave select. Wrap it in an
//! `SpiDevice` implementation that owns the chip select line.

use embedded_hal::spi::{self, ErrorType};
use embedded_hal_nb::spi::FullDuplex;

use super::{Spimss, State, Transaction, TransferError, Word};
use crate::regs::Registers;

/// One channel of a [`Spimss`] engine, as a bus.
pub struct SpimssBus<'e, 'a, R, const N: usize> {
    engine: &'e Spimss<'a, R, N>,
    channel: usize,
}

impl<'e, 'a, R: Registers, const N: usize> SpimssBus<'e, 'a, R, N> {
    pub(crate) fn new(engine: &'e Spimss<'a, R, N>, channel: usize) -> Self {
        SpimssBus { engine, channel }
    }

    /// Index of the channel behind this bus.
    pub fn channel(&self) -> usize {
        self.channel
    }

    fn run(&mut self, transaction: Transaction<'_>) -> Result<(), TransferError> {
        self.engine
            .submit_blocking(self.channel, &mut transaction.without_slave_select())
    }
}

impl<'a, R: Registers, const N: usize> Spimss<'a, R, N> {
    /// Run `f` on an idle, initialized channel whose width suits `wide` frames.
    fn with_idle_channel<T>(
        &self,
        channel: usize,
        wide: bool,
        f: impl FnOnce(&mut State<'a, R>, usize) -> nb::Result<T, TransferError>,
    ) -> nb::Result<T, TransferError> {
        let ch = self.channel(channel)?;
        let token = self.issue();
        if !ch.lock.try_acquire(token) {
            return Err(nb::Error::Other(TransferError::Busy));
        }
        let result = critical_section::with(|cs| {
            let mut state = ch.state.borrow_ref_mut(cs);
            match state.config {
                Some(config) if (config.bits > 8) == wide => {
                    let unit = if wide { 2 } else { 1 };
                    f(&mut *state, unit)
                }
                _ => Err(nb::Error::Other(TransferError::BadParam)),
            }
        });
        ch.lock.release_if(token);
        result
    }

    fn push_frame(&self, channel: usize, frame: u16, wide: bool) -> nb::Result<(), TransferError> {
        self.with_idle_channel(channel, wide, |state, unit| {
            if state.regs.transmit_fifo_free_count() < unit {
                return Err(nb::Error::WouldBlock);
            }
            state.regs.push_unit(frame);
            state.regs.enable(true);
            Ok(())
        })
    }

    fn pop_frame(&self, channel: usize, wide: bool) -> nb::Result<u16, TransferError> {
        self.with_idle_channel(channel, wide, |state, unit| {
            if state.regs.receive_fifo_occupied_count() < unit {
                return Err(nb::Error::WouldBlock);
            }
            Ok(state.regs.pop_unit())
        })
    }

    fn drain_transmit(&self, channel: usize, wide: bool) -> Result<(), TransferError> {
        loop {
            let drained = self.with_idle_channel(channel, wide, |state, _| {
                if state.regs.transmit_fifo_free_count() >= R::FIFO_DEPTH {
                    Ok(())
                } else {
                    Err(nb::Error::WouldBlock)
                }
            });
            match drained {
                Ok(()) => return Ok(()),
                Err(nb::Error::WouldBlock) => continue,
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }
    }
}

impl<'e, 'a, R: Registers, const N: usize> ErrorType for SpimssBus<'e, 'a, R, N> {
    type Error = TransferError;
}

macro_rules! impl_bus {
    ($type:ident) => {
        impl<'e, 'a, R: Registers, const N: usize> spi::SpiBus<$type> for SpimssBus<'e, 'a, R, N> {
            fn read(&mut self, words: &mut [$type]) -> Result<(), Self::Error> {
                self.run(Transaction::read(<$type as Word>::read_buf(words)))
            }

            fn write(&mut self, words: &[$type]) -> Result<(), Self::Error> {
                self.run(Transaction::write(<$type as Word>::write_buf(words)))
            }

            fn transfer(&mut self, read: &mut [$type], write: &[$type]) -> Result<(), Self::Error> {
                let common = read.len().min(write.len());
                let (head, tail) = read.split_at_mut(common);
                self.run(Transaction::transfer(
                    <$type as Word>::write_buf(&write[..common]),
                    <$type as Word>::read_buf(head),
                ))?;
                // the longer side goes on alone
                if !tail.is_empty() {
                    self.run(Transaction::read(<$type as Word>::read_buf(tail)))?;
                } else if write.len() > common {
                    self.run(Transaction::write(<$type as Word>::write_buf(&write[common..])))?;
                }
                Ok(())
            }

            fn transfer_in_place(&mut self, words: &mut [$type]) -> Result<(), Self::Error> {
                let mut scratch = [0 as $type; 32];
                for block in words.chunks_mut(scratch.len()) {
                    let sent = &mut scratch[..block.len()];
                    sent.copy_from_slice(block);
                    self.run(Transaction::transfer(
                        <$type as Word>::write_buf(sent),
                        <$type as Word>::read_buf(block),
                    ))?;
                }
                Ok(())
            }

            fn flush(&mut self) -> Result<(), Self::Error> {
                self.engine
                    .drain_transmit(self.channel, <$type as Word>::WIDE)
            }
        }

        impl<'e, 'a, R: Registers, const N: usize> FullDuplex<$type> for SpimssBus<'e, 'a, R, N> {
            fn read(&mut self) -> nb::Result<$type, Self::Error> {
                self.engine
                    .pop_frame(self.channel, <$type as Word>::WIDE)
                    .map(<$type as Word>::from_unit)
            }

            fn write(&mut self, word: $type) -> nb::Result<(), Self::Error> {
                self.engine
                    .push_frame(self.channel, word.into_unit(), <$type as Word>::WIDE)
            }
        }
    };
}

impl_bus!(u8);
impl_bus!(u16);
