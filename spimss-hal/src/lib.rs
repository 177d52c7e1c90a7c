//! Transfer engine for SPI master/slave shift-register peripherals
//!
//! This crate drives a FIFO-backed, half-duplex shift-register transport (the
//! kind of "SPI master/slave software" block found on many small MCUs) through
//! FIFO-level interrupts. It owns the transaction state of every channel,
//! enforces a single outstanding transaction per channel and hands the
//! caller's buffers back through a completion callback.
//!
//! The silicon itself is abstracted behind the [`regs::Registers`] trait, so
//! the same engine works for any chip that can report FIFO levels, push and
//! pop frames and raise an interrupt. [`sim::Loopback`] is a software model of
//! such a peripheral, used by the tests and handy for bring-up.
//!
//! See [`spimss`] for the engine itself.
//!
//! NOTE This HAL is still under active development. This API will remain volatile until 1.0.0

#![warn(missing_docs)]
#![no_std]

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("features `defmt` and `log` are mutually exclusive");

// This must go first so the macros are visible to the other modules.
#[macro_use]
mod fmt;

pub mod lock;
pub mod regs;
pub mod sim;
pub mod spimss;
mod typelevel;

pub use crate::spimss::{
    Callback, Completion, Config, Handle, ReadBuf, Rejected, Role, Spimss, SpimssBus,
    Transaction, TransferError, Word, WriteBuf,
};
