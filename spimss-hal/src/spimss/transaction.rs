//! Transactions and their completion
//!
//! A [`Transaction`] owns the caller's buffers while it is in flight. When it
//! finishes (successfully or not) the engine hands it back, buffers included,
//! through the [`Callback`] it was created with.

use core::num::NonZeroU32;

use super::{Config, Role, TransferError};
use crate::{regs::Status, typelevel::Sealed};

/// Frame types accepted by the engine.
///
/// `u8` carries frames of 1 to 8 bits, `u16` frames of 9 to 16 bits.
pub trait Word: Sealed + Copy + Default {
    /// Whether this word type carries frames wider than 8 bits.
    const WIDE: bool;

    /// Wrap a slice as a transmit buffer.
    fn write_buf(words: &[Self]) -> WriteBuf<'_>;

    /// Wrap a slice as a receive buffer.
    fn read_buf(words: &mut [Self]) -> ReadBuf<'_>;

    /// Convert a frame popped from the receive FIFO.
    fn from_unit(unit: u16) -> Self;

    /// Convert into a frame for the transmit FIFO.
    fn into_unit(self) -> u16;
}

impl Word for u8 {
    const WIDE: bool = false;

    fn write_buf(words: &[u8]) -> WriteBuf<'_> {
        WriteBuf::U8(words)
    }

    fn read_buf(words: &mut [u8]) -> ReadBuf<'_> {
        ReadBuf::U8(words)
    }

    fn from_unit(unit: u16) -> u8 {
        unit as u8
    }

    fn into_unit(self) -> u16 {
        self as u16
    }
}

impl Word for u16 {
    const WIDE: bool = true;

    fn write_buf(words: &[u16]) -> WriteBuf<'_> {
        WriteBuf::U16(words)
    }

    fn read_buf(words: &mut [u16]) -> ReadBuf<'_> {
        ReadBuf::U16(words)
    }

    fn from_unit(unit: u16) -> u16 {
        unit
    }

    fn into_unit(self) -> u16 {
        self
    }
}

/// Frames to be shifted out.
#[derive(Debug, Clone, Copy)]
pub enum WriteBuf<'a> {
    /// Frames of up to 8 bits.
    U8(&'a [u8]),
    /// Frames of 9 to 16 bits.
    U16(&'a [u16]),
}

impl<'a> WriteBuf<'a> {
    /// Number of frames in the buffer.
    pub fn len(&self) -> usize {
        match self {
            WriteBuf::U8(b) => b.len(),
            WriteBuf::U16(w) => w.len(),
        }
    }

    /// Check if the buffer holds no frame.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the buffer holds frames wider than 8 bits.
    pub fn is_wide(&self) -> bool {
        matches!(self, WriteBuf::U16(_))
    }

    pub(crate) fn unit(&self, index: usize) -> u16 {
        match self {
            WriteBuf::U8(b) => b[index] as u16,
            WriteBuf::U16(w) => w[index],
        }
    }
}

impl<'a> From<&'a [u8]> for WriteBuf<'a> {
    fn from(b: &'a [u8]) -> Self {
        WriteBuf::U8(b)
    }
}

impl<'a> From<&'a [u16]> for WriteBuf<'a> {
    fn from(w: &'a [u16]) -> Self {
        WriteBuf::U16(w)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for WriteBuf<'a> {
    fn from(b: &'a [u8; N]) -> Self {
        WriteBuf::U8(b)
    }
}

impl<'a, const N: usize> From<&'a [u16; N]> for WriteBuf<'a> {
    fn from(w: &'a [u16; N]) -> Self {
        WriteBuf::U16(w)
    }
}

/// Storage for frames shifted in.
///
/// If a transaction is aborted or shut down the buffer keeps whatever was
/// received up to that point; the rest is left untouched.
#[derive(Debug)]
pub enum ReadBuf<'a> {
    /// Frames of up to 8 bits.
    U8(&'a mut [u8]),
    /// Frames of 9 to 16 bits.
    U16(&'a mut [u16]),
}

impl<'a> ReadBuf<'a> {
    /// Number of frames the buffer can hold.
    pub fn len(&self) -> usize {
        match self {
            ReadBuf::U8(b) => b.len(),
            ReadBuf::U16(w) => w.len(),
        }
    }

    /// Check if the buffer can hold no frame.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the buffer holds frames wider than 8 bits.
    pub fn is_wide(&self) -> bool {
        matches!(self, ReadBuf::U16(_))
    }

    /// View as bytes, if this is a byte buffer.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ReadBuf::U8(b) => Some(b),
            ReadBuf::U16(_) => None,
        }
    }

    /// View as 16-bit words, if this is a word buffer.
    pub fn as_words(&self) -> Option<&[u16]> {
        match self {
            ReadBuf::U8(_) => None,
            ReadBuf::U16(w) => Some(w),
        }
    }

    /// Give the byte slice back, if this is a byte buffer.
    pub fn into_bytes(self) -> Option<&'a mut [u8]> {
        match self {
            ReadBuf::U8(b) => Some(b),
            ReadBuf::U16(_) => None,
        }
    }

    /// Give the word slice back, if this is a word buffer.
    pub fn into_words(self) -> Option<&'a mut [u16]> {
        match self {
            ReadBuf::U8(_) => None,
            ReadBuf::U16(w) => Some(w),
        }
    }

    pub(crate) fn store(&mut self, index: usize, unit: u16) {
        match self {
            ReadBuf::U8(b) => b[index] = unit as u8,
            ReadBuf::U16(w) => w[index] = unit,
        }
    }
}

impl<'a> From<&'a mut [u8]> for ReadBuf<'a> {
    fn from(b: &'a mut [u8]) -> Self {
        ReadBuf::U8(b)
    }
}

impl<'a> From<&'a mut [u16]> for ReadBuf<'a> {
    fn from(w: &'a mut [u16]) -> Self {
        ReadBuf::U16(w)
    }
}

impl<'a, const N: usize> From<&'a mut [u8; N]> for ReadBuf<'a> {
    fn from(b: &'a mut [u8; N]) -> Self {
        ReadBuf::U8(b)
    }
}

impl<'a, const N: usize> From<&'a mut [u16; N]> for ReadBuf<'a> {
    fn from(w: &'a mut [u16; N]) -> Self {
        ReadBuf::U16(w)
    }
}

/// Identifies an accepted asynchronous transaction, e.g. to [abort] it.
///
/// [abort]: super::Spimss::abort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle(NonZeroU32);

impl Handle {
    pub(crate) fn new(token: NonZeroU32) -> Self {
        Handle(token)
    }

    pub(crate) fn token(self) -> NonZeroU32 {
        self.0
    }

    /// Raw identifier, unique per engine until the counter wraps.
    pub fn id(self) -> u32 {
        self.0.get()
    }
}

/// Outcome of a transaction, delivered exactly once through its [`Callback`].
#[derive(Debug)]
pub struct Completion<'a> {
    /// The handle returned when the transaction was submitted.
    pub handle: Handle,
    /// `Ok` on success, otherwise [`Aborted`], [`ShutDown`] or [`HardwareFault`].
    ///
    /// [`Aborted`]: TransferError::Aborted
    /// [`ShutDown`]: TransferError::ShutDown
    /// [`HardwareFault`]: TransferError::HardwareFault
    pub result: Result<(), TransferError>,
    /// The transaction itself, with its buffers and final progress counters.
    pub transaction: Transaction<'a>,
}

/// Completion notification.
///
/// Invoked synchronously by whichever context detects completion: the
/// submitting call, the interrupt handler, `abort` or `shutdown`. The channel
/// is already unlocked when this runs, so the callback may submit the next
/// transaction right away.
pub trait Callback<'a> {
    /// The transaction finished.
    fn complete(&self, completion: Completion<'a>);
}

impl<'a, F> Callback<'a> for F
where
    F: Fn(Completion<'a>),
{
    fn complete(&self, completion: Completion<'a>) {
        self(completion)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub(crate) unit_bytes: usize,
    pub(crate) role: Role,
    // master only: assert slave select for the duration of the transaction
    pub(crate) select: bool,
}

/// A request to exchange up to `len` frames with a channel.
///
/// At least one of the transmit and receive buffers should be present; a
/// transaction with neither is treated as zero-length and completes at once.
pub struct Transaction<'a> {
    pub(crate) tx: Option<WriteBuf<'a>>,
    pub(crate) rx: Option<ReadBuf<'a>>,
    pub(crate) len: usize,
    bits: Option<u8>,
    role: Option<Role>,
    select: bool,
    callback: Option<&'a (dyn Callback<'a> + Sync)>,
    pub(crate) transmitted: usize,
    pub(crate) received: usize,
    // frames pushed into the transmit FIFO, fill frames of receive-only masters included
    pub(crate) clocked: usize,
    pub(crate) frame: Frame,
}

impl<'a> Default for Transaction<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Transaction<'a> {
    /// A transaction without buffers. It completes immediately.
    pub fn new() -> Self {
        Transaction {
            tx: None,
            rx: None,
            len: 0,
            bits: None,
            role: None,
            select: true,
            callback: None,
            transmitted: 0,
            received: 0,
            clocked: 0,
            frame: Frame {
                unit_bytes: 1,
                role: Role::Master,
                select: true,
            },
        }
    }

    /// Transmit every frame of `tx`, ignoring whatever is shifted in.
    pub fn write<T: Into<WriteBuf<'a>>>(tx: T) -> Self {
        let tx = tx.into();
        Transaction {
            len: tx.len(),
            tx: Some(tx),
            ..Self::new()
        }
    }

    /// Fill `rx` with frames shifted in.
    ///
    /// In the master role the engine clocks the bus with zero frames.
    pub fn read<T: Into<ReadBuf<'a>>>(rx: T) -> Self {
        let rx = rx.into();
        Transaction {
            len: rx.len(),
            rx: Some(rx),
            ..Self::new()
        }
    }

    /// Exchange frames in both directions.
    ///
    /// The length is the shorter of the two buffers; use
    /// [`with_len`](Self::with_len) to shorten it further.
    pub fn transfer<T: Into<WriteBuf<'a>>, U: Into<ReadBuf<'a>>>(tx: T, rx: U) -> Self {
        let tx = tx.into();
        let rx = rx.into();
        Transaction {
            len: tx.len().min(rx.len()),
            tx: Some(tx),
            rx: Some(rx),
            ..Self::new()
        }
    }

    /// Override the number of frames to exchange.
    ///
    /// Must not exceed the length of any buffer present, which is checked on submission.
    pub fn with_len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Override the channel's frame width for this transaction (1 to 16 bits).
    pub fn with_bits(mut self, bits: u8) -> Self {
        self.bits = Some(bits);
        self
    }

    /// Override the channel's role for this transaction.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Leave slave select alone, for callers that manage chip select themselves.
    pub(crate) fn without_slave_select(mut self) -> Self {
        self.select = false;
        self
    }

    /// Register the completion callback.
    pub fn with_callback(mut self, callback: &'a (dyn Callback<'a> + Sync)) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Requested number of frames.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the transaction completes without touching the FIFOs.
    pub fn is_empty(&self) -> bool {
        self.len == 0 || (self.tx.is_none() && self.rx.is_none())
    }

    /// Frames pushed from the transmit buffer so far.
    pub fn transmitted(&self) -> usize {
        self.transmitted
    }

    /// Frames stored into the receive buffer so far.
    pub fn received(&self) -> usize {
        self.received
    }

    /// The transmit buffer, if any.
    pub fn tx(&self) -> Option<&WriteBuf<'a>> {
        self.tx.as_ref()
    }

    /// The receive buffer, if any.
    pub fn rx(&self) -> Option<&ReadBuf<'a>> {
        self.rx.as_ref()
    }

    /// Give the buffers back.
    pub fn into_buffers(self) -> (Option<WriteBuf<'a>>, Option<ReadBuf<'a>>) {
        (self.tx, self.rx)
    }

    /// Checks that don't need the channel configuration.
    pub(crate) fn check_buffers(&self) -> Result<(), TransferError> {
        if let (Some(tx), Some(rx)) = (&self.tx, &self.rx) {
            if tx.is_wide() != rx.is_wide() {
                return Err(TransferError::BadParam);
            }
        }
        let tx_short = self.tx.as_ref().is_some_and(|tx| tx.len() < self.len);
        let rx_short = self.rx.as_ref().is_some_and(|rx| rx.len() < self.len);
        if tx_short || rx_short {
            return Err(TransferError::BadParam);
        }
        Ok(())
    }

    /// Effective settings for this transaction on a channel configured with `config`.
    pub(crate) fn settings(&self, config: &Config) -> Result<Config, TransferError> {
        let mut settings = *config;
        if let Some(bits) = self.bits {
            settings.bits = bits;
        }
        if let Some(role) = self.role {
            settings.role = role;
        }
        settings.validate()?;

        let wide = settings.bits > 8;
        let tx_mismatch = self.tx.as_ref().is_some_and(|tx| tx.is_wide() != wide);
        let rx_mismatch = self.rx.as_ref().is_some_and(|rx| rx.is_wide() != wide);
        if tx_mismatch || rx_mismatch {
            return Err(TransferError::BadParam);
        }
        Ok(settings)
    }

    pub(crate) fn begin(&mut self, settings: &Config) {
        self.transmitted = 0;
        self.received = 0;
        self.clocked = 0;
        self.frame = Frame {
            unit_bytes: if settings.bits > 8 { 2 } else { 1 },
            role: settings.role,
            select: self.select,
        };
    }

    /// Reset the progress counters of a transaction that completes without I/O.
    pub(crate) fn restart(&mut self) {
        self.transmitted = 0;
        self.received = 0;
        self.clocked = 0;
    }

    /// Status flags that terminate this transaction.
    pub(crate) fn fault_mask(&self) -> Status {
        let mut mask = Status::MODE_FAULT | Status::COLLISION;
        if self.rx.is_some() {
            mask |= Status::RX_OVERRUN;
        }
        if self.tx.is_some() {
            mask |= Status::TX_OVERRUN;
            if self.frame.role == Role::Slave {
                mask |= Status::TX_UNDERRUN;
            }
        }
        mask
    }

    pub(crate) fn is_complete(&self) -> bool {
        let tx_done = self.tx.is_none() || self.transmitted == self.len;
        let rx_done = self.rx.is_none() || self.received == self.len;
        tx_done && rx_done
    }

    /// Deliver the outcome, consuming the transaction.
    pub(crate) fn notify(self, handle: Handle, result: Result<(), TransferError>) {
        if let Some(callback) = self.callback {
            callback.complete(Completion {
                handle,
                result,
                transaction: self,
            });
        }
    }
}

impl core::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .field("len", &self.len)
            .field("bits", &self.bits)
            .field("role", &self.role)
            .field("callback", &self.callback.is_some())
            .field("transmitted", &self.transmitted)
            .field("received", &self.received)
            .finish()
    }
}
