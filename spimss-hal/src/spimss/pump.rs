//! The FIFO pump
//!
//! One pass moves as many frames as the FIFOs allow: first it drains the
//! receive FIFO into the receive buffer, then it tops up the transmit FIFO,
//! and finally it reprograms both notification levels for the next pass.
//! Receive is always serviced before transmit so the frames pushed in a pass
//! find room on the way back.

use super::{Role, Transaction};
use crate::regs::{FifoSide, Registers};

/// Result of a pump pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Progress {
    /// More interrupts are needed.
    Pending,
    /// Every active side has reached the transaction length.
    Complete,
}

/// A notification level that never triggers.
pub(crate) const fn disabled_level<R: Registers>() -> usize {
    R::FIFO_DEPTH + 1
}

/// Run one drain/fill pass for `txn`.
///
/// `txn` must have been set up with [`Transaction::begin`] and the FIFO must
/// hold at least one frame.
pub(crate) fn pump<R: Registers>(regs: &mut R, txn: &mut Transaction<'_>) -> Progress {
    let unit = txn.frame.unit_bytes;
    let depth = R::FIFO_DEPTH / unit;

    if let Some(rx) = txn.rx.as_mut() {
        loop {
            let remaining = txn.len - txn.received;
            let available = (regs.receive_fifo_occupied_count() / unit).min(remaining);
            if available == 0 {
                break;
            }
            for _ in 0..available {
                rx.store(txn.received, regs.pop_unit());
                txn.received += 1;
            }
        }

        let remaining = txn.len - txn.received;
        let level = if remaining > 0 {
            (remaining.min(depth) - 1) * unit
        } else {
            disabled_level::<R>()
        };
        regs.set_notify_threshold(FifoSide::Receive, level);
    }

    // A master has to clock the bus to receive anything.
    let master = txn.frame.role == Role::Master;
    let clocks = txn.tx.is_some() || (txn.rx.is_some() && master);
    if clocks {
        let guarded = txn.rx.is_some() && master;
        let in_flight = txn.clocked.saturating_sub(txn.received);
        let window = if guarded {
            depth.saturating_sub(in_flight)
        } else {
            depth
        };

        let room = regs.transmit_fifo_free_count() / unit;
        let count = (txn.len - txn.clocked).min(window).min(room);
        for _ in 0..count {
            let frame = match &txn.tx {
                Some(tx) => {
                    let frame = tx.unit(txn.transmitted);
                    txn.transmitted += 1;
                    frame
                }
                None => 0,
            };
            regs.push_unit(frame);
            txn.clocked += 1;
        }

        let remaining = txn.len - txn.clocked;
        let window = if guarded { window - count } else { depth };
        let level = if remaining == 0 || window == 0 {
            // nothing left to push, or the receive side has to catch up first
            disabled_level::<R>()
        } else {
            remaining.min(window) * unit
        };
        regs.set_notify_threshold(FifoSide::Transmit, level);
    }

    if txn.is_complete() {
        Progress::Complete
    } else {
        Progress::Pending
    }
}

/// Check that every frame a master pushed has left the transmit FIFO.
///
/// A slave never waits: the remote master decides when the FIFO drains.
pub(crate) fn flushed<R: Registers>(regs: &mut R, txn: &Transaction<'_>) -> bool {
    txn.frame.role == Role::Slave || regs.transmit_fifo_free_count() >= R::FIFO_DEPTH
}

/// Only notify once the transmit FIFO is empty.
pub(crate) fn await_flush<R: Registers>(regs: &mut R) {
    regs.set_notify_threshold(FifoSide::Receive, disabled_level::<R>());
    regs.set_notify_threshold(FifoSide::Transmit, R::FIFO_DEPTH);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{regs::Status, sim::Loopback, spimss::Config};

    fn start<const D: usize>(txn: &mut Transaction<'_>) -> Loopback<D> {
        let settings = txn.settings(&Config::default()).unwrap();
        let mut sim = Loopback::new();
        sim.configure(&settings);
        sim.enable(true);
        txn.begin(&settings);
        sim
    }

    fn run<const D: usize>(sim: &mut Loopback<D>, txn: &mut Transaction<'_>) -> usize {
        let depth = D / txn.frame.unit_bytes;
        for pass in 1..=1000 {
            let progress = pump(sim, txn);
            assert!(txn.transmitted <= txn.len);
            assert!(txn.received <= txn.len);
            assert!(txn.clocked - txn.received <= depth || txn.rx.is_none());
            if progress == Progress::Complete {
                return pass;
            }
        }
        panic!("pump did not complete");
    }

    #[test]
    fn duplex_bytes_loop_back() {
        let tx: [u8; 20] = core::array::from_fn(|i| i as u8 * 3);
        let mut rx = [0u8; 20];
        let mut txn = Transaction::transfer(&tx, &mut rx);
        let mut sim = start::<8>(&mut txn);
        run(&mut sim, &mut txn);
        assert_eq!(txn.transmitted(), 20);
        assert_eq!(txn.received(), 20);
        assert_eq!(txn.rx().and_then(|rx| rx.as_bytes()), Some(&tx[..]));
        assert!(!sim.status().contains(Status::RX_OVERRUN));
    }

    #[test]
    fn wide_frames_on_odd_depth() {
        let tx: [u16; 5] = [0x0123, 0x4567, 0x89ab, 0xcdef, 0xffff];
        let mut rx = [0u16; 5];
        let mut txn = Transaction::transfer(&tx, &mut rx).with_bits(16);
        // 5 bytes hold two 16-bit frames
        let mut sim = start::<5>(&mut txn);
        pump(&mut sim, &mut txn);
        assert_eq!(sim.pushed(), 2);
        run(&mut sim, &mut txn);
        assert_eq!(txn.rx().and_then(|rx| rx.as_words()), Some(&tx[..]));
    }

    #[test]
    fn receive_only_master_clocks_fill_frames() {
        let mut rx = [0xffu8; 6];
        let mut txn = Transaction::read(&mut rx);
        let mut sim = start::<4>(&mut txn);
        run(&mut sim, &mut txn);
        assert_eq!(txn.transmitted(), 0);
        assert_eq!(txn.received(), 6);
        assert_eq!(sim.pushed(), 6);
        assert_eq!(txn.rx().and_then(|rx| rx.as_bytes()), Some(&[0u8; 6][..]));
    }

    #[test]
    fn receive_only_slave_never_pushes() {
        let mut rx = [0u8; 3];
        let mut txn = Transaction::read(&mut rx).with_role(Role::Slave);
        let mut sim = start::<4>(&mut txn);
        assert_eq!(pump(&mut sim, &mut txn), Progress::Pending);
        assert_eq!(sim.pushed(), 0);
        sim.feed(&[7, 8, 9]);
        assert_eq!(pump(&mut sim, &mut txn), Progress::Complete);
        assert_eq!(txn.rx().and_then(|rx| rx.as_bytes()), Some(&[7u8, 8, 9][..]));
    }

    #[test]
    fn in_flight_frames_never_exceed_depth() {
        let tx = [0x5au8; 12];
        let mut rx = [0u8; 12];
        let mut txn = Transaction::transfer(&tx, &mut rx);
        let mut sim = start::<4>(&mut txn);

        sim.hold(true);
        pump(&mut sim, &mut txn);
        assert_eq!(txn.clocked, 4);
        // the transmit FIFO is full and nothing came back yet
        pump(&mut sim, &mut txn);
        assert_eq!(txn.clocked, 4);
        assert_eq!(sim.transmit_level(), disabled_level::<Loopback<4>>());

        sim.hold(false);
        run(&mut sim, &mut txn);
        assert!(!sim.status().contains(Status::RX_OVERRUN));
        assert_eq!(txn.rx().and_then(|rx| rx.as_bytes()), Some(&tx[..]));
    }

    #[test]
    fn thresholds_follow_remaining_frames() {
        let tx = [1u8; 3];
        let mut rx = [0u8; 3];
        let mut txn = Transaction::transfer(&tx, &mut rx);
        let mut sim = start::<8>(&mut txn);
        sim.hold(true);
        pump(&mut sim, &mut txn);
        // notify once all three frames are back
        assert_eq!(sim.receive_level(), 2);
        assert_eq!(sim.transmit_level(), disabled_level::<Loopback<8>>());
    }

    #[test]
    fn transmit_only_completes_on_count() {
        let tx = [9u8; 3];
        let mut txn = Transaction::write(&tx);
        let mut sim = start::<8>(&mut txn);
        sim.hold(true);
        assert_eq!(pump(&mut sim, &mut txn), Progress::Complete);
        assert!(!flushed(&mut sim, &txn));
        sim.hold(false);
        assert!(flushed(&mut sim, &txn));
    }
}
