//! Shared device context and the interrupt-side acquisition callbacks.
//!
//! Two lanes of control touch the [`DeviceContext`]:
//!
//! - the **main loop** arms a measurement with [`DeviceContext::arm()`],
//!   polls [`DeviceContext::is_finished()`] and streams the table out, and
//! - the **interrupt lane** (ADC and timer handlers) calls
//!   [`DeviceContext::on_sample()`] and [`DeviceContext::on_tick()`].
//!
//! Ownership rules:
//!
//! | Field              | Main loop writes          | Interrupt lane writes |
//! |--------------------|---------------------------|-----------------------|
//! | result table       | while the source is stopped | while running       |
//! | `finished` flag    | cleared by `arm()`        | set                   |
//! | countdown          | set by `arm()`            | decremented           |
//! | config, skip state | set by `arm()`/`halt()`   | skip state            |
//!
//! The finished flag is a single atomic.  The countdown is a 16 bit value
//! held as two independent byte halves, as it would be on an 8 bit target,
//! so the main loop reads it with [`SplitCounter::read_stable()`], which
//! re-reads until two consecutive reads agree.
//!
//! Nothing in the interrupt lane logs.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use critical_section::Mutex;

use crate::personality::{MeasureConfig, Personality};
use crate::table::{ResultTable, TableKind};

/// 16 bit counter stored as two bytes which are written separately.
///
/// A reader racing with the writer can observe the new low byte together
/// with the old high byte.  [`Self::read_stable()`] guards against that.
pub struct SplitCounter {
    lo: AtomicU8,
    hi: AtomicU8,
}

impl SplitCounter {
    pub const fn new(value: u16) -> Self {
        let b = value.to_le_bytes();
        Self {
            lo: AtomicU8::new(b[0]),
            hi: AtomicU8::new(b[1]),
        }
    }

    /// Single-writer store, low byte first.
    pub fn store(&self, value: u16) {
        let b = value.to_le_bytes();
        self.lo.store(b[0], Ordering::Release);
        self.hi.store(b[1], Ordering::Release);
    }

    /// One unsynchronised read.  Only safe to trust from the writing lane.
    pub fn read_raw(&self) -> u16 {
        let lo = self.lo.load(Ordering::Acquire);
        let hi = self.hi.load(Ordering::Acquire);
        u16::from_le_bytes([lo, hi])
    }

    /// Read until two consecutive reads return the same value.
    pub fn read_stable(&self) -> u16 {
        let mut current = self.read_raw();
        loop {
            let previous = current;
            current = self.read_raw();
            if current == previous {
                return current;
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Acquisition {
    config: MeasureConfig,
    /// Samples still to drop before the next one is kept
    skip_left: u16,
    running: bool,
}

/// State shared between the main loop and the acquisition interrupts.
///
/// Designed to live in a `static`:
///
/// ```ignore
/// static CONTEXT: DeviceContext<3072> = DeviceContext::new(&ADC_MCA_TIMED);
/// ```
pub struct DeviceContext<const N: usize> {
    table: ResultTable<N>,
    finished: AtomicBool,
    countdown: SplitCounter,
    acquisition: Mutex<Cell<Acquisition>>,
}

impl<const N: usize> DeviceContext<N> {
    pub const fn new(personality: &Personality) -> Self {
        Self {
            table: personality.new_table(),
            finished: AtomicBool::new(false),
            countdown: SplitCounter::new(0),
            acquisition: Mutex::new(Cell::new(Acquisition {
                config: MeasureConfig {
                    duration: 0,
                    skip_samples: 0,
                },
                skip_left: 0,
                running: false,
            })),
        }
    }

    pub fn table(&self) -> &ResultTable<N> {
        &self.table
    }

    /// Prepare a new measurement: clear the table, load the countdown and
    /// clear the finished flag.
    ///
    /// Main loop only, with the sampling source stopped.
    pub fn arm(&self, config: MeasureConfig) {
        critical_section::with(|cs| {
            self.table.clear();
            self.countdown.store(config.duration);
            self.finished.store(false, Ordering::Release);
            self.acquisition.borrow(cs).set(Acquisition {
                config,
                skip_left: config.skip_samples,
                running: true,
            });
        });
    }

    /// Ignore any further callbacks.  Called after the source was stopped.
    pub fn halt(&self) {
        critical_section::with(|cs| {
            let cell = self.acquisition.borrow(cs);
            let mut acq = cell.get();
            acq.running = false;
            cell.set(acq);
        });
    }

    /// Whether the interrupt lane has completed the measurement.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Configuration of the current (or last) measurement
    pub fn config(&self) -> MeasureConfig {
        critical_section::with(|cs| self.acquisition.borrow(cs).get().config)
    }

    /// Remaining countdown, in timer units
    pub fn remaining(&self) -> u16 {
        self.countdown.read_stable()
    }

    /// Elapsed timer units since the measurement was armed.
    ///
    /// A time series counts every completed element as one full period.
    pub fn elapsed(&self) -> u16 {
        let duration = self.config().duration;
        let in_period = duration.saturating_sub(self.remaining());
        match self.table.kind() {
            TableKind::TimeSeries => {
                let periods = u16::try_from(self.table.cursor()).unwrap_or(u16::MAX);
                periods.saturating_mul(duration).saturating_add(in_period)
            }
            TableKind::Histogram | TableKind::Samples => in_period,
        }
    }

    /// ADC conversion complete callback.
    ///
    /// Interrupt lane.  `value` is the already scaled ADC reading for
    /// histograms and samples.  Time series ignore it and count the event.
    pub fn on_sample(&self, value: u16) {
        critical_section::with(|cs| {
            let cell = self.acquisition.borrow(cs);
            let mut acq = cell.get();
            if !acq.running || self.finished.load(Ordering::Relaxed) {
                return;
            }

            if acq.skip_left > 0 {
                acq.skip_left -= 1;
                cell.set(acq);
                return;
            }
            acq.skip_left = acq.config.skip_samples;
            cell.set(acq);

            match self.table.kind() {
                TableKind::Histogram => {
                    // Out of range readings are dropped
                    self.table.increment_element(value as usize);
                }
                TableKind::TimeSeries => {
                    self.table.increment_current();
                }
                TableKind::Samples => {
                    if !self.table.append(value as u32) || self.table.is_full() {
                        self.finished.store(true, Ordering::Release);
                    }
                }
            }
        });
    }

    /// Timer tick callback.
    ///
    /// Interrupt lane.  Counts the measurement duration down.  A histogram
    /// finishes when it reaches zero.  A time series moves on to the next
    /// element and restarts the countdown, finishing once the table is full.
    pub fn on_tick(&self) {
        critical_section::with(|cs| {
            let acq = self.acquisition.borrow(cs).get();
            if !acq.running
                || acq.config.duration == 0
                || self.finished.load(Ordering::Relaxed)
            {
                return;
            }

            let left = self.countdown.read_raw().saturating_sub(1);
            self.countdown.store(left);
            if left != 0 {
                return;
            }

            match self.table.kind() {
                TableKind::TimeSeries => {
                    if self.table.advance() {
                        self.countdown.store(acq.config.duration);
                    } else {
                        self.finished.store(true, Ordering::Release);
                    }
                }
                TableKind::Histogram | TableKind::Samples => {
                    self.finished.store(true, Ordering::Release);
                }
            }
        });
    }
}
