//! Build-time device variants ("personalities").
//!
//! A personality fixes what the result table means, how wide its elements
//! are and which measurement parameters the host has to send.  Parameters
//! are little endian `u16` values in a fixed order: first the measurement
//! duration (in timer units) if the personality has a timer parameter, then
//! the skip factor (number of ADC samples dropped between kept samples) if
//! it has a skip parameter.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::frame::MAX_PARAM_LENGTH;
use crate::table::{ElementSize, ResultTable, TableKind};
use crate::{Error, Result};

/// Size of the fixed part of the personality info payload
pub const PERSONALITY_INFO_HEADER_LEN: usize = 8;

/// Static capability descriptor of a firmware variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Personality {
    /// Name reported to the host
    pub name: &'static str,
    /// Size of the duration parameter, 0 or 2
    pub timer_param_size: u8,
    /// Size of the skip factor parameter, 0 or 2
    pub skip_param_size: u8,
    /// Timer units per second
    pub units_per_second: u8,
    pub element_size: ElementSize,
    pub kind: TableKind,
}

/// ADC histogram, measurement duration counted by the timer.
pub const ADC_MCA_TIMED: Personality = Personality {
    name: "adc-int-mca-timed",
    timer_param_size: 2,
    skip_param_size: 2,
    units_per_second: 10,
    element_size: ElementSize::Three,
    kind: TableKind::Histogram,
};

/// ADC histogram, conversions triggered by an external pulse.
pub const ADC_MCA: Personality = Personality {
    name: "adc-int-mca",
    timer_param_size: 2,
    skip_param_size: 0,
    units_per_second: 1,
    element_size: ElementSize::Three,
    kind: TableKind::Histogram,
};

/// Event counter, one table element per timer period.
pub const GEIGER_TIME_SERIES: Personality = Personality {
    name: "geiger-time-series",
    timer_param_size: 2,
    skip_param_size: 0,
    units_per_second: 1,
    element_size: ElementSize::Three,
    kind: TableKind::TimeSeries,
};

/// Raw ADC samples until the table is full.
pub const ADC_TIMED_SAMPLING: Personality = Personality {
    name: "adc-int-timed-sampling",
    timer_param_size: 0,
    skip_param_size: 2,
    units_per_second: 10,
    element_size: ElementSize::Two,
    kind: TableKind::Samples,
};

/// Measurement configuration decoded from the host's parameters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MeasureConfig {
    /// Countdown in timer units.  0 if the personality has no timer
    /// parameter, in which case only a full table ends the measurement.
    pub duration: u16,
    /// Samples to drop between two kept samples
    pub skip_samples: u16,
}

impl Personality {
    /// Number of parameter bytes a measurement needs
    pub const fn min_param_size(&self) -> usize {
        self.timer_param_size as usize + self.skip_param_size as usize
    }

    /// Whether an inbound frame may carry `len` parameter bytes.
    pub const fn accepts_param_length(&self, len: usize) -> bool {
        len == 0 || (len >= self.min_param_size() && len < MAX_PARAM_LENGTH)
    }

    /// Decode measurement parameters.
    ///
    /// Extra trailing bytes are ignored so hosts may append data for other
    /// personalities.
    pub fn parse_params(&self, params: &[u8]) -> Result<MeasureConfig> {
        if params.len() < self.min_param_size() {
            return Err(Error::InvalidParams);
        }

        let mut ofs = 0;
        let mut config = MeasureConfig::default();

        if self.timer_param_size == 2 {
            config.duration = u16::from_le_bytes([params[0], params[1]]);
            // A zero countdown would wrap in the timer interrupt
            if config.duration == 0 {
                return Err(Error::InvalidParams);
            }
            ofs += 2;
        }

        if self.skip_param_size == 2 {
            config.skip_samples = u16::from_le_bytes([params[ofs], params[ofs + 1]]);
        }

        Ok(config)
    }

    /// Create an empty result table matching this personality.
    pub const fn new_table<const N: usize>(&self) -> ResultTable<N> {
        ResultTable::new(self.element_size, self.kind)
    }

    /// Fixed part of the personality info payload.  The name follows it.
    ///
    /// Layout: table size in bytes (u32 LE), timer parameter size, skip
    /// parameter size, units per second, element size in bytes.
    pub fn info_header(&self, table_bytes: usize) -> [u8; PERSONALITY_INFO_HEADER_LEN] {
        let size = (table_bytes as u32).to_le_bytes();
        [
            size[0],
            size[1],
            size[2],
            size[3],
            self.timer_param_size,
            self.skip_param_size,
            self.units_per_second,
            self.element_size as u8,
        ]
    }
}
