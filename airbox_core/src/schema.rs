//! Field schema: the single source of truth for every channel a box reports.
//!
//! The order of [`Channel::ALL`] is the order of the fields on the wire.

use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// Static definition of one physical quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSpec {
    pub name: &'static str,
    pub unit: &'static str,
    pub lo: f64,
    pub hi: f64,
    /// Multiplier applied before the integer cast (×100 = two decimals)
    pub scale: f64,
    /// i16 on the wire when set, u16 otherwise
    pub signed: bool,
}

impl ChannelSpec {
    /// Clips a value into `[lo, hi]`.
    pub fn clip(&self, value: f64) -> f64 {
        value.clamp(self.lo, self.hi)
    }
}

pub const CHANNEL_COUNT: usize = 11;

/// Channel table, indexed by `Channel as usize`.
pub const FIELDS: [ChannelSpec; CHANNEL_COUNT] = [
    ChannelSpec { name: "serial", unit: "-", lo: 0.0, hi: 65535.0, scale: 1.0, signed: false },
    ChannelSpec { name: "temp_c", unit: "°C", lo: -40.0, hi: 85.0, scale: 100.0, signed: true },
    ChannelSpec { name: "rh_pct", unit: "%RH", lo: 0.0, hi: 100.0, scale: 100.0, signed: false },
    ChannelSpec { name: "co2_ppm", unit: "ppm", lo: 400.0, hi: 10000.0, scale: 1.0, signed: false },
    ChannelSpec { name: "o2_pct", unit: "%vol", lo: 0.0, hi: 25.0, scale: 100.0, signed: false },
    ChannelSpec { name: "co_ppm", unit: "ppm", lo: 0.0, hi: 500.0, scale: 10.0, signed: false },
    ChannelSpec { name: "pm25_ugm3", unit: "µg/m³", lo: 0.0, hi: 1000.0, scale: 1.0, signed: false },
    ChannelSpec { name: "noise_dba", unit: "dBA", lo: 30.0, hi: 130.0, scale: 10.0, signed: false },
    ChannelSpec { name: "no2_ppb", unit: "ppb", lo: 5.0, hi: 80.0, scale: 1.0, signed: false },
    // Sensor reads up to 88 klx; the frame saturates at 65535.
    ChannelSpec { name: "lux", unit: "lux", lo: 0.0, hi: 88000.0, scale: 1.0, signed: false },
    ChannelSpec { name: "bat_mv", unit: "mV", lo: 3200.0, hi: 4300.0, scale: 1.0, signed: false },
];

/// One physical quantity tracked by a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Serial,
    Temperature,
    Humidity,
    Co2,
    O2,
    Co,
    Pm25,
    Noise,
    No2,
    Illuminance,
    Battery,
}

impl Channel {
    /// All channels in wire order.
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Serial,
        Channel::Temperature,
        Channel::Humidity,
        Channel::Co2,
        Channel::O2,
        Channel::Co,
        Channel::Pm25,
        Channel::Noise,
        Channel::No2,
        Channel::Illuminance,
        Channel::Battery,
    ];

    /// The channels evolved by the environmental model (no serial, no battery).
    pub const ENVIRONMENTAL: [Channel; 9] = [
        Channel::Temperature,
        Channel::Humidity,
        Channel::Co2,
        Channel::O2,
        Channel::Co,
        Channel::Pm25,
        Channel::Noise,
        Channel::No2,
        Channel::Illuminance,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn spec(self) -> &'static ChannelSpec {
        &FIELDS[self.index()]
    }

    /// Maps a declared sensor type to the channel that feeds it.
    pub fn for_sensor_type(sensor_type: &str) -> Option<Channel> {
        match sensor_type {
            "temperature" => Some(Channel::Temperature),
            "humidity" => Some(Channel::Humidity),
            "co2" => Some(Channel::Co2),
            "o2" => Some(Channel::O2),
            "co" => Some(Channel::Co),
            "pm2_5" => Some(Channel::Pm25),
            "sound_level" => Some(Channel::Noise),
            "no2" => Some(Channel::No2),
            "light" => Some(Channel::Illuminance),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.spec().name)
    }
}

/// Dense per-channel storage of floats.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelMap([f64; CHANNEL_COUNT]);

impl ChannelMap {
    pub fn zeros() -> Self {
        Self([0.0; CHANNEL_COUNT])
    }

    /// Adds `other * weight` channel by channel.
    pub fn add_scaled(&mut self, other: &ChannelMap, weight: f64) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a += b * weight;
        }
    }
}

impl Index<Channel> for ChannelMap {
    type Output = f64;

    fn index(&self, channel: Channel) -> &f64 {
        &self.0[channel.index()]
    }
}

impl IndexMut<Channel> for ChannelMap {
    fn index_mut(&mut self, channel: Channel) -> &mut f64 {
        &mut self.0[channel.index()]
    }
}

/// One full box read in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub serial: u16,
    pub temp_c: f64,
    pub rh_pct: f64,
    pub co2_ppm: f64,
    pub o2_pct: f64,
    pub co_ppm: f64,
    pub pm25_ugm3: f64,
    pub noise_dba: f64,
    pub no2_ppb: f64,
    pub lux: f64,
    pub bat_mv: f64,
}

impl Reading {
    /// Returns the value of one channel.
    pub fn get(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Serial => f64::from(self.serial),
            Channel::Temperature => self.temp_c,
            Channel::Humidity => self.rh_pct,
            Channel::Co2 => self.co2_ppm,
            Channel::O2 => self.o2_pct,
            Channel::Co => self.co_ppm,
            Channel::Pm25 => self.pm25_ugm3,
            Channel::Noise => self.noise_dba,
            Channel::No2 => self.no2_ppb,
            Channel::Illuminance => self.lux,
            Channel::Battery => self.bat_mv,
        }
    }

    /// Builds a reading from a serial, environmental levels and a battery voltage.
    pub fn from_levels(serial: u16, levels: &ChannelMap, bat_mv: f64) -> Self {
        Self {
            serial,
            temp_c: levels[Channel::Temperature],
            rh_pct: levels[Channel::Humidity],
            co2_ppm: levels[Channel::Co2],
            o2_pct: levels[Channel::O2],
            co_ppm: levels[Channel::Co],
            pm25_ugm3: levels[Channel::Pm25],
            noise_dba: levels[Channel::Noise],
            no2_ppb: levels[Channel::No2],
            lux: levels[Channel::Illuminance],
            bat_mv,
        }
    }

    /// Builds a reading from per-channel values in wire order.
    ///
    /// The serial is rounded and clamped into `u16`.
    pub fn from_values(values: &ChannelMap) -> Self {
        let serial = values[Channel::Serial].round().clamp(0.0, 65535.0) as u16;
        Self::from_levels(serial, values, values[Channel::Battery])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_channel_order() {
        assert_eq!(Channel::Serial.spec().name, "serial");
        assert_eq!(Channel::Temperature.spec().name, "temp_c");
        assert_eq!(Channel::Illuminance.spec().name, "lux");
        assert_eq!(Channel::Battery.spec().name, "bat_mv");
        for (i, channel) in Channel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
    }

    #[test]
    fn test_only_temperature_is_signed() {
        let signed: Vec<_> = Channel::ALL.iter().filter(|c| c.spec().signed).collect();
        assert_eq!(signed, vec![&Channel::Temperature]);
    }

    #[test]
    fn test_sensor_type_mapping() {
        assert_eq!(Channel::for_sensor_type("pm2_5"), Some(Channel::Pm25));
        assert_eq!(Channel::for_sensor_type("sound_level"), Some(Channel::Noise));
        assert_eq!(Channel::for_sensor_type("light"), Some(Channel::Illuminance));
        assert_eq!(Channel::for_sensor_type("motion"), None);
    }

    #[test]
    fn test_reading_get_round_trips_levels() {
        let mut levels = ChannelMap::zeros();
        for (i, channel) in Channel::ENVIRONMENTAL.iter().enumerate() {
            levels[*channel] = i as f64 + 0.5;
        }
        let reading = Reading::from_levels(77, &levels, 4100.0);
        for channel in Channel::ENVIRONMENTAL {
            assert_eq!(reading.get(channel), levels[channel]);
        }
        assert_eq!(reading.get(Channel::Serial), 77.0);
        assert_eq!(reading.get(Channel::Battery), 4100.0);
    }
}
