//! The "ENVIRONMENT" Engine - per-box continuous-state air-quality model.
//!
//! Every call to [`EnvironmentSimulator::advance`] moves all channels from their
//! previous value toward a profile- and time-of-day-dependent target:
//!
//! 1. Target = baseline + event deltas + Gaussian noise
//! 2. Step cap: the target may not be further than `max_step` from the previous value
//! 3. One-pole low-pass toward the capped target
//! 4. Clip to the channel's physical bounds
//!
//! Battery voltage is integrated separately over the real elapsed time with a
//! drain rate fixed per local calendar day.
//!
//! The model is a phenomenological approximation, fully reproducible from
//! `(profile, period, seed, serial)`.

use crate::events::{apply_events, maybe_start_events, Event};
use crate::schema::{Channel, ChannelMap, Reading};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Outdoor CO₂ baseline (ppm).
pub const OUTDOOR_CO2_PPM: f64 = 420.0;

/// Household risk profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Healthy,
    /// Some periods unhealthy
    #[default]
    Intermittent,
    /// Persistently under-heated, damp and badly ventilated
    Chronic,
}

impl Profile {
    pub fn name(self) -> &'static str {
        match self {
            Profile::Healthy => "healthy",
            Profile::Intermittent => "intermittent",
            Profile::Chronic => "chronic",
        }
    }

    /// Intermittent and chronic homes get crowded-night events.
    pub fn is_at_risk(self) -> bool {
        !matches!(self, Profile::Healthy)
    }

    fn occupancy_bias(self) -> f64 {
        match self {
            Profile::Healthy => -0.1,
            Profile::Intermittent => 0.0,
            Profile::Chronic => 0.15,
        }
    }

    fn baseline(self) -> Baseline {
        match self {
            Profile::Healthy => Baseline { temp_night: 18.5, temp_day: 20.0, rh: 50.0, vent_sink: 0.006 },
            Profile::Intermittent => Baseline { temp_night: 12.5, temp_day: 17.0, rh: 58.0, vent_sink: 0.004 },
            Profile::Chronic => Baseline { temp_night: 11.5, temp_day: 15.0, rh: 70.0, vent_sink: 0.002 },
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "healthy" => Ok(Profile::Healthy),
            "intermittent" => Ok(Profile::Intermittent),
            "chronic" => Ok(Profile::Chronic),
            _ => Err(format!("Unknown profile: {}", s)),
        }
    }
}

struct Baseline {
    temp_night: f64,
    temp_day: f64,
    rh: f64,
    /// Fraction of the CO₂ excess removed per minute
    vent_sink: f64,
}

/// Maximum change per tick, sized for 5–10 minute sampling.
pub fn max_step(channel: Channel) -> f64 {
    match channel {
        Channel::Temperature => 0.6,
        Channel::Humidity => 3.0,
        Channel::Co2 => 130.0,
        Channel::O2 => 0.08,
        Channel::Co => 10.0,
        Channel::Pm25 => 25.0,
        Channel::Noise => 7.0,
        Channel::No2 => 9.0,
        Channel::Illuminance => 2000.0,
        Channel::Battery => 5.0,
        Channel::Serial => 0.0,
    }
}

fn smoothing(channel: Channel) -> f64 {
    match channel {
        Channel::Co2 | Channel::No2 | Channel::Co => 0.45,
        Channel::Pm25 => 0.5,
        Channel::Noise => 0.35,
        _ => 0.28,
    }
}

/// One-pole low-pass filter (alpha in (0, 1]).
fn low_pass(prev: f64, target: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * prev + alpha * target
}

fn gauss<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    mean + std_dev * z
}

/// Approximate daylight length in hours; peaks around day-of-year 172.
pub fn daylength_hours(day_of_year: u32) -> f64 {
    12.0 + 4.0 * (2.0 * PI * (f64::from(day_of_year) - 80.0) / 365.0).sin()
}

/// Sunrise and sunset as decimal local hours, centred on 12:30.
pub fn sunrise_sunset(day_of_year: u32) -> (f64, f64) {
    let length = daylength_hours(day_of_year);
    let center = 12.5;
    ((center - length / 2.0).max(0.0), (center + length / 2.0).min(24.0))
}

/// 0..1 "people at home" factor. Weekends are busier; profile shifts the curve.
pub fn occupancy_factor<R: Rng>(hour: f64, weekend: bool, profile: Profile, rng: &mut R) -> f64 {
    let mut base = if weekend {
        let evening = if hour >= 20.0 || hour < 8.0 { 0.25 } else { 0.0 };
        let midday = if (10.0..=16.0).contains(&hour) { 0.1 } else { 0.0 };
        0.65 + evening + midday
    } else if hour >= 20.0 || hour < 7.0 {
        0.75
    } else if (9.0..17.0).contains(&hour) {
        0.4
    } else {
        0.55
    };
    base += profile.occupancy_bias();
    base += rng.gen_range(-0.05..0.05);
    base.clamp(0.0, 1.0)
}

/// Configuration for one box simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub profile: Profile,

    /// Nominal tick period in minutes (ages events, scales dynamics)
    pub period_minutes: f64,

    /// Battery voltage at creation (mV)
    pub start_battery_mv: f64,

    /// Reported serial; drawn from the RNG when absent
    pub serial: Option<u16>,

    pub seed: u64,

    /// Mean daily battery drop (mV/day)
    pub daily_battery_drop_mv: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            profile: Profile::Intermittent,
            period_minutes: 5.0,
            start_battery_mv: 4300.0,
            serial: None,
            seed: 0,
            daily_battery_drop_mv: 100.0,
        }
    }
}

/// Battery with a drain rate that changes only at local midnight.
#[derive(Debug, Clone)]
struct BatteryModel {
    mv: f64,
    daily_mean: f64,
    day: Option<NaiveDate>,
    day_rate: f64,
}

impl BatteryModel {
    fn ensure_day_rate<R: Rng>(&mut self, rng: &mut R, day: NaiveDate) {
        if self.day == Some(day) {
            return;
        }
        // N(mean, 10 mV) clipped to [0.7, 1.3] × mean
        let jitter = gauss(rng, 0.0, 10.0);
        self.day_rate = if self.daily_mean > 0.0 {
            ((self.daily_mean + jitter) / self.daily_mean).clamp(0.7, 1.3) * self.daily_mean
        } else {
            0.0
        };
        self.day = Some(day);
    }

    fn drain(&mut self, minutes: f64) {
        let floor = Channel::Battery.spec().lo;
        self.mv = (self.mv - self.day_rate / 1440.0 * minutes).max(floor);
    }

    /// Integrates the drain over `minutes` starting at `from`, switching rate at each midnight.
    fn advance<R: Rng>(&mut self, rng: &mut R, from: NaiveDateTime, minutes: f64) {
        let mut t = from;
        let mut remaining = minutes;
        while remaining > 0.0 {
            self.ensure_day_rate(rng, t.date());
            let Some(next_day) = t.date().succ_opt() else {
                self.drain(remaining);
                return;
            };
            let midnight = next_day.and_time(NaiveTime::MIN);
            let to_midnight = (midnight - t).num_microseconds().unwrap_or(i64::MAX) as f64 / 60e6;
            if remaining <= to_midnight {
                self.drain(remaining);
                return;
            }
            self.drain(to_midnight);
            remaining -= to_midnight;
            t = midnight;
        }
    }
}

/// Continuous-state model of one box.
#[derive(Debug, Clone)]
pub struct EnvironmentSimulator {
    config: SimulatorConfig,
    rng: ChaCha8Rng,
    serial: u16,
    levels: ChannelMap,
    battery: BatteryModel,
    events: Vec<Event>,
    last_tick: Option<NaiveDateTime>,
}

impl EnvironmentSimulator {
    /// Creates a simulator with its initial state drawn from the seeded RNG.
    pub fn new(config: SimulatorConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let serial = match config.serial {
            Some(serial) => serial,
            None => rng.gen_range(0..=u16::MAX),
        };

        let mut levels = ChannelMap::zeros();
        levels[Channel::Temperature] = rng.gen_range(14.0..19.0);
        levels[Channel::Humidity] = rng.gen_range(50.0..65.0);
        levels[Channel::Co2] = rng.gen_range(500.0..900.0);
        levels[Channel::O2] = 20.9;
        levels[Channel::Co] = rng.gen_range(0.0..2.0);
        levels[Channel::Pm25] = rng.gen_range(5.0..15.0);
        levels[Channel::Noise] = rng.gen_range(35.0..55.0);
        levels[Channel::No2] = rng.gen_range(8.0..24.0);
        levels[Channel::Illuminance] = rng.gen_range(50.0..500.0);

        let battery = BatteryModel {
            mv: config.start_battery_mv,
            daily_mean: config.daily_battery_drop_mv,
            day: None,
            day_rate: 0.0,
        };

        Self {
            config,
            rng,
            serial,
            levels,
            battery,
            events: Vec::new(),
            last_tick: None,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn profile(&self) -> Profile {
        self.config.profile
    }

    pub fn serial(&self) -> u16 {
        self.serial
    }

    /// Unrounded battery voltage.
    pub fn battery_mv(&self) -> f64 {
        self.battery.mv
    }

    /// Drain rate (mV/day) of the day the battery was last integrated over.
    pub fn current_day_rate(&self) -> Option<f64> {
        self.battery.day.map(|_| self.battery.day_rate)
    }

    pub fn active_events(&self) -> &[Event] {
        &self.events
    }

    pub fn last_tick(&self) -> Option<NaiveDateTime> {
        self.last_tick
    }

    /// Generates one read at `at`, interpreted in its own local wall-clock.
    pub fn advance<Tz: TimeZone>(&mut self, at: &DateTime<Tz>) -> Reading {
        self.advance_local(at.naive_local())
    }

    /// Generates one read at a local wall-clock time.
    ///
    /// Timestamps should be non-decreasing; a step backwards counts as zero elapsed time.
    pub fn advance_local(&mut self, at: NaiveDateTime) -> Reading {
        let hour = f64::from(at.hour()) + f64::from(at.minute()) / 60.0;
        let weekend = at.weekday().num_days_from_monday() >= 5;
        let profile = self.config.profile;
        let period = self.config.period_minutes;

        // Battery continuity across the elapsed minutes
        if let Some(last) = self.last_tick {
            let elapsed = (at - last).num_milliseconds() as f64 / 60_000.0;
            if elapsed > 0.0 {
                self.battery.advance(&mut self.rng, last, elapsed);
            }
        }
        self.last_tick = Some(self.last_tick.map_or(at, |last| last.max(at)));

        // Daylight & indoor light
        let (sunrise, sunset) = sunrise_sunset(at.ordinal());
        let is_day = sunrise <= hour && hour < sunset;
        let day_lux = if (9.0..17.0).contains(&hour) { 800.0 } else { 400.0 };
        let night_lux = if hour >= 22.0 || hour < 6.0 { 40.0 } else { 120.0 };
        let lux_target = if is_day { day_lux } else { night_lux };

        let occupancy = occupancy_factor(hour, weekend, profile, &mut self.rng);
        maybe_start_events(&mut self.rng, &mut self.events, hour, occupancy, profile);

        let baseline = profile.baseline();
        let mut temp_target = if (9.0..18.0).contains(&hour) {
            baseline.temp_day
        } else {
            baseline.temp_night
        };
        temp_target += 0.8 * ((hour - 16.0) * PI / 12.0).sin(); // afternoon bump
        let rh_target = baseline.rh + 6.0 * ((hour - 5.0) * PI / 12.0).sin();

        // CO₂ generation (ppm/min) proportional to occupancy
        let mut co2_gen = 1.8 + 1.2 * occupancy;
        if profile == Profile::Chronic {
            co2_gen *= 1.4;
        }
        if weekend {
            co2_gen *= 1.15;
        }

        let effects = apply_events(&mut self.events, period);
        let ev = effects.deltas;

        // Light
        let target = (lux_target + gauss(&mut self.rng, 0.0, 60.0) + ev[Channel::Illuminance]).max(0.0);
        self.relax(Channel::Illuminance, target);

        // Temperature
        let target = temp_target + ev[Channel::Temperature] + gauss(&mut self.rng, 0.0, 0.12);
        self.relax(Channel::Temperature, target);

        // Humidity: base + occupancy moisture + events - drying while the window is open
        let rh_vent = if effects.venting { -10.0 } else { 0.0 };
        let target = rh_target + 2.5 * occupancy + rh_vent + ev[Channel::Humidity]
            + gauss(&mut self.rng, 0.0, 0.9);
        self.relax(Channel::Humidity, target);

        // CO₂: first order with ventilation sink
        let dt = period.max(1.0);
        let co2 = self.levels[Channel::Co2];
        let sink = baseline.vent_sink + if effects.venting { 0.02 } else { 0.0 };
        let target = co2 + dt * (co2_gen + ev[Channel::Co2]) - dt * sink * (co2 - OUTDOOR_CO2_PPM)
            + gauss(&mut self.rng, 0.0, 15.0);
        self.relax(Channel::Co2, target);

        // O₂ inverse to CO₂
        let o2 = 20.9 - (self.levels[Channel::Co2] - OUTDOOR_CO2_PPM) / 20000.0
            + self.rng.gen_range(-0.02..0.02);
        self.levels[Channel::O2] = Channel::O2.spec().clip(o2);

        // Particulates and gases decay toward zero between events
        let pm = self.levels[Channel::Pm25];
        let target = pm * (-dt / 80.0).exp() + ev[Channel::Pm25] + gauss(&mut self.rng, 0.0, 2.0);
        self.relax(Channel::Pm25, target);

        let no2 = self.levels[Channel::No2];
        let target = no2 * (-dt / 120.0).exp() + ev[Channel::No2] + gauss(&mut self.rng, 0.0, 1.0);
        self.relax(Channel::No2, target);

        // CO: continuous low background emission
        let co = self.levels[Channel::Co];
        let target = co * (-dt / 70.0).exp() + ev[Channel::Co] + gauss(&mut self.rng, 0.05, 0.08).max(0.0);
        self.relax(Channel::Co, target);

        let base_noise = if hour >= 23.0 || hour < 6.0 { 38.0 } else { 46.0 + 6.0 * occupancy };
        let target = base_noise + ev[Channel::Noise] + gauss(&mut self.rng, 0.0, 1.2).max(0.0);
        self.relax(Channel::Noise, target);

        let battery = (Channel::Battery.spec().clip(self.battery.mv) * 10.0).round() / 10.0;
        Reading::from_levels(self.serial, &self.levels, battery)
    }

    /// Step cap, low-pass and clip for one channel.
    fn relax(&mut self, channel: Channel, target: f64) {
        let prev = self.levels[channel];
        let cap = max_step(channel);
        let capped = target.clamp(prev - cap, prev + cap);
        let next = low_pass(prev, capped, smoothing(channel));
        self.levels[channel] = channel.spec().clip(next);
    }

    /// Generates consecutive reads over a window starting at `start`.
    pub fn generate_window<Tz: TimeZone>(&mut self, start: DateTime<Tz>, hours: f64) -> Vec<(DateTime<Tz>, Reading)> {
        let steps = (hours * 60.0 / self.config.period_minutes).round().max(0.0) as usize;
        let step = chrono::Duration::milliseconds((self.config.period_minutes * 60_000.0).round() as i64);
        let mut t = start;
        let mut out = Vec::with_capacity(steps);
        for _ in 0..steps {
            let reading = self.advance(&t);
            out.push((t.clone(), reading));
            t = t + step;
        }
        out
    }
}
