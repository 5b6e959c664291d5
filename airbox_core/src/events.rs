//! Transient household events (cooking, showering, airing, ...).
//!
//! Each event perturbs one or more channels with a triangular envelope: zero
//! when it starts, full magnitude at its temporal midpoint, zero again when it
//! expires.

use crate::schema::{Channel, ChannelMap};
use crate::simulator::Profile;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Kind of household event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CookSmall,
    CookBig,
    Shower,
    /// Window open
    Vent,
    /// Outdoor traffic/dust leaking in
    Infiltration,
    /// Overcrowded sleeping room
    CrowdedNight,
}

impl EventKind {
    /// Per-channel delta at full weight.
    pub fn magnitudes(self) -> ChannelMap {
        let mut m = ChannelMap::zeros();
        match self {
            EventKind::CookSmall => {
                m[Channel::Pm25] = 60.0;
                m[Channel::No2] = 12.0;
                m[Channel::Co] = 2.5;
                m[Channel::Co2] = 120.0;
                m[Channel::Noise] = 4.0;
                m[Channel::Temperature] = 0.2;
            }
            EventKind::CookBig => {
                m[Channel::Pm25] = 140.0;
                m[Channel::No2] = 30.0;
                m[Channel::Co] = 6.0;
                m[Channel::Co2] = 280.0;
                m[Channel::Noise] = 7.0;
                m[Channel::Temperature] = 0.4;
            }
            EventKind::Shower => {
                m[Channel::Humidity] = 20.0;
            }
            EventKind::Vent => {
                m[Channel::Co2] = -260.0;
                m[Channel::Humidity] = -9.0;
                m[Channel::Temperature] = -0.7;
            }
            EventKind::Infiltration => {
                m[Channel::Pm25] = 25.0;
                m[Channel::No2] = 10.0;
                m[Channel::Noise] = 3.0;
            }
            EventKind::CrowdedNight => {
                m[Channel::Co2] = 340.0;
                m[Channel::Humidity] = 6.0;
            }
        }
        m
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::CookSmall => "cook_small",
            EventKind::CookBig => "cook_big",
            EventKind::Shower => "shower",
            EventKind::Vent => "vent",
            EventKind::Infiltration => "infiltration",
            EventKind::CrowdedNight => "crowded_night",
        }
    }
}

/// An active event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub remaining_minutes: f64,
    pub total_duration_minutes: f64,
}

impl Event {
    pub fn new(kind: EventKind, duration_minutes: f64) -> Self {
        Self {
            kind,
            remaining_minutes: duration_minutes,
            total_duration_minutes: duration_minutes,
        }
    }

    /// Triangular envelope in `[0, 1]`.
    pub fn weight(&self) -> f64 {
        if self.total_duration_minutes <= 0.0 {
            return 0.0;
        }
        let progress = (self.remaining_minutes / self.total_duration_minutes).min(1.0);
        (1.0 - (0.5 - progress).abs() * 2.0).max(0.0)
    }

    /// Current contribution of this event to every channel.
    pub fn contribution(&self) -> ChannelMap {
        let mut delta = ChannelMap::zeros();
        delta.add_scaled(&self.kind.magnitudes(), self.weight());
        delta
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_minutes <= 0.0
    }
}

/// Summed event effect for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventEffects {
    pub deltas: ChannelMap,
    /// A window is open this tick
    pub venting: bool,
}

/// Sums the contribution of every active event, ages them by one period and
/// drops the expired ones.
pub fn apply_events(events: &mut Vec<Event>, period_minutes: f64) -> EventEffects {
    let mut deltas = ChannelMap::zeros();
    let mut venting = false;

    for event in events.iter_mut() {
        deltas.add_scaled(&event.contribution(), 1.0);
        venting |= event.kind == EventKind::Vent;
        event.remaining_minutes = (event.remaining_minutes - period_minutes).max(0.0);
    }
    events.retain(|event| !event.is_expired());

    EventEffects { deltas, venting }
}

/// Rolls the per-tick Bernoulli triggers and appends any new events.
///
/// `hour` is the local decimal hour, `occupancy` the 0..1 people-at-home factor.
pub fn maybe_start_events<R: Rng>(
    rng: &mut R,
    events: &mut Vec<Event>,
    hour: f64,
    occupancy: f64,
    profile: Profile,
) {
    // Breakfast: small. Dinner: larger. Someone must be home.
    if (6.5..8.5).contains(&hour) && occupancy > 0.4 && rng.gen::<f64>() < 0.06 {
        events.push(Event::new(EventKind::CookSmall, f64::from(rng.gen_range(10..=25u32))));
    }
    if (17.0..20.5).contains(&hour) && occupancy > 0.4 && rng.gen::<f64>() < 0.14 {
        events.push(Event::new(EventKind::CookBig, f64::from(rng.gen_range(20..=60u32))));
    }

    if ((6.0..8.5).contains(&hour) || (21.0..23.0).contains(&hour))
        && occupancy > 0.3
        && rng.gen::<f64>() < 0.08
    {
        events.push(Event::new(EventKind::Shower, f64::from(rng.gen_range(8..=20u32))));
    }

    if rng.gen::<f64>() < 0.035 {
        events.push(Event::new(EventKind::Vent, f64::from(rng.gen_range(10..=45u32))));
    }

    if (7.0..19.0).contains(&hour) && rng.gen::<f64>() < 0.025 {
        events.push(Event::new(EventKind::Infiltration, f64::from(rng.gen_range(15..=45u32))));
    }

    if profile.is_at_risk() && !(6.0..22.0).contains(&hour) && rng.gen::<f64>() < 0.05 {
        events.push(Event::new(EventKind::CrowdedNight, f64::from(rng.gen_range(60..=210u32))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_envelope_zero_at_edges_and_peak_at_midpoint() {
        let mut event = Event::new(EventKind::CookBig, 40.0);
        assert_relative_eq!(event.weight(), 0.0);

        event.remaining_minutes = 20.0;
        assert_relative_eq!(event.weight(), 1.0);
        assert_relative_eq!(event.contribution()[Channel::Pm25], 140.0);

        event.remaining_minutes = 10.0;
        assert_relative_eq!(event.weight(), 0.5);

        event.remaining_minutes = 0.0;
        assert_relative_eq!(event.weight(), 0.0);
        assert_relative_eq!(event.contribution()[Channel::Co2], 0.0);
    }

    #[test]
    fn test_zero_duration_has_no_weight() {
        let event = Event::new(EventKind::Shower, 0.0);
        assert_eq!(event.weight(), 0.0);
    }

    #[test]
    fn test_apply_events_ages_and_expires() {
        let mut events = vec![
            Event::new(EventKind::Shower, 10.0),
            Event::new(EventKind::Vent, 20.0),
        ];

        let first = apply_events(&mut events, 5.0);
        // Both start at zero weight.
        assert_relative_eq!(first.deltas[Channel::Humidity], 0.0);
        assert!(first.venting);
        assert_eq!(events.len(), 2);

        let second = apply_events(&mut events, 5.0);
        // Shower at its midpoint (+20), vent a quarter in (-9 * 0.5).
        assert_relative_eq!(second.deltas[Channel::Humidity], 20.0 - 4.5);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Vent);
    }

    #[test]
    fn test_crowded_night_only_for_at_risk_profiles() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut events = Vec::new();
        for _ in 0..2000 {
            maybe_start_events(&mut rng, &mut events, 2.0, 0.9, Profile::Healthy);
        }
        assert!(events.iter().all(|e| e.kind != EventKind::CrowdedNight));

        let mut events = Vec::new();
        for _ in 0..2000 {
            maybe_start_events(&mut rng, &mut events, 2.0, 0.9, Profile::Chronic);
        }
        assert!(events.iter().any(|e| e.kind == EventKind::CrowdedNight));
    }

    #[test]
    fn test_cooking_requires_occupancy() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut events = Vec::new();
        for _ in 0..2000 {
            maybe_start_events(&mut rng, &mut events, 18.0, 0.1, Profile::Intermittent);
        }
        assert!(events.iter().all(|e| e.kind != EventKind::CookBig));
    }

    #[test]
    fn test_durations_within_ranges() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut events = Vec::new();
        for _ in 0..5000 {
            maybe_start_events(&mut rng, &mut events, 7.5, 0.9, Profile::Chronic);
        }
        for event in &events {
            let (lo, hi) = match event.kind {
                EventKind::CookSmall => (10.0, 25.0),
                EventKind::CookBig => (20.0, 60.0),
                EventKind::Shower => (8.0, 20.0),
                EventKind::Vent => (10.0, 45.0),
                EventKind::Infiltration => (15.0, 45.0),
                EventKind::CrowdedNight => (60.0, 210.0),
            };
            assert!(event.total_duration_minutes >= lo && event.total_duration_minutes <= hi);
        }
    }
}
