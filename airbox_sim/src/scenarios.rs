//! Chaos and physics scenarios for the simulated fleet.

use std::str::FromStr;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Chronic vs healthy household over a working day
    ChronicWindow,

    /// Battery drain across a multi-hour gap spanning midnight
    BatteryContinuity,

    /// A box is deregistered mid-run
    Deregistration,

    /// Backend answers 503 for several minutes, then recovers
    BackendOutage,

    /// Many sensors firing at once against a small delivery gate
    Throttle,

    /// The configuration document disappears, then returns
    ConfigOutage,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::ChronicWindow,
            ScenarioId::BatteryContinuity,
            ScenarioId::Deregistration,
            ScenarioId::BackendOutage,
            ScenarioId::Throttle,
            ScenarioId::ConfigOutage,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::ChronicWindow => "chronic_window",
            ScenarioId::BatteryContinuity => "battery_continuity",
            ScenarioId::Deregistration => "deregistration",
            ScenarioId::BackendOutage => "backend_outage",
            ScenarioId::Throttle => "throttle",
            ScenarioId::ConfigOutage => "config_outage",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::ChronicWindow => "05:00-17:00 at 5 min: chronic CO2 above healthy, healthy more often <= 1000 ppm",
            ScenarioId::BatteryContinuity => "3 days with a 7 h gap over midnight: battery never rises, daily rate in band",
            ScenarioId::Deregistration => "registered flips false: runner stops within one poll, no further deliveries",
            ScenarioId::BackendOutage => "3 min of 503s: retries, drops, then delivery resumes after heal",
            ScenarioId::Throttle => "40 sensors in phase, gate of 3: never more than 3 deliveries in flight",
            ScenarioId::ConfigOutage => "config missing: every runner stops; config back: fleet resumes",
        }
    }

    /// Scenarios that run a simulated fleet (as opposed to a bare simulator).
    pub fn uses_fleet(&self) -> bool {
        !matches!(self, ScenarioId::ChronicWindow | ScenarioId::BatteryContinuity)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScenarioId::all()
            .into_iter()
            .find(|id| id.name() == s.trim().to_lowercase())
            .ok_or_else(|| format!("Unknown scenario: {}", s))
    }
}
