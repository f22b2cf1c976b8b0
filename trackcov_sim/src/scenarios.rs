//! Validation scenarios for the vertex fitter.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioId {
    /// VAL-001: prompt charged tracks from a beam-spot vertex, unconstrained
    Primary,

    /// VAL-002: prompt tracks fitted with the beam spot as vertex constraint
    BeamSpot,

    /// VAL-003: displaced K0s -> pi+ pi- with mass-constrained refit
    DisplacedV0,

    /// VAL-004: charged tracks plus one neutral line from the same vertex
    WithNeutral,

    // ═══════════════════════════════════════════════════
    // STRESS SCENARIOS
    // ═══════════════════════════════════════════════════
    /// VAL-005: nearly collinear stiff pairs, exercises regularization
    Collinear,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Primary,
            ScenarioId::BeamSpot,
            ScenarioId::DisplacedV0,
            ScenarioId::WithNeutral,
            ScenarioId::Collinear,
        ]
    }

    /// Scenarios judged on pull statistics.
    pub fn standard() -> Vec<ScenarioId> {
        Self::all().into_iter().filter(|s| !s.is_stress()).collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Primary => "primary",
            ScenarioId::BeamSpot => "beam_spot",
            ScenarioId::DisplacedV0 => "displaced_v0",
            ScenarioId::WithNeutral => "with_neutral",
            ScenarioId::Collinear => "collinear",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Primary => "Prompt charged tracks, unconstrained fit, unit pulls",
            ScenarioId::BeamSpot => "Prompt charged tracks with beam-spot constraint, ndof = 2N",
            ScenarioId::DisplacedV0 => "K0s decays at 2-40 cm, start-radius hint and K0 mass constraint",
            ScenarioId::WithNeutral => "Charged tracks plus a neutral line sharing the vertex",
            ScenarioId::Collinear => "Nearly parallel stiff pairs, fit must survive without NaN",
        }
    }

    /// Stress scenarios only check that every fit returns finite results.
    pub fn is_stress(&self) -> bool {
        matches!(self, ScenarioId::Collinear)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" | "val-001" => Ok(ScenarioId::Primary),
            "beam_spot" | "beamspot" | "val-002" => Ok(ScenarioId::BeamSpot),
            "displaced_v0" | "v0" | "k0s" | "val-003" => Ok(ScenarioId::DisplacedV0),
            "with_neutral" | "neutral" | "val-004" => Ok(ScenarioId::WithNeutral),
            "collinear" | "val-005" => Ok(ScenarioId::Collinear),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for s in ScenarioId::all() {
            assert_eq!(s.name().parse::<ScenarioId>(), Ok(s));
        }
        assert_eq!("K0S".parse::<ScenarioId>(), Ok(ScenarioId::DisplacedV0));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_standard_excludes_stress() {
        assert_eq!(ScenarioId::standard().len(), 4);
        assert!(!ScenarioId::standard().contains(&ScenarioId::Collinear));
    }
}
