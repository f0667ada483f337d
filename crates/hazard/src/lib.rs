use perception::{PerceptionSnapshot, PpeKind};
use serde::Serialize;
use thiserror::Error;

/// Why a snapshot was classified as a hazard. Carried for logging and alert
/// text; control flow branches only on hazard/no-hazard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HazardReason {
    PersonAndOverTemperature,
    PersonWithoutGear { missing: PpeKind },
    OverTemperature,
}

/// Recomputed for every snapshot, never stored.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HazardVerdict {
    pub reason: Option<HazardReason>,
}

impl HazardVerdict {
    pub fn is_hazard(&self) -> bool {
        self.reason.is_some()
    }

    pub const SAFE: HazardVerdict = HazardVerdict { reason: None };
}

#[derive(Clone, Debug)]
pub struct HazardPolicy {
    /// Max allowed workstation temperature in °C.
    pub temperature_threshold_c: f64,
    /// Categories that must be present on any detected person.
    pub required_ppe: Vec<PpeKind>,
}

impl Default for HazardPolicy {
    fn default() -> Self {
        Self {
            temperature_threshold_c: 45.0,
            required_ppe: vec![PpeKind::Helmet, PpeKind::Jacket],
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("required PPE set is empty; the policy must name at least one category")]
    EmptyRequiredPpe,
    #[error("temperature threshold must be finite, got {0}")]
    InvalidThreshold(f64),
}

impl HazardPolicy {
    /// Reject malformed configuration at load time. This is the only error
    /// class that prevents a session from starting.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.required_ppe.is_empty() {
            return Err(PolicyError::EmptyRequiredPpe);
        }
        if !self.temperature_threshold_c.is_finite() {
            return Err(PolicyError::InvalidThreshold(self.temperature_threshold_c));
        }
        Ok(())
    }
}

fn over_threshold(policy: &HazardPolicy, temperature_c: Option<f64>) -> bool {
    // An absent reading is treated as "not over threshold" (fail-open on the
    // sensor channel; PPE stays fail-closed).
    match temperature_c {
        Some(t) => t.is_finite() && t > policy.temperature_threshold_c,
        None => false,
    }
}

fn first_missing_required(policy: &HazardPolicy, snapshot: &PerceptionSnapshot) -> Option<PpeKind> {
    policy
        .required_ppe
        .iter()
        .copied()
        .find(|kind| !snapshot.ppe.get(*kind))
}

/// Classify a snapshot against the safety policy. Pure: no side effects, no
/// hidden state. First matching rule wins:
///
/// 1. person present + over temperature
/// 2. person present + any required PPE category missing
/// 3. over temperature with no person
/// 4. safe
pub fn evaluate(policy: &HazardPolicy, snapshot: &PerceptionSnapshot) -> HazardVerdict {
    let over = over_threshold(policy, snapshot.temperature_c);

    if snapshot.person_present && over {
        return HazardVerdict {
            reason: Some(HazardReason::PersonAndOverTemperature),
        };
    }
    if snapshot.person_present {
        if let Some(missing) = first_missing_required(policy, snapshot) {
            return HazardVerdict {
                reason: Some(HazardReason::PersonWithoutGear { missing }),
            };
        }
    }
    if over {
        return HazardVerdict {
            reason: Some(HazardReason::OverTemperature),
        };
    }
    HazardVerdict::SAFE
}

#[cfg(test)]
mod tests {
    use super::*;
    use perception::PpeFlags;

    fn snap(person: bool, ppe: PpeFlags, temp: Option<f64>) -> PerceptionSnapshot {
        PerceptionSnapshot::new(0, person, ppe, temp)
    }

    #[test]
    fn person_and_overtemp_beats_ppe_state() {
        let policy = HazardPolicy::default();
        // Fully geared person, still a hazard when over temperature.
        let v = evaluate(&policy, &snap(true, PpeFlags::all_present(), Some(50.0)));
        assert_eq!(v.reason, Some(HazardReason::PersonAndOverTemperature));
    }

    #[test]
    fn person_without_required_gear_is_hazard() {
        let policy = HazardPolicy::default();
        let mut ppe = PpeFlags::all_present();
        ppe.helmet = false;
        let v = evaluate(&policy, &snap(true, ppe, Some(30.0)));
        assert_eq!(
            v.reason,
            Some(HazardReason::PersonWithoutGear {
                missing: PpeKind::Helmet
            })
        );
    }

    #[test]
    fn overtemp_without_person_is_hazard() {
        let policy = HazardPolicy::default();
        let v = evaluate(&policy, &snap(false, PpeFlags::default(), Some(46.0)));
        assert_eq!(v.reason, Some(HazardReason::OverTemperature));
    }

    #[test]
    fn geared_person_at_nominal_temp_is_safe() {
        let policy = HazardPolicy::default();
        let v = evaluate(&policy, &snap(true, PpeFlags::all_present(), Some(44.9)));
        assert!(!v.is_hazard());
    }

    #[test]
    fn absent_temperature_reads_as_not_over() {
        let policy = HazardPolicy::default();
        // No person, no reading: safe.
        assert!(!evaluate(&policy, &snap(false, PpeFlags::default(), None)).is_hazard());
        // PPE rule still applies with the sensor gone.
        let v = evaluate(&policy, &snap(true, PpeFlags::default(), None));
        assert_eq!(
            v.reason,
            Some(HazardReason::PersonWithoutGear {
                missing: PpeKind::Helmet
            })
        );
    }

    #[test]
    fn only_required_categories_matter() {
        let policy = HazardPolicy {
            required_ppe: vec![PpeKind::Helmet],
            ..Default::default()
        };
        let mut ppe = PpeFlags::default();
        ppe.helmet = true;
        // Gloves, goggles, jacket all missing but not required.
        assert!(!evaluate(&policy, &snap(true, ppe, Some(30.0))).is_hazard());
    }

    #[test]
    fn empty_required_set_is_rejected() {
        let policy = HazardPolicy {
            required_ppe: Vec::new(),
            ..Default::default()
        };
        assert_eq!(policy.validate(), Err(PolicyError::EmptyRequiredPpe));
    }

    #[test]
    fn non_finite_threshold_is_rejected() {
        let policy = HazardPolicy {
            temperature_threshold_c: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::InvalidThreshold(_))
        ));
    }
}
