//! Variation registry.
//!
//! A closed catalog of eight parameter variations evaluated in parallel with
//! production. `CHAMPION` carries no overrides, so it always resolves to the
//! live configuration; each challenger overrides a few parameters either
//! absolutely (`set`) or relative to the champion value (`scale`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::params::{self, ParameterSet};
use crate::types::CanaryError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VariationId {
    #[serde(rename = "CHAMPION")]
    Champion,
    #[serde(rename = "CHALLENGER_1")]
    Challenger1,
    #[serde(rename = "CHALLENGER_2")]
    Challenger2,
    #[serde(rename = "CHALLENGER_3")]
    Challenger3,
    #[serde(rename = "CHALLENGER_4")]
    Challenger4,
    #[serde(rename = "CHALLENGER_5")]
    Challenger5,
    #[serde(rename = "CHALLENGER_6")]
    Challenger6,
    #[serde(rename = "CHALLENGER_7")]
    Challenger7,
}

impl VariationId {
    pub const ALL: [VariationId; 8] = [
        VariationId::Champion,
        VariationId::Challenger1,
        VariationId::Challenger2,
        VariationId::Challenger3,
        VariationId::Challenger4,
        VariationId::Challenger5,
        VariationId::Challenger6,
        VariationId::Challenger7,
    ];

    pub fn is_champion(&self) -> bool {
        *self == VariationId::Champion
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariationId::Champion => "CHAMPION",
            VariationId::Challenger1 => "CHALLENGER_1",
            VariationId::Challenger2 => "CHALLENGER_2",
            VariationId::Challenger3 => "CHALLENGER_3",
            VariationId::Challenger4 => "CHALLENGER_4",
            VariationId::Challenger5 => "CHALLENGER_5",
            VariationId::Challenger6 => "CHALLENGER_6",
            VariationId::Challenger7 => "CHALLENGER_7",
        }
    }
}

impl fmt::Display for VariationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VariationId {
    type Err = CanaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        VariationId::ALL
            .iter()
            .find(|id| id.as_str() == upper)
            .copied()
            .ok_or_else(|| CanaryError::Validation(format!("unknown variation: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// How a challenger derives a parameter from the champion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Override {
    Set(f64),
    Scale(f64),
}

impl Override {
    fn apply(&self, champion_value: f64) -> f64 {
        match self {
            Override::Set(v) => *v,
            Override::Scale(k) => champion_value * k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub id: VariationId,
    pub label: String,
    pub overrides: BTreeMap<String, Override>,
}

/// Variation entry as written in `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariationConfig {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, Override>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct VariationRegistry {
    variations: Vec<Variation>,
}

impl VariationRegistry {
    /// The built-in catalog: one challenger per direction of the main knobs.
    pub fn default_catalog() -> Self {
        let one = |id, label: &str, name: &str, ov| Variation {
            id,
            label: label.to_string(),
            overrides: BTreeMap::from([(name.to_string(), ov)]),
        };

        Self {
            variations: vec![
                Variation {
                    id: VariationId::Champion,
                    label: "production".to_string(),
                    overrides: BTreeMap::new(),
                },
                one(VariationId::Challenger1, "stricter confidence", params::MIN_CONFIDENCE, Override::Scale(1.04)),
                one(VariationId::Challenger2, "looser confidence", params::MIN_CONFIDENCE, Override::Scale(0.96)),
                one(VariationId::Challenger3, "tighter stop", params::STOP_LOSS_PCT, Override::Scale(0.85)),
                one(VariationId::Challenger4, "wider stop", params::STOP_LOSS_PCT, Override::Scale(1.15)),
                one(VariationId::Challenger5, "extended target", params::TAKE_PROFIT_PCT, Override::Scale(1.15)),
                one(VariationId::Challenger6, "larger size", params::POSITION_SIZE_MULT, Override::Scale(1.25)),
                one(VariationId::Challenger7, "smaller size", params::POSITION_SIZE_MULT, Override::Scale(0.75)),
            ],
        }
    }

    /// Default catalog with entries replaced from configuration.
    pub fn from_config(entries: &BTreeMap<String, VariationConfig>) -> Result<Self, CanaryError> {
        let mut registry = Self::default_catalog();

        for (name, entry) in entries {
            let id: VariationId = name.parse()?;
            if id.is_champion() && !entry.overrides.is_empty() {
                return Err(CanaryError::Config(
                    "CHAMPION cannot carry overrides; it always mirrors production".to_string(),
                ));
            }
            for (param, ov) in &entry.overrides {
                if params::spec(param).is_none() {
                    return Err(CanaryError::Config(format!("{id}: unknown parameter {param}")));
                }
                if let Override::Scale(k) = ov {
                    if !(k.is_finite() && *k > 0.0) {
                        return Err(CanaryError::Config(format!("{id}: scale for {param} must be positive")));
                    }
                }
            }

            if let Some(slot) = registry.variations.iter_mut().find(|v| v.id == id) {
                if let Some(label) = &entry.label {
                    slot.label = label.clone();
                }
                slot.overrides = entry.overrides.clone();
            }
        }

        Ok(registry)
    }

    pub fn variations(&self) -> &[Variation] {
        &self.variations
    }

    pub fn get(&self, id: VariationId) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == id)
    }

    /// Effective parameters for `id` given the champion's set for one strategy.
    /// Overrides for parameters the strategy does not use are ignored.
    pub fn resolve(&self, id: VariationId, champion: &ParameterSet) -> ParameterSet {
        let mut resolved = champion.clone();
        let Some(variation) = self.get(id) else {
            return resolved;
        };

        for (name, ov) in &variation.overrides {
            let Some(base) = champion.get(name) else {
                continue;
            };
            let value = match params::spec(name) {
                Some(spec) => spec.normalize(ov.apply(base)),
                None => continue,
            };
            resolved.set(name.clone(), value);
        }
        resolved
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{MIN_CONFIDENCE, POSITION_SIZE_MULT, STOP_LOSS_PCT, TAKE_PROFIT_PCT};

    fn champion() -> ParameterSet {
        [
            (MIN_CONFIDENCE.to_string(), 0.6),
            (STOP_LOSS_PCT.to_string(), 4.0),
            (TAKE_PROFIT_PCT.to_string(), 8.0),
            (POSITION_SIZE_MULT.to_string(), 1.0),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_default_catalog_has_eight_with_single_champion() {
        let registry = VariationRegistry::default_catalog();
        assert_eq!(registry.variations().len(), 8);
        assert_eq!(registry.variations().iter().filter(|v| v.id.is_champion()).count(), 1);
    }

    #[test]
    fn test_champion_resolves_to_production() {
        let registry = VariationRegistry::default_catalog();
        assert_eq!(registry.resolve(VariationId::Champion, &champion()), champion());
    }

    #[test]
    fn test_scale_override() {
        let registry = VariationRegistry::default_catalog();
        let resolved = registry.resolve(VariationId::Challenger3, &champion());
        assert!((resolved.get(STOP_LOSS_PCT).unwrap() - 3.4).abs() < 1e-9);
        assert_eq!(resolved.differing(&champion()), vec![STOP_LOSS_PCT.to_string()]);
    }

    #[test]
    fn test_override_for_missing_param_is_ignored() {
        let registry = VariationRegistry::default_catalog();
        let mut sparse = ParameterSet::new();
        sparse.set(MIN_CONFIDENCE, 0.5);
        let resolved = registry.resolve(VariationId::Challenger3, &sparse);
        assert_eq!(resolved, sparse);
    }

    #[test]
    fn test_from_config_replaces_entry() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "challenger_3".to_string(),
            VariationConfig {
                label: Some("fixed stop".into()),
                overrides: BTreeMap::from([(STOP_LOSS_PCT.to_string(), Override::Set(2.5))]),
            },
        );
        let registry = VariationRegistry::from_config(&entries).unwrap();
        let v = registry.get(VariationId::Challenger3).unwrap();
        assert_eq!(v.label, "fixed stop");
        assert_eq!(registry.resolve(VariationId::Challenger3, &champion()).get(STOP_LOSS_PCT), Some(2.5));
    }

    #[test]
    fn test_from_config_rejects_champion_overrides() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "CHAMPION".to_string(),
            VariationConfig {
                label: None,
                overrides: BTreeMap::from([(STOP_LOSS_PCT.to_string(), Override::Set(2.5))]),
            },
        );
        assert!(VariationRegistry::from_config(&entries).is_err());
    }

    #[test]
    fn test_from_config_rejects_unknown_param_and_name() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "CHALLENGER_2".to_string(),
            VariationConfig {
                label: None,
                overrides: BTreeMap::from([("leverage".to_string(), Override::Set(3.0))]),
            },
        );
        assert!(VariationRegistry::from_config(&entries).is_err());

        let mut entries = BTreeMap::new();
        entries.insert("CHALLENGER_9".to_string(), VariationConfig::default());
        assert!(VariationRegistry::from_config(&entries).is_err());
    }

    #[test]
    fn test_variation_id_parse_display() {
        for id in VariationId::ALL {
            assert_eq!(id.to_string().parse::<VariationId>().unwrap(), id);
        }
        assert_eq!(serde_json::to_string(&VariationId::Challenger5).unwrap(), "\"CHALLENGER_5\"");
    }
}
