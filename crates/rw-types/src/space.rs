//! Configuration space definitions, sampling and encoding.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::errors::RwResult;
use crate::validation_error;

/// A single parameter dimension in the configuration space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of domain.
    pub kind: ParameterKind,
}

/// Describes the domain of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    Float { low: f64, high: f64 },
    /// Log-uniform continuous range (sampled in log-space then exponentiated).
    LogFloat { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    Int { low: i64, high: i64 },
    /// Log-uniform integer range [low, high] inclusive.
    LogInt { low: i64, high: i64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterKind {
    /// Number of coordinates this parameter occupies in the encoded space.
    pub fn encoded_width(&self) -> usize {
        match self {
            Self::Choice { values } => values.len(),
            _ => 1,
        }
    }
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Float(f64),
    Int(i64),
    Json(serde_json::Value),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// A point in the configuration space.
///
/// Parameters are kept in name order so iteration, encoding and
/// serialization are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, ParameterValue>);

impl Configuration {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ParameterValue)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (String, ParameterValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "}}")
    }
}

/// The full configuration space: an ordered list of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpace {
    pub parameters: Vec<ParameterDef>,
}

impl ConfigurationSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Float { low, high },
        });
        self
    }

    pub fn add_log_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogFloat { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Int { low, high },
        });
        self
    }

    pub fn add_log_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogInt { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Check that every domain is well formed and names are unique.
    pub fn validate(&self) -> RwResult<()> {
        if self.parameters.is_empty() {
            return Err(validation_error!("configuration space has no parameters"));
        }
        let mut names = BTreeSet::new();
        for param in &self.parameters {
            if !names.insert(param.name.as_str()) {
                return Err(validation_error!("duplicate parameter name: {}", param.name));
            }
            let ok = match &param.kind {
                ParameterKind::Float { low, high } => low.is_finite() && high.is_finite() && low <= high,
                ParameterKind::LogFloat { low, high } => *low > 0.0 && high.is_finite() && low <= high,
                ParameterKind::Int { low, high } => low <= high,
                ParameterKind::LogInt { low, high } => *low > 0 && low <= high,
                ParameterKind::Choice { values } => !values.is_empty(),
            };
            if !ok {
                return Err(validation_error!(
                    "invalid domain for parameter {}: {:?}",
                    param.name,
                    param.kind
                ));
            }
        }
        Ok(())
    }

    /// Dimension of the encoded feature vector (categoricals are one-hot).
    pub fn encoded_dim(&self) -> usize {
        self.parameters.iter().map(|p| p.kind.encoded_width()).sum()
    }

    /// Draw `n` independent configurations from the space.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Configuration> {
        (0..n).map(|_| self.sample_one(rng)).collect()
    }

    /// Draw `n` configurations from a fresh generator seeded with `seed`.
    pub fn sample_seeded(&self, n: usize, seed: u64) -> Vec<Configuration> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.sample(n, &mut rng)
    }

    fn sample_one<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let mut config = Configuration::new();

        for param in &self.parameters {
            let value = match &param.kind {
                ParameterKind::Float { low, high } => {
                    ParameterValue::Float(sample_between(rng, *low, *high))
                }
                ParameterKind::LogFloat { low, high } => {
                    let log_val = sample_between(rng, low.ln(), high.ln());
                    ParameterValue::Float(log_val.exp().clamp(*low, *high))
                }
                ParameterKind::Int { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
                ParameterKind::LogInt { low, high } => {
                    let log_low = (*low as f64).ln();
                    let log_high = ((*high + 1) as f64).ln();
                    let raw = sample_between(rng, log_low, log_high).exp().floor() as i64;
                    ParameterValue::Int(raw.clamp(*low, *high))
                }
                ParameterKind::Choice { values } => {
                    let idx = rng.gen_range(0..values.len());
                    ParameterValue::Json(values[idx].clone())
                }
            };
            config.insert(param.name.clone(), value);
        }

        config
    }

    /// Domain membership: every parameter present with a value of the right
    /// kind inside its bounds, and no unknown parameters.
    pub fn contains(&self, config: &Configuration) -> bool {
        if config.len() != self.parameters.len() {
            return false;
        }
        self.parameters.iter().all(|param| {
            match (&param.kind, config.get(&param.name)) {
                (ParameterKind::Float { low, high }, Some(ParameterValue::Float(v)))
                | (ParameterKind::LogFloat { low, high }, Some(ParameterValue::Float(v))) => {
                    v.is_finite() && *v >= *low && *v <= *high
                }
                (ParameterKind::Int { low, high }, Some(ParameterValue::Int(v)))
                | (ParameterKind::LogInt { low, high }, Some(ParameterValue::Int(v))) => {
                    *v >= *low && *v <= *high
                }
                (ParameterKind::Choice { values }, Some(ParameterValue::Json(v))) => {
                    values.contains(v)
                }
                _ => false,
            }
        })
    }

    /// Map a configuration into `[0, 1]^d`.
    ///
    /// Log domains are encoded in log space, integers at the centre of their
    /// unit cell, categoricals as one-hot blocks.
    pub fn encode(&self, config: &Configuration) -> RwResult<Vec<f64>> {
        if !self.contains(config) {
            return Err(validation_error!(
                "configuration {} is outside the configuration space",
                config
            ));
        }
        let mut features = Vec::with_capacity(self.encoded_dim());
        for param in &self.parameters {
            match (&param.kind, config.get(&param.name)) {
                (ParameterKind::Float { low, high }, Some(ParameterValue::Float(v))) => {
                    features.push(unit_interval(*v, *low, *high));
                }
                (ParameterKind::LogFloat { low, high }, Some(ParameterValue::Float(v))) => {
                    features.push(unit_interval(v.ln(), low.ln(), high.ln()));
                }
                (ParameterKind::Int { low, high }, Some(ParameterValue::Int(v))) => {
                    let cells = (high - low + 1) as f64;
                    features.push(((v - low) as f64 + 0.5) / cells);
                }
                (ParameterKind::LogInt { low, high }, Some(ParameterValue::Int(v))) => {
                    features.push(unit_interval(
                        (*v as f64).ln(),
                        (*low as f64).ln(),
                        (*high as f64).ln(),
                    ));
                }
                (ParameterKind::Choice { values }, Some(ParameterValue::Json(v))) => {
                    features.extend(values.iter().map(|c| if c == v { 1.0 } else { 0.0 }));
                }
                _ => {
                    return Err(validation_error!(
                        "parameter {} has a value of the wrong kind",
                        param.name
                    ))
                }
            }
        }
        Ok(features)
    }
}

fn sample_between<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    if high > low {
        rng.gen_range(low..=high)
    } else {
        low
    }
}

fn unit_interval(value: f64, low: f64, high: f64) -> f64 {
    if high > low {
        ((value - low) / (high - low)).clamp(0.0, 1.0)
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_space() -> ConfigurationSpace {
        ConfigurationSpace::new()
            .add_log_float("learning_rate", 1e-5, 1e-1)
            .add_int("num_layers", 1, 8)
            .add_float("dropout", 0.0, 0.5)
    }

    #[test]
    fn sampled_configurations_are_members() {
        let space = sample_space();
        let configs = space.sample_seeded(200, 3);
        assert_eq!(configs.len(), 200);
        for config in &configs {
            assert!(space.contains(config), "not a member: {config}");
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let space = sample_space();
        assert_eq!(space.sample_seeded(20, 11), space.sample_seeded(20, 11));
        assert_ne!(space.sample_seeded(20, 11), space.sample_seeded(20, 12));
    }

    #[test]
    fn log_int_stays_in_bounds() {
        let space = ConfigurationSpace::new().add_log_int("batch_size", 8, 512);
        for config in space.sample_seeded(300, 5) {
            match config.get("batch_size") {
                Some(ParameterValue::Int(v)) => assert!((8..=512).contains(v)),
                other => panic!("unexpected batch_size value: {other:?}"),
            }
        }
    }

    #[test]
    fn membership_rejects_bad_values() {
        let space = sample_space();
        let good = Configuration::new()
            .with("learning_rate", ParameterValue::Float(1e-3))
            .with("num_layers", ParameterValue::Int(4))
            .with("dropout", ParameterValue::Float(0.1));
        assert!(space.contains(&good));

        let out_of_range = good.clone().with("dropout", ParameterValue::Float(0.9));
        assert!(!space.contains(&out_of_range));

        let wrong_kind = good.clone().with("num_layers", ParameterValue::Float(4.0));
        assert!(!space.contains(&wrong_kind));

        let extra = good.with("momentum", ParameterValue::Float(0.9));
        assert!(!space.contains(&extra));
    }

    #[test]
    fn encoding_is_unit_cube_with_one_hot_choices() {
        let space = ConfigurationSpace::new()
            .add_float("x", 0.0, 2.0)
            .add_choice(
                "optimizer",
                vec![
                    serde_json::json!("sgd"),
                    serde_json::json!("adam"),
                    serde_json::json!("rmsprop"),
                ],
            );
        assert_eq!(space.encoded_dim(), 4);

        let config = Configuration::new()
            .with("x", ParameterValue::Float(0.5))
            .with("optimizer", ParameterValue::Json(serde_json::json!("adam")));
        let encoded = space.encode(&config).unwrap();
        assert_eq!(encoded, vec![0.25, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn validate_catches_broken_domains() {
        assert!(sample_space().validate().is_ok());
        assert!(ConfigurationSpace::new().validate().is_err());
        assert!(ConfigurationSpace::new()
            .add_log_float("lr", 0.0, 1.0)
            .validate()
            .is_err());
        assert!(ConfigurationSpace::new()
            .add_int("a", 1, 2)
            .add_int("a", 1, 2)
            .validate()
            .is_err());
    }

    #[test]
    fn configuration_display_is_ordered() {
        let config = Configuration::new()
            .with("b", ParameterValue::Int(2))
            .with("a", ParameterValue::Float(0.5));
        assert_eq!(config.to_string(), "{a=0.5, b=2}");
    }
}
