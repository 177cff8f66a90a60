//! Integer and string fuzz variables.

use crate::config::ConfigError;
use crate::plugin::{FuzzVariable, TraceHook, Value};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::collections::HashSet;

const DEFAULT_SAMPLE_SIZE: usize = 5;

fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct IntConfig {
    #[serde(default)]
    values: Vec<i64>,
    #[serde(default)]
    range: Option<IntRange>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct IntRange {
    minimum: i64,
    maximum: i64,
    #[serde(default = "default_sample_size")]
    size: usize,
}

/// An integer variable yielding a fixed list of values, a random sample from
/// an inclusive range, or both.
///
/// ```yaml
/// variables:
///   count:
///     type: int
///     values: [-1, 0, 1]
///     range:
///       minimum: 0
///       maximum: 100
///       size: 5
/// ```
pub struct IntVariable {
    name: String,
    values: Vec<i64>,
    range: Option<IntRange>,
}

pub fn int_variable(name: &str, config: &Value) -> Result<Box<dyn FuzzVariable>, ConfigError> {
    let config: IntConfig = serde_yaml::from_value(config.clone())
        .map_err(|err| ConfigError::invalid(name, err.to_string()))?;

    if let Some(range) = &config.range {
        if range.minimum > range.maximum {
            return Err(ConfigError::invalid(
                name,
                format!("range minimum {} exceeds maximum {}", range.minimum, range.maximum),
            ));
        }
    }
    let sampled = config.range.as_ref().map(|range| range.size).unwrap_or(0);
    if config.values.is_empty() && sampled == 0 {
        return Err(ConfigError::EmptyVariable(name.to_string()));
    }

    Ok(Box::new(IntVariable {
        name: name.to_string(),
        values: config.values,
        range: config.range,
    }))
}

impl IntVariable {
    /// Sample `size` distinct integers from the inclusive range. The rng is
    /// seeded from the variable's configuration so repeated runs of the same
    /// project hit the same values.
    fn sample(&self, range: &IntRange) -> Vec<i64> {
        let span = (range.maximum - range.minimum + 1) as usize;
        let size = range.size.min(span);

        let digest = md5::compute(format!(
            "{}:{}:{}:{}",
            self.name, range.minimum, range.maximum, range.size
        ));
        let mut seed = [0u8; 32];
        seed[..16].copy_from_slice(&digest.0);
        seed[16..].copy_from_slice(&digest.0);
        let mut rng = ChaCha8Rng::from_seed(seed);

        let mut seen = HashSet::with_capacity(size);
        let mut sampled = Vec::with_capacity(size);
        while sampled.len() < size {
            let value = rng.random_range(range.minimum..=range.maximum);
            if seen.insert(value) {
                sampled.push(value);
            }
        }
        sampled
    }
}

impl TraceHook for IntVariable {}

impl FuzzVariable for IntVariable {
    fn id(&self) -> &str {
        "int"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn generate_values(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        let fixed = self.values.iter().copied();
        let sampled = self
            .range
            .as_ref()
            .map(|range| self.sample(range))
            .unwrap_or_default();
        Box::new(fixed.chain(sampled).map(Value::from))
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct StrConfig {
    values: Vec<String>,
}

/// A string variable yielding a fixed list of values.
pub struct StrVariable {
    name: String,
    values: Vec<String>,
}

pub fn str_variable(name: &str, config: &Value) -> Result<Box<dyn FuzzVariable>, ConfigError> {
    let config: StrConfig = serde_yaml::from_value(config.clone())
        .map_err(|err| ConfigError::invalid(name, err.to_string()))?;
    if config.values.is_empty() {
        return Err(ConfigError::EmptyVariable(name.to_string()));
    }
    Ok(Box::new(StrVariable {
        name: name.to_string(),
        values: config.values,
    }))
}

impl TraceHook for StrVariable {}

impl FuzzVariable for StrVariable {
    fn id(&self) -> &str {
        "str"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn generate_values(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        Box::new(self.values.iter().map(|value| Value::from(value.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn int_fixed_values() {
        let variable = int_variable("x", &config("{values: [-1, 0, 1]}")).unwrap();
        let values: Vec<Value> = variable.generate_values().collect();
        assert_eq!(values, vec![Value::from(-1), Value::from(0), Value::from(1)]);
    }

    #[test]
    fn int_range_samples_distinct_values_within_bounds() {
        let variable =
            int_variable("x", &config("{range: {minimum: 0, maximum: 100, size: 5}}")).unwrap();
        let values: Vec<i64> = variable
            .generate_values()
            .map(|value| value.as_i64().unwrap())
            .collect();

        assert_eq!(values.len(), 5);
        let mut unique = values.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 5);
        assert!(values.iter().all(|value| (0..=100).contains(value)));
    }

    #[test]
    fn int_range_sampling_is_reproducible() {
        let config = config("{range: {minimum: 0, maximum: 1000, size: 10}}");
        let a: Vec<Value> = int_variable("x", &config)
            .unwrap()
            .generate_values()
            .collect();
        let b: Vec<Value> = int_variable("x", &config)
            .unwrap()
            .generate_values()
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn int_range_narrower_than_size_yields_whole_range() {
        let variable =
            int_variable("x", &config("{range: {minimum: 1, maximum: 3, size: 10}}")).unwrap();
        let mut values: Vec<i64> = variable
            .generate_values()
            .map(|value| value.as_i64().unwrap())
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn int_values_and_range_combine() {
        let variable = int_variable(
            "x",
            &config("{values: [7], range: {minimum: 0, maximum: 10, size: 2}}"),
        )
        .unwrap();
        let values: Vec<Value> = variable.generate_values().collect();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], Value::from(7));
    }

    #[test]
    fn int_rejects_empty_configuration() {
        let err = int_variable("x", &config("{}")).err().unwrap();
        assert!(matches!(err, ConfigError::EmptyVariable(name) if name == "x"));
    }

    #[test]
    fn int_rejects_inverted_range() {
        let err = int_variable("x", &config("{range: {minimum: 5, maximum: 1}}")).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn str_values() {
        let variable = str_variable("word", &config("{values: [hello, world]}")).unwrap();
        assert_eq!(variable.name(), "word");
        let values: Vec<Value> = variable.generate_values().collect();
        assert_eq!(values, vec![Value::from("hello"), Value::from("world")]);
    }

    #[test]
    fn str_rejects_empty_values() {
        let err = str_variable("word", &config("{values: []}")).err().unwrap();
        assert!(matches!(err, ConfigError::EmptyVariable(_)));
    }
}
