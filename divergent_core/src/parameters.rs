//! Deterministic cross-product generation of fuzz variable values.

use crate::config::ConfigError;
use crate::plugin::{FuzzVariable, Value, ValueMap};
use crate::trace::TraceTemplate;

/// An iterator over one variable's generated values. Values are pulled
/// lazily from the variable and cached; once the underlying sequence is
/// exhausted the cache is replayed cyclically, with each wrap reported to
/// the outer generator so it can detect overall termination.
pub struct ParameterIterator<'a> {
    variable: &'a dyn FuzzVariable,
    iter: Box<dyn Iterator<Item = Value> + 'a>,
    cache: Vec<Value>,
    /// Zero while still pulling from the variable; otherwise the cache index
    /// of the next replayed value.
    pos: usize,
    pub value: Value,
}

impl<'a> ParameterIterator<'a> {
    pub fn new(variable: &'a dyn FuzzVariable) -> Result<ParameterIterator<'a>, ConfigError> {
        let mut iter = variable.generate_values();
        let value = iter
            .next()
            .ok_or_else(|| ConfigError::EmptyVariable(variable.name().to_string()))?;
        Ok(ParameterIterator {
            variable,
            iter,
            cache: vec![value.clone()],
            pos: 0,
            value,
        })
    }

    pub fn name(&self) -> &str {
        self.variable.name()
    }

    /// Advance to the next value. Returns true when the iterator wrapped
    /// back to the first value (the sequence has been exhausted).
    pub fn advance(&mut self) -> bool {
        if self.pos > 0 {
            match self.cache.get(self.pos) {
                Some(value) => {
                    self.value = value.clone();
                    self.pos += 1;
                    false
                }
                None => {
                    self.pos = 1;
                    self.value = self.cache[0].clone();
                    true
                }
            }
        } else {
            match self.iter.next() {
                Some(value) => {
                    self.cache.push(value.clone());
                    self.value = value;
                    false
                }
                None => {
                    self.pos = 1;
                    self.value = self.cache[0].clone();
                    true
                }
            }
        }
    }
}

/// Generates every unique combination of template variable values using a
/// waterfall (odometer) ordering: the last configured variable varies
/// fastest. Generation terminates once every variable's sequence has been
/// exhausted at least once.
///
/// ```text
/// variables:           yields:
///   x: [a, b]            {x: a, y: 1}
///   y: [1, 2]            {x: a, y: 2}
///                        {x: b, y: 1}
///                        {x: b, y: 2}
/// ```
pub struct CombinationGenerator<'a> {
    parameters: Vec<ParameterIterator<'a>>,
    exhausted: bool,
}

impl<'a> CombinationGenerator<'a> {
    pub fn new(template: &'a TraceTemplate) -> Result<CombinationGenerator<'a>, ConfigError> {
        let parameters = template
            .variables
            .iter()
            .map(|variable| ParameterIterator::new(variable.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CombinationGenerator {
            parameters,
            exhausted: false,
        })
    }
}

impl Iterator for CombinationGenerator<'_> {
    type Item = ValueMap;

    fn next(&mut self) -> Option<ValueMap> {
        if self.exhausted {
            return None;
        }

        let values: ValueMap = self
            .parameters
            .iter()
            .map(|param| (param.name().to_string(), param.value.clone()))
            .collect();

        // Odometer step: advance the fastest (last) variable first and carry
        // wraps towards the front. A full carry means every sequence has
        // wrapped and the cross-product is complete.
        let mut all_wrapped = true;
        for param in self.parameters.iter_mut().rev() {
            if !param.advance() {
                all_wrapped = false;
                break;
            }
        }
        if all_wrapped {
            self.exhausted = true;
        }

        Some(values)
    }
}
