//! Configuration-driven record rules.
//!
//! Rules are declared in the pipeline file in shorthand or repeat form and
//! compiled once at startup; invalid patterns and bounds are configuration
//! errors, never per-record failures.

use std::collections::BTreeMap;
use std::fmt;

use bigdecimal::BigDecimal;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Partition keys longer than this are refused by the destination.
pub const MAX_PARTITION_KEY_CHARS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSpec {
    Present { assert_present: FieldSelector },
    NotEmpty { assert_not_empty: FieldSelector },
    Type { assert_type: BTreeMap<String, ValueType> },
    Regex { assert_regex: RegexSelector },
    Range { assert_range: RangeSelector },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSelector {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegexSelector {
    One(RegexRule),
    Many(Vec<RegexRule>),
    Map(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexRule {
    pub field: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeSelector {
    One(RangeRule),
    Many(Vec<RangeRule>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    pub field: String,
    pub min: Option<Number>,
    pub max: Option<Number>,
}

/// JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ValueType {
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        };
        f.write_str(s)
    }
}

/// Where the destination partition key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionKeySpec {
    Source(PartitionKeySource),
    Field { field: String },
}

impl Default for PartitionKeySpec {
    fn default() -> Self {
        Self::Source(PartitionKeySource::MessageKey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKeySource {
    /// The queue message key, or the source partition number for keyless messages.
    MessageKey,
    SourcePartition,
}

#[derive(Debug, Clone)]
pub enum CompiledRule {
    Present {
        field: String,
    },
    NotEmpty {
        field: String,
    },
    Type {
        field: String,
        expected: ValueType,
    },
    Regex {
        field: String,
        pattern: String,
        regex: Regex,
    },
    Range {
        field: String,
        min: Option<NumericBound>,
        max: Option<NumericBound>,
    },
}

impl CompiledRule {
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Present { field }
            | Self::NotEmpty { field }
            | Self::Type { field, .. }
            | Self::Regex { field, .. }
            | Self::Range { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NumericBound {
    pub literal: String,
    pub decimal: BigDecimal,
}

impl NumericBound {
    fn from_number(number: &Number, field: &str, bound_name: &str) -> Result<Self, String> {
        let literal = number.to_string();
        let decimal = literal.parse::<BigDecimal>().map_err(|error| {
            format!("range rule for field '{field}' has invalid {bound_name} value '{literal}': {error}")
        })?;
        Ok(Self { literal, decimal })
    }
}

/// Compile rule specs into their checked form.
///
/// An empty rule list is valid: every JSON object is then accepted.
///
/// # Errors
///
/// Returns a description of the first invalid rule.
pub fn compile(specs: &[RuleSpec]) -> Result<Vec<CompiledRule>, String> {
    let mut compiled = Vec::new();
    for spec in specs {
        match spec {
            RuleSpec::Present { assert_present } => {
                assert_present.try_for_each_field(|field| {
                    compiled.push(CompiledRule::Present {
                        field: field.to_string(),
                    });
                    Ok(())
                })?;
            }
            RuleSpec::NotEmpty { assert_not_empty } => {
                assert_not_empty.try_for_each_field(|field| {
                    compiled.push(CompiledRule::NotEmpty {
                        field: field.to_string(),
                    });
                    Ok(())
                })?;
            }
            RuleSpec::Type { assert_type } => {
                if assert_type.is_empty() {
                    return Err("assert_type must name at least one field".to_string());
                }
                for (field, expected) in assert_type {
                    ensure_non_empty_field(field)?;
                    compiled.push(CompiledRule::Type {
                        field: field.clone(),
                        expected: *expected,
                    });
                }
            }
            RuleSpec::Regex { assert_regex } => {
                assert_regex.try_for_each_rule(|field, pattern| {
                    if pattern.trim().is_empty() {
                        return Err(format!("regex pattern for field '{field}' must not be empty"));
                    }
                    let regex = Regex::new(pattern)
                        .map_err(|e| format!("invalid regex pattern for field '{field}': {e}"))?;
                    compiled.push(CompiledRule::Regex {
                        field: field.to_string(),
                        pattern: pattern.to_string(),
                        regex,
                    });
                    Ok(())
                })?;
            }
            RuleSpec::Range { assert_range } => {
                assert_range.try_for_each_rule(|field, min, max| {
                    if min.is_none() && max.is_none() {
                        return Err(format!("range rule for field '{field}' must set min and/or max"));
                    }
                    let min_bound = min
                        .map(|bound| NumericBound::from_number(bound, field, "min"))
                        .transpose()?;
                    let max_bound = max
                        .map(|bound| NumericBound::from_number(bound, field, "max"))
                        .transpose()?;
                    if let (Some(minimum), Some(maximum)) = (&min_bound, &max_bound) {
                        if minimum.decimal > maximum.decimal {
                            return Err(format!(
                                "range rule for field '{field}' has min > max ({} > {})",
                                minimum.literal, maximum.literal
                            ));
                        }
                    }
                    compiled.push(CompiledRule::Range {
                        field: field.to_string(),
                        min: min_bound,
                        max: max_bound,
                    });
                    Ok(())
                })?;
            }
        }
    }
    Ok(compiled)
}

/// Check the partition key selector itself.
///
/// # Errors
///
/// Returns a description when a field selector names an empty field.
pub fn check_partition_key(spec: &PartitionKeySpec) -> Result<(), String> {
    match spec {
        PartitionKeySpec::Source(_) => Ok(()),
        PartitionKeySpec::Field { field } => ensure_non_empty_field(field),
    }
}

fn ensure_non_empty_field(field: &str) -> Result<(), String> {
    if field.trim().is_empty() {
        Err("field name must not be empty".to_string())
    } else {
        Ok(())
    }
}

impl FieldSelector {
    fn try_for_each_field(
        &self,
        mut callback: impl FnMut(&str) -> Result<(), String>,
    ) -> Result<(), String> {
        match self {
            Self::One(field) => {
                ensure_non_empty_field(field)?;
                callback(field)
            }
            Self::Many(fields) => {
                if fields.is_empty() {
                    return Err("field list must not be empty".to_string());
                }
                for field in fields {
                    ensure_non_empty_field(field)?;
                    callback(field)?;
                }
                Ok(())
            }
        }
    }
}

impl RegexSelector {
    fn try_for_each_rule(
        &self,
        mut callback: impl FnMut(&str, &str) -> Result<(), String>,
    ) -> Result<(), String> {
        match self {
            Self::One(rule) => {
                ensure_non_empty_field(&rule.field)?;
                callback(&rule.field, &rule.pattern)
            }
            Self::Many(rules) => {
                for rule in rules {
                    ensure_non_empty_field(&rule.field)?;
                    callback(&rule.field, &rule.pattern)?;
                }
                Ok(())
            }
            Self::Map(map) => {
                for (field, pattern) in map {
                    ensure_non_empty_field(field)?;
                    callback(field, pattern)?;
                }
                Ok(())
            }
        }
    }
}

impl RangeSelector {
    fn try_for_each_rule(
        &self,
        mut callback: impl FnMut(&str, Option<&Number>, Option<&Number>) -> Result<(), String>,
    ) -> Result<(), String> {
        match self {
            Self::One(rule) => {
                ensure_non_empty_field(&rule.field)?;
                callback(&rule.field, rule.min.as_ref(), rule.max.as_ref())
            }
            Self::Many(rules) => {
                for rule in rules {
                    ensure_non_empty_field(&rule.field)?;
                    callback(&rule.field, rule.min.as_ref(), rule.max.as_ref())?;
                }
                Ok(())
            }
        }
    }
}
