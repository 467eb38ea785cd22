//! Record validation: raw queue message in, [`DomainEvent`] or [`Rejection`] out.

pub mod rules;

use serde_json::{Map, Value};
use streambridge_types::error::{Rejection, RejectionKind};
use streambridge_types::message::{DomainEvent, RawMessage};

use crate::config::types::ValidationConfig;
use rules::{CompiledRule, PartitionKeySource, PartitionKeySpec, MAX_PARTITION_KEY_CHARS};

/// Stateless, reusable validator built once per pipeline run.
#[derive(Debug, Clone)]
pub struct RecordValidator {
    rules: Vec<CompiledRule>,
    partition_key: PartitionKeySpec,
}

struct RuleFailure {
    kind: RejectionKind,
    message: String,
}

impl RecordValidator {
    /// Compile the configured rules.
    ///
    /// # Errors
    ///
    /// Returns a description of the first rule or key selector that does not compile.
    pub fn from_config(config: &ValidationConfig) -> Result<Self, String> {
        rules::check_partition_key(&config.partition_key)?;
        Ok(Self {
            rules: rules::compile(&config.rules)?,
            partition_key: config.partition_key.clone(),
        })
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Decode and check one message.
    ///
    /// Every failing rule is reported, not just the first. The rejection kind
    /// is `schema` when any shape rule failed and `constraint` otherwise.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] carrying the message's source position.
    pub fn validate(&self, message: &RawMessage) -> Result<DomainEvent, Rejection> {
        let position = message.position();
        let decoded: Value = serde_json::from_slice(&message.payload).map_err(|e| {
            Rejection::new(position, RejectionKind::Decode, format!("invalid JSON: {e}"))
        })?;

        let Value::Object(fields) = decoded else {
            return Err(Rejection::new(
                position,
                RejectionKind::Schema,
                format!("expected a JSON object, got {}", json_kind(&decoded)),
            ));
        };

        let mut failures: Vec<RuleFailure> = self
            .rules
            .iter()
            .filter_map(|rule| evaluate_rule(rule, &fields))
            .collect();

        let key = match self.derive_partition_key(message, &fields) {
            Ok(key) => Some(key),
            Err(failure) => {
                failures.push(failure);
                None
            }
        };

        if let Some(key) = key.filter(|_| failures.is_empty()) {
            return DomainEvent::new(position, fields, key).map_err(|e| {
                Rejection::new(position, RejectionKind::Decode, format!("re-encode failed: {e}"))
            });
        }

        let kind = if failures.iter().any(|f| f.kind == RejectionKind::Schema) {
            RejectionKind::Schema
        } else {
            RejectionKind::Constraint
        };
        Err(Rejection {
            position,
            kind,
            reasons: failures.into_iter().map(|f| f.message).collect(),
        })
    }

    fn derive_partition_key(
        &self,
        message: &RawMessage,
        fields: &Map<String, Value>,
    ) -> Result<String, RuleFailure> {
        let key = match &self.partition_key {
            PartitionKeySpec::Source(PartitionKeySource::SourcePartition) => {
                message.partition.to_string()
            }
            PartitionKeySpec::Source(PartitionKeySource::MessageKey) => match &message.key {
                Some(raw) => String::from_utf8(raw.to_vec()).map_err(|_| {
                    constraint("partition key: message key is not valid UTF-8".to_string())
                })?,
                None => message.partition.to_string(),
            },
            PartitionKeySpec::Field { field } => match lookup(fields, field) {
                Some(Value::String(s)) => s.clone(),
                Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
                Some(Value::Null) | None => {
                    return Err(constraint(format!(
                        "partition key: field '{field}' is missing or null"
                    )))
                }
                Some(other) => {
                    return Err(constraint(format!(
                        "partition key: field '{field}' is {}, expected a scalar",
                        json_kind(other)
                    )))
                }
            },
        };

        let chars = key.chars().count();
        if chars == 0 || chars > MAX_PARTITION_KEY_CHARS {
            return Err(constraint(format!(
                "partition key must be 1..={MAX_PARTITION_KEY_CHARS} characters, got {chars}"
            )));
        }
        Ok(key)
    }
}

fn constraint(message: String) -> RuleFailure {
    RuleFailure {
        kind: RejectionKind::Constraint,
        message,
    }
}

fn schema(message: String) -> RuleFailure {
    RuleFailure {
        kind: RejectionKind::Schema,
        message,
    }
}

/// Resolve a dotted field path (`customer.id`) inside a JSON object.
fn lookup<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = fields.get(path) {
        return Some(value);
    }
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Constraint rules (`not_empty`, `regex`, `range`) only inspect fields that
/// are present and non-null; pair them with `assert_present` to require the field.
fn evaluate_rule(rule: &CompiledRule, fields: &Map<String, Value>) -> Option<RuleFailure> {
    let value = lookup(fields, rule.field()).filter(|v| !v.is_null());
    match rule {
        CompiledRule::Present { field } => value
            .is_none()
            .then(|| schema(format!("assert_present({field}) failed: field is missing or null"))),
        CompiledRule::Type { field, expected } => {
            let value = value?;
            (!expected.matches(value)).then(|| {
                schema(format!(
                    "assert_type({field}) failed: expected {expected}, got {}",
                    json_kind(value)
                ))
            })
        }
        CompiledRule::NotEmpty { field } => {
            let empty = match value? {
                Value::String(s) => s.trim().is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                _ => false,
            };
            empty.then(|| constraint(format!("assert_not_empty({field}) failed: value is empty")))
        }
        CompiledRule::Regex {
            field,
            pattern,
            regex,
        } => match value? {
            Value::String(s) if regex.is_match(s) => None,
            Value::String(_) => Some(constraint(format!(
                "assert_regex({field}) failed: value does not match /{pattern}/"
            ))),
            other => Some(constraint(format!(
                "assert_regex({field}) failed: expected string, got {}",
                json_kind(other)
            ))),
        },
        CompiledRule::Range { field, min, max } => {
            let value = value?;
            let Some(decimal) = value
                .as_number()
                .and_then(|n| n.to_string().parse::<bigdecimal::BigDecimal>().ok())
            else {
                return Some(constraint(format!(
                    "assert_range({field}) failed: expected number, got {}",
                    json_kind(value)
                )));
            };
            if let Some(minimum) = min {
                if decimal < minimum.decimal {
                    return Some(constraint(format!(
                        "assert_range({field}) failed: {decimal} < min {}",
                        minimum.literal
                    )));
                }
            }
            if let Some(maximum) = max {
                if decimal > maximum.decimal {
                    return Some(constraint(format!(
                        "assert_range({field}) failed: {decimal} > max {}",
                        maximum.literal
                    )));
                }
            }
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
