//! Condition Evaluation
//!
//! Evaluates the boolean expressions carried by `if-condition` and
//! `while-condition` steps.
//!
//! Expressions are STIX-style comparisons with exactly three space-separated
//! parts: `<lhs> <operator> <rhs>`. The left operand normally references a
//! variable (`__ip__:value IN 10.0.0.0/8`) and the type of that variable
//! selects how both operands are compared.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use log::{debug, warn};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use super::variables::{variable_type, Variables};

/// Errors raised while evaluating a condition expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("comparisons can only contain 3 parts as per STIX specification: '{0}'")]
    Malformed(String),

    #[error("operator: {operator} not valid or implemented for type '{var_type}'")]
    UnsupportedOperator { operator: String, var_type: String },

    #[error("variable type '{0}' cannot be compared")]
    UnknownType(String),

    #[error("'{value}' is not a valid {expected}")]
    InvalidOperand { value: String, expected: &'static str },
}

/// Evaluates a boolean expression over a variable scope.
///
/// The engine holds this behind an `Arc<dyn ConditionEvaluator>` so tests
/// can substitute a deterministic stub.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<bool, ConditionError>;
}

/// Comparison operators understood by [`StixComparison`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    Greater,
    Less,
    LessOrEqual,
    GreaterOrEqual,
    In,
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            ">" => Ok(Self::Greater),
            "<" => Ok(Self::Less),
            "<=" => Ok(Self::LessOrEqual),
            ">=" => Ok(Self::GreaterOrEqual),
            "IN" => Ok(Self::In),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Greater => ">",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::GreaterOrEqual => ">=",
            Self::In => "IN",
        };
        f.write_str(symbol)
    }
}

/// The default evaluator: typed STIX comparison expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StixComparison;

impl StixComparison {
    pub fn new() -> Self {
        Self
    }
}

impl ConditionEvaluator for StixComparison {
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<bool, ConditionError> {
        let parts: Vec<&str> = expression.trim().split(' ').collect();
        if parts.len() != 3 {
            return Err(ConditionError::Malformed(expression.to_string()));
        }

        // Without a referenced variable both sides are plain strings.
        let var_type = variables
            .referenced_in(parts[0])
            .map(|v| v.var_type.clone())
            .unwrap_or_else(|| variable_type::STRING.to_string());

        let lhs = variables.interpolate(parts[0]);
        let rhs = variables.interpolate(parts[2]);
        let rhs = unwrap_quotes(&rhs);

        let operator: Operator =
            parts[1]
                .parse()
                .map_err(|operator| ConditionError::UnsupportedOperator {
                    operator,
                    var_type: var_type.clone(),
                })?;

        debug!("Evaluating '{}' {} '{}' as {}", lhs, operator, rhs, var_type);

        let unsupported = || ConditionError::UnsupportedOperator {
            operator: operator.to_string(),
            var_type: var_type.clone(),
        };

        match var_type.as_str() {
            variable_type::STRING | variable_type::HEX_STRING => {
                compare_strings(&lhs, operator, rhs).ok_or_else(unsupported)
            }
            variable_type::INTEGER | variable_type::LONG => {
                let lhs: i64 = parse_operand(&lhs, "integer")?;
                let rhs: i64 = parse_operand(rhs, "integer")?;
                compare_ordered(&lhs, operator, &rhs).ok_or_else(unsupported)
            }
            variable_type::FLOAT => {
                let lhs: f64 = parse_operand(&lhs, "float")?;
                let rhs: f64 = parse_operand(rhs, "float")?;
                compare_ordered(&lhs, operator, &rhs).ok_or_else(unsupported)
            }
            variable_type::BOOL => {
                let lhs = parse_bool(&lhs)?;
                let rhs = parse_bool(rhs)?;
                compare_equality(&lhs, operator, &rhs).ok_or_else(unsupported)
            }
            variable_type::IPV4_ADDRESS | variable_type::IPV6_ADDRESS => {
                compare_ip(&lhs, operator, rhs)?.ok_or_else(unsupported)
            }
            variable_type::MAC_ADDRESS => {
                let lhs = normalize_mac(&lhs)?;
                let rhs = normalize_mac(rhs)?;
                compare_strings(&lhs, operator, &rhs).ok_or_else(unsupported)
            }
            variable_type::HASH | variable_type::MD5_HASH | variable_type::SHA256_HASH => {
                if lhs.len() != rhs.len() {
                    warn!("Hash lengths do not match: {} vs {}", lhs.len(), rhs.len());
                }
                compare_strings(&lhs, operator, rhs).ok_or_else(unsupported)
            }
            variable_type::URI => {
                let lhs = parse_url(&lhs)?;
                let rhs = parse_url(rhs)?;
                compare_equality(&lhs.as_str(), operator, &rhs.as_str()).ok_or_else(unsupported)
            }
            variable_type::UUID => {
                let lhs = parse_uuid(&lhs)?;
                let rhs = parse_uuid(rhs)?;
                compare_equality(&lhs, operator, &rhs).ok_or_else(unsupported)
            }
            other => Err(ConditionError::UnknownType(other.to_string())),
        }
    }
}

fn unwrap_quotes(value: &str) -> &str {
    let value = value.strip_prefix('\'').unwrap_or(value);
    value.strip_suffix('\'').unwrap_or(value)
}

fn compare_strings(lhs: &str, operator: Operator, rhs: &str) -> Option<bool> {
    match operator {
        Operator::In => Some(lhs.contains(rhs)),
        _ => compare_ordered(lhs, operator, rhs),
    }
}

fn compare_ordered<T: PartialOrd + ?Sized>(lhs: &T, operator: Operator, rhs: &T) -> Option<bool> {
    let ordering = lhs.partial_cmp(rhs);
    match operator {
        Operator::Equal => Some(ordering == Some(Ordering::Equal)),
        Operator::NotEqual => Some(ordering != Some(Ordering::Equal)),
        Operator::Greater => Some(ordering == Some(Ordering::Greater)),
        Operator::Less => Some(ordering == Some(Ordering::Less)),
        Operator::LessOrEqual => Some(matches!(
            ordering,
            Some(Ordering::Less | Ordering::Equal)
        )),
        Operator::GreaterOrEqual => Some(matches!(
            ordering,
            Some(Ordering::Greater | Ordering::Equal)
        )),
        Operator::In => None,
    }
}

fn compare_equality<T: PartialEq + ?Sized>(lhs: &T, operator: Operator, rhs: &T) -> Option<bool> {
    match operator {
        Operator::Equal => Some(lhs == rhs),
        Operator::NotEqual => Some(lhs != rhs),
        _ => None,
    }
}

fn compare_ip(lhs: &str, operator: Operator, rhs: &str) -> Result<Option<bool>, ConditionError> {
    let address: IpAddr = parse_operand(lhs, "IP address")?;

    if operator == Operator::In {
        let network: IpNetwork = parse_operand(rhs, "CIDR network")?;
        return Ok(Some(network.contains(address)));
    }

    let other: IpAddr = parse_operand(rhs, "IP address")?;
    Ok(compare_equality(&address, operator, &other))
}

fn parse_operand<T: FromStr>(value: &str, expected: &'static str) -> Result<T, ConditionError> {
    value.parse().map_err(|_| ConditionError::InvalidOperand {
        value: value.to_string(),
        expected,
    })
}

fn parse_bool(value: &str) -> Result<bool, ConditionError> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(ConditionError::InvalidOperand {
            value: value.to_string(),
            expected: "boolean",
        }),
    }
}

fn parse_url(value: &str) -> Result<Url, ConditionError> {
    Url::parse(value).map_err(|_| ConditionError::InvalidOperand {
        value: value.to_string(),
        expected: "URI",
    })
}

fn parse_uuid(value: &str) -> Result<Uuid, ConditionError> {
    Uuid::parse_str(value).map_err(|_| ConditionError::InvalidOperand {
        value: value.to_string(),
        expected: "UUID",
    })
}

/// Normalizes a MAC address to lowercase colon-separated octets.
///
/// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and `aabb.ccdd.eeff`.
fn normalize_mac(value: &str) -> Result<String, ConditionError> {
    let invalid = || ConditionError::InvalidOperand {
        value: value.to_string(),
        expected: "MAC address",
    };

    let hex: String = if value.contains('.') {
        let groups: Vec<&str> = value.split('.').collect();
        if groups.len() != 3 || groups.iter().any(|g| g.len() != 4) {
            return Err(invalid());
        }
        groups.concat()
    } else {
        let octets: Vec<&str> = value.split(|c| c == ':' || c == '-').collect();
        if octets.len() != 6 || octets.iter().any(|o| o.len() != 2) {
            return Err(invalid());
        }
        octets.concat()
    };

    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let hex = hex.to_ascii_lowercase();
    let octets: Vec<&str> = (0..hex.len())
        .step_by(2)
        .map(|i| &hex[i..i + 2])
        .collect();
    Ok(octets.join(":"))
}
