//! Flow conditions over an instance's flags and counters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use weft_core::Value;

/// A boolean expression guarding a conditional flow.
///
/// Missing flags read as `Bool(false)` and missing counters as `0`, both
/// here and in the VM.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// The flag is truthy.
    Flag {
        /// Flag name.
        flag: String,
    },
    /// The flag equals a constant.
    Equals {
        /// Flag name.
        flag: String,
        /// Expected value.
        value: Value,
    },
    /// A loop counter is strictly below a limit.
    CounterBelow {
        /// Counter name (the loop header's node id).
        counter: String,
        /// Exclusive upper bound.
        limit: i64,
    },
    /// Negation.
    Not {
        /// The negated condition.
        condition: Box<Condition>,
    },
    /// Conjunction; empty is `true`.
    All {
        /// Operands.
        conditions: Vec<Condition>,
    },
    /// Disjunction; empty is `false`.
    Any {
        /// Operands.
        conditions: Vec<Condition>,
    },
}

impl Condition {
    /// `flag` is truthy.
    #[must_use]
    pub fn flag(flag: impl Into<String>) -> Self {
        Self::Flag { flag: flag.into() }
    }

    /// `flag == value`.
    #[must_use]
    pub fn equals(flag: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            flag: flag.into(),
            value: value.into(),
        }
    }

    /// `counter < limit`.
    #[must_use]
    pub fn counter_below(counter: impl Into<String>, limit: i64) -> Self {
        Self::CounterBelow {
            counter: counter.into(),
            limit,
        }
    }

    /// Logical negation of `self`.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not {
            condition: Box::new(self),
        }
    }

    /// Conjunction of `conditions`.
    #[must_use]
    pub fn all(conditions: Vec<Self>) -> Self {
        Self::All { conditions }
    }

    /// Disjunction of `conditions`.
    #[must_use]
    pub fn any(conditions: Vec<Self>) -> Self {
        Self::Any { conditions }
    }

    /// Evaluate against a flag set and counters.
    #[must_use]
    pub fn evaluate(&self, flags: &BTreeMap<String, Value>, counters: &BTreeMap<String, i64>) -> bool {
        match self {
            Self::Flag { flag } => flags.get(flag).is_some_and(Value::is_truthy),
            Self::Equals { flag, value } => flags.get(flag).cloned().unwrap_or_default() == *value,
            Self::CounterBelow { counter, limit } => {
                counters.get(counter).copied().unwrap_or(0) < *limit
            }
            Self::Not { condition } => !condition.evaluate(flags, counters),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(flags, counters)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(flags, counters)),
        }
    }

    /// Every constant each referenced flag is compared against. Flags used
    /// only for truthiness map to an empty set.
    pub(crate) fn collect_flags(&self, out: &mut BTreeMap<String, BTreeSet<Value>>) {
        match self {
            Self::Flag { flag } => {
                out.entry(flag.clone()).or_default();
            }
            Self::Equals { flag, value } => {
                out.entry(flag.clone()).or_default().insert(value.clone());
            }
            Self::CounterBelow { .. } => {}
            Self::Not { condition } => condition.collect_flags(out),
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.collect_flags(out);
                }
            }
        }
    }

    /// Every limit each referenced counter is compared against.
    pub(crate) fn collect_counters(&self, out: &mut BTreeMap<String, BTreeSet<i64>>) {
        match self {
            Self::CounterBelow { counter, limit } => {
                out.entry(counter.clone()).or_default().insert(*limit);
            }
            Self::Flag { .. } | Self::Equals { .. } => {}
            Self::Not { condition } => condition.collect_counters(out),
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.collect_counters(out);
                }
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Condition], sep: &str) -> fmt::Result {
            write!(f, "(")?;
            for (i, c) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {sep} ")?;
                }
                write!(f, "{c}")?;
            }
            write!(f, ")")
        }
        match self {
            Self::Flag { flag } => write!(f, "{flag}"),
            Self::Equals { flag, value } => write!(f, "{flag} == {value:?}"),
            Self::CounterBelow { counter, limit } => write!(f, "#{counter} < {limit}"),
            Self::Not { condition } => write!(f, "!{condition}"),
            Self::All { conditions } if conditions.is_empty() => write!(f, "true"),
            Self::Any { conditions } if conditions.is_empty() => write!(f, "false"),
            Self::All { conditions } => join(f, conditions, "&&"),
            Self::Any { conditions } => join(f, conditions, "||"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn flags(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[rstest]
    #[case(Condition::flag("x"), true)]
    #[case(Condition::flag("missing"), false)]
    #[case(Condition::equals("tier", "gold"), true)]
    #[case(Condition::equals("tier", "silver"), false)]
    #[case(Condition::equals("missing", false), true)]
    #[case(Condition::flag("x").negate(), false)]
    #[case(Condition::all(vec![]), true)]
    #[case(Condition::any(vec![]), false)]
    #[case(Condition::any(vec![Condition::flag("missing"), Condition::flag("x")]), true)]
    fn evaluates(#[case] condition: Condition, #[case] expected: bool) {
        let flags = flags(&[("x", Value::Bool(true)), ("tier", Value::from("gold"))]);
        assert_eq!(condition.evaluate(&flags, &BTreeMap::new()), expected);
    }

    #[test]
    fn counter_defaults_to_zero() {
        let c = Condition::counter_below("loop", 1);
        assert!(c.evaluate(&BTreeMap::new(), &BTreeMap::new()));
        let counters = BTreeMap::from([("loop".to_owned(), 1)]);
        assert!(!c.evaluate(&BTreeMap::new(), &counters));
    }

    #[test]
    fn collects_referenced_flags() {
        let c = Condition::all(vec![
            Condition::equals("a", 1),
            Condition::flag("b").negate(),
            Condition::counter_below("n", 3),
        ]);
        let mut out = BTreeMap::new();
        c.collect_flags(&mut out);
        assert_eq!(out.len(), 2);
        assert!(out["a"].contains(&Value::Int(1)));
        assert!(out["b"].is_empty());
    }

    #[test]
    fn display_is_readable() {
        let c = Condition::any(vec![Condition::flag("a"), Condition::equals("b", 2)]);
        assert_eq!(c.to_string(), "(a || b == Int(2))");
    }

    #[test]
    fn serde_tagged_by_op() {
        let c: Condition = serde_json::from_str(r#"{"op":"equals","flag":"x","value":true}"#).unwrap();
        assert_eq!(c, Condition::equals("x", true));
    }
}
