//! Join barriers and the arrival rules.
//!
//! A split *activates* its join: the barrier's activation number goes up,
//! its arrival count resets, and the instance records how many arrivals the
//! activation expects. Each forked fiber carries a [`JoinTicket`] for that
//! activation and spends it on arrival. Tickets from an older activation are
//! stale and never count.

use serde::{Deserialize, Serialize};
use weft_core::NodeKey;

use crate::error::ExecutionError;
use crate::fiber::JoinTicket;
use crate::state::InstanceState;

/// Arrival count of one join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinBarrier {
    /// The converging gateway.
    pub join: NodeKey,
    /// Current activation, starting at 1.
    pub activation: u64,
    /// Arrivals recorded for the current activation.
    pub arrived: u32,
}

/// Result of spending a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// More siblings are still outstanding.
    Waiting {
        /// Arrivals so far, this one included.
        arrived: u32,
        /// Arrivals expected.
        expected: u32,
    },
    /// This was the last expected arrival.
    Satisfied {
        /// The activation that completed.
        activation: u64,
    },
    /// The ticket belongs to a superseded or finished activation.
    Stale,
}

impl InstanceState {
    /// Start a new activation of `join` expecting `expected` arrivals.
    pub fn activate_join(&mut self, join: &NodeKey, expected: u32) -> u64 {
        let activation = self.barriers.get(join).map_or(1, |b| b.activation + 1);
        self.barriers.insert(
            join.clone(),
            JoinBarrier {
                join: join.clone(),
                activation,
                arrived: 0,
            },
        );
        self.instance.join_expected.insert(join.clone(), expected);
        activation
    }

    /// Record an arrival. Strictly additive; satisfied exactly once per
    /// activation.
    pub fn arrive(&mut self, ticket: &JoinTicket) -> Result<Arrival, ExecutionError> {
        let Some(barrier) = self.barriers.get_mut(&ticket.join) else {
            return Ok(Arrival::Stale);
        };
        if barrier.activation != ticket.activation {
            return Ok(Arrival::Stale);
        }
        let Some(&expected) = self.instance.join_expected.get(&ticket.join) else {
            return Ok(Arrival::Stale);
        };
        if barrier.arrived >= expected {
            return Err(ExecutionError::JoinOverflow {
                join: ticket.join.to_string(),
                arrived: barrier.arrived,
                expected,
            });
        }
        barrier.arrived += 1;
        if barrier.arrived == expected {
            self.instance.join_expected.remove(&ticket.join);
            Ok(Arrival::Satisfied {
                activation: barrier.activation,
            })
        } else {
            Ok(Arrival::Waiting {
                arrived: barrier.arrived,
                expected,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ProcessInstance;
    use chrono::Utc;
    use proptest::prelude::*;
    use weft_bytecode::ProgramHash;
    use weft_core::InstanceId;

    fn state() -> InstanceState {
        InstanceState::new(
            ProcessInstance::new(
                InstanceId::new(),
                ProgramHash::parse(&"0".repeat(64)).unwrap(),
                serde_json::Value::Null,
                "c",
                Utc::now(),
            )
            .unwrap(),
        )
    }

    fn join() -> NodeKey {
        NodeKey::new("merge").unwrap()
    }

    #[test]
    fn satisfied_after_exactly_n_arrivals() {
        let mut s = state();
        let activation = s.activate_join(&join(), 3);
        let ticket = JoinTicket {
            join: join(),
            activation,
        };
        assert_eq!(s.arrive(&ticket).unwrap(), Arrival::Waiting { arrived: 1, expected: 3 });
        assert_eq!(s.arrive(&ticket).unwrap(), Arrival::Waiting { arrived: 2, expected: 3 });
        assert_eq!(s.arrive(&ticket).unwrap(), Arrival::Satisfied { activation });
        assert!(s.instance.join_expected.is_empty());
        // Further arrivals for a finished activation are stale.
        assert_eq!(s.arrive(&ticket).unwrap(), Arrival::Stale);
    }

    #[test]
    fn reactivation_makes_old_tickets_stale() {
        let mut s = state();
        let first = s.activate_join(&join(), 2);
        let old = JoinTicket {
            join: join(),
            activation: first,
        };
        s.arrive(&old).unwrap();
        let second = s.activate_join(&join(), 2);
        assert_eq!(second, first + 1);
        assert_eq!(s.arrive(&old).unwrap(), Arrival::Stale);
        assert_eq!(s.barriers[&join()].arrived, 0);
    }

    #[test]
    fn unknown_join_is_stale() {
        let mut s = state();
        let ticket = JoinTicket {
            join: join(),
            activation: 1,
        };
        assert_eq!(s.arrive(&ticket).unwrap(), Arrival::Stale);
    }

    proptest! {
        #[test]
        fn never_exceeds_expected(expected in 1_u32..16, extra in 0_u32..4) {
            let mut s = state();
            let activation = s.activate_join(&join(), expected);
            let ticket = JoinTicket { join: join(), activation };
            let mut satisfied = 0;
            for i in 1..=expected + extra {
                let arrival = s.arrive(&ticket).unwrap();
                if i < expected {
                    prop_assert_eq!(arrival, Arrival::Waiting { arrived: i, expected });
                } else if i == expected {
                    prop_assert_eq!(arrival, Arrival::Satisfied { activation });
                    satisfied += 1;
                } else {
                    prop_assert_eq!(arrival, Arrival::Stale);
                }
                prop_assert!(s.barriers[&join()].arrived <= expected);
            }
            prop_assert_eq!(satisfied, 1);
        }
    }
}
