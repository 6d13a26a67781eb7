//! Deterministic matching of external transactions against open obligations.
//!
//! Pure: given the same obligations, transactions and policy the plan is
//! always the same. Persistence happens afterwards, one match set per
//! obligation.

use crate::config::MatchingConfig;
use crate::models::{Allocation, ExternalTransaction, MatchSet, Obligation, ObligationEvent};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchPolicy {
    pub amount_tolerance: Decimal,
    pub date_slack_days: i64,
    pub require_reference: bool,
}

impl MatchPolicy {
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            amount_tolerance: config.amount_tolerance,
            date_slack_days: config.date_slack_days,
            require_reference: config.require_reference,
        }
    }
}

/// An obligation with more than one equally good candidate. Left untouched.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbiguousMatch {
    pub obligation_id: Uuid,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MatchPlan {
    pub sets: Vec<MatchSet>,
    pub ambiguous: Vec<AmbiguousMatch>,
    /// Transactions no set consumed, in input order.
    pub unmatched: Vec<ExternalTransaction>,
}

struct Candidate<'a> {
    tx: &'a ExternalTransaction,
    distance: i64,
    reference_hit: bool,
}

fn day_distance(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}

fn obligation_reference(obligation: &Obligation) -> Option<&str> {
    obligation
        .reference
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
}

fn reference_hit(obligation: &Obligation, tx: &ExternalTransaction) -> bool {
    match (tx.reference.as_deref(), obligation_reference(obligation)) {
        (Some(paid), Some(owed)) => paid
            .to_ascii_lowercase()
            .contains(&owed.to_ascii_lowercase()),
        _ => false,
    }
}

impl MatchPolicy {
    fn within_slack(&self, obligation: &Obligation, tx: &ExternalTransaction) -> bool {
        day_distance(tx.booked_on, obligation.due_utc.date_naive()) <= self.date_slack_days
    }

    fn reference_ok(&self, obligation: &Obligation, tx: &ExternalTransaction) -> bool {
        let both_carry = tx.reference.is_some() && obligation_reference(obligation).is_some();
        if self.require_reference || both_carry {
            reference_hit(obligation, tx)
        } else {
            true
        }
    }

    fn exact_candidates<'a>(
        &self,
        obligation: &Obligation,
        transactions: &'a [ExternalTransaction],
        consumed: &HashSet<String>,
    ) -> Vec<Candidate<'a>> {
        let outstanding = obligation.outstanding();
        let mut candidates: Vec<Candidate<'a>> = transactions
            .iter()
            .filter(|tx| !consumed.contains(&tx.external_id))
            .filter(|tx| tx.amount > Decimal::ZERO)
            .filter(|tx| tx.currency.eq_ignore_ascii_case(&obligation.currency))
            .filter(|tx| (tx.amount - outstanding).abs() <= self.amount_tolerance)
            .filter(|tx| self.within_slack(obligation, tx))
            .filter(|tx| self.reference_ok(obligation, tx))
            .map(|tx| Candidate {
                tx,
                distance: day_distance(tx.booked_on, obligation.due_utc.date_naive()),
                reference_hit: reference_hit(obligation, tx),
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then(b.reference_hit.cmp(&a.reference_hit))
                .then(a.tx.external_id.cmp(&b.tx.external_id))
        });
        candidates
    }

    /// Reference-carrying transactions smaller than the outstanding amount,
    /// allocated in booking order while the sum stays within tolerance.
    fn partial_allocations(
        &self,
        obligation: &Obligation,
        transactions: &[ExternalTransaction],
        consumed: &HashSet<String>,
    ) -> Vec<Allocation> {
        if obligation_reference(obligation).is_none() {
            return Vec::new();
        }
        let outstanding = obligation.outstanding();
        let mut pieces: Vec<&ExternalTransaction> = transactions
            .iter()
            .filter(|tx| !consumed.contains(&tx.external_id))
            .filter(|tx| tx.amount > Decimal::ZERO && tx.amount < outstanding)
            .filter(|tx| tx.currency.eq_ignore_ascii_case(&obligation.currency))
            .filter(|tx| self.within_slack(obligation, tx))
            .filter(|tx| reference_hit(obligation, tx))
            .collect();
        pieces.sort_by(|a, b| {
            a.booked_on
                .cmp(&b.booked_on)
                .then(a.external_id.cmp(&b.external_id))
        });

        let ceiling = outstanding + self.amount_tolerance;
        let mut running = Decimal::ZERO;
        let mut allocations = Vec::new();
        for tx in pieces {
            if running + tx.amount <= ceiling {
                running += tx.amount;
                allocations.push(Allocation {
                    external_id: tx.external_id.clone(),
                    amount: tx.amount,
                });
            }
        }
        allocations
    }

    /// Build the match plan for one company and provider.
    pub fn plan(
        &self,
        company_id: Uuid,
        provider: &str,
        obligations: &[Obligation],
        transactions: &[ExternalTransaction],
    ) -> MatchPlan {
        let mut ordered: Vec<&Obligation> = obligations.iter().filter(|o| o.state().is_open()).collect();
        ordered.sort_by(|a, b| {
            a.due_utc
                .cmp(&b.due_utc)
                .then(a.obligation_id.cmp(&b.obligation_id))
        });

        let mut consumed: HashSet<String> = HashSet::new();
        let mut plan = MatchPlan::default();
        let mut unresolved: Vec<&Obligation> = Vec::new();

        let set_for = |obligation: &Obligation, event, allocations| MatchSet {
            obligation_id: obligation.obligation_id,
            company_id,
            provider: provider.to_string(),
            expected_state: obligation.state(),
            expected_matched: obligation.amount_matched,
            event,
            allocations,
        };

        // Pass 1: one transaction settles one obligation.
        for obligation in ordered {
            let candidates = self.exact_candidates(obligation, transactions, &consumed);
            match candidates.as_slice() {
                [] => unresolved.push(obligation),
                [best, second, ..]
                    if best.distance == second.distance
                        && best.reference_hit == second.reference_hit =>
                {
                    plan.ambiguous.push(AmbiguousMatch {
                        obligation_id: obligation.obligation_id,
                        candidates: candidates
                            .iter()
                            .take_while(|c| {
                                c.distance == best.distance && c.reference_hit == best.reference_hit
                            })
                            .map(|c| c.tx.external_id.clone())
                            .collect(),
                    });
                }
                [best, ..] => {
                    consumed.insert(best.tx.external_id.clone());
                    plan.sets.push(set_for(
                        obligation,
                        ObligationEvent::Settle,
                        vec![Allocation {
                            external_id: best.tx.external_id.clone(),
                            amount: best.tx.amount,
                        }],
                    ));
                }
            }
        }

        // Pass 2: several smaller transactions against one referenced obligation.
        for obligation in unresolved {
            let allocations = self.partial_allocations(obligation, transactions, &consumed);
            if allocations.is_empty() {
                continue;
            }
            let total: Decimal = allocations.iter().map(|a| a.amount).sum();
            let event = if (obligation.outstanding() - total).abs() <= self.amount_tolerance {
                ObligationEvent::Settle
            } else {
                ObligationEvent::PartialMatch
            };
            for allocation in &allocations {
                consumed.insert(allocation.external_id.clone());
            }
            plan.sets.push(set_for(obligation, event, allocations));
        }

        plan.unmatched = transactions
            .iter()
            .filter(|tx| !consumed.contains(&tx.external_id))
            .cloned()
            .collect();
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObligationKind, ObligationState};
    use chrono::{TimeZone, Utc};

    fn policy() -> MatchPolicy {
        MatchPolicy {
            amount_tolerance: Decimal::new(1, 2),
            date_slack_days: 5,
            require_reference: false,
        }
    }

    fn obligation(reference: &str, amount: Decimal, due_day: u32) -> Obligation {
        let now = Utc::now();
        Obligation {
            obligation_id: Uuid::new_v4(),
            company_id: Uuid::nil(),
            kind: ObligationKind::Manual.as_str().to_string(),
            reference: (!reference.is_empty()).then(|| reference.to_string()),
            amount,
            amount_matched: Decimal::ZERO,
            currency: "EUR".to_string(),
            due_utc: Utc.with_ymd_and_hms(2025, 1, due_day, 0, 0, 0).unwrap(),
            state: ObligationState::Pending.as_str().to_string(),
            settled_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn tx(id: &str, amount: Decimal, day: u32, reference: Option<&str>) -> ExternalTransaction {
        ExternalTransaction {
            company_id: Uuid::nil(),
            provider: "sepa".to_string(),
            external_id: id.to_string(),
            amount,
            currency: "EUR".to_string(),
            booked_on: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            reference: reference.map(String::from),
            counterparty: None,
        }
    }

    fn plan(obligations: &[Obligation], txs: &[ExternalTransaction]) -> MatchPlan {
        policy().plan(Uuid::nil(), "sepa", obligations, txs)
    }

    #[test]
    fn exact_amount_within_slack_settles() {
        let o = obligation("", Decimal::new(10000, 2), 10);
        let result = plan(&[o.clone()], &[tx("t1", Decimal::new(10000, 2), 12, None)]);
        assert_eq!(result.sets.len(), 1);
        assert_eq!(result.sets[0].obligation_id, o.obligation_id);
        assert_eq!(result.sets[0].event, ObligationEvent::Settle);
        assert!(result.unmatched.is_empty());
    }

    #[test]
    fn amount_outside_tolerance_stays_unmatched() {
        let o = obligation("", Decimal::new(10000, 2), 10);
        let result = plan(&[o], &[tx("t1", Decimal::new(10002, 2), 10, None)]);
        assert!(result.sets.is_empty());
        assert_eq!(result.unmatched.len(), 1);
    }

    #[test]
    fn date_outside_slack_stays_unmatched() {
        let o = obligation("", Decimal::new(10000, 2), 10);
        let result = plan(&[o], &[tx("t1", Decimal::new(10000, 2), 16, None)]);
        assert!(result.sets.is_empty());
    }

    #[test]
    fn equal_candidates_are_ambiguous() {
        let o = obligation("", Decimal::new(5000, 2), 10);
        let result = plan(
            &[o.clone()],
            &[
                tx("t1", Decimal::new(5000, 2), 12, None),
                tx("t2", Decimal::new(5000, 2), 8, None),
            ],
        );
        assert!(result.sets.is_empty());
        assert_eq!(result.ambiguous.len(), 1);
        assert_eq!(result.ambiguous[0].candidates, vec!["t1", "t2"]);
        assert_eq!(result.unmatched.len(), 2);
    }

    #[test]
    fn closer_date_breaks_the_tie() {
        let o = obligation("", Decimal::new(5000, 2), 10);
        let result = plan(
            &[o],
            &[
                tx("t1", Decimal::new(5000, 2), 13, None),
                tx("t2", Decimal::new(5000, 2), 11, None),
            ],
        );
        assert_eq!(result.sets[0].allocations[0].external_id, "t2");
        assert_eq!(result.unmatched[0].external_id, "t1");
    }

    #[test]
    fn mismatched_reference_is_not_a_candidate() {
        let o = obligation("OVG-AAAA0001", Decimal::new(5000, 2), 10);
        let result = plan(&[o], &[tx("t1", Decimal::new(5000, 2), 10, Some("OVG-BBBB0002"))]);
        assert!(result.sets.is_empty());
    }

    #[test]
    fn a_transaction_settles_at_most_one_obligation() {
        let first = obligation("", Decimal::new(5000, 2), 9);
        let second = obligation("", Decimal::new(5000, 2), 10);
        let result = plan(
            &[second.clone(), first.clone()],
            &[tx("t1", Decimal::new(5000, 2), 10, None)],
        );
        assert_eq!(result.sets.len(), 1);
        assert_eq!(result.sets[0].obligation_id, first.obligation_id);
    }

    #[test]
    fn referenced_pieces_partially_match() {
        let o = obligation("OVG-0000ABCD", Decimal::new(10000, 2), 10);
        let result = plan(
            &[o],
            &[
                tx("p1", Decimal::new(3000, 2), 9, Some("payment ovg-0000abcd 1/3")),
                tx("p2", Decimal::new(3000, 2), 11, Some("payment OVG-0000ABCD 2/3")),
            ],
        );
        assert_eq!(result.sets.len(), 1);
        assert_eq!(result.sets[0].event, ObligationEvent::PartialMatch);
        assert_eq!(result.sets[0].total(), Decimal::new(6000, 2));
    }

    #[test]
    fn referenced_pieces_that_cover_the_amount_settle() {
        let o = obligation("OVG-0000ABCD", Decimal::new(10000, 2), 10);
        let result = plan(
            &[o],
            &[
                tx("p1", Decimal::new(6000, 2), 9, Some("OVG-0000ABCD")),
                tx("p2", Decimal::new(4000, 2), 11, Some("OVG-0000ABCD")),
            ],
        );
        assert_eq!(result.sets[0].event, ObligationEvent::Settle);
        assert!(result.unmatched.is_empty());
    }

    /// Small xorshift so generated scenarios are reproducible.
    struct Scenarios(u64);

    impl Scenarios {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn pick<T: Copy>(&mut self, items: &[T]) -> T {
            items[(self.next() % items.len() as u64) as usize]
        }
    }

    #[test]
    fn planned_sets_respect_amount_bounds() {
        let references = ["", "OVG-0000AAAA", "OVG-0000BBBB"];
        let obligation_cents = [3000, 5000, 10000];
        let tx_cents = [1000, 2000, 3000, 4999, 5000, 5001, 5002, 7000, 10000];
        let tolerance = policy().amount_tolerance;
        let mut rng = Scenarios(0x9e37_79b9_7f4a_7c15);

        for round in 0..500 {
            let obligations: Vec<Obligation> = (0..1 + rng.next() % 4)
                .map(|_| {
                    let amount = Decimal::new(rng.pick(&obligation_cents), 2);
                    obligation(rng.pick(&references), amount, 8 + (rng.next() % 6) as u32)
                })
                .collect();
            let txs: Vec<ExternalTransaction> = (0..rng.next() % 7)
                .map(|i| {
                    let reference = rng.pick(&references);
                    tx(
                        &format!("t{}", i),
                        Decimal::new(rng.pick(&tx_cents), 2),
                        4 + (rng.next() % 14) as u32,
                        (!reference.is_empty()).then_some(reference),
                    )
                })
                .collect();

            let result = plan(&obligations, &txs);
            let mut seen = HashSet::new();
            for set in &result.sets {
                let owed = obligations
                    .iter()
                    .find(|o| o.obligation_id == set.obligation_id)
                    .unwrap()
                    .outstanding();
                for allocation in &set.allocations {
                    assert!(seen.insert(allocation.external_id.clone()), "round {}", round);
                }

                let exact = set.allocations.len() == 1
                    && (set.allocations[0].amount - owed).abs() <= tolerance;
                if exact {
                    assert_eq!(set.event, ObligationEvent::Settle, "round {}", round);
                } else {
                    assert!(set.total() <= owed + tolerance, "round {}", round);
                    assert!(
                        set.allocations.iter().all(|a| a.amount < owed),
                        "round {}",
                        round
                    );
                }
                if set.event == ObligationEvent::Settle {
                    assert!((set.total() - owed).abs() <= tolerance, "round {}", round);
                }
            }
            assert_eq!(seen.len() + result.unmatched.len(), txs.len(), "round {}", round);
        }
    }

    #[test]
    fn required_reference_blocks_unreferenced_transactions() {
        let mut strict = policy();
        strict.require_reference = true;
        let o = obligation("OVG-0000ABCD", Decimal::new(5000, 2), 10);
        let result = strict.plan(Uuid::nil(), "sepa", &[o], &[tx("t1", Decimal::new(5000, 2), 10, None)]);
        assert!(result.sets.is_empty());
    }
}
