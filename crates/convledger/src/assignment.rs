//! Bot-type assignment for new participants.

use std::collections::BTreeMap;

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::BotType;
use crate::storage::Ledger;

/// How a new participant's condition is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// The least-assigned condition; ties broken at random.
    #[default]
    EqualDistribution,
    /// Uniformly random.
    Random,
    /// Round robin by number of participants so far.
    Sequential,
}

impl std::fmt::Display for AssignmentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EqualDistribution => write!(f, "equal_distribution"),
            Self::Random => write!(f, "random"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Pick a bot type for the next participant.
///
/// The counts are read outside any write transaction, so two front-ends
/// calling this at once may pick the same condition. Use
/// [`Ledger::open_assigned_session`] to assign and open atomically.
///
/// # Errors
///
/// Returns an error if the current assignment counts cannot be read.
pub fn assign_bot_type<R: Rng + ?Sized>(
    ledger: &Ledger,
    strategy: AssignmentStrategy,
    rng: &mut R,
) -> Result<BotType> {
    choose_bot_type(&ledger.bot_type_counts()?, strategy, rng)
}

/// Pick a bot type given the number of participants per condition.
pub(crate) fn choose_bot_type<R: Rng + ?Sized>(
    counts: &BTreeMap<BotType, i64>,
    strategy: AssignmentStrategy,
    rng: &mut R,
) -> Result<BotType> {
    let bot_type = match strategy {
        AssignmentStrategy::EqualDistribution => {
            let least = counts.values().copied().min().unwrap_or(0);
            let candidates: Vec<BotType> = BotType::ALL
                .iter()
                .copied()
                .filter(|bot_type| counts.get(bot_type).copied().unwrap_or(0) == least)
                .collect();
            candidates.choose(rng).copied()
        }
        AssignmentStrategy::Random => BotType::ALL.choose(rng).copied(),
        AssignmentStrategy::Sequential => {
            let total: i64 = counts.values().sum();
            let len = i64::try_from(BotType::ALL.len()).unwrap_or(i64::MAX);
            usize::try_from(total.rem_euclid(len))
                .ok()
                .and_then(|index| BotType::ALL.get(index).copied())
        }
    };

    let bot_type =
        bot_type.ok_or_else(|| Error::internal("no bot type available for assignment"))?;
    debug!(%strategy, %bot_type, "Assigned bot type");
    Ok(bot_type)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn create_test_ledger() -> Ledger {
        Ledger::open_in_memory().expect("failed to create test ledger")
    }

    #[test]
    fn test_sequential_round_robin() {
        let mut ledger = create_test_ledger();
        let mut rng = StdRng::seed_from_u64(7);

        let mut assigned = Vec::new();
        for _ in 0..6 {
            let bot_type =
                assign_bot_type(&ledger, AssignmentStrategy::Sequential, &mut rng).unwrap();
            ledger.open_session(bot_type).unwrap();
            assigned.push(bot_type);
        }

        assert_eq!(
            assigned,
            vec![
                BotType::Emotional,
                BotType::Cognitive,
                BotType::Motivational,
                BotType::Neutral,
                BotType::Emotional,
                BotType::Cognitive,
            ]
        );
    }

    #[test]
    fn test_equal_distribution_stays_balanced() {
        let mut ledger = create_test_ledger();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..12 {
            let bot_type =
                assign_bot_type(&ledger, AssignmentStrategy::EqualDistribution, &mut rng)
                    .unwrap();
            ledger.open_session(bot_type).unwrap();
        }

        let counts = ledger.bot_type_counts().unwrap();
        assert!(counts.values().all(|count| *count == 3));
    }

    #[test]
    fn test_equal_distribution_picks_least_assigned() {
        let mut ledger = create_test_ledger();
        let mut rng = StdRng::seed_from_u64(1);
        for bot_type in [BotType::Emotional, BotType::Cognitive, BotType::Motivational] {
            ledger.open_session(bot_type).unwrap();
        }

        let bot_type =
            assign_bot_type(&ledger, AssignmentStrategy::EqualDistribution, &mut rng).unwrap();
        assert_eq!(bot_type, BotType::Neutral);
    }

    #[test]
    fn test_random_covers_all_types() {
        let ledger = create_test_ledger();
        let mut rng = StdRng::seed_from_u64(99);

        let seen: HashSet<BotType> = (0..200)
            .map(|_| assign_bot_type(&ledger, AssignmentStrategy::Random, &mut rng).unwrap())
            .collect();
        assert_eq!(seen.len(), BotType::ALL.len());
    }

    #[test]
    fn test_choose_from_counts() {
        let mut rng = StdRng::seed_from_u64(3);
        let counts: BTreeMap<BotType, i64> = [
            (BotType::Emotional, 2),
            (BotType::Cognitive, 1),
            (BotType::Motivational, 2),
            (BotType::Neutral, 2),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            choose_bot_type(&counts, AssignmentStrategy::EqualDistribution, &mut rng).unwrap(),
            BotType::Cognitive
        );
        // Seven participants so far: the eighth goes to the fourth condition
        assert_eq!(
            choose_bot_type(&counts, AssignmentStrategy::Sequential, &mut rng).unwrap(),
            BotType::Neutral
        );
    }

    #[test]
    fn test_open_assigned_session_balances() {
        let mut ledger = create_test_ledger();
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..8 {
            ledger
                .open_assigned_session(AssignmentStrategy::EqualDistribution, &mut rng, None)
                .unwrap();
        }

        let counts = ledger.bot_type_counts().unwrap();
        assert!(counts.values().all(|count| *count == 2));
    }

    #[test]
    fn test_open_assigned_session_attaches_external_id() {
        let mut ledger = create_test_ledger();
        let mut rng = StdRng::seed_from_u64(5);

        let participant = ledger
            .open_assigned_session(
                AssignmentStrategy::Sequential,
                &mut rng,
                Some("prolific-77".to_string()),
            )
            .unwrap();

        assert_eq!(participant.bot_type, BotType::Emotional);
        assert_eq!(participant.external_id.as_deref(), Some("prolific-77"));
    }

    #[test]
    fn test_strategy_serde() {
        let json = serde_json::to_string(&AssignmentStrategy::EqualDistribution).unwrap();
        assert_eq!(json, "\"equal_distribution\"");
        let parsed: AssignmentStrategy = serde_json::from_str("\"random\"").unwrap();
        assert_eq!(parsed, AssignmentStrategy::Random);
        assert_eq!(AssignmentStrategy::Sequential.to_string(), "sequential");
    }
}
