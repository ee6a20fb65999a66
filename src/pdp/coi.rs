//! Community-of-interest checks

use crate::config::CoiExclusion;
use crate::policy::{CoiOperator, CoiRequirement};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Why a subject's COI set fails a label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CoiFailure {
    /// all-of requirement with communities the subject lacks
    Missing { missing: Vec<String> },
    /// any-of requirement and the subject holds none
    NoneHeld { required: Vec<String> },
    /// Subject holds two mutually exclusive communities
    Incoherent { first: String, second: String },
}

/// Test `held` against a label's requirement; an empty requirement always passes
pub fn check_requirement(
    held: &BTreeSet<String>,
    requirement: &CoiRequirement,
) -> Result<(), CoiFailure> {
    if requirement.is_empty() {
        return Ok(());
    }
    match requirement.operator {
        CoiOperator::AllOf => {
            let missing: Vec<String> = requirement
                .communities
                .difference(held)
                .cloned()
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(CoiFailure::Missing { missing })
            }
        }
        CoiOperator::AnyOf => {
            if requirement.communities.is_disjoint(held) {
                Err(CoiFailure::NoneHeld {
                    required: requirement.communities.iter().cloned().collect(),
                })
            } else {
                Ok(())
            }
        }
    }
}

/// First mutually exclusive pair in `held`, names in sorted order
pub fn find_incoherent(
    held: &BTreeSet<String>,
    exclusions: &[CoiExclusion],
) -> Option<CoiFailure> {
    for exclusion in exclusions {
        if held.contains(&exclusion.coi) {
            if let Some(other) = exclusion.excludes.iter().find(|c| held.contains(*c)) {
                let (first, second) = ordered(&exclusion.coi, other);
                return Some(CoiFailure::Incoherent { first, second });
            }
        }
    }
    None
}

fn ordered(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}
