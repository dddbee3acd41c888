use super::BaseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Percent of the suffrage in (0, 100] needed for a majority.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Threshold(f64);

impl Threshold {
    pub const MAX: Threshold = Threshold(100.0);

    pub fn new(percent: f64) -> Result<Self, BaseError> {
        if !percent.is_finite() || percent <= 0.0 || percent > 100.0 {
            return Err(BaseError::InvalidThreshold(percent));
        }
        Ok(Threshold(percent))
    }

    pub fn percent(self) -> f64 {
        self.0
    }

    /// ⌈total · percent / 100⌉
    pub fn required(self, total: usize) -> usize {
        ((total as f64) * self.0 / 100.0).ceil() as usize
    }

    pub fn requirement(self, total: usize) -> ThresholdRequirement {
        ThresholdRequirement {
            total,
            required: self.required(total),
            percent: self.0,
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold(67.0)
    }
}

impl TryFrom<f64> for Threshold {
    type Error = BaseError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Threshold::new(value)
    }
}

impl From<Threshold> for f64 {
    fn from(t: Threshold) -> Self {
        t.0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Encoded form of a threshold applied to a concrete suffrage size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRequirement {
    pub total: usize,
    pub required: usize,
    pub percent: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteResult {
    NotYet,
    Draw,
    Majority,
}

impl fmt::Display for VoteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteResult::NotYet => f.write_str("NOT_YET"),
            VoteResult::Draw => f.write_str("DRAW"),
            VoteResult::Majority => f.write_str("MAJORITY"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MajorityOutcome {
    NotYet,
    Draw,
    /// Index into the `counts` slice of the winning fact.
    Majority(usize),
}

impl MajorityOutcome {
    pub fn result(self) -> VoteResult {
        match self {
            MajorityOutcome::NotYet => VoteResult::NotYet,
            MajorityOutcome::Draw => VoteResult::Draw,
            MajorityOutcome::Majority(_) => VoteResult::Majority,
        }
    }
}

/// Decide the vote outcome from per-fact counts.
///
/// Nothing is decided before `required` votes are in. Then majority when
/// one count reaches `required`; draw when even every remaining voter
/// joining the leading fact could not reach it.
pub fn find_majority(total: usize, required: usize, counts: &[usize]) -> MajorityOutcome {
    if total == 0 || required == 0 {
        return MajorityOutcome::NotYet;
    }

    let voted: usize = counts.iter().sum();
    if voted < required {
        return MajorityOutcome::NotYet;
    }

    if let Some(i) = counts.iter().position(|c| *c >= required) {
        return MajorityOutcome::Majority(i);
    }

    let remaining = total.saturating_sub(voted);
    let leading = counts.iter().copied().max().unwrap_or(0);
    if leading + remaining < required {
        return MajorityOutcome::Draw;
    }

    MajorityOutcome::NotYet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_is_ceiling() {
        let t = Threshold::default();
        assert_eq!(t.required(3), 3);
        assert_eq!(t.required(4), 3);
        assert_eq!(t.required(10), 7);
        assert_eq!(Threshold::MAX.required(3), 3);
        assert_eq!(Threshold::new(50.0).unwrap().required(1), 1);
    }

    #[test]
    fn threshold_bounds() {
        assert!(Threshold::new(0.0).is_err());
        assert!(Threshold::new(100.1).is_err());
        assert!(Threshold::new(f64::NAN).is_err());
        assert!(serde_json::from_str::<Threshold>("150").is_err());
        let t: Threshold = serde_json::from_str("67").unwrap();
        assert_eq!(t.requirement(4).required, 3);
    }

    #[test]
    fn outcomes() {
        assert_eq!(find_majority(3, 3, &[3]), MajorityOutcome::Majority(0));
        assert_eq!(find_majority(3, 3, &[1, 1, 1]), MajorityOutcome::Draw);
        assert_eq!(find_majority(3, 3, &[2]), MajorityOutcome::NotYet);
        assert_eq!(find_majority(4, 3, &[2, 1]), MajorityOutcome::NotYet);
        assert_eq!(find_majority(4, 3, &[2, 2]), MajorityOutcome::Draw);
        assert_eq!(find_majority(4, 3, &[1, 3]), MajorityOutcome::Majority(1));
    }

    #[test]
    fn no_draw_below_required_votes() {
        assert_eq!(find_majority(3, 3, &[1, 1]), MajorityOutcome::NotYet);
        assert_eq!(find_majority(5, 4, &[1, 1, 1]), MajorityOutcome::NotYet);
        assert_eq!(find_majority(5, 4, &[1, 1, 1, 1]), MajorityOutcome::Draw);
    }
}
