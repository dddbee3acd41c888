use super::BaseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height. `NIL` (-1) means "no block yet".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Height(i64);

impl Height {
    pub const NIL: Height = Height(-1);
    pub const GENESIS: Height = Height(0);

    pub const fn new(h: i64) -> Self {
        Height(h)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Height {
        Height(self.0 + 1)
    }

    pub fn prev(self) -> Height {
        if self.0 <= Self::NIL.0 {
            return Self::NIL;
        }
        Height(self.0 - 1)
    }

    pub fn is_nil(self) -> bool {
        self.0 == Self::NIL.0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn is_valid(self) -> Result<(), BaseError> {
        if self.0 < Self::GENESIS.0 {
            return Err(BaseError::InvalidHeight(self.0));
        }
        Ok(())
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Round(u64);

impl Round {
    pub const ZERO: Round = Round(0);

    pub const fn new(r: u64) -> Self {
        Round(r)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Round {
        Round(self.0 + 1)
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// (height, round); ordered by height first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Point {
    pub height: Height,
    pub round: Round,
}

impl Point {
    pub const fn new(height: Height, round: Round) -> Self {
        Point { height, round }
    }

    pub fn genesis() -> Self {
        Point::new(Height::GENESIS, Round::ZERO)
    }

    pub fn next_round(self) -> Point {
        Point::new(self.height, self.round.next())
    }

    pub fn next_height(self) -> Point {
        Point::new(self.height.next(), Round::ZERO)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[..8].copy_from_slice(&self.height.to_bytes());
        b[8..].copy_from_slice(&self.round.to_bytes());
        b
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.height, self.round)
    }
}

/// Voting stage. Declaration order is the stage rank: INIT < SIGN < ACCEPT.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Init,
    Sign,
    Accept,
}

impl Stage {
    /// Ballots are only collected for INIT and ACCEPT.
    pub fn can_vote(self) -> bool {
        matches!(self, Stage::Init | Stage::Accept)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::Sign => "SIGN",
            Stage::Accept => "ACCEPT",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagePoint {
    pub point: Point,
    pub stage: Stage,
}

impl StagePoint {
    pub const fn new(point: Point, stage: Stage) -> Self {
        StagePoint { point, stage }
    }

    pub fn height(&self) -> Height {
        self.point.height
    }

    pub fn round(&self) -> Round {
        self.point.round
    }
}

impl fmt::Display for StagePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.point.height, self.point.round, self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(h: i64, r: u64, s: Stage) -> StagePoint {
        StagePoint::new(Point::new(Height::new(h), Round::new(r)), s)
    }

    #[test]
    fn stagepoint_order_is_lexicographic() {
        assert!(sp(1, 0, Stage::Init) < sp(1, 0, Stage::Sign));
        assert!(sp(1, 0, Stage::Sign) < sp(1, 0, Stage::Accept));
        assert!(sp(1, 0, Stage::Accept) < sp(1, 1, Stage::Init));
        assert!(sp(1, 9, Stage::Accept) < sp(2, 0, Stage::Init));
    }

    #[test]
    fn nil_height() {
        assert!(Height::NIL.is_nil());
        assert_eq!(Height::NIL.next(), Height::GENESIS);
        assert_eq!(Height::NIL.prev(), Height::NIL);
        assert!(Height::NIL.is_valid().is_err());
        assert!(Height::GENESIS.is_valid().is_ok());
    }

    #[test]
    fn stage_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Stage::Accept).unwrap(), "\"ACCEPT\"");
        assert!(!Stage::Sign.can_vote());
    }
}
