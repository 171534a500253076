//! Compound identifiers for index entries.
//!
//! The index only knows numeric ids, so each entry's filler category is
//! packed into the low two decimal digits of its id:
//!
//! ```text
//! id = sequence_position * 100 + filler_category
//! ```
//!
//! Decoding is `id % 100`. Both directions are checked: a category outside
//! `[0, 100)` or a position whose id would not fit in a `u64` is rejected
//! instead of silently producing an id that decodes to the wrong category.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Modulus reserved for the filler category.
pub const CATEGORY_MODULUS: u64 = 100;

/// Largest sequence position whose id still fits in a `u64` for every
/// category.
pub const MAX_SEQUENCE_POSITION: u64 = (u64::MAX - (CATEGORY_MODULUS - 1)) / CATEGORY_MODULUS;

/// Errors raised when an id cannot be encoded losslessly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("filler category {0} is outside [0, 100)")]
    CategoryOutOfRange(i64),

    #[error("sequence position {0} exceeds the maximum of {max}", max = MAX_SEQUENCE_POSITION)]
    PositionOverflow(u64),
}

/// Index identifier carrying both a sequence position and a filler category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompoundId(u64);

impl CompoundId {
    /// Raw integer handed to the index.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Rebuild an id read back from a persisted index.
    ///
    /// Every `u64` is a well-formed id, so this cannot fail.
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Filler category packed into this id.
    pub fn category(self) -> u8 {
        decode(self)
    }

    /// Sequence position packed into this id.
    pub fn sequence_position(self) -> u64 {
        self.0 / CATEGORY_MODULUS
    }
}

impl Display for CompoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check that `category` can be stored in the reserved digits.
pub fn validate_category(category: i64) -> Result<u8, CodecError> {
    if (0..CATEGORY_MODULUS as i64).contains(&category) {
        Ok(category as u8)
    } else {
        Err(CodecError::CategoryOutOfRange(category))
    }
}

/// Pack a sequence position and a filler category into one id.
pub fn encode(sequence_position: u64, category: i64) -> Result<CompoundId, CodecError> {
    let category = validate_category(category)?;

    if sequence_position > MAX_SEQUENCE_POSITION {
        return Err(CodecError::PositionOverflow(sequence_position));
    }

    sequence_position
        .checked_mul(CATEGORY_MODULUS)
        .and_then(|base| base.checked_add(category as u64))
        .map(CompoundId)
        .ok_or(CodecError::PositionOverflow(sequence_position))
}

/// Recover the filler category from an id.
pub fn decode(id: CompoundId) -> u8 {
    (id.0 % CATEGORY_MODULUS) as u8
}
