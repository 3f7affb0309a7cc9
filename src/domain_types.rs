//! Domain types shared across the cell hierarchy
//!
//! These types prevent primitive obsession for the concepts every other
//! module touches: cell names and paths, instance identity, and the small
//! set of configuration knobs that do not belong to a single component.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Separator used between cell names in a cell path or routing path.
pub const PATH_SEPARATOR: char = '!';

/// Short local name of a single cell, e.g. `child-cell2`.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255, predicate = |s: &str| !s.contains(PATH_SEPARATOR)),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom)
)]
pub struct CellName(String);

/// Errors constructing or manipulating a [`CellPath`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CellPathError {
    /// The path had no segments at all.
    #[error("cell path must not be empty")]
    Empty,
    /// A segment of the path was not a valid [`CellName`].
    #[error("invalid cell name in path: {0}")]
    InvalidSegment(String),
}

/// An absolute, `!`-separated sequence of cell names from some root to some
/// cell (a *cell path*), or the sequence of cells a message has already
/// traversed (a *routing path*). Both share the same representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellPath(Vec<CellName>);

impl CellPath {
    /// Builds a path from an ordered, non-empty list of cell names.
    ///
    /// # Errors
    ///
    /// Returns [`CellPathError::Empty`] if `segments` is empty.
    pub fn new(segments: Vec<CellName>) -> Result<Self, CellPathError> {
        if segments.is_empty() {
            return Err(CellPathError::Empty);
        }
        Ok(Self(segments))
    }

    /// Builds a single-segment path, e.g. the origin cell of a fresh message.
    #[must_use]
    pub fn single(name: CellName) -> Self {
        Self(vec![name])
    }

    /// Parses a `!`-separated string such as `api-cell!child-cell2`.
    ///
    /// # Errors
    ///
    /// Returns [`CellPathError::Empty`] for an empty string, or
    /// [`CellPathError::InvalidSegment`] if any segment fails [`CellName`]
    /// validation.
    pub fn parse(path: &str) -> Result<Self, CellPathError> {
        if path.is_empty() {
            return Err(CellPathError::Empty);
        }
        let segments = path
            .split(PATH_SEPARATOR)
            .map(|segment| {
                CellName::try_new(segment.to_string())
                    .map_err(|_| CellPathError::InvalidSegment(segment.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(segments)
    }

    /// The path's segments, root-to-leaf (or origin-to-current for a
    /// routing path).
    #[must_use]
    pub fn segments(&self) -> &[CellName] {
        &self.0
    }

    /// The number of hops represented by this path.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the path has no segments. Never true for a validly
    /// constructed [`CellPath`]; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The final segment, i.e. the cell this path currently names/reaches.
    #[must_use]
    pub fn last(&self) -> &CellName {
        self.0.last().expect("CellPath is never empty")
    }

    /// The first segment, i.e. the root of the path.
    #[must_use]
    pub fn first(&self) -> &CellName {
        self.0.first().expect("CellPath is never empty")
    }

    /// Whether `self` currently names `local_name`, i.e. `local_name` is the
    /// last segment of the path.
    #[must_use]
    pub fn is_me(&self, local_name: &CellName) -> bool {
        self.last() == local_name
    }

    /// Reverses the path. Reversing a routing path yields the return route
    /// for a response; reversing twice is always the identity.
    #[must_use]
    pub fn reversed(&self) -> Self {
        let mut segments = self.0.clone();
        segments.reverse();
        Self(segments)
    }

    /// Appends a segment, producing a new, longer path.
    #[must_use]
    pub fn appended(&self, name: CellName) -> Self {
        let mut segments = self.0.clone();
        segments.push(name);
        Self(segments)
    }

    /// The length of the longest prefix shared with `other`.
    #[must_use]
    pub fn common_prefix_len(&self, other: &Self) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Whether `self` starts with `other` as a prefix.
    #[must_use]
    pub fn starts_with(&self, other: &Self) -> bool {
        self.0.len() >= other.0.len() && self.common_prefix_len(other) == other.0.len()
    }

    /// The path with its first segment dropped, or `None` if this was the
    /// last segment. Used to consume a response's remaining relay path one
    /// hop at a time.
    #[must_use]
    pub fn tail(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(Self(self.0[1..].to_vec()))
        }
    }
}

impl std::fmt::Display for CellPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(CellName::as_ref)
            .collect::<Vec<_>>()
            .join(&PATH_SEPARATOR.to_string());
        write!(f, "{rendered}")
    }
}

/// Separator joining a cell name and an item id, e.g. `child-cell2@42`.
pub const CELL_ITEM_SEPARATOR: char = '@';

/// Joins a cell name and an opaque item identifier as `<cell>@<item>`, the
/// form the API cell uses to disambiguate ids/hosts that are only unique
/// within a single child cell.
#[must_use]
pub fn cell_with_item(cell: &CellName, item: &str) -> String {
    format!("{cell}{CELL_ITEM_SEPARATOR}{item}")
}

/// Splits a combined `<cell>@<item>` string back into its two parts, from
/// the right so an item value containing `@` is preserved intact.
#[must_use]
pub fn split_cell_and_item(cell_and_item: &str) -> Option<(&str, &str)> {
    cell_and_item.rsplit_once(CELL_ITEM_SEPARATOR)
}

/// Unique identifier for a compute instance, mirrored across cells.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct InstanceUuid(Uuid);

impl InstanceUuid {
    /// Generates a fresh random instance uuid.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Parses an instance uuid from its string form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidUuidError`] if `s` is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, InvalidUuidError> {
        Uuid::parse_str(s)
            .map(Self::new)
            .map_err(|_| InvalidUuidError { value: s.to_string() })
    }
}

/// A string that was expected to be a UUID but was not.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid UUID: {value}")]
pub struct InvalidUuidError {
    /// The offending value.
    pub value: String,
}

impl TryFrom<String> for InstanceUuid {
    type Error = InvalidUuidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// Coarse instance lifecycle state, mirrored down from the top cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Instance is being built.
    Building,
    /// Instance is running.
    Active,
    /// Instance is stopped but not deleted.
    Stopped,
    /// Instance has failed.
    Error,
    /// Instance has been soft-deleted.
    Deleted,
}

/// Fine-grained in-progress task, orthogonal to [`VmState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// No task in progress.
    None,
    /// Instance is scheduling.
    Scheduling,
    /// Instance is spawning.
    Spawning,
    /// Instance is being deleted.
    Deleting,
}

/// Maximum hop count permitted before a targeted message is bounced as
/// [`crate::router::RouterError::MaxHopCountReached`].
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct MaxHopCount(u32);

/// Current hop count of a message in flight.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Into
))]
pub struct HopCount(u32);

impl HopCount {
    /// The first hop of a freshly created message.
    #[must_use]
    pub fn first() -> Self {
        Self::new(1)
    }

    /// The next hop count after traversing one more cell.
    #[must_use]
    pub fn incremented(&self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// Whether this hop count has exceeded `max`.
    #[must_use]
    pub fn exceeds(&self, max: MaxHopCount) -> bool {
        self.into_inner() > max.into_inner()
    }
}

/// Overall per-request timeout for a response-expecting message.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Into)
)]
pub struct CallTimeoutMs(u64);

impl CallTimeoutMs {
    /// Converts to a [`std::time::Duration`].
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversing_a_path_twice_is_the_identity() {
        let path = CellPath::parse("api-cell!child-cell2!grandchild-cell1").unwrap();
        assert_eq!(path.reversed().reversed(), path);
    }

    #[test]
    fn reversed_path_has_segments_in_opposite_order() {
        let path = CellPath::parse("api-cell!child-cell2").unwrap();
        let reversed = path.reversed();
        assert_eq!(reversed.to_string(), "child-cell2!api-cell");
    }

    #[test]
    fn common_prefix_len_finds_shared_root() {
        let a = CellPath::parse("api-cell!child-cell2").unwrap();
        let b = CellPath::parse("api-cell!child-cell2!grandchild-cell1").unwrap();
        assert_eq!(a.common_prefix_len(&b), 2);
    }

    #[test]
    fn parse_rejects_empty_string() {
        assert_eq!(CellPath::parse(""), Err(CellPathError::Empty));
    }

    #[test]
    fn cell_name_rejects_path_separator() {
        assert!(CellName::try_new("bad!name".to_string()).is_err());
    }

    #[test]
    fn starts_with_requires_full_prefix_match() {
        let full = CellPath::parse("api-cell!child-cell2!grandchild-cell1").unwrap();
        let prefix = CellPath::parse("api-cell!child-cell2").unwrap();
        let other = CellPath::parse("api-cell!child-cell9").unwrap();
        assert!(full.starts_with(&prefix));
        assert!(!full.starts_with(&other));
    }

    #[test]
    fn hop_count_exceeds_respects_max() {
        let max = MaxHopCount::try_new(2).unwrap();
        assert!(!HopCount::new(2).exceeds(max));
        assert!(HopCount::new(3).exceeds(max));
    }

    #[test]
    fn tail_drops_first_segment_until_none_at_the_last() {
        let path = CellPath::parse("api-cell!child-cell2!grandchild-cell1").unwrap();
        let tail = path.tail().unwrap();
        assert_eq!(tail.to_string(), "child-cell2!grandchild-cell1");
        assert!(tail.tail().unwrap().tail().is_none());
    }

    #[test]
    fn cell_with_item_round_trips_through_split() {
        let cell = CellName::try_new("child-cell2".to_string()).unwrap();
        let combined = cell_with_item(&cell, "42");
        assert_eq!(split_cell_and_item(&combined), Some(("child-cell2", "42")));
    }
}
