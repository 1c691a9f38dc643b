//! Compact rank-set representation and its canonical range-list wire encoding.
//!
//! An [`Idset`] is the currency the rest of this crate trades in: hello
//! response targets, peer subtrees, job rank sets, and barrier progress are
//! all idsets. Internally it is a sorted set; externally it round-trips
//! through a canonical `0-3,7,9-11` range-list encoding.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::DerpError;

pub type Rank = u32;

/// A compact, ordered set of non-negative rank identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Idset(BTreeSet<Rank>);

impl Idset {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn singleton(rank: Rank) -> Self {
        let mut s = BTreeSet::new();
        s.insert(rank);
        Self(s)
    }

    pub fn from_ranks(ranks: impl IntoIterator<Item = Rank>) -> Self {
        Self(ranks.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.0.contains(&rank)
    }

    pub fn add(&mut self, rank: Rank) -> bool {
        self.0.insert(rank)
    }

    pub fn remove(&mut self, rank: Rank) -> bool {
        self.0.remove(&rank)
    }

    pub fn iter(&self) -> impl Iterator<Item = Rank> + '_ {
        self.0.iter().copied()
    }

    /// In-place union; ranks already present are no-ops.
    pub fn union_with(&mut self, other: &Idset) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn union(&self, other: &Idset) -> Idset {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn intersect(&self, other: &Idset) -> Idset {
        Idset(self.0.intersection(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &Idset) -> Idset {
        Idset(self.0.difference(&other.0).copied().collect())
    }

    pub fn is_subset(&self, other: &Idset) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Canonical `0-3,7,9-11` encoding. Ranges are maximal and ascending;
    /// encoding two equal sets always produces the same string.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut ranges = self.ranges();
        let mut first = true;
        while let Some((lo, hi)) = ranges.next() {
            if !first {
                out.push(',');
            }
            first = false;
            if lo == hi {
                out.push_str(&lo.to_string());
            } else {
                out.push_str(&format!("{lo}-{hi}"));
            }
        }
        out
    }

    fn ranges(&self) -> RangeIter<'_> {
        RangeIter {
            iter: self.0.iter().copied().peekable(),
        }
    }

    /// Parse a `0-3,7,9-11` style range list. Empty string decodes to the
    /// empty set. Any malformed token is a `DerpError::Protocol`.
    pub fn decode(s: &str) -> Result<Idset, DerpError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Idset::new());
        }
        let mut set = BTreeSet::new();
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(DerpError::Protocol(format!("empty idset token in '{s}'")));
            }
            match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo: Rank = lo
                        .parse()
                        .map_err(|_| DerpError::Protocol(format!("bad range start '{token}'")))?;
                    let hi: Rank = hi
                        .parse()
                        .map_err(|_| DerpError::Protocol(format!("bad range end '{token}'")))?;
                    if hi < lo {
                        return Err(DerpError::Protocol(format!(
                            "inverted range '{token}'"
                        )));
                    }
                    set.extend(lo..=hi);
                }
                None => {
                    let v: Rank = token
                        .parse()
                        .map_err(|_| DerpError::Protocol(format!("bad rank '{token}'")))?;
                    set.insert(v);
                }
            }
        }
        Ok(Idset(set))
    }
}

impl fmt::Display for Idset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromIterator<Rank> for Idset {
    fn from_iter<T: IntoIterator<Item = Rank>>(iter: T) -> Self {
        Idset(iter.into_iter().collect())
    }
}

impl serde::Serialize for Idset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> serde::Deserialize<'de> for Idset {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Idset::decode(&s).map_err(serde::de::Error::custom)
    }
}

struct RangeIter<'a> {
    iter: std::iter::Peekable<std::iter::Copied<std::collections::btree_set::Iter<'a, Rank>>>,
}

impl Iterator for RangeIter<'_> {
    type Item = (Rank, Rank);

    fn next(&mut self) -> Option<Self::Item> {
        let lo = self.iter.next()?;
        let mut hi = lo;
        while let Some(&next) = self.iter.peek() {
            if next == hi + 1 {
                hi = next;
                self.iter.next();
            } else {
                break;
            }
        }
        Some((lo, hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_normalizes_ranges() {
        let s = Idset::from_ranks([0, 1, 2, 3, 7, 9, 10, 11]);
        assert_eq!(s.encode(), "0-3,7,9-11");
    }

    #[test]
    fn decode_encode_roundtrip() {
        for raw in ["", "0", "0-3,7,9-11", "5,6,7", "0-0"] {
            let s = Idset::decode(raw).unwrap();
            let back = Idset::decode(&s.encode()).unwrap();
            assert_eq!(s, back, "roundtrip mismatch for {raw}");
        }
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(Idset::decode("a-b").is_err());
        assert!(Idset::decode("3-1").is_err());
        assert!(Idset::decode("1,,2").is_err());
    }

    #[test]
    fn set_algebra() {
        let a = Idset::from_ranks([0, 1, 2, 3]);
        let b = Idset::from_ranks([2, 3, 4]);
        assert_eq!(a.union(&b), Idset::from_ranks([0, 1, 2, 3, 4]));
        assert_eq!(a.intersect(&b), Idset::from_ranks([2, 3]));
        assert_eq!(a.difference(&b), Idset::from_ranks([0, 1]));
        assert!(Idset::from_ranks([2, 3]).is_subset(&a));
    }
}
