use crate::error::{Error, ErrorKind};
use derive_more::Display;
use exn::OptionExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Key of the combined score in [`DiffMetrics::diffs`].
pub const COMBINED_METRIC: &str = "combined";

const ID_SEPARATOR: char = ':';

/// Canonical key for an unordered pair of distinct digests.
///
/// The larger digest comes first: `DiffId::new("aaa", "bbb")` and
/// `DiffId::new("bbb", "aaa")` both produce `bbb:aaa`.
///
/// ```
/// use diffcache_metrics::DiffId;
/// let id = DiffId::new("aaa", "bbb").unwrap();
/// assert_eq!(id.as_str(), "bbb:aaa");
/// assert_eq!(DiffId::new("bbb", "aaa"), Some(id));
/// assert_eq!(DiffId::new("aaa", "aaa"), None);
/// ```
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0}")]
pub struct DiffId(String);

impl DiffId {
    /// Build the id for a pair of digests. Returns `None` for a self-pair,
    /// which never has a diff.
    pub fn new(a: &str, b: &str) -> Option<Self> {
        match a.cmp(b) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(Self(format!("{a}{ID_SEPARATOR}{b}"))),
            std::cmp::Ordering::Less => Some(Self(format!("{b}{ID_SEPARATOR}{a}"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Both digests, smallest first.
    pub fn digests(&self) -> (&str, &str) {
        // Construction guarantees the separator is present.
        let (larger, smaller) = self.0.split_once(ID_SEPARATOR).unwrap_or((&self.0, ""));
        (smaller, larger)
    }

    /// File name of the diff image for this pair: `{smaller}-{larger}.png`.
    pub fn diff_image_name(&self) -> String {
        let (smaller, larger) = self.digests();
        format!("{smaller}-{larger}.png")
    }
}

impl FromStr for DiffId {
    type Err = Error;

    /// Parse an id, accepting either digest order.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((a, b)) = s.split_once(ID_SEPARATOR) else {
            exn::bail!(ErrorKind::InvalidId(s.to_string()));
        };
        if a.is_empty() || b.is_empty() || b.contains(ID_SEPARATOR) {
            exn::bail!(ErrorKind::InvalidId(s.to_string()));
        }
        Self::new(a, b).ok_or_raise(|| ErrorKind::InvalidId(s.to_string()))
    }
}

impl AsRef<str> for DiffId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Result of comparing two images.
///
/// Every field defaults when missing from stored data, and unknown stored
/// fields are ignored, so records written by older and newer builds stay
/// readable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffMetrics {
    /// Number of pixels that differ.
    pub num_diff_pixels: u64,
    /// Differing pixels as a percentage of the larger image's area.
    pub pixel_diff_percent: f32,
    /// Largest per-channel difference, in RGBA order.
    pub max_rgba_diffs: [u8; 4],
    /// Whether the two images have different dimensions.
    pub dim_differ: bool,
    /// Named scores, see [`COMBINED_METRIC`].
    pub diffs: BTreeMap<String, f32>,
}

impl DiffMetrics {
    pub fn combined(&self) -> Option<f32> {
        self.diffs.get(COMBINED_METRIC).copied()
    }
}
