//! Byte pattern parsing and scanning over raw memory.
//!
//! Patterns are authored as space separated hex pairs: `"48 8B ?? ?? E8"`.
//! `??` wildcards a whole byte and a single `?` wildcards one nibble
//! (`"4?"` matches `0x40..=0x4F`). Two optional words adjust the reported
//! address: a `|` marker moves it to that position within the pattern, and
//! a final `+N` word (decimal or `0x` hex) adds a fixed byte offset.
//!
//! Scanning is strictly forward; [`find_first`] returns the lowest match
//! and [`scan`] sweeps many patterns over a region in one parallel pass.

use std::collections::HashMap;
use std::fmt::Display;

use thiserror::Error;

/// Reasons a pattern string is rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// A word was neither a hex pair, `??`, `|`, nor a trailing `+N`.
    #[error("bad pattern word {word:?}")]
    BadWord {
        /// The offending word.
        word: String,
    },
    /// The pattern contains no byte tokens at all.
    #[error("pattern must contain at least one byte")]
    Empty,
    /// Every nibble of the pattern is wildcarded. Such a pattern matches at
    /// offset zero of any region and is always an authoring mistake.
    #[error("pattern consists only of wildcards")]
    AllWildcards,
    /// The `|` marker appeared more than once.
    #[error("result marker `|` given more than once")]
    DuplicateMarker,
    /// A `+N` word appeared before the end of the pattern.
    #[error("offset suffix `+N` must be the final word")]
    MisplacedSuffix,
}

/// A parsed byte pattern with a per-byte wildcard mask.
#[derive(Clone, Eq, PartialEq)]
pub struct Pattern {
    sig: Vec<u8>,
    mask: Vec<u8>,
    marker: usize,
    suffix: usize,
}

impl Pattern {
    /// Parses a pattern string. See the crate docs for the grammar.
    pub fn parse<S: AsRef<str>>(s: S) -> Result<Self, PatternError> {
        let mut sig = vec![];
        let mut mask = vec![];
        let mut marker = None;
        let mut suffix = None;

        for word in s.as_ref().split_whitespace() {
            if suffix.is_some() {
                return Err(PatternError::MisplacedSuffix);
            }
            if let Some((s, m)) = parse_byte(word) {
                sig.push(s);
                mask.push(m);
            } else if word == "|" {
                if marker.replace(sig.len()).is_some() {
                    return Err(PatternError::DuplicateMarker);
                }
            } else if let Some(rest) = word.strip_prefix('+') {
                suffix = Some(parse_offset(rest).ok_or_else(|| PatternError::BadWord {
                    word: word.to_string(),
                })?);
            } else {
                return Err(PatternError::BadWord {
                    word: word.to_string(),
                });
            }
        }

        if sig.is_empty() {
            return Err(PatternError::Empty);
        }
        if mask.iter().all(|m| *m == 0) {
            return Err(PatternError::AllWildcards);
        }

        Ok(Self {
            sig,
            mask,
            marker: marker.unwrap_or(0),
            suffix: suffix.unwrap_or(0),
        })
    }

    /// Number of bytes the pattern occupies in memory.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.sig.len()
    }

    /// Whether the first byte is fully concrete, i.e. usable as a
    /// single-byte prefilter.
    fn concrete_lead(&self) -> Option<u8> {
        (self.mask[0] == 0xff).then_some(self.sig[0])
    }

    /// Whether the first four bytes are fully concrete.
    fn concrete_head(&self) -> Option<[u8; 4]> {
        (self.mask.len() >= 4 && self.mask[..4].iter().all(|m| *m == 0xff))
            .then(|| self.sig[..4].try_into().unwrap())
    }

    /// Tests the pattern against `data` at `index`. The caller guarantees
    /// `index + self.len() <= data.len()`.
    #[inline(always)]
    pub fn is_match(&self, data: &[u8], index: usize) -> bool {
        for i in 0..self.len() {
            if data[index + i] & self.mask[i] != self.sig[i] {
                return false;
            }
        }
        true
    }

    /// Address reported for a match at `index`, accounting for the `|`
    /// marker and the `+N` suffix.
    pub fn result(&self, base_address: usize, index: usize) -> usize {
        base_address + index + self.marker + self.suffix
    }
}

fn parse_byte(word: &str) -> Option<(u8, u8)> {
    let mut chars = word.chars();
    let (hi, lo) = (chars.next()?, chars.next()?);
    if chars.next().is_some() {
        return None;
    }
    let mut sig = 0u8;
    let mut mask = 0u8;
    for (shift, c) in [(4, hi), (0, lo)] {
        if let Some(digit) = c.to_digit(16) {
            sig |= (digit as u8) << shift;
            mask |= 0xf << shift;
        } else if c != '?' {
            return None;
        }
    }
    Some((sig, mask))
}

fn parse_offset(s: &str) -> Option<usize> {
    if let Some(hex) = s.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (sig, mask)) in self.sig.iter().zip(&self.mask).enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if i == self.marker && self.marker != 0 {
                write!(f, "| ")?;
            }
            match mask {
                0x00 => write!(f, "??")?,
                0xff => write!(f, "{sig:02X}")?,
                0x0f => write!(f, "?{:X}", sig & 0xf)?,
                0xf0 => write!(f, "{:X}?", sig >> 4)?,
                _ => unreachable!("nibble masks only"),
            }
        }
        if self.suffix != 0 {
            write!(f, " +{}", self.suffix)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pattern(\"{self}\")")
    }
}

impl TryFrom<&str> for Pattern {
    type Error = PatternError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

/// Returns the lowest-addressed match of `pattern` in `data`, as an
/// absolute address, or `None` when the pattern occurs nowhere. Absence is
/// an expected outcome and never an error.
pub fn find_first(pattern: &Pattern, base_address: usize, data: &[u8]) -> Option<usize> {
    let len = pattern.len();
    if len > data.len() {
        return None;
    }
    let last = data.len() - len;
    if let Some(lead) = pattern.concrete_lead() {
        for i in memchr::memchr_iter(lead, &data[..=last]) {
            if pattern.is_match(data, i) {
                return Some(pattern.result(base_address, i));
            }
        }
        None
    } else {
        (0..=last)
            .find(|i| pattern.is_match(data, *i))
            .map(|i| pattern.result(base_address, i))
    }
}

/// Sweeps all `patterns` over `data` in one pass and returns the matches
/// of each pattern, in ascending address order, at the corresponding index
/// of the result.
///
/// Patterns with a concrete first byte are prefiltered with `memchr`;
/// patterns opening with four concrete bytes additionally go through a
/// 4-byte bin so a single lookup rejects most candidate offsets. The bulk
/// of the region is split into per-core chunks scanned in parallel and the
/// tail, where a pattern could run off the end, is rechecked sequentially
/// with exact bounds.
pub fn scan(patterns: &[&Pattern], base_address: usize, data: &[u8]) -> Vec<Vec<usize>> {
    use rayon::prelude::*;

    let mut bins: Vec<Vec<usize>> = patterns.iter().map(|_| vec![]).collect();
    if patterns.is_empty() || data.is_empty() {
        return bins;
    }

    const WIDE: usize = 4;

    let mut lead_bins: HashMap<u8, Vec<(usize, &Pattern)>> = Default::default();
    let mut wide_bins: HashMap<[u8; WIDE], Vec<(usize, &Pattern)>> = Default::default();
    // Patterns that cannot be prefiltered get tested at every offset.
    let mut slow = vec![];
    for (pi, p) in patterns.iter().enumerate() {
        if let Some(head) = p.concrete_head() {
            wide_bins.entry(head).or_default().push((pi, *p));
        } else if let Some(lead) = p.concrete_lead() {
            lead_bins.entry(lead).or_default().push((pi, *p));
        } else {
            slow.push((pi, *p));
        }
    }
    let lead_bytes: Vec<u8> = lead_bins
        .keys()
        .copied()
        .chain(wide_bins.keys().map(|head| head[0]))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let max = patterns.iter().map(|p| p.len()).max().unwrap();

    // Cut the middle short so even the longest pattern needs no bounds
    // check there; the remainder is handled below.
    let middle = &data[..data.len().saturating_sub(max)];

    let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
    let chunk_size = (middle.len() / threads).max(1);
    let chunks: Vec<_> = middle.chunks(chunk_size).enumerate().collect();

    let mut matches: Vec<(usize, usize)> = chunks
        .par_iter()
        .map(|(index, chunk)| {
            let mut matches = vec![];
            let offset = index * chunk_size;

            for lead in &lead_bytes {
                for i in memchr::memchr_iter(*lead, chunk) {
                    let j = offset + i;
                    if let Some(candidates) = lead_bins.get(lead) {
                        for (pi, p) in candidates {
                            if p.is_match(data, j) {
                                matches.push((*pi, p.result(base_address, j)));
                            }
                        }
                    }
                    if !wide_bins.is_empty() {
                        let head: [u8; WIDE] = data[j..j + WIDE].try_into().unwrap();
                        if let Some(candidates) = wide_bins.get(&head) {
                            for (pi, p) in candidates {
                                if p.is_match(data, j) {
                                    matches.push((*pi, p.result(base_address, j)));
                                }
                            }
                        }
                    }
                }
            }
            for (pi, p) in &slow {
                for j in offset..offset + chunk.len() {
                    if p.is_match(data, j) {
                        matches.push((*pi, p.result(base_address, j)));
                    }
                }
            }
            matches
        })
        .flatten()
        .collect();

    // Tail: every offset from the end of the middle up to where each
    // pattern still fits.
    let start = middle.len();
    for (pi, p) in patterns.iter().enumerate() {
        let end = (data.len() + 1).saturating_sub(p.len());
        for j in start..end.max(start) {
            if p.is_match(data, j) {
                matches.push((pi, p.result(base_address, j)));
            }
        }
    }

    for (pi, addr) in matches {
        bins[pi].push(addr);
    }
    for bin in &mut bins {
        bin.sort_unstable();
    }

    bins
}
