//! Cached signature scanning over one host module.

use std::collections::HashMap;

use hooksleuth_scanner::{find_first, scan, Pattern, PatternError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::region::ScanRegion;

/// Failures of the throwing scan entry points.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The signature string itself is malformed. Always a programming or
    /// configuration error, never a property of the host build.
    #[error(transparent)]
    InvalidPattern(#[from] PatternError),
    /// The signature occurs nowhere in the region. Expected after host
    /// updates; fatal only to subsystems that require the address.
    #[error("signature {signature:?} not found")]
    PatternNotFound {
        /// The signature as authored.
        signature: String,
    },
    /// The match site was a rel32 branch whose target lies outside the
    /// region. Usually means the signature matched the wrong function.
    #[error("signature {signature:?} branches to {target:#x}, outside the scan region")]
    BranchOutOfRegion {
        /// The signature as authored.
        signature: String,
        /// Where the branch pointed.
        target: usize,
    },
}

/// Signature scanner bound to one module snapshot.
///
/// Results are cached per signature string, so repeated lookups across
/// subsystems cost one scan. The scanner is `&self` throughout and safe to
/// share between every address table targeting the same module.
pub struct SigScanner {
    region: ScanRegion,
    cache: Mutex<HashMap<String, usize>>,
}

impl SigScanner {
    pub fn new(region: ScanRegion) -> Self {
        debug!(
            "signature scanner ready, base {:#x} size {:#x}",
            region.base(),
            region.len()
        );
        Self {
            region,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn region(&self) -> &ScanRegion {
        &self.region
    }

    /// Finds `signature` in the region and returns its absolute address.
    ///
    /// When the matched byte is a `call`/`jmp` rel32 opcode the branch is
    /// followed and the target returned instead, so signatures may point
    /// either at a function body or at a call site of it.
    pub fn scan_text(&self, signature: &str) -> Result<usize, ScanError> {
        if let Some(hit) = self.cache.lock().get(signature) {
            return Ok(*hit);
        }

        let pattern = Pattern::parse(signature)?;
        let found = find_first(&pattern, self.region.base(), self.region.bytes()).ok_or_else(
            || ScanError::PatternNotFound {
                signature: signature.to_string(),
            },
        )?;
        let resolved = self.follow_branch(signature, found)?;

        trace!("signature {signature:?} resolved to {resolved:#x}");
        self.cache.lock().insert(signature.to_string(), resolved);
        Ok(resolved)
    }

    /// Non-throwing form of [`scan_text`](Self::scan_text): `Ok(None)`
    /// when the signature is absent (or resolves outside the region), so
    /// optional features can be gated on it. Malformed signatures still
    /// error.
    pub fn try_scan_text(&self, signature: &str) -> Result<Option<usize>, ScanError> {
        match self.scan_text(signature) {
            Ok(address) => Ok(Some(address)),
            Err(ScanError::PatternNotFound { .. }) => Ok(None),
            Err(ScanError::BranchOutOfRegion { signature, target }) => {
                warn!("signature {signature:?} conflicts, branch target {target:#x}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves many signatures in a single sweep over the region,
    /// returning one entry per signature in order. Missing signatures
    /// yield `None`; malformed ones fail the whole batch up front.
    pub fn scan_batch(&self, signatures: &[&str]) -> Result<Vec<Option<usize>>, ScanError> {
        let mut results: Vec<Option<usize>> = vec![None; signatures.len()];

        // Split cached signatures out before parsing the rest.
        let mut pending = vec![];
        {
            let cache = self.cache.lock();
            for (i, signature) in signatures.iter().enumerate() {
                match cache.get(*signature) {
                    Some(hit) => results[i] = Some(*hit),
                    None => pending.push((i, *signature)),
                }
            }
        }
        let patterns = pending
            .iter()
            .map(|(_, signature)| Pattern::parse(signature))
            .collect::<Result<Vec<_>, _>>()?;

        if !patterns.is_empty() {
            let refs: Vec<&Pattern> = patterns.iter().collect();
            let bins = scan(&refs, self.region.base(), self.region.bytes());
            let mut cache = self.cache.lock();
            for ((i, signature), matches) in pending.into_iter().zip(bins) {
                let Some(first) = matches.first() else {
                    continue;
                };
                match self.follow_branch(signature, *first) {
                    Ok(resolved) => {
                        cache.insert(signature.to_string(), resolved);
                        results[i] = Some(resolved);
                    }
                    Err(e) => warn!("dropping batched signature: {e}"),
                }
            }
        }

        Ok(results)
    }

    /// Resolves a RIP-relative displacement inside the region, for data
    /// addresses referenced by matched instructions. See
    /// [`ScanRegion::resolve_rip`].
    pub fn resolve_rip(&self, address: usize, next_opcode_offset: usize) -> Option<usize> {
        self.region.resolve_rip(address, next_opcode_offset)
    }

    fn follow_branch(&self, signature: &str, address: usize) -> Result<usize, ScanError> {
        let Some(opcode) = self.region.read_u8(address) else {
            return Ok(address);
        };
        if opcode != 0xE8 && opcode != 0xE9 {
            return Ok(address);
        }
        let Some(target) = self.region.resolve_rip(address + 1, 4) else {
            // Branch at the region's very edge; leave the match as-is.
            return Ok(address);
        };
        if !self.region.contains(target) {
            return Err(ScanError::BranchOutOfRegion {
                signature: signature.to_string(),
                target,
            });
        }
        Ok(target)
    }

    #[cfg(test)]
    fn cached(&self, signature: &str) -> Option<usize> {
        self.cache.lock().get(signature).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASE: usize = 0x14000_0000;

    fn scanner(bytes: Vec<u8>) -> SigScanner {
        SigScanner::new(ScanRegion::from_bytes(BASE, bytes))
    }

    #[test]
    fn test_scan_text() {
        let mut bytes = vec![0x90u8; 256];
        bytes[40..44].copy_from_slice(b"\x48\x8B\xC8\xCC");
        let s = scanner(bytes);

        assert_eq!(s.scan_text("48 8B C8 CC").unwrap(), BASE + 40);
        assert!(matches!(
            s.scan_text("DE AD BE EF"),
            Err(ScanError::PatternNotFound { .. })
        ));
        assert!(matches!(
            s.scan_text("?? ??"),
            Err(ScanError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_try_scan_text() {
        let s = scanner(vec![0x11, 0x22, 0x33]);
        assert_eq!(s.try_scan_text("22 33").unwrap(), Some(BASE + 1));
        assert_eq!(s.try_scan_text("44 55").unwrap(), None);
        assert!(s.try_scan_text("not a sig").is_err());
    }

    #[test]
    fn test_scan_text_caches() {
        let s = scanner(vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(s.cached("BB CC"), None);
        assert_eq!(s.scan_text("BB CC").unwrap(), BASE + 1);
        assert_eq!(s.cached("BB CC"), Some(BASE + 1));
        // Misses stay uncached.
        assert!(s.scan_text("DD EE").is_err());
        assert_eq!(s.cached("DD EE"), None);
    }

    #[test]
    fn test_follows_call() {
        // call rel32 at offset 16 whose target is offset 64
        let mut bytes = vec![0x90u8; 128];
        bytes[16] = 0xE8;
        let displacement = 64i32 - (16 + 5);
        bytes[17..21].copy_from_slice(&displacement.to_le_bytes());
        bytes[64] = 0x55;
        let s = scanner(bytes);

        assert_eq!(s.scan_text("E8 ?? ?? ?? ?? 90 90").unwrap(), BASE + 64);
    }

    #[test]
    fn test_branch_out_of_region() {
        let mut bytes = vec![0x90u8; 64];
        bytes[8] = 0xE9;
        bytes[9..13].copy_from_slice(&0x7fff_0000i32.to_le_bytes());
        let s = scanner(bytes);

        assert!(matches!(
            s.scan_text("E9 ?? ?? ?? ?? 90"),
            Err(ScanError::BranchOutOfRegion { .. })
        ));
        assert_eq!(s.try_scan_text("E9 ?? ?? ?? ?? 90").unwrap(), None);
    }

    #[test]
    fn test_marker_skips_branch_following() {
        // The `|` marker points past the opcode, so the reported byte is
        // not the E8 and no following happens.
        let mut bytes = vec![0x90u8; 64];
        bytes[8] = 0xE8;
        bytes[9..13].copy_from_slice(&(-4i32).to_le_bytes());
        let s = scanner(bytes);

        assert_eq!(s.scan_text("E8 | ?? ?? ?? ?? 90").unwrap(), BASE + 9);
    }

    #[test]
    fn test_scan_batch() {
        let mut bytes = vec![0x90u8; 512];
        bytes[10..13].copy_from_slice(b"\x11\x22\x33");
        bytes[200..202].copy_from_slice(b"\x44\x55");
        let s = scanner(bytes);

        // Prime one entry through the single-signature path first.
        assert_eq!(s.scan_text("44 55").unwrap(), BASE + 200);

        let results = s
            .scan_batch(&["11 22 33", "44 55", "AB CD"])
            .unwrap();
        assert_eq!(
            results,
            vec![Some(BASE + 10), Some(BASE + 200), None]
        );
        assert_eq!(s.cached("11 22 33"), Some(BASE + 10));

        assert!(s.scan_batch(&["11 22", "??"]).is_err());
    }
}
