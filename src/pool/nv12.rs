//! Paired-plane packing heuristics
//!
//! A subsampled image pair is a full-resolution 8-bit plane plus a
//! half-resolution 16-bit plane; in slot space the second plane is half the
//! width of the first. Packing the planes independently pays the area
//! height-rounding overhead twice, so batches are laid out either
//! *separately* (two independent strip packs, scored together) or
//! *together* (both planes co-packed into one 64-slot-wide area by a set of
//! fixed layout generators). The cheaper choice by [`nv12_eff`] wins.
//!
//! All geometry here is in slots. Pairs are `(full_x, half_x)` offsets
//! relative to the start of the hosting area.

use crate::geom::{align_slots, align_up, div_round_up};

/// Width in slots of a co-packed area. Keeping it at one 8-bit band means
/// every block in the area keeps a whole-page row stride.
pub(crate) const PAIR_AREA: u16 = 64;

/// Outcome of a strip-packing estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PackFit {
    /// Blocks that fit
    pub count: u16,
    /// Area width consumed, in slots
    pub area: u16,
    /// Packing efficiency, 1024 times the used fraction
    pub eff: u32,
}

/// A concrete co-packed layout: pair offsets within one area.
#[derive(Debug, Clone, Default)]
pub(crate) struct PairLayout {
    pub area: u16,
    pub pairs: Vec<(u16, u16)>,
}

impl PairLayout {
    pub fn count(&self) -> u16 {
        self.pairs.len() as u16
    }
}

/// Maximum number of same-size blocks that can sit next to each other while
/// every block keeps the stride `align(offset + width, band)`.
///
/// `pitch` is the aligned distance between consecutive block starts. The
/// best count/area combination by efficiency is returned; a zero count
/// means not even one block fits.
pub(crate) fn best2pack(
    offset: u16,
    width: u16,
    pitch: u16,
    band: u16,
    max_count: u16,
    grid_width: u16,
) -> PackFit {
    let (o, w, e, b) = (offset, width, pitch, band);
    let mut best = PackFit::default();
    let mut m: u16 = 0;

    // stride must stay constant for every block in the run
    let stride = align_slots(o + w, b);
    let mut ar = stride;

    while m < max_count
        && o as u32 + m as u32 * e as u32 + w as u32 <= grid_width as u32
        && stride == align_slots(ar - o - m * e, b)
    {
        m += 1;
        let eff = m as u32 * w as u32 * 1024 / ar as u32;
        if eff > best.eff {
            best = PackFit {
                count: m,
                area: ar,
                eff,
            };
        }
        ar = align_up(o as u32 + m as u32 * e as u32 + w as u32, b as u32) as u16;
    }
    best
}

/// Score a packing: fewer areas to cover the full request dominates, higher
/// area utilization breaks ties. Zero-count packings score zero.
pub(crate) fn nv12_eff(n: u16, w: u16, area: u16, need: u16) -> u32 {
    if n == 0 || area == 0 {
        return 0;
    }
    0x1000_0000u32
        .wrapping_sub(div_round_up(need as u32, n as u32) * area as u32 * 32)
        .wrapping_add(1024 * n as u32 * ((w as u32 * 3 + 1) >> 1) / area as u32)
}

/// Estimate packing the two planes as independent strip runs.
///
/// Returns (count, combined area). The combined area is three times the
/// half-plane area so the two formats' differing slot costs compare evenly.
pub(crate) fn separate_estimate(
    o: u16,
    w: u16,
    a: u16,
    n: u16,
    grid_width: u16,
) -> (u16, u16) {
    let full = best2pack(o, w, align_slots(w, a), 64, n, grid_width);
    if full.count == 0 {
        return (0, 0);
    }
    let half = best2pack(
        o / 2,
        (w + 1) >> 1,
        align_slots(w, a) / 2,
        32,
        full.count,
        grid_width,
    );
    if half.count == 0 {
        return (0, 0);
    }
    (half.count, half.area.saturating_mul(3))
}

/// Progressive fan-out: full-plane blocks fill the lower half of the area
/// while their half-plane partners climb the upper half, then the bounds
/// move and the pattern repeats.
fn pack_progressive(o: u16, w: u16, a: u16, n: u16) -> PairLayout {
    let area = PAIR_AREA;
    let mut pairs = Vec::new();
    let mut x = o;

    while x + w < area && (pairs.len() as u16) < n {
        // current full-plane upper bound is the next run's lower bound
        let u = (area + x) >> 1;
        let mut l = u;

        while x + w <= u && (pairs.len() as u16) < n {
            pairs.push((x, l));
            l = (area + x + w + 1) >> 1;
            x = align_slots(x + w - o, a) + o;
        }
        x = align_slots(l - o, a) + o;
    }
    PairLayout { area, pairs }
}

/// Mirrored fan-out: the progressive layout computed for the flipped
/// offset, then reflected across the area.
fn pack_mirrored(o: u16, w: u16, a: u16, n: u16) -> PairLayout {
    let flipped = (a - (o + w) % a) % a;
    let mut layout = pack_progressive(flipped, w, a, n);
    let area = layout.area;
    let half_w = (w + 1) >> 1;
    for p in &mut layout.pairs {
        p.0 = area - p.0 - w;
        p.1 = area - p.1 - half_w;
    }
    layout
}

/// Simple alternating placement: each half-plane block sits at half its
/// partner's offset. Only valid when the residues guarantee the half-plane
/// blocks never overlap a full-plane block.
fn pack_alternating(o: u16, w: u16, a: u16, n: u16) -> PairLayout {
    let area = PAIR_AREA;
    let mut pairs = Vec::new();

    let e = (o + w) % a;
    let o1 = (o >> 1) % a;
    let e1 = ((o + w + 1) >> 1) % a;
    let o2 = o1 + (a >> 2);
    let e2 = e1 + (a >> 2);

    // width cannot wrap the alignment, the half block must end before its
    // partner starts, and the second half position must clear it entirely
    if w < a && o < e && e1 <= o && (e2 <= o || o2 >= e) {
        let mut x = o;
        while x + w <= area && (pairs.len() as u16) < n {
            pairs.push((x, x >> 1));
            x += a;
        }
    }
    PairLayout { area, pairs }
}

/// Butterfly placement: pairs grow symmetrically from both ends of the
/// area, half-plane partners meeting in the middle.
fn pack_butterfly(o: u16, w: u16, a: u16, n: u16) -> PairLayout {
    let area = PAIR_AREA;
    let mut pairs = Vec::new();
    let e = align_slots(w, a);

    // end of the last possible block
    let o2 = area - (a - (o + w) % a) % a;

    let limit = (std::cmp::min(
        o2 as i32 - 2 * o as i32,
        2 * o2 as i32 - o as i32 - area as i32,
    ) / 3
        - w as i32)
        / e as i32
        + 1;

    let mut i: i32 = 0;
    while i < limit && (pairs.len() as u16) < n {
        let fwd = o + i as u16 * e;
        pairs.push((fwd, (fwd + area) >> 1));
        if (pairs.len() as u16) < n {
            let back = o2 - i as u16 * e - w;
            pairs.push((back, back >> 1));
        }
        i += 1;
    }
    PairLayout { area, pairs }
}

/// Single-pair fallback for blocks too large for the generators: fit the
/// half-plane block either before or after its partner.
fn pack_single_pair(o: u16, w: u16, a: u16, n: u16) -> PairLayout {
    let half_w = (w + 1) >> 1;
    let area = align_slots(o + w, PAIR_AREA);
    let mut pairs = Vec::new();
    if n == 0 || a == 0 {
        return PairLayout { area, pairs };
    }

    let mut d: u16 = 0;
    while d as u32 + o as u32 + w as u32 <= area as u32 {
        // half-plane before the full block
        let before = ((o + d) % PAIR_AREA) >> 1;
        if before + half_w <= o + d {
            pairs.push((o + d, before));
            return PairLayout { area, pairs };
        }

        // half-plane after the full block
        let after = before + align_slots(d + o + w - before, 32);
        if after + half_w <= area {
            pairs.push((o, after));
            return PairLayout { area, pairs };
        }

        d += a;
    }
    PairLayout { area, pairs }
}

/// A precomputed layout for a parameter family the generators handle badly.
struct CannedLayout {
    count: u16,
    offset: u16,
    width: u16,
    align: u16,
    area: u16,
    pairs: &'static [(u16, u16)],
}

/// Sorted by increasing area, then decreasing count.
const CANNED_LAYOUTS: &[CannedLayout] = &[
    CannedLayout {
        count: 9,
        offset: 2,
        width: 4,
        align: 4,
        area: 64,
        pairs: &[
            (2, 33),
            (6, 35),
            (10, 37),
            (14, 39),
            (18, 41),
            (46, 23),
            (50, 25),
            (54, 27),
            (58, 29),
        ],
    },
    CannedLayout {
        count: 3,
        offset: 0,
        width: 12,
        align: 4,
        area: 64,
        pairs: &[(0, 32), (12, 38), (48, 24)],
    },
];

/// `align_up` over signed values, matching two's-complement rounding.
fn align_i32(value: i32, align: i32) -> i32 {
    (value + align - 1) & !(align - 1)
}

/// Pick the best co-packed layout for up to `n` pairs.
///
/// Generators run in order of increasing area appetite and stop as soon as
/// one covers the whole batch; the canned layouts can displace a partial
/// generator result; the single-pair fallback is the last resort.
pub(crate) fn pack_paired(o: u16, w: u16, a: u16, n: u16) -> PairLayout {
    let mut best = pack_progressive(o, w, a, n);

    if best.count() < n {
        let next = pack_mirrored(o, w, a, n);
        if next.count() > best.count() {
            best = next;
        }
    }
    if best.count() < n {
        let next = pack_alternating(o, w, a, n);
        if next.count() > best.count() {
            best = next;
        }
    }
    if best.count() < n {
        let next = pack_butterfly(o, w, a, n);
        if next.count() > best.count() {
            best = next;
        }
    }

    for canned in CANNED_LAYOUTS {
        // entries are ordered; once below the running best, none can win
        if canned.count < best.count() {
            break;
        }
        let aligned_gap = align_i32(canned.offset as i32 - o as i32, a as i32);
        if canned.align >= a
            && o as i32 + w as i32 + aligned_gap <= canned.offset as i32 + canned.width as i32
        {
            let take = canned.count.min(n) as usize;
            best = PairLayout {
                area: canned.area,
                pairs: canned.pairs[..take].to_vec(),
            };
            break;
        }
    }

    if best.pairs.is_empty() {
        best = pack_single_pair(o, w, a, n);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every pair must keep both blocks inside the area, and no two blocks
    /// of the same plane may overlap.
    fn assert_layout_valid(layout: &PairLayout, w: u16) {
        let half_w = (w + 1) >> 1;
        for &(full, half) in &layout.pairs {
            assert!(full + w <= layout.area, "full block escapes the area");
            assert!(half + half_w <= layout.area, "half block escapes the area");
        }
        let mut fulls: Vec<u16> = layout.pairs.iter().map(|p| p.0).collect();
        fulls.sort_unstable();
        for pair in fulls.windows(2) {
            assert!(pair[0] + w <= pair[1], "full blocks overlap");
        }
        let mut halves: Vec<u16> = layout.pairs.iter().map(|p| p.1).collect();
        halves.sort_unstable();
        for pair in halves.windows(2) {
            assert!(pair[0] + half_w <= pair[1], "half blocks overlap");
        }
    }

    #[test]
    fn test_best2pack_basic() {
        let fit = best2pack(0, 4, 4, 64, 9, 256);
        assert_eq!(fit.count, 9);
        assert_eq!(fit.area, 64);

        // a block as wide as the band gains nothing from packing more:
        // efficiency stays flat, so the first count wins
        let fit = best2pack(0, 64, 64, 64, 4, 256);
        assert_eq!(fit.count, 1);
        assert_eq!(fit.area, 64);
    }

    #[test]
    fn test_best2pack_respects_grid_width() {
        let fit = best2pack(0, 4, 4, 64, 100, 64);
        assert!(fit.count <= 16);
        assert!(fit.area <= 64);
    }

    #[test]
    fn test_best2pack_nothing_fits() {
        let fit = best2pack(0, 65, 65, 64, 4, 64);
        assert_eq!(fit.count, 0);
    }

    #[test]
    fn test_eff_prefers_full_coverage_at_equal_area() {
        // same area: the packing covering the request in one area must
        // always outrank a partial one
        let full = nv12_eff(8, 4, 64, 8);
        let partial = nv12_eff(5, 4, 64, 8);
        assert!(full > partial);
    }

    #[test]
    fn test_eff_zero_count_scores_zero() {
        assert_eq!(nv12_eff(0, 4, 64, 8), 0);
        assert!(nv12_eff(1, 4, 64, 8) > 0);
    }

    #[test]
    fn test_separate_estimate() {
        let (n, area) = separate_estimate(0, 4, 4, 9, 256);
        assert_eq!(n, 9);
        // half-plane area of 32 slots, scaled by three
        assert_eq!(area, 96);
    }

    #[test]
    fn test_progressive_layout_valid() {
        let layout = pack_progressive(2, 4, 4, 9);
        assert!(layout.count() >= 6, "expected a dense progressive packing");
        assert_layout_valid(&layout, 4);
    }

    #[test]
    fn test_mirrored_matches_progressive_count() {
        let prog = pack_progressive(0, 4, 4, 9);
        let mirr = pack_mirrored(0, 4, 4, 9);
        assert_eq!(prog.count(), mirr.count());
        assert_layout_valid(&mirr, 4);
    }

    #[test]
    fn test_canned_layout_is_picked() {
        // offset 2, width 4, align 4: the generators top out below nine
        // pairs, the first canned layout covers all nine
        let layout = pack_paired(2, 4, 4, 9);
        assert_eq!(layout.count(), 9);
        assert_eq!(layout.area, 64);
        assert_eq!(layout.pairs[0], (2, 33));
        assert_layout_valid(&layout, 4);
    }

    #[test]
    fn test_canned_layout_truncated_to_request() {
        let layout = pack_paired(2, 4, 4, 9);
        assert_eq!(layout.count(), 9);
        // requesting fewer keeps a prefix at most the request long
        let small = pack_paired(2, 4, 4, 2);
        assert!(small.count() <= 2);
        assert!(small.count() >= 1);
    }

    #[test]
    fn test_wide_blocks_fall_back_to_single_pair_or_nothing() {
        // a 40-slot block cannot share a 64-slot area with its partner in
        // any generator layout
        let layout = pack_paired(0, 40, 4, 4);
        assert!(layout.count() <= 1);
    }

    #[test]
    fn test_single_pair_fallback() {
        let layout = pack_single_pair(0, 20, 4, 1);
        if let Some(&(full, half)) = layout.pairs.first() {
            let half_w = 10;
            // partner sits entirely before or entirely after the block
            assert!(half + half_w <= full || half >= full + 20);
            assert!(half + half_w <= layout.area);
        }
    }

    #[test]
    fn test_pack_paired_prefers_covering_generator() {
        // small batch the progressive generator covers outright
        let layout = pack_paired(0, 4, 4, 3);
        assert_eq!(layout.count(), 3);
        assert_layout_valid(&layout, 4);
    }
}
