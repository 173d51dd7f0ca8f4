//! Geometric allocation: placing blocks into areas
//!
//! Three paths, tried in priority order: reuse an exact-match reserved
//! placeholder, fit into an existing same-height area (first fit in group
//! order, no global optimum search), or reserve a fresh area sized to the
//! block. Bulk pre-reservation lays n same-size blocks into one area at a
//! fixed pitch; paired pre-reservation places generator-provided
//! heterogeneous widths into one area.

use tracing::{debug, info};

use crate::container::SlotContainer;
use crate::error::{PoolError, PoolResult};
use crate::geom::{align_slots, SlotArea};
use crate::pool::layout::{self, AreaSpec};
use crate::pool::registry::Registry;
use crate::pool::types::{
    BlockDescriptor, BlockHandle, BlockOwner, GroupHandle, TileFormat,
};

impl Registry {
    /// Rightmost-gap search within one area, left to right over the placed
    /// blocks. Returns the x origin where a `w`-slot block with the given
    /// alignment/offset residue fits, plus the insertion index that keeps
    /// the block list sorted by x.
    fn find_fit(
        &self,
        ah: crate::pool::types::AreaHandle,
        w: u16,
        align: u16,
        offs: u16,
    ) -> Option<(u16, usize)> {
        let area = self.areas.get(&ah)?;

        // end coordinate of a candidate placed at the area start
        let mut x = area.rect.p0.x + w + offs;
        for (i, bh) in area.blocks.iter().enumerate() {
            let b = self.blocks.get(bh)?;
            if x <= b.area.p0.x {
                return Some((x - w, i));
            }
            x = align_slots(b.area.p1.x + 1 - offs, align) + w + offs;
        }
        if x <= area.rect.p1.x + 1 {
            Some((x - w, area.blocks.len()))
        } else {
            None
        }
    }

    /// Attach a block to an area at `x0`, spanning the area's full height.
    fn add_to_area(
        &mut self,
        bh: BlockHandle,
        ah: crate::pool::types::AreaHandle,
        x0: u16,
        w: u16,
        index: usize,
    ) {
        let rect = match self.areas.get(&ah) {
            Some(a) => a.rect,
            None => return,
        };
        if let Some(b) = self.blocks.get_mut(&bh) {
            b.owner = BlockOwner::Area(ah);
            b.area = SlotArea::rect(x0, rect.p0.y, x0 + w - 1, rect.p1.y);
        }
        if let Some(a) = self.areas.get_mut(&ah) {
            a.blocks.insert(index, bh);
        }
    }

    /// The core 2D packing entry point: reuse, fit, or reserve anew.
    pub(crate) fn get_2d_area(
        &mut self,
        container: &mut dyn SlotContainer,
        w: u16,
        h: u16,
        align: u16,
        offs: u16,
        band: u16,
        gh: GroupHandle,
    ) -> PoolResult<BlockHandle> {
        // 1. an exact-geometry reserved placeholder is free to hand out
        let reserved = self.group(gh)?.reserved.clone();
        for (i, &bh) in reserved.iter().enumerate() {
            let hit = self
                .blocks
                .get(&bh)
                .map(|b| {
                    b.area.is_2d()
                        && b.area.height() == h
                        && b.area.width() == w
                        && (b.area.p0.x & (align - 1)) == offs
                })
                .unwrap_or(false);
            if hit {
                if let Some(g) = self.groups.get_mut(&gh) {
                    g.reserved.remove(i);
                }
                debug!(block = bh.0, "reusing reserved placeholder");
                return Ok(bh);
            }
        }

        // 2. first existing area of matching height with a wide-enough gap
        let areas = self.group(gh)?.areas.clone();
        for ah in areas {
            let height_matches = self
                .areas
                .get(&ah)
                .map(|a| a.rect.height() == h)
                .unwrap_or(false);
            if !height_matches {
                continue;
            }
            if let Some((x0, index)) = self.find_fit(ah, w, align, offs) {
                let bh = self.new_block_shell(TileFormat::Bpp8);
                self.add_to_area(bh, ah, x0, w, index);
                return Ok(bh);
            }
        }

        // 3. a fresh area sized to exactly this block
        let big = align.max(band);
        let rect = container.reserve_rect(align_slots(w + offs, big), h, big)?;
        let ah = self.insert_area(rect, gh);
        let bh = self.new_block_shell(TileFormat::Bpp8);
        self.add_to_area(bh, ah, rect.p0.x + offs, w, 0);
        Ok(bh)
    }

    /// Pre-reserve `n` identical blocks as one area at pitch
    /// `align(w, align)`, pushing the placeholders onto `out`.
    ///
    /// Returns the count placed; the area is reserved in full up front, so
    /// a success places every block.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reserve_2d(
        &mut self,
        container: &mut dyn SlotContainer,
        fmt: TileFormat,
        n: u16,
        w: u16,
        h: u16,
        band: u16,
        align: u16,
        offs: u16,
        gh: GroupHandle,
        out: &mut Vec<BlockHandle>,
    ) -> PoolResult<u16> {
        if n == 0 {
            return Ok(0);
        }
        let e = align_slots(w, align);
        let w_res = (n as u32 - 1) * e as u32 + w as u32;
        if w_res > u16::MAX as u32 {
            return Err(PoolError::OutOfSpace);
        }
        let w_res = w_res as u16;

        info!(n, w, w_res, "packing blocks into one reserved area");

        let big = align.max(band);
        let rect = container.reserve_rect(align_slots(w_res + offs, big), h, big)?;
        let ah = self.insert_area(rect, gh);

        let mut count: u16 = 0;
        let mut x = offs;
        while x < w_res {
            let bh = self.new_block_shell(fmt);
            self.add_to_area(bh, ah, rect.p0.x + x, w, count as usize);
            out.push(bh);
            count += 1;
            x += e;
        }
        Ok(count)
    }

    /// Lay a paired-plane layout into one area: even entries are
    /// full-plane blocks of width `w`, odd entries half-plane blocks of
    /// width `(w + 1) / 2`, at the generator-provided offsets. All
    /// placeholders land on the group's reserved pool.
    pub(crate) fn pack_paired_area(
        &mut self,
        container: &mut dyn SlotContainer,
        n: u16,
        area_w: u16,
        w: u16,
        h: u16,
        gh: GroupHandle,
        pairs: &[(u16, u16)],
    ) -> PoolResult<u16> {
        let half_w = (w + 1) >> 1;
        let rect = container.reserve_rect(area_w, h, 64)?;
        let ah = self.insert_area(rect, gh);

        for m in 0..(2 * n as usize) {
            let (width, rel_x, fmt) = if m % 2 == 0 {
                (w, pairs[m / 2].0, TileFormat::Bpp8)
            } else {
                (half_w, pairs[m / 2].1, TileFormat::Bpp16)
            };
            let x0 = rect.p0.x + rel_x;

            // keep the area's block list sorted by x
            let index = {
                let area = self.area(ah)?;
                let mut index = area.blocks.len();
                for (i, bh) in area.blocks.iter().enumerate() {
                    let bx = self.blocks.get(bh).map(|b| b.area.p0.x).unwrap_or(0);
                    if bx > x0 {
                        index = i;
                        break;
                    }
                }
                index
            };

            let bh = self.new_block_shell(fmt);
            self.add_to_area(bh, ah, x0, width, index);
            if let Some(g) = self.groups.get_mut(&gh) {
                g.reserved.push(bh);
            }
        }
        Ok(n)
    }

    /// Place a block for `spec` under the group: a strip for the linear
    /// format, 2D packing otherwise. The block is left unactivated.
    pub(crate) fn place_block(
        &mut self,
        container: &mut dyn SlotContainer,
        fmt: TileFormat,
        spec: &AreaSpec,
        gh: GroupHandle,
    ) -> PoolResult<BlockHandle> {
        if fmt.is_linear() {
            let strip =
                container.reserve_strip(spec.width as u32 * spec.height as u32)?;
            let bh = self.new_block_shell(fmt);
            if let Some(b) = self.blocks.get_mut(&bh) {
                b.area = strip;
                b.owner = BlockOwner::Group(gh);
            }
            if let Some(g) = self.groups.get_mut(&gh) {
                g.onedim.push(bh);
            }
            Ok(bh)
        } else {
            self.get_2d_area(
                container,
                spec.width,
                spec.height,
                spec.align,
                spec.offset,
                spec.band,
                gh,
            )
        }
    }

    /// Publish a placed block: compute its external address, mark it
    /// allocated with the allocation's own reference, enter it into the
    /// global lookup list and drop the group's transient reference.
    pub(crate) fn activate_block(
        &mut self,
        bh: BlockHandle,
        fmt: TileFormat,
        in_offset: u32,
        gh: GroupHandle,
    ) -> PoolResult<u32> {
        let config = self.config.clone();
        let ssptr = {
            let b = self.block_mut(bh)?;
            b.fmt = fmt;
            b.ssptr = layout::external_address(&config, fmt, &b.area, in_offset);
            b.allocated = true;
            b.refs += 1;
            b.ssptr
        };
        self.global.push(bh);
        if let Some(g) = self.groups.get_mut(&gh) {
            g.refs = g.refs.saturating_sub(1);
        }
        Ok(ssptr)
    }

    /// Client-facing descriptor of an activated block.
    pub(crate) fn describe(&self, bh: BlockHandle) -> PoolResult<BlockDescriptor> {
        let b = self.block(bh)?;
        let group_id = match b.owner {
            BlockOwner::Area(ah) => self
                .areas
                .get(&ah)
                .and_then(|a| a.group)
                .and_then(|gh| self.groups.get(&gh))
                .map(|g| g.gid)
                .unwrap_or(0),
            BlockOwner::Group(gh) => self.groups.get(&gh).map(|g| g.gid).unwrap_or(0),
            BlockOwner::Orphaned => 0,
        };
        let stride = if b.fmt.is_linear() {
            0
        } else {
            layout::view_row_stride(&self.config, b.fmt)
        };
        Ok(BlockDescriptor {
            fmt: b.fmt,
            ssptr: b.ssptr,
            stride,
            width: b.width_px,
            height: b.height_px,
            group_id,
            key: b.key,
            id: b.id,
            offset: b.ssptr & (self.config.page_size - 1),
        })
    }
}
