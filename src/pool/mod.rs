//! The tile pool: grouped, reference-counted 2D block allocation
//!
//! This module ties the registry, the slot container and the page backing
//! together behind [`TilePool`]. One mutex serializes registry state;
//! the container and backing sit behind their own locks and are only ever
//! taken after the registry lock (never the other way around). Page
//! backing for a fresh block is filled in outside the registry lock: the
//! block is published first, so concurrent lookups can find a valid handle
//! whose backing is still in flight - callers never see the id until the
//! fill completes.

mod alloc;
pub mod layout;
mod nv12;
mod registry;
pub mod types;

pub use types::{
    Area, AreaHandle, Block, BlockBacking, BlockDescriptor, BlockHandle, BlockOwner, Group,
    GroupHandle, Owner, PoolStats, Process, TileFormat,
};

use std::sync::Mutex;

use tracing::debug;

use crate::backing::{PageAddr, PageBacking, PagePool, PageStats};
use crate::config::PoolConfig;
use crate::container::{ContainerStats, GridContainer, SlotContainer};
use crate::error::{PoolError, PoolResult};
use crate::geom::align_slots;
use registry::Registry;

/// A two-dimensional tiled memory pool.
///
/// Blocks of four pixel formats are packed into a fixed slot grid, backed
/// by physical pages, and owned through `(owner, group id)` scopes with
/// reference-counted lifetimes.
pub struct TilePool<C: SlotContainer = GridContainer, B: PageBacking = PagePool> {
    config: PoolConfig,
    state: Mutex<Registry>,
    container: Mutex<C>,
    backing: Mutex<B>,
}

impl TilePool<GridContainer, PagePool> {
    /// Build a pool with the in-crate container and page pool, sized one
    /// page per slot.
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        let container = GridContainer::new(config.grid_width, config.grid_height)?;
        let backing = PagePool::new(
            config.total_slots() as usize,
            config.page_size,
            config.grid_width,
        )?;
        TilePool::with_parts(config, container, backing)
    }
}

impl<C: SlotContainer, B: PageBacking> TilePool<C, B> {
    /// Build a pool over caller-supplied container and backing managers.
    pub fn with_parts(config: PoolConfig, container: C, backing: B) -> PoolResult<Self> {
        config.validate()?;
        Ok(TilePool {
            state: Mutex::new(Registry::new(config.clone())),
            container: Mutex::new(container),
            backing: Mutex::new(backing),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /*
     *  Allocation entry points
     *  =======================================================================
     */

    /// Allocate a block of `width x height` pixels (bytes x 1 for the
    /// linear format) under `(owner, gid)`, at the given byte alignment
    /// and offset-within-alignment, tagged with the caller's `key`.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_block(
        &self,
        fmt: TileFormat,
        width: u32,
        height: u32,
        align: u32,
        offset: u32,
        key: u32,
        gid: u32,
        owner: Owner,
    ) -> PoolResult<BlockDescriptor> {
        // only up to page alignment is supported
        if align > self.config.page_size {
            return Err(PoolError::InvalidAlignment(align));
        }
        let effective = if align == 0 {
            self.config.default_align
        } else {
            align
        };
        if offset >= effective {
            return Err(PoolError::InvalidOffset {
                offset,
                align: effective,
            });
        }

        // rejected before any state mutation
        let spec = layout::analyze_area(&self.config, fmt, width, height, align, offset)?;

        let gh = self.state.lock()?.get_group(owner, gid);

        let placed = {
            let mut reg = self.state.lock()?;
            let mut container = self.container.lock()?;
            reg.place_block(&mut *container, fmt, &spec, gh)
        };
        let bh = match placed {
            Ok(bh) => bh,
            Err(e) => {
                self.state.lock()?.release_group(gh);
                return Err(e);
            }
        };

        // publish the block, then fill its backing outside the state lock
        let (area, slots, descriptor) = {
            let mut reg = self.state.lock()?;
            reg.activate_block(bh, fmt, spec.in_offset, gh)?;
            let id = if self.config.ssptr_id {
                reg.block(bh)?.ssptr
            } else {
                reg.next_external_id()
            };
            let block = reg.block_mut(bh)?;
            block.width_px = width;
            block.height_px = height;
            block.key = key;
            block.id = id;
            let area = block.area;
            (
                area,
                area.slot_count(self.config.grid_width),
                reg.describe(bh)?,
            )
        };

        let fill = (|| -> PoolResult<Vec<PageAddr>> {
            let mut backing = self.backing.lock()?;
            let pages = backing.acquire(slots as usize)?;
            if let Err(e) = backing.program(&area, &pages) {
                backing.release(&pages);
                return Err(e);
            }
            Ok(pages)
        })();

        match fill {
            Ok(pages) => {
                self.state.lock()?.block_mut(bh)?.backing = BlockBacking::Pool(pages);
                debug!(ssptr = descriptor.ssptr, id = descriptor.id, "allocated block");
                Ok(descriptor)
            }
            Err(e) => {
                self.teardown_block(bh)?;
                Err(e)
            }
        }
    }

    /// Bind a linear block to an external buffer at `addr` of `len` bytes.
    /// The buffer's own pages back the block; resolution is page-granular
    /// and fails if the covering pages cross an unresolvable hole.
    pub fn map_block(
        &self,
        len: u32,
        key: u32,
        gid: u32,
        owner: Owner,
        addr: u64,
    ) -> PoolResult<BlockDescriptor> {
        let fmt = TileFormat::Page;
        let spec = layout::analyze_area(&self.config, fmt, len, 1, 0, 0)?;

        let gh = self.state.lock()?.get_group(owner, gid);

        let placed = {
            let mut reg = self.state.lock()?;
            let mut container = self.container.lock()?;
            reg.place_block(&mut *container, fmt, &spec, gh)
        };
        let bh = match placed {
            Ok(bh) => bh,
            Err(e) => {
                self.state.lock()?.release_group(gh);
                return Err(e);
            }
        };

        let (area, slots, descriptor) = {
            let mut reg = self.state.lock()?;
            reg.activate_block(bh, fmt, spec.in_offset, gh)?;
            let id = if self.config.ssptr_id {
                reg.block(bh)?.ssptr
            } else {
                reg.next_external_id()
            };
            let block = reg.block_mut(bh)?;
            block.width_px = len;
            block.height_px = 1;
            block.key = key;
            block.id = id;
            let area = block.area;
            (
                area,
                area.slot_count(self.config.grid_width),
                reg.describe(bh)?,
            )
        };

        let page = self.config.page_size as u64;
        let first_page = addr & !(page - 1);
        let fill = (|| -> PoolResult<Vec<PageAddr>> {
            let mut backing = self.backing.lock()?;
            let pages = backing.resolve_user(first_page, slots as u64 * page)?;
            backing.program(&area, &pages)?;
            Ok(pages)
        })();

        match fill {
            Ok(pages) => {
                self.state.lock()?.block_mut(bh)?.backing = BlockBacking::User(pages);
                debug!(ssptr = descriptor.ssptr, addr, "mapped user buffer");
                Ok(descriptor)
            }
            Err(e) => {
                self.teardown_block(bh)?;
                Err(e)
            }
        }
    }

    fn teardown_block(&self, bh: BlockHandle) -> PoolResult<()> {
        let mut reg = self.state.lock()?;
        let mut container = self.container.lock()?;
        let mut backing = self.backing.lock()?;
        reg.destroy_block(bh, &mut *container, &mut *backing);
        Ok(())
    }

    /*
     *  Lookup and release
     *  =======================================================================
     */

    /// Find a block by `(key, id)` and lock it against destruction.
    /// With a scope, only that group's blocks are searched.
    pub fn lock_block(
        &self,
        key: u32,
        id: u32,
        scope: Option<(Owner, u32)>,
    ) -> PoolResult<BlockHandle> {
        let mut reg = self.state.lock()?;
        let gh = match scope {
            None => None,
            Some((owner, gid)) => Some(
                reg.find_group(owner, gid)
                    .ok_or(PoolError::GroupNotFound)?,
            ),
        };
        reg.lock_block(key, id, gh).ok_or(PoolError::BlockNotFound)
    }

    /// Drop a lock taken by [`TilePool::lock_block`]; with `free` the block
    /// is also released and dies once its last reference is gone.
    pub fn unlock_block(&self, h: BlockHandle, free: bool) -> PoolResult<()> {
        let mut reg = self.state.lock()?;
        let mut container = self.container.lock()?;
        let mut backing = self.backing.lock()?;
        reg.unlock_block(h, free, &mut *container, &mut *backing)
    }

    /// Release a block by `(key, id)`. If someone still holds it, actual
    /// destruction is deferred to their unlock.
    pub fn free_block(&self, key: u32, id: u32, scope: Option<(Owner, u32)>) -> PoolResult<()> {
        let h = self.lock_block(key, id, scope)?;
        self.unlock_block(h, true)
    }

    /// Describe an activated block.
    pub fn block_info(&self, h: BlockHandle) -> PoolResult<BlockDescriptor> {
        self.state.lock()?.describe(h)
    }

    /// The slot rectangle (or strip) a block occupies.
    pub fn block_area(&self, h: BlockHandle) -> PoolResult<crate::geom::SlotArea> {
        Ok(self.state.lock()?.block(h)?.area)
    }

    /// Reverse lookup: the block whose slots contain an external address.
    pub fn find_by_address(&self, ssptr: u32) -> PoolResult<BlockHandle> {
        let (fmt, pt) = layout::slot_of_address(&self.config, ssptr)?;
        let reg = self.state.lock()?;
        reg.global
            .iter()
            .copied()
            .find(|h| {
                reg.blocks
                    .get(h)
                    .map(|b| b.fmt == fmt && b.area.contains(pt, self.config.grid_width))
                    .unwrap_or(false)
            })
            .ok_or(PoolError::BlockNotFound)
    }

    /*
     *  Pre-reservation
     *  =======================================================================
     */

    /// Pre-reserve `n` subsampled image pairs (full-resolution 8-bit plane
    /// plus half-resolution 16-bit plane) under `(owner, gid)`. Per batch
    /// the cheaper of separate and co-packed layout is chosen; the count
    /// actually reserved is returned and partial success is kept.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve_nv12(
        &self,
        n: u32,
        width: u32,
        height: u32,
        align: u32,
        offset: u32,
        gid: u32,
        owner: Owner,
        can_together: bool,
    ) -> PoolResult<u32> {
        if n == 0 || width == 0 || height == 0 {
            return Err(PoolError::ZeroSize);
        }
        // the half plane halves the offset, so it must be even
        if offset % 2 == 1 || offset >= align {
            return Err(PoolError::InvalidOffset { offset, align });
        }
        if align >= self.config.page_size || !align.is_power_of_two() {
            return Err(PoolError::InvalidAlignment(align));
        }
        if n > self.config.total_slots() / 2 {
            return Err(PoolError::OutOfSpace);
        }

        // at least one half-plane slot row of alignment
        let a_bytes = align.max(128);
        let spec =
            layout::analyze_area(&self.config, TileFormat::Bpp8, width, height, a_bytes, offset)?;
        let (w, h, band, a, o) = (spec.width, spec.height, spec.band, spec.align, spec.offset);
        let grid_width = self.config.grid_width;

        let gh = self.state.lock()?.get_group(owner, gid);

        let mut total: u32 = 0;
        while total < n {
            let remaining = (n - total).min(u16::MAX as u32) as u16;

            let (n_s, area_s) = nv12::separate_estimate(o, w, a, remaining, grid_width);
            let paired = if can_together {
                nv12::pack_paired(o, w, a, remaining)
            } else {
                nv12::PairLayout::default()
            };
            let n_t = paired.count();

            let separate_wins = !can_together
                || nv12::nv12_eff(n_s, w, area_s, remaining)
                    > nv12::nv12_eff(n_t, w, paired.area, remaining);

            let mut placed: u16 = 0;
            if separate_wins && n_s > 0 {
                let mut reg = self.state.lock()?;
                let mut container = self.container.lock()?;
                let mut staged: Vec<BlockHandle> = Vec::new();

                let full = reg.reserve_2d(
                    &mut *container,
                    TileFormat::Bpp8,
                    n_s,
                    w,
                    h,
                    band,
                    a,
                    o,
                    gh,
                    &mut staged,
                );
                // only pair the half plane with a successful full plane:
                // a lone half-plane area can never match a later full-plane
                // reservation's offset
                let outcome = match full {
                    Ok(c1) => reg
                        .reserve_2d(
                            &mut *container,
                            TileFormat::Bpp16,
                            n_s,
                            (w + 1) / 2,
                            h,
                            band / 2,
                            a / 2,
                            o / 2,
                            gh,
                            &mut staged,
                        )
                        .map(|c2| (c1, c2)),
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok((c1, c2)) if c1 == c2 => {
                        reg.add_reserved(staged, gh);
                        placed = c1;
                    }
                    _ => {
                        let mut backing = self.backing.lock()?;
                        let _ = reg.release_reserved(&staged, &mut *container, &mut *backing);
                    }
                }
            }

            // if separate packing failed or lost, still try to pack together
            if placed == 0 && can_together && n_t > 0 {
                let mut reg = self.state.lock()?;
                let mut container = self.container.lock()?;
                placed = reg
                    .pack_paired_area(&mut *container, n_t, paired.area, w, h, gh, &paired.pairs)
                    .unwrap_or(0);
            }

            if placed == 0 {
                break;
            }
            total += placed as u32;
        }

        self.state.lock()?.release_group(gh);
        Ok(total)
    }

    /// Pre-reserve `n` ordinary 2D blocks, chunked into areas sized by the
    /// strip-packing estimate. Requests small enough for the default
    /// allocator are a no-op. Partial success is kept.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve_blocks(
        &self,
        n: u32,
        fmt: TileFormat,
        width: u32,
        height: u32,
        align: u32,
        offset: u32,
        gid: u32,
        owner: Owner,
    ) -> PoolResult<u32> {
        if n == 0 || width == 0 || height == 0 {
            return Err(PoolError::ZeroSize);
        }
        if fmt.is_linear() {
            return Err(PoolError::UnsupportedFormat);
        }
        if align > self.config.page_size {
            return Err(PoolError::InvalidAlignment(align));
        }
        let effective = if align == 0 {
            self.config.default_align
        } else {
            align
        };
        if offset >= effective {
            return Err(PoolError::InvalidOffset {
                offset,
                align: effective,
            });
        }

        // blocks under half a page row pack fine on the default path
        if width * fmt.bytes_per_pixel() * 2 <= self.config.page_size {
            return Ok(0);
        }

        let spec = layout::analyze_area(&self.config, fmt, width, height, align, offset)?;
        let pitch = align_slots(spec.width, spec.align);

        let gh = self.state.lock()?.get_group(owner, gid);

        let mut total: u32 = 0;
        while total < n {
            let mut n_try = (n - total).min(self.config.grid_width as u32) as u16;
            let fit = nv12::best2pack(
                spec.offset,
                spec.width,
                pitch,
                spec.band,
                n_try,
                self.config.grid_width,
            );
            if fit.count > 0 {
                n_try = fit.count;
            }

            let mut placed: u16 = 0;
            while n_try > 1 {
                let attempt = {
                    let mut reg = self.state.lock()?;
                    let mut container = self.container.lock()?;
                    let mut staged = Vec::new();
                    match reg.reserve_2d(
                        &mut *container,
                        fmt,
                        n_try,
                        spec.width,
                        spec.height,
                        spec.band,
                        spec.align,
                        spec.offset,
                        gh,
                        &mut staged,
                    ) {
                        Ok(c) => {
                            reg.add_reserved(staged, gh);
                            Some(c)
                        }
                        Err(_) => None,
                    }
                };
                match attempt {
                    Some(c) => {
                        placed = c;
                        break;
                    }
                    // shrink the batch until an area fits
                    None => n_try -= 1,
                }
            }

            if placed == 0 {
                break;
            }
            total += placed as u32;
        }

        self.state.lock()?.release_group(gh);
        Ok(total)
    }

    /// Release every reserved placeholder of `(owner, gid)`.
    pub fn unreserve_blocks(&self, owner: Owner, gid: u32) -> PoolResult<()> {
        let mut reg = self.state.lock()?;
        let gh = match reg.find_group(owner, gid) {
            Some(gh) => gh,
            None => return Ok(()),
        };
        let list: Vec<BlockHandle> = reg.group(gh)?.reserved.clone();
        let mut container = self.container.lock()?;
        let mut backing = self.backing.lock()?;
        reg.release_reserved(&list, &mut *container, &mut *backing)?;
        reg.try_free_group(gh);
        Ok(())
    }

    /*
     *  Teardown
     *  =======================================================================
     */

    /// Tear down a group: everything it owns is freed, and blocks still
    /// referenced from outside are orphaned rather than leaked.
    pub fn destroy_group(&self, owner: Owner, gid: u32) -> PoolResult<()> {
        let mut reg = self.state.lock()?;
        let gh = reg.find_group(owner, gid).ok_or(PoolError::GroupNotFound)?;
        let mut container = self.container.lock()?;
        let mut backing = self.backing.lock()?;
        reg.destroy_group(gh, &mut *container, &mut *backing)
    }

    /// Tear down every group of an owner.
    pub fn destroy_process(&self, owner: Owner) -> PoolResult<()> {
        let mut reg = self.state.lock()?;
        let groups: Vec<GroupHandle> = reg
            .processes
            .get(&owner)
            .map(|p| p.groups.clone())
            .unwrap_or_default();
        let mut container = self.container.lock()?;
        let mut backing = self.backing.lock()?;
        for gh in groups {
            let _ = reg.destroy_group(gh, &mut *container, &mut *backing);
        }
        if reg
            .processes
            .get(&owner)
            .map(|p| p.groups.is_empty())
            .unwrap_or(false)
        {
            reg.processes.remove(&owner);
        }
        Ok(())
    }

    /*
     *  Introspection
     *  =======================================================================
     */

    pub fn stats(&self) -> PoolResult<PoolStats> {
        Ok(self.state.lock()?.stats())
    }

    pub fn container_stats(&self) -> PoolResult<ContainerStats> {
        Ok(self.container.lock()?.stats())
    }

    pub fn page_stats(&self) -> PoolResult<PageStats> {
        Ok(self.backing.lock()?.stats())
    }

    /// Run a closure against the backing manager, e.g. to register user
    /// buffer ranges on the in-crate page pool.
    pub fn with_backing<R>(&self, f: impl FnOnce(&mut B) -> R) -> PoolResult<R> {
        Ok(f(&mut *self.backing.lock()?))
    }
}
