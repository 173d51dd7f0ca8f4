//! Block/area/group registry
//!
//! All bookkeeping lives in arena tables keyed by stable handles; the pool
//! serializes access through one lock, so nothing here locks. Destruction
//! cascades exactly three levels: a block's death can empty its area, an
//! area's death can collapse its group, and a kernel pseudo-owner dies with
//! its last group. Blocks that are still referenced when their group is
//! torn down are orphaned, not leaked.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::backing::PageBacking;
use crate::config::PoolConfig;
use crate::container::SlotContainer;
use crate::error::{PoolError, PoolResult};
use crate::pool::layout;
use crate::pool::types::{
    Area, AreaHandle, Block, BlockBacking, BlockHandle, BlockOwner, Group, GroupHandle, Owner,
    PoolStats, Process, TileFormat,
};

/// Galois LFSR polynomial for external id generation (taps 32, 22, 2, 1).
const ID_POLY: u32 = 0x8020_0003;

/// First id the generator emits.
const ID_SEED: u32 = 0x2d7ae;

pub(crate) struct Registry {
    pub(crate) config: PoolConfig,
    pub(crate) blocks: HashMap<BlockHandle, Block>,
    pub(crate) areas: HashMap<AreaHandle, Area>,
    pub(crate) groups: HashMap<GroupHandle, Group>,
    pub(crate) processes: HashMap<Owner, Process>,
    /// Activated blocks in insertion order; reserved placeholders are not
    /// visible here
    pub(crate) global: Vec<BlockHandle>,
    /// Still-referenced 1D blocks whose group is gone
    pub(crate) orphaned_blocks: Vec<BlockHandle>,
    /// Areas with referenced blocks whose group is gone
    pub(crate) orphaned_areas: Vec<AreaHandle>,
    next_block: u32,
    next_area: u32,
    next_group: u32,
    id_state: u32,
}

impl Registry {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Registry {
            config,
            blocks: HashMap::new(),
            areas: HashMap::new(),
            groups: HashMap::new(),
            processes: HashMap::new(),
            global: Vec::new(),
            orphaned_blocks: Vec::new(),
            orphaned_areas: Vec::new(),
            next_block: 1,
            next_area: 1,
            next_group: 1,
            id_state: ID_SEED,
        }
    }

    pub(crate) fn block(&self, h: BlockHandle) -> PoolResult<&Block> {
        self.blocks.get(&h).ok_or(PoolError::BlockNotFound)
    }

    pub(crate) fn block_mut(&mut self, h: BlockHandle) -> PoolResult<&mut Block> {
        self.blocks.get_mut(&h).ok_or(PoolError::BlockNotFound)
    }

    pub(crate) fn area(&self, h: AreaHandle) -> PoolResult<&Area> {
        self.areas.get(&h).ok_or(PoolError::BlockNotFound)
    }

    pub(crate) fn group(&self, h: GroupHandle) -> PoolResult<&Group> {
        self.groups.get(&h).ok_or(PoolError::GroupNotFound)
    }

    /// Create an unattached block shell. The caller attaches it to an area
    /// or group and activates it.
    pub(crate) fn new_block_shell(&mut self, fmt: TileFormat) -> BlockHandle {
        let h = BlockHandle(self.next_block);
        self.next_block += 1;
        self.blocks.insert(
            h,
            Block {
                handle: h,
                fmt,
                area: crate::geom::SlotArea::rect(0, 0, 0, 0),
                width_px: 0,
                height_px: 0,
                ssptr: 0,
                key: 0,
                id: 0,
                refs: 0,
                allocated: false,
                owner: BlockOwner::Orphaned,
                backing: BlockBacking::None,
            },
        );
        h
    }

    /// Register a freshly reserved area under a group.
    pub(crate) fn insert_area(
        &mut self,
        rect: crate::geom::SlotArea,
        gh: GroupHandle,
    ) -> AreaHandle {
        let h = AreaHandle(self.next_area);
        self.next_area += 1;
        self.areas.insert(
            h,
            Area {
                handle: h,
                rect,
                blocks: Vec::new(),
                group: Some(gh),
            },
        );
        if let Some(g) = self.groups.get_mut(&gh) {
            g.areas.push(h);
        }
        h
    }

    /*
     *  Group handling
     *  =======================================================================
     */

    /// Find or create the group `(owner, gid)` and take a reference on it.
    ///
    /// The reference keeps the group alive while a lookup or allocation is
    /// in flight; drop it with [`Registry::release_group`].
    pub(crate) fn get_group(&mut self, owner: Owner, gid: u32) -> GroupHandle {
        let process = self
            .processes
            .entry(owner)
            .or_insert_with(|| Process {
                owner,
                groups: Vec::new(),
            });

        for &gh in process.groups.iter() {
            if let Some(g) = self.groups.get(&gh) {
                if g.gid == gid {
                    if let Some(g) = self.groups.get_mut(&gh) {
                        g.refs += 1;
                    }
                    return gh;
                }
            }
        }

        let gh = GroupHandle(self.next_group);
        self.next_group += 1;
        process.groups.push(gh);
        self.groups.insert(
            gh,
            Group {
                handle: gh,
                gid,
                owner,
                areas: Vec::new(),
                onedim: Vec::new(),
                reserved: Vec::new(),
                refs: 1,
            },
        );
        debug!(pid = owner.pid, gid, "created group");
        gh
    }

    /// Look up an existing group without creating or referencing it.
    pub(crate) fn find_group(&self, owner: Owner, gid: u32) -> Option<GroupHandle> {
        let process = self.processes.get(&owner)?;
        process
            .groups
            .iter()
            .copied()
            .find(|gh| self.groups.get(gh).map(|g| g.gid) == Some(gid))
    }

    /// Drop a reference taken by [`Registry::get_group`].
    pub(crate) fn release_group(&mut self, gh: GroupHandle) {
        if let Some(g) = self.groups.get_mut(&gh) {
            g.refs = g.refs.saturating_sub(1);
        }
        self.try_free_group(gh);
    }

    /// Collapse the group if it holds nothing and nobody references it.
    /// A non-empty reserved list always keeps it alive.
    pub(crate) fn try_free_group(&mut self, gh: GroupHandle) {
        let collapsible = match self.groups.get(&gh) {
            Some(g) => g.is_collapsible(),
            None => return,
        };
        if !collapsible {
            return;
        }
        let group = self.groups.remove(&gh).expect("group vanished");
        debug!(pid = group.owner.pid, gid = group.gid, "destroyed empty group");

        if let Some(process) = self.processes.get_mut(&group.owner) {
            process.groups.retain(|&g| g != gh);
            // kernel pseudo-owners die with their last group
            if group.owner.kernel && process.groups.is_empty() {
                self.processes.remove(&group.owner);
            }
        }
    }

    /*
     *  Id handling
     *  =======================================================================
     */

    fn id_in_use(&self, id: u32) -> bool {
        self.global
            .iter()
            .any(|h| self.blocks.get(h).map(|b| b.id == id).unwrap_or(false))
    }

    /// Next external block id: a fixed Galois LFSR sequence, skipping ids
    /// that are currently in use.
    pub(crate) fn next_external_id(&mut self) -> u32 {
        while self.id_in_use(self.id_state) {
            self.id_state =
                (self.id_state >> 1) ^ (0u32.wrapping_sub(self.id_state & 1) & ID_POLY);
        }
        self.id_state
    }

    /*
     *  Lookup and reference counting
     *  =======================================================================
     */

    /// Find an activated block by `(key, id)`: in the global list, or within
    /// one group's 1D blocks and areas.
    pub(crate) fn find_block(
        &self,
        key: u32,
        id: u32,
        scope: Option<GroupHandle>,
    ) -> Option<BlockHandle> {
        let matches = |h: &BlockHandle| {
            self.blocks
                .get(h)
                .map(|b| b.key == key && b.id == id)
                .unwrap_or(false)
        };

        let gh = match scope {
            None => return self.global.iter().copied().find(|h| matches(h)),
            Some(gh) => gh,
        };
        let group = self.groups.get(&gh)?;

        // when ids are addresses the view tells 1D from 2D, halving the scan
        let addr_fmt = if self.config.ssptr_id {
            layout::slot_of_address(&self.config, id).ok().map(|(f, _)| f)
        } else {
            None
        };

        if addr_fmt.is_none() || addr_fmt == Some(TileFormat::Page) {
            if let Some(h) = group.onedim.iter().copied().find(|h| matches(h)) {
                return Some(h);
            }
        }
        if addr_fmt.is_none() || addr_fmt != Some(TileFormat::Page) {
            for ah in &group.areas {
                if let Some(area) = self.areas.get(ah) {
                    if let Some(h) = area.blocks.iter().copied().find(|h| matches(h)) {
                        return Some(h);
                    }
                }
            }
        }
        None
    }

    /// Find a block and lock it against destruction by taking a reference.
    pub(crate) fn lock_block(
        &mut self,
        key: u32,
        id: u32,
        scope: Option<GroupHandle>,
    ) -> Option<BlockHandle> {
        let h = self.find_block(key, id, scope)?;
        if let Some(b) = self.blocks.get_mut(&h) {
            b.refs += 1;
        }
        Some(h)
    }

    /// Drop a reference; with `free` also clear the allocated state so the
    /// block dies once the last reference is gone.
    pub(crate) fn unlock_block(
        &mut self,
        h: BlockHandle,
        free: bool,
        container: &mut dyn SlotContainer,
        backing: &mut dyn PageBacking,
    ) -> PoolResult<()> {
        if !self.blocks.contains_key(&h) {
            return Err(PoolError::BlockNotFound);
        }
        let freed = self.dec_ref(h, container, backing);
        if free && !freed {
            self.try_free(h, container, backing);
        }
        Ok(())
    }

    fn dec_ref(
        &mut self,
        h: BlockHandle,
        container: &mut dyn SlotContainer,
        backing: &mut dyn PageBacking,
    ) -> bool {
        let last = match self.blocks.get_mut(&h) {
            Some(b) => {
                let prev = b.refs;
                b.refs = prev.saturating_sub(1);
                prev <= 1
            }
            None => return true,
        };
        if last {
            self.check_idle(h, container, backing)
        } else {
            false
        }
    }

    fn check_idle(
        &mut self,
        h: BlockHandle,
        container: &mut dyn SlotContainer,
        backing: &mut dyn PageBacking,
    ) -> bool {
        match self.blocks.get(&h) {
            Some(b) if b.refs == 0 => {
                self.destroy_block(h, container, backing);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Release the allocation's own reference and destroy the block if no
    /// lookup still holds it. Returns whether the block was destroyed.
    pub(crate) fn try_free(
        &mut self,
        h: BlockHandle,
        container: &mut dyn SlotContainer,
        backing: &mut dyn PageBacking,
    ) -> bool {
        match self.blocks.get_mut(&h) {
            Some(b) => {
                if b.allocated {
                    b.refs = b.refs.saturating_sub(1);
                    b.allocated = false;
                }
            }
            None => return true,
        }
        self.check_idle(h, container, backing)
    }

    /*
     *  Destruction cascade
     *  =======================================================================
     */

    /// Destroy a block outright: release its backing, detach it from every
    /// list, free an emptied area back to the container and re-check the
    /// group. Reference counts are not consulted here.
    pub(crate) fn destroy_block(
        &mut self,
        h: BlockHandle,
        container: &mut dyn SlotContainer,
        backing: &mut dyn PageBacking,
    ) {
        let block = match self.blocks.remove(&h) {
            Some(b) => b,
            None => return,
        };

        match &block.backing {
            BlockBacking::Pool(pages) => {
                backing.release(pages);
                backing.clear(&block.area);
            }
            BlockBacking::User(_) => backing.clear(&block.area),
            BlockBacking::None => {}
        }

        self.global.retain(|&x| x != h);
        self.orphaned_blocks.retain(|&x| x != h);
        for g in self.groups.values_mut() {
            g.reserved.retain(|&x| x != h);
        }

        match block.owner {
            BlockOwner::Area(ah) => {
                let emptied = match self.areas.get_mut(&ah) {
                    Some(area) => {
                        area.blocks.retain(|&x| x != h);
                        area.blocks.is_empty().then_some((area.rect, area.group))
                    }
                    None => None,
                };
                if let Some((rect, group)) = emptied {
                    if let Err(e) = container.free(&rect) {
                        error!(error = %e, "error while freeing an emptied area");
                    }
                    self.areas.remove(&ah);
                    self.orphaned_areas.retain(|&x| x != ah);
                    if let Some(gh) = group {
                        if let Some(g) = self.groups.get_mut(&gh) {
                            g.areas.retain(|&x| x != ah);
                        }
                        self.try_free_group(gh);
                    }
                }
            }
            BlockOwner::Group(gh) => {
                if let Err(e) = container.free(&block.area) {
                    error!(error = %e, "error while freeing a strip reservation");
                }
                if let Some(g) = self.groups.get_mut(&gh) {
                    g.onedim.retain(|&x| x != h);
                }
                self.try_free_group(gh);
            }
            BlockOwner::Orphaned => {
                // an orphaned 1D block still owns its strip
                if !block.area.is_2d() {
                    if let Err(e) = container.free(&block.area) {
                        error!(error = %e, "error while freeing an orphaned strip");
                    }
                }
            }
        }
    }

    /// Tear down a group: reserved placeholders are released, every block
    /// is freed, and anything still referenced is orphaned so the group
    /// itself can always go away.
    pub(crate) fn destroy_group(
        &mut self,
        gh: GroupHandle,
        container: &mut dyn SlotContainer,
        backing: &mut dyn PageBacking,
    ) -> PoolResult<()> {
        if !self.groups.contains_key(&gh) {
            return Err(PoolError::GroupNotFound);
        }

        // reserved placeholders hold no references and die first
        let reserved: Vec<BlockHandle> = self
            .groups
            .get_mut(&gh)
            .map(|g| g.reserved.drain(..).collect())
            .unwrap_or_default();
        for h in reserved {
            self.destroy_block(h, container, backing);
        }

        let area_handles: Vec<AreaHandle> = self
            .groups
            .get(&gh)
            .map(|g| g.areas.clone())
            .unwrap_or_default();
        for ah in area_handles {
            let block_handles: Vec<BlockHandle> = match self.areas.get(&ah) {
                Some(a) => a.blocks.clone(),
                None => continue,
            };
            let mut all_freed = true;
            for h in block_handles {
                all_freed &= self.try_free(h, container, backing);
            }
            if !all_freed {
                warn!(area = ah.0, "orphaning area with referenced blocks");
                if let Some(area) = self.areas.get_mut(&ah) {
                    area.group = None;
                }
                if let Some(g) = self.groups.get_mut(&gh) {
                    g.areas.retain(|&x| x != ah);
                }
                self.orphaned_areas.push(ah);
            }
        }

        let onedim: Vec<BlockHandle> = self
            .groups
            .get(&gh)
            .map(|g| g.onedim.clone())
            .unwrap_or_default();
        for h in onedim {
            if !self.try_free(h, container, backing) {
                warn!(block = h.0, "orphaning referenced 1D block");
                if let Some(b) = self.blocks.get_mut(&h) {
                    b.owner = BlockOwner::Orphaned;
                }
                if let Some(g) = self.groups.get_mut(&gh) {
                    g.onedim.retain(|&x| x != h);
                }
                self.orphaned_blocks.push(h);
            }
        }

        // the cascade may already have collapsed the group
        self.try_free_group(gh);
        Ok(())
    }

    /// Release reserved placeholders outright. A placeholder that is
    /// referenced or has been handed out cannot be on a reserved list.
    pub(crate) fn release_reserved(
        &mut self,
        list: &[BlockHandle],
        container: &mut dyn SlotContainer,
        backing: &mut dyn PageBacking,
    ) -> PoolResult<()> {
        for &h in list {
            match self.blocks.get(&h) {
                Some(b) if b.refs > 0 || b.allocated => return Err(PoolError::Busy),
                Some(_) => {}
                None => continue,
            }
            self.destroy_block(h, container, backing);
        }
        Ok(())
    }

    /// Move placeholders from a caller-held list onto the group's reserved
    /// pool, where the allocation reuse path can find them.
    pub(crate) fn add_reserved(&mut self, list: Vec<BlockHandle>, gh: GroupHandle) {
        if let Some(g) = self.groups.get_mut(&gh) {
            g.reserved.extend(list);
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            blocks: self.blocks.len(),
            areas: self.areas.len(),
            groups: self.groups.len(),
            processes: self.processes.len(),
            orphaned_blocks: self.orphaned_blocks.len(),
            orphaned_areas: self.orphaned_areas.len(),
            reserved_blocks: self.groups.values().map(|g| g.reserved.len()).sum(),
        }
    }
}
