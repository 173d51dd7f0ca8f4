//! Core types for the block/area/group registry
//!
//! Registry entries live in arena tables keyed by the handle types below;
//! ownership is expressed as index relations (a block knows its area handle,
//! an area knows its group handle) rather than pointers, and a detached
//! entry is tagged orphaned instead of being re-parented.

use serde::{Deserialize, Serialize};

use crate::backing::PageAddr;
use crate::geom::SlotArea;

/// Pixel format of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileFormat {
    /// 8-bit samples, 64x64 pixel slots
    Bpp8,
    /// 16-bit samples, 64x32 pixel slots
    Bpp16,
    /// 32-bit samples, 32x32 pixel slots
    Bpp32,
    /// Linear page-granular data, one-dimensional
    Page,
}

impl TileFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TileFormat::Bpp8 | TileFormat::Page => 1,
            TileFormat::Bpp16 => 2,
            TileFormat::Bpp32 => 4,
        }
    }

    /// Slot width in pixels (1 for the linear format).
    pub fn slot_width(self) -> u32 {
        match self {
            TileFormat::Bpp8 | TileFormat::Bpp16 => 64,
            TileFormat::Bpp32 => 32,
            TileFormat::Page => 1,
        }
    }

    /// Slot height in pixels (1 for the linear format).
    pub fn slot_height(self) -> u32 {
        match self {
            TileFormat::Bpp8 => 64,
            TileFormat::Bpp16 | TileFormat::Bpp32 => 32,
            TileFormat::Page => 1,
        }
    }

    pub fn is_linear(self) -> bool {
        self == TileFormat::Page
    }

    /// Index of this format's aliased address view.
    pub fn view_index(self) -> u32 {
        match self {
            TileFormat::Bpp8 => 0,
            TileFormat::Bpp16 => 1,
            TileFormat::Bpp32 => 2,
            TileFormat::Page => 3,
        }
    }

    pub fn from_view_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(TileFormat::Bpp8),
            1 => Some(TileFormat::Bpp16),
            2 => Some(TileFormat::Bpp32),
            3 => Some(TileFormat::Page),
            _ => None,
        }
    }
}

/// Stable handle of a block in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHandle(pub u32);

/// Stable handle of an area in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AreaHandle(pub u32);

/// Stable handle of a group in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupHandle(pub u32);

/// External owner of one or more groups: a user process id, or a kernel
/// pseudo-owner that is destroyed together with its last group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub pid: u32,
    pub kernel: bool,
}

impl Owner {
    pub fn process(pid: u32) -> Self {
        Owner { pid, kernel: false }
    }

    pub fn kernel(pid: u32) -> Self {
        Owner { pid, kernel: true }
    }
}

/// Who holds a block right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOwner {
    /// A 2D block inside an area
    Area(AreaHandle),
    /// A 1D block held directly by a group
    Group(GroupHandle),
    /// Detached during group teardown, kept alive by references
    Orphaned,
}

/// Pages behind a block, if any.
#[derive(Debug, Clone)]
pub enum BlockBacking {
    /// Not yet backed (reserved placeholders, or fill still in flight)
    None,
    /// Pages owned by the page pool
    Pool(Vec<PageAddr>),
    /// Pages resolved from an external user buffer
    User(Vec<PageAddr>),
}

impl BlockBacking {
    pub fn pages(&self) -> Option<&[PageAddr]> {
        match self {
            BlockBacking::None => None,
            BlockBacking::Pool(p) | BlockBacking::User(p) => Some(p),
        }
    }
}

/// One packed allocation.
#[derive(Debug)]
pub struct Block {
    pub handle: BlockHandle,
    pub fmt: TileFormat,
    /// The block's own slots: a sub-rectangle of its area, or a 1D strip
    pub area: SlotArea,
    /// Requested size: pixels for 2D formats, bytes for the linear format
    pub width_px: u32,
    pub height_px: u32,
    /// Externally visible opaque address
    pub ssptr: u32,
    /// Caller-supplied lookup key
    pub key: u32,
    /// Caller-visible id
    pub id: u32,
    pub refs: u32,
    /// True once handed to a client; false while merely reserved
    pub allocated: bool,
    pub owner: BlockOwner,
    pub backing: BlockBacking,
}

impl Block {
    /// `refs == 0 && !allocated` makes a block eligible for destruction.
    pub fn is_idle(&self) -> bool {
        self.refs == 0 && !self.allocated
    }
}

/// A container-reserved rectangle hosting same-height blocks side by side.
#[derive(Debug)]
pub struct Area {
    pub handle: AreaHandle,
    pub rect: SlotArea,
    /// Child blocks sorted by ascending x coordinate
    pub blocks: Vec<BlockHandle>,
    /// Owning group; `None` once orphaned during group teardown
    pub group: Option<GroupHandle>,
}

/// Ownership scope for areas, 1D blocks and reserved placeholders.
#[derive(Debug)]
pub struct Group {
    pub handle: GroupHandle,
    /// Caller-chosen group id, unique per owner
    pub gid: u32,
    pub owner: Owner,
    pub areas: Vec<AreaHandle>,
    pub onedim: Vec<BlockHandle>,
    /// Pre-packed placeholders awaiting a matching allocation
    pub reserved: Vec<BlockHandle>,
    /// Held while a lookup or allocation is in flight
    pub refs: u32,
}

impl Group {
    /// Empty of content and unreferenced. A non-empty reserved list keeps
    /// the group alive regardless.
    pub fn is_collapsible(&self) -> bool {
        self.areas.is_empty() && self.onedim.is_empty() && self.refs == 0
            && self.reserved.is_empty()
    }
}

/// Per-owner aggregate of groups.
#[derive(Debug)]
pub struct Process {
    pub owner: Owner,
    pub groups: Vec<GroupHandle>,
}

/// Client-facing description of a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub fmt: TileFormat,
    pub ssptr: u32,
    /// Row stride in bytes within the format view; zero for 1D blocks
    pub stride: u32,
    /// Pixels for 2D formats; length in bytes for the linear format
    pub width: u32,
    pub height: u32,
    pub group_id: u32,
    pub key: u32,
    pub id: u32,
    /// Byte offset of the data within its first page
    pub offset: u32,
}

/// Registry snapshot for monitoring and invariant checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub blocks: usize,
    pub areas: usize,
    pub groups: usize,
    pub processes: usize,
    pub orphaned_blocks: usize,
    pub orphaned_areas: usize,
    pub reserved_blocks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_geometry() {
        assert_eq!(TileFormat::Bpp8.slot_width(), 64);
        assert_eq!(TileFormat::Bpp8.slot_height(), 64);
        assert_eq!(TileFormat::Bpp16.slot_width(), 64);
        assert_eq!(TileFormat::Bpp16.slot_height(), 32);
        assert_eq!(TileFormat::Bpp32.slot_width(), 32);
        assert_eq!(TileFormat::Bpp32.slot_height(), 32);
        assert!(TileFormat::Page.is_linear());

        // every 2D slot covers exactly one page of bytes
        for fmt in [TileFormat::Bpp8, TileFormat::Bpp16, TileFormat::Bpp32] {
            assert_eq!(
                fmt.slot_width() * fmt.slot_height() * fmt.bytes_per_pixel(),
                4096
            );
        }
    }

    #[test]
    fn test_view_index_round_trip() {
        for fmt in [
            TileFormat::Bpp8,
            TileFormat::Bpp16,
            TileFormat::Bpp32,
            TileFormat::Page,
        ] {
            assert_eq!(TileFormat::from_view_index(fmt.view_index()), Some(fmt));
        }
        assert_eq!(TileFormat::from_view_index(4), None);
    }

    #[test]
    fn test_block_idle() {
        let mut block = Block {
            handle: BlockHandle(1),
            fmt: TileFormat::Bpp8,
            area: SlotArea::rect(0, 0, 0, 0),
            width_px: 64,
            height_px: 64,
            ssptr: 0,
            key: 0,
            id: 0,
            refs: 0,
            allocated: false,
            owner: BlockOwner::Orphaned,
            backing: BlockBacking::None,
        };
        assert!(block.is_idle());
        block.refs = 1;
        assert!(!block.is_idle());
        block.refs = 0;
        block.allocated = true;
        assert!(!block.is_idle());
    }

    #[test]
    fn test_group_collapsible() {
        let mut group = Group {
            handle: GroupHandle(1),
            gid: 7,
            owner: Owner::process(42),
            areas: Vec::new(),
            onedim: Vec::new(),
            reserved: Vec::new(),
            refs: 0,
        };
        assert!(group.is_collapsible());

        group.refs = 1;
        assert!(!group.is_collapsible());
        group.refs = 0;

        // a reserved placeholder keeps the group alive
        group.reserved.push(BlockHandle(9));
        assert!(!group.is_collapsible());
    }
}
