//! Pixel-space to slot-space conversion and the external address scheme
//!
//! `analyze_area` turns a pixel-space request (format, width, height,
//! alignment, offset in bytes) into grid-slot units. The external address
//! range is split into one aliased view per format; within a view an
//! address is `y_px * row_stride + x_px * bytes_per_pixel`, so the format
//! and the natural slot coordinates are recoverable from any address.

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::geom::{align_up, div_round_up, SlotArea, SlotPoint};
use crate::pool::types::TileFormat;

/// A pixel-space request converted to slot units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaSpec {
    /// Width in slots (slot count for the linear format)
    pub width: u16,
    /// Height in slots (1 for the linear format)
    pub height: u16,
    /// Slots reachable through one physical page at the format's row
    /// stride; packing never crosses a band boundary
    pub band: u16,
    /// Alignment in slots
    pub align: u16,
    /// Offset within the alignment, in slots
    pub offset: u16,
    /// Remaining byte offset of the data within its first slot row
    pub in_offset: u32,
}

/// Bytes per slot row for a format.
pub fn slot_row_bytes(fmt: TileFormat, page_size: u32) -> u32 {
    if fmt.is_linear() {
        page_size
    } else {
        fmt.slot_width() * fmt.bytes_per_pixel()
    }
}

/// Row stride in bytes of a format's aliased view.
pub fn view_row_stride(config: &PoolConfig, fmt: TileFormat) -> u32 {
    config.grid_width as u32 * slot_row_bytes(fmt, config.page_size)
}

/// Convert a pixel-space request into grid-slot units.
///
/// # Errors
/// - `InvalidAlignment` if `align` is not a power of two
/// - `InvalidOffset` if `offset` is not a pixel multiple or not below the
///   effective alignment
/// - `ZeroSize` / `ExceedsContainer` for degenerate or oversized requests
pub fn analyze_area(
    config: &PoolConfig,
    fmt: TileFormat,
    width: u32,
    height: u32,
    align: u32,
    offset: u32,
) -> PoolResult<AreaSpec> {
    if align & align.wrapping_sub(1) != 0 {
        return Err(PoolError::InvalidAlignment(align));
    }
    if width == 0 || (!fmt.is_linear() && height == 0) {
        return Err(PoolError::ZeroSize);
    }

    if fmt.is_linear() {
        // 1D areas only get page alignment; grow to absorb the page offset
        let width = width + (offset & (config.page_size - 1));
        let slots = div_round_up(width, config.page_size);
        if slots > config.total_slots() {
            return Err(PoolError::ExceedsContainer {
                width: slots,
                height: 1,
                max_width: config.grid_width,
                max_height: config.grid_height,
            });
        }
        return Ok(AreaSpec {
            width: slots as u16,
            height: 1,
            band: 1,
            align: 1,
            offset: 0,
            in_offset: offset & (config.page_size - 1),
        });
    }

    let slot_w = fmt.slot_width();
    let slot_h = fmt.slot_height();
    let bpp = fmt.bytes_per_pixel();
    let slot_row = slot_w * bpp;

    // slots reachable via one physical page at this row stride
    let band = config.page_size / slot_row;

    // minimum alignment is at least one slot row
    let min_align = slot_row.max(config.granularity);
    let align = align_up(
        if align == 0 { config.default_align } else { align },
        min_align,
    );

    if offset % bpp != 0 || offset >= align {
        return Err(PoolError::InvalidOffset { offset, align });
    }

    // round the offset down to the slot granularity and widen the request
    // so the data still fits at the correct byte position
    let mut width = width + (offset & (min_align - 1)) / bpp;
    let in_offset = offset & (min_align - 1);
    let offset = offset & !(min_align - 1);

    width = align_up(width, min_align / bpp);

    let x_slots = div_round_up(width, slot_w);
    let y_slots = div_round_up(height, slot_h);
    if x_slots > config.grid_width as u32 || y_slots > config.grid_height as u32 {
        return Err(PoolError::ExceedsContainer {
            width: x_slots,
            height: y_slots,
            max_width: config.grid_width,
            max_height: config.grid_height,
        });
    }

    Ok(AreaSpec {
        width: x_slots as u16,
        height: y_slots as u16,
        band: band as u16,
        align: (align / slot_row) as u16,
        offset: (offset / slot_row) as u16,
        in_offset,
    })
}

/// External address of a reservation's first slot, plus the in-slot offset.
pub fn external_address(
    config: &PoolConfig,
    fmt: TileFormat,
    area: &SlotArea,
    in_offset: u32,
) -> u32 {
    let view = config.alias_base + fmt.view_index() * config.view_size();
    if fmt.is_linear() {
        view + area.linear_start(config.grid_width) * config.page_size + in_offset
    } else {
        let slot_row = slot_row_bytes(fmt, config.page_size);
        let stride = view_row_stride(config, fmt);
        view + area.p0.y as u32 * fmt.slot_height() * stride + area.p0.x as u32 * slot_row
            + in_offset
    }
}

/// Whether `addr` falls within the pool's aliased views.
pub fn is_pool_address(config: &PoolConfig, addr: u32) -> bool {
    addr >= config.alias_base
        && (addr - config.alias_base) / config.view_size() < crate::config::FORMAT_VIEWS
}

/// Recover the format and slot coordinates behind an external address.
pub fn slot_of_address(config: &PoolConfig, addr: u32) -> PoolResult<(TileFormat, SlotPoint)> {
    if !is_pool_address(config, addr) {
        return Err(PoolError::NotPoolAddress(addr));
    }
    let rel = addr - config.alias_base;
    let fmt = TileFormat::from_view_index(rel / config.view_size())
        .ok_or(PoolError::NotPoolAddress(addr))?;
    let off = rel % config.view_size();

    if fmt.is_linear() {
        let slot = off / config.page_size;
        Ok((
            fmt,
            SlotPoint::new(
                (slot % config.grid_width as u32) as u16,
                (slot / config.grid_width as u32) as u16,
            ),
        ))
    } else {
        let stride = view_row_stride(config, fmt);
        let slot_row = slot_row_bytes(fmt, config.page_size);
        let y = off / stride / fmt.slot_height();
        let x = off % stride / slot_row;
        Ok((fmt, SlotPoint::new(x as u16, y as u16)))
    }
}
