//! Pre-reservation tests: paired-plane packing and bulk 2D reservation

use tilepool::{Owner, PoolConfig, PoolError, TileFormat, TilePool};

fn pool() -> TilePool {
    TilePool::new(PoolConfig::default()).unwrap()
}

#[test]
fn test_nv12_together_packs_one_area() {
    // 256px wide pairs (4 slots) at align 256: the co-packed layout covers
    // both pairs in a single 64-slot area and wins the score
    let pool = pool();
    let owner = Owner::process(100);

    let n = pool
        .reserve_nv12(2, 256, 64, 256, 0, 1, owner, true)
        .unwrap();
    assert_eq!(n, 2);

    let stats = pool.stats().unwrap();
    assert_eq!(stats.areas, 1, "both pairs should share one area");
    assert_eq!(stats.reserved_blocks, 4, "two planes per pair");
    // placeholders are not active blocks: nothing findable globally
    assert!(matches!(
        pool.find_by_address(pool.config().alias_base),
        Err(PoolError::BlockNotFound)
    ));

    pool.unreserve_blocks(owner, 1).unwrap();
    let stats = pool.stats().unwrap();
    assert_eq!(stats.reserved_blocks, 0);
    assert_eq!(stats.areas, 0);
    assert_eq!(stats.groups, 0);
    assert_eq!(pool.container_stats().unwrap().reserved_slots, 0);
}

#[test]
fn test_nv12_wide_pairs_fall_back_to_separate_areas() {
    // 33-slot-wide pairs cannot co-pack into a 64-slot area; each pair
    // falls back to independent full-plane and half-plane areas
    let pool = pool();
    let owner = Owner::process(200);

    let n = pool
        .reserve_nv12(1, 33 * 64, 64, 256, 0, 1, owner, true)
        .unwrap();
    assert_eq!(n, 1);

    let stats = pool.stats().unwrap();
    assert_eq!(stats.areas, 2, "one full-plane area plus one half-plane area");
    assert_eq!(stats.reserved_blocks, 2);

    pool.unreserve_blocks(owner, 1).unwrap();
    assert_eq!(pool.container_stats().unwrap().reserved_slots, 0);
}

#[test]
fn test_nv12_disallowing_together_forces_separate() {
    let pool = pool();
    let owner = Owner::process(250);

    let n = pool
        .reserve_nv12(2, 256, 64, 256, 0, 1, owner, false)
        .unwrap();
    assert_eq!(n, 2);
    // separate packing: full planes in one area, half planes in another
    assert_eq!(pool.stats().unwrap().areas, 2);
    assert_eq!(pool.stats().unwrap().reserved_blocks, 4);

    pool.unreserve_blocks(owner, 1).unwrap();
}

#[test]
fn test_nv12_reservation_is_consumed_by_allocation() {
    let pool = pool();
    let owner = Owner::process(300);

    pool.reserve_nv12(2, 256, 64, 256, 0, 1, owner, true)
        .unwrap();
    assert_eq!(pool.stats().unwrap().reserved_blocks, 4);
    let reservations_before = pool.container_stats().unwrap().reservations;

    // a matching full-plane allocation consumes a placeholder in place
    let luma = pool
        .alloc_block(TileFormat::Bpp8, 256, 64, 256, 0, 1, 1, owner)
        .unwrap();
    assert_eq!(pool.stats().unwrap().reserved_blocks, 3);
    assert_eq!(
        pool.container_stats().unwrap().reservations,
        reservations_before,
        "reuse must not touch the container"
    );

    // the matching half-plane allocation consumes its partner
    let chroma = pool
        .alloc_block(TileFormat::Bpp16, 128, 32, 128, 0, 2, 1, owner)
        .unwrap();
    assert_eq!(pool.stats().unwrap().reserved_blocks, 2);
    assert_eq!(pool.stats().unwrap().areas, 1);

    // release everything: the two active blocks and the leftover pair
    pool.free_block(1, luma.id, None).unwrap();
    pool.free_block(2, chroma.id, None).unwrap();
    pool.unreserve_blocks(owner, 1).unwrap();
    let stats = pool.stats().unwrap();
    assert_eq!(stats.blocks, 0);
    assert_eq!(stats.areas, 0);
    assert_eq!(stats.groups, 0);
    assert_eq!(pool.container_stats().unwrap().reserved_slots, 0);
}

#[test]
fn test_nv12_invalid_arguments() {
    let pool = pool();
    let owner = Owner::process(400);

    assert!(matches!(
        pool.reserve_nv12(0, 256, 64, 256, 0, 1, owner, true),
        Err(PoolError::ZeroSize)
    ));
    // odd offsets cannot be halved for the second plane
    assert!(matches!(
        pool.reserve_nv12(1, 256, 64, 256, 3, 1, owner, true),
        Err(PoolError::InvalidOffset { .. })
    ));
    assert!(matches!(
        pool.reserve_nv12(1, 256, 64, 4096, 0, 1, owner, true),
        Err(PoolError::InvalidAlignment(_))
    ));
    assert_eq!(pool.stats().unwrap().groups, 0);
}

#[test]
fn test_reserve_blocks_wide_blocks_stay_on_default_path() {
    // blocks wide enough to pass the half-page cutoff are wider than half
    // a band, so no two of them can share a band at one stride: the
    // packing estimate caps the batch at one and nothing is pre-reserved
    let pool = pool();
    let owner = Owner::process(500);

    let n = pool
        .reserve_blocks(4, TileFormat::Bpp8, 64 * 64, 64, 4096, 0, 1, owner)
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(pool.stats().unwrap().reserved_blocks, 0);
    assert_eq!(pool.stats().unwrap().groups, 0);
    assert_eq!(pool.container_stats().unwrap().reserved_slots, 0);
}

#[test]
fn test_reserve_blocks_small_requests_are_a_noop() {
    let pool = pool();
    let owner = Owner::process(600);

    // half a page row or less: the default allocation path is sufficient
    let n = pool
        .reserve_blocks(4, TileFormat::Bpp8, 2048, 64, 0, 0, 1, owner)
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(pool.stats().unwrap().groups, 0);
}

#[test]
fn test_reserve_blocks_rejects_linear_format() {
    let pool = pool();
    let owner = Owner::process(700);
    assert!(matches!(
        pool.reserve_blocks(2, TileFormat::Page, 4096, 1, 0, 0, 1, owner),
        Err(PoolError::UnsupportedFormat)
    ));
}

#[test]
fn test_reserved_group_survives_emptiness_check() {
    // a group whose only content is reserved placeholders must not collapse
    let pool = pool();
    let owner = Owner::process(800);

    pool.reserve_nv12(1, 256, 64, 256, 0, 1, owner, true)
        .unwrap();
    let stats = pool.stats().unwrap();
    assert!(stats.reserved_blocks > 0);
    assert_eq!(stats.groups, 1);

    // an unrelated allocate/free cycle in the same group must not destroy it
    let d = pool
        .alloc_block(TileFormat::Bpp32, 32, 32, 0, 0, 9, 1, owner)
        .unwrap();
    pool.free_block(9, d.id, None).unwrap();
    assert_eq!(pool.stats().unwrap().groups, 1);

    pool.unreserve_blocks(owner, 1).unwrap();
    assert_eq!(pool.stats().unwrap().groups, 0);
}

#[test]
fn test_partial_reservation_is_kept() {
    // a compact container runs out of room partway; what was reserved stays
    let config = PoolConfig::from_preset(tilepool::GridPreset::Custom {
        grid_width: 64,
        grid_height: 2,
    });
    let container = tilepool::GridContainer::new(config.grid_width, config.grid_height).unwrap();
    let backing =
        tilepool::PagePool::new(config.total_slots() as usize, config.page_size, config.grid_width)
            .unwrap();
    let pool = TilePool::with_parts(config, container, backing).unwrap();
    let owner = Owner::process(900);

    // the co-packed layout fits ten pairs per 64x1 area and the grid holds
    // two such rows; a request for thirty stops at twenty
    let n = pool
        .reserve_nv12(30, 256, 64, 256, 0, 1, owner, true)
        .unwrap();
    assert_eq!(n, 20, "expected partial success");
    assert_eq!(pool.stats().unwrap().reserved_blocks, 40);
    assert_eq!(pool.stats().unwrap().areas, 2);
}
