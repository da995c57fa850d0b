mod common;

use common::{box_model, flat_square_model, spawn_at, VmapFixture};
use mangos_vmap::{
    convert_position_to_internal_rep, DisableFlags, DisableTable, LiquidTypeTable, LoadResult, ModelIgnoreFlags,
    VMapManager, Vec3, VmapConfig, WmoLiquid, VMAP_INVALID_HEIGHT_VALUE,
};

const SQUARE: &str = "World/wmo/square.wmo";

/// Map 0 with tile (32, 32) holding one flat square at world (-100, -100, 100)
fn square_fixture() -> VmapFixture {
    let fx = VmapFixture::new();
    fx.write_model(SQUARE, &flat_square_model(20.0, 1));
    fx.write_map(0, true, Vec::new());
    fx.write_tile(0, 32, 32, vec![spawn_at(1, SQUARE, Vec3::new(-100.0, -100.0, 100.0))]);
    fx
}

#[test]
fn test_load_query_unload_scenario() {
    let fx = square_fixture();
    let manager = fx.manager();

    assert_eq!(manager.load_map_tile(0, 32, 32), LoadResult::Success);

    let height = manager.get_height(0, Vec3::new(-100.0, -100.0, 150.0), 50.0);
    assert!((height - 100.0).abs() < 1e-2, "height {}", height);

    let above = Vec3::new(-100.0, -100.0, 150.0);
    let below = Vec3::new(-100.0, -100.0, 50.0);
    assert!(!manager.is_in_line_of_sight(0, above, below, ModelIgnoreFlags::NOTHING));
    assert!(manager.is_in_line_of_sight(0, above, Vec3::new(-100.0, -100.0, 120.0), ModelIgnoreFlags::NOTHING));

    manager.unload_map(0);
    assert_eq!(manager.get_height(0, Vec3::new(-100.0, -100.0, 150.0), 50.0), VMAP_INVALID_HEIGHT_VALUE);
    assert!(manager.is_in_line_of_sight(0, above, below, ModelIgnoreFlags::NOTHING));
    assert!(manager.loaded_map_ids().is_empty());
    assert_eq!(manager.loaded_model_count(), 0);
}

#[test]
fn test_object_hit_pos_in_world_space() {
    let fx = square_fixture();
    let manager = fx.manager();
    manager.load_map_tile(0, 32, 32);

    let from = Vec3::new(-95.0, -105.0, 130.0);
    let to = Vec3::new(-95.0, -105.0, 80.0);
    let (hit, pos) = manager.get_object_hit_pos(0, from, to, -1.0);
    assert!(hit);
    assert!(pos.fuzzy_eq(Vec3::new(-95.0, -105.0, 101.0), 1e-2), "{:?}", pos);

    // beside the square nothing is hit and the target comes back untouched
    let from = Vec3::new(-200.0, -100.0, 130.0);
    let to = Vec3::new(-200.0, -100.0, 80.0);
    assert_eq!(manager.get_object_hit_pos(0, from, to, -1.0), (false, to));

    // unloaded map
    assert_eq!(manager.get_object_hit_pos(1, from, to, 0.0), (false, to));
}

#[test]
fn test_height_sentinel_without_tiles() {
    let fx = square_fixture();
    let manager = fx.manager();
    let p = Vec3::new(-100.0, -100.0, 150.0);

    assert_eq!(manager.get_height(0, p, 50.0), VMAP_INVALID_HEIGHT_VALUE);

    // loaded, but the ground is out of range
    manager.load_map_tile(0, 32, 32);
    assert_eq!(manager.get_height(0, p, 10.0), VMAP_INVALID_HEIGHT_VALUE);
    assert_eq!(manager.get_height(0, Vec3::new(-100.0, -100.0, 90.0), 500.0), VMAP_INVALID_HEIGHT_VALUE);
}

#[test]
fn test_disabled_line_of_sight_short_circuits() {
    let fx = square_fixture();
    let manager = fx.manager();
    manager.load_map_tile(0, 32, 32);

    let above = Vec3::new(-100.0, -100.0, 150.0);
    let below = Vec3::new(-100.0, -100.0, 50.0);

    manager.set_enable_line_of_sight_calc(false);
    assert!(manager.is_in_line_of_sight(0, above, below, ModelIgnoreFlags::NOTHING));
    assert_eq!(manager.get_object_hit_pos(0, above, below, 0.0), (false, below));
    // height is gated separately
    assert!((manager.get_height(0, above, 100.0) - 100.0).abs() < 1e-2);

    manager.set_enable_height_calc(false);
    assert_eq!(manager.get_height(0, above, 100.0), VMAP_INVALID_HEIGHT_VALUE);
    assert_eq!(manager.load_map_tile(0, 10, 10), LoadResult::DisabledInConfig);
}

#[test]
fn test_per_map_disables() {
    let fx = square_fixture();
    let disables: DisableTable = [(0, DisableFlags::LOS | DisableFlags::HEIGHT)].into_iter().collect();
    let manager = fx.manager().with_disable_policy(disables);
    assert!(manager.load_map_tile(0, 32, 32).is_success());

    let above = Vec3::new(-100.0, -100.0, 150.0);
    let below = Vec3::new(-100.0, -100.0, 50.0);
    assert!(manager.is_in_line_of_sight(0, above, below, ModelIgnoreFlags::NOTHING));
    assert_eq!(manager.get_height(0, above, 100.0), VMAP_INVALID_HEIGHT_VALUE);
}

#[test]
fn test_coordinate_round_trip() {
    for &(x, y, z) in &[(0.0, 0.0, 0.0), (-8913.23, 554.61, 93.7), (16000.0, -16000.0, -500.0)] {
        let p = Vec3::new(x, y, z);
        let back = convert_position_to_internal_rep(convert_position_to_internal_rep(p));
        assert!(back.fuzzy_eq(p, 1e-2), "{:?} -> {:?}", p, back);
    }
}

#[test]
fn test_load_and_unload_are_idempotent() {
    let fx = square_fixture();
    fx.write_tile(0, 33, 32, vec![spawn_at(2, SQUARE, Vec3::new(-600.0, -100.0, 100.0))]);
    let manager = fx.manager();

    assert!(manager.load_map_tile(0, 32, 32).is_success());
    assert!(manager.load_map_tile(0, 32, 32).is_success());
    assert_eq!(manager.model_ref_count(SQUARE), 1);
    assert_eq!(manager.loaded_tile_count(0), 1);

    assert!(manager.load_map_tile(0, 33, 32).is_success());
    assert_eq!(manager.model_ref_count(SQUARE), 2);
    assert_eq!(manager.loaded_model_count(), 1);

    // not loaded: nothing happens
    manager.unload_map_tile(0, 1, 1);
    manager.unload_map_tile(7, 32, 32);
    assert_eq!(manager.loaded_tile_count(0), 2);

    manager.unload_map_tile(0, 32, 32);
    manager.unload_map_tile(0, 32, 32);
    assert_eq!(manager.model_ref_count(SQUARE), 1);
    assert_eq!(manager.loaded_map_ids(), vec![0]);

    manager.unload_map_tile(0, 33, 32);
    assert!(manager.loaded_map_ids().is_empty());
    assert_eq!(manager.loaded_model_count(), 0);

    // unloading an unknown map is harmless
    manager.unload_map(42);
}

#[test]
fn test_load_failures() {
    let fx = square_fixture();
    let manager = fx.manager();

    assert_eq!(manager.load_map_tile(5, 0, 0), LoadResult::FileNotFound);
    assert!(manager.loaded_map_ids().is_empty());

    assert_eq!(manager.load_map_tile(0, 1, 1), LoadResult::FileNotFound);
    assert!(manager.loaded_map_ids().is_empty());

    fx.write_raw("000_02_02.vmtile", b"VMAP_4.2\x00\x00\x00\x00");
    assert_eq!(manager.load_map_tile(0, 2, 2), LoadResult::VersionMismatch);
    assert_eq!(manager.exists_map_tile(0, 2, 2), LoadResult::VersionMismatch);

    fx.write_raw("000_03_03.vmtile", b"VMAP_7.0\x01\x00\x00\x00\x00\x00");
    assert_eq!(manager.load_map_tile(0, 3, 3), LoadResult::ReadFromFileFailed);
    assert!(manager.loaded_map_ids().is_empty());

    fx.write_raw("009.vmtree", b"VMAP_6.0\x01GOBJ\x00\x00\x00\x00");
    assert_eq!(manager.load_map_tile(9, 0, 0), LoadResult::VersionMismatch);
    fx.write_raw("010.vmtree", b"NOPE_7.0\x01GOBJ\x00\x00\x00\x00");
    assert_eq!(manager.load_map_tile(10, 0, 0), LoadResult::ReadFromFileFailed);

    // a failed tile on a map that already has tiles keeps the map
    assert!(manager.load_map_tile(0, 32, 32).is_success());
    assert_eq!(manager.load_map_tile(0, 3, 3), LoadResult::ReadFromFileFailed);
    assert_eq!(manager.loaded_map_ids(), vec![0]);
    assert_eq!(manager.loaded_tile_count(0), 1);
    assert_eq!(manager.loaded_model_count(), 1);
}

#[test]
fn test_exists_map_tile_is_a_dry_run() {
    let fx = square_fixture();
    let manager = fx.manager();

    assert_eq!(manager.exists_map_tile(0, 32, 32), LoadResult::Success);
    assert_eq!(manager.exists_map_tile(0, 31, 32), LoadResult::FileNotFound);
    assert_eq!(manager.exists_map_tile(3, 32, 32), LoadResult::FileNotFound);
    assert!(manager.loaded_map_ids().is_empty());
    assert_eq!(manager.loaded_model_count(), 0);
}

#[test]
fn test_area_and_liquid_data() {
    let fx = VmapFixture::new();
    let liquid = WmoLiquid::flat(5, 3.0);
    fx.write_model("World/wmo/cave.wmo", &box_model(10.0, 10.0, 77, 1234, Some(liquid)));
    fx.write_map(1, true, Vec::new());
    let mut spawn = spawn_at(900, "World/wmo/cave.wmo", Vec3::new(-100.0, -100.0, 50.0));
    spawn.adt_id = 12;
    fx.write_tile(1, 32, 32, vec![spawn]);

    let liquids: LiquidTypeTable = [(5, 0x2)].into_iter().collect();
    let manager = fx.manager().with_liquid_flags(liquids);
    assert!(manager.load_map_tile(1, 32, 32).is_success());

    let inside = Vec3::new(-98.0, -99.0, 55.0);
    let data = manager.get_area_and_liquid_data(1, inside, None).unwrap();
    assert!((data.floor_z - 50.0).abs() < 1e-2);
    let area = data.area_info.unwrap();
    assert_eq!(area.group_id, 1234);
    assert_eq!(area.root_id, 77);
    assert_eq!(area.adt_id, 12);
    assert_eq!(area.unique_id, 900);
    assert_eq!(area.mogp_flags, 0x2000);
    let liquid = data.liquid_info.unwrap();
    assert_eq!(liquid.liquid_type, 5);
    assert!((liquid.level - 53.0).abs() < 1e-2);

    // requested mask matches the liquid's flags
    let data = manager.get_area_and_liquid_data(1, inside, Some(0x2)).unwrap();
    assert!(data.liquid_info.is_some());
    let data = manager.get_area_and_liquid_data(1, inside, Some(0x1)).unwrap();
    assert!(data.liquid_info.is_none());
    assert!(data.area_info.is_some());

    // outside the placement, or on another map
    assert!(manager.get_area_and_liquid_data(1, Vec3::new(-130.0, -99.0, 55.0), None).is_none());
    assert!(manager.get_area_and_liquid_data(2, inside, None).is_none());
}

#[test]
fn test_area_and_liquid_disables() {
    let fx = VmapFixture::new();
    fx.write_model("cave.wmo", &box_model(10.0, 10.0, 77, 1234, Some(WmoLiquid::flat(5, 3.0))));
    fx.write_map(1, true, Vec::new());
    fx.write_tile(1, 32, 32, vec![spawn_at(900, "cave.wmo", Vec3::new(-100.0, -100.0, 50.0))]);
    let inside = Vec3::new(-98.0, -99.0, 55.0);

    let disables: DisableTable = [(1, DisableFlags::LIQUID_STATUS)].into_iter().collect();
    let manager = fx.manager().with_disable_policy(disables);
    manager.load_map_tile(1, 32, 32);
    let data = manager.get_area_and_liquid_data(1, inside, None).unwrap();
    assert!(data.liquid_info.is_none());
    assert!(data.area_info.is_some());

    let disables: DisableTable = [(1, DisableFlags::AREA_FLAG)].into_iter().collect();
    let manager = fx.manager().with_disable_policy(disables);
    manager.load_map_tile(1, 32, 32);
    let data = manager.get_area_and_liquid_data(1, inside, None).unwrap();
    assert!(data.area_info.is_none());
    assert!(data.liquid_info.is_some());
    assert!((data.floor_z - 50.0).abs() < 1e-2);
}

#[test]
fn test_non_tiled_map() {
    let fx = VmapFixture::new();
    fx.write_model(SQUARE, &flat_square_model(20.0, 1));
    fx.write_map(30, false, vec![spawn_at(1, SQUARE, Vec3::new(0.0, 0.0, 10.0))]);
    let manager = fx.manager();

    assert!(manager.load_map_tile(30, 31, 31).is_success());
    assert!(manager.load_map_tile(30, 32, 32).is_success());
    assert_eq!(manager.loaded_tile_count(30), 2);
    assert_eq!(manager.model_ref_count(SQUARE), 1);
    assert!((manager.get_height(30, Vec3::new(5.0, 5.0, 20.0), 50.0) - 10.0).abs() < 1e-2);

    manager.unload_map_tile(30, 31, 31);
    assert_eq!(manager.model_ref_count(SQUARE), 1);
    manager.unload_map_tile(30, 32, 32);
    assert!(manager.loaded_map_ids().is_empty());
    assert_eq!(manager.loaded_model_count(), 0);
}

#[test]
fn test_manual_model_references() {
    let fx = square_fixture();
    let manager = fx.manager();

    let model = manager.acquire_model(SQUARE).unwrap();
    assert_eq!(model.root_wmo_id(), 1);
    assert!(manager.acquire_model("World/wmo/missing.wmo").is_none());

    assert!(manager.load_map_tile(0, 32, 32).is_success());
    assert_eq!(manager.model_ref_count(SQUARE), 2);

    manager.release_model(SQUARE);
    assert_eq!(manager.model_ref_count(SQUARE), 1);
    manager.unload_map(0);
    assert_eq!(manager.loaded_model_count(), 0);

    // a second release only logs
    manager.release_model(SQUARE);
    assert_eq!(manager.loaded_model_count(), 0);
}

#[test]
fn test_config_built_manager() {
    let fx = square_fixture();
    let mut config = mangos_shared::config::Config::new();
    let data_dir = fx.path().parent().unwrap().to_path_buf();
    let vmaps = data_dir.join("vmaps");
    assert!(config.load_from_str(&format!("DataDir = {}\nvmap.enableHeight = 0\n", data_dir.display())));

    let manager = VMapManager::new(VmapConfig::from_config(&config));
    assert_eq!(manager.vmap_dir(), vmaps.as_path());
    assert!(manager.is_line_of_sight_calc_enabled());
    assert!(!manager.is_height_calc_enabled());
}
