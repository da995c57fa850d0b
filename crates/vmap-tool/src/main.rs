// vmap-tool - CMaNGOS TBC vmap inspection tool
// Validates extracted vmap tiles and answers one-shot collision queries
// (line of sight, object hit, ground height, area and liquid)

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rayon::prelude::*;
use serde::Serialize;

use mangos_shared::config::get_config;
use mangos_shared::log::{initialize_logging, map_log_level};
use mangos_shared::MAX_NUMBER_OF_GRIDS;
use mangos_vmap::{
    grid_coords, AreaAndLiquidData, LoadResult, ModelIgnoreFlags, VMapManager, Vec3, VmapConfig,
    VMAP_INVALID_HEIGHT_VALUE,
};

/// Default config file name
const DEFAULT_CONFIG: &str = "vmap.conf";

/// Environment variable prefix for config overrides
const ENV_PREFIX: &str = "Vmap_";

#[derive(Parser, Debug)]
#[command(name = "vmap-tool")]
#[command(about = "CMaNGOS TBC VMap query tool (Rust)")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Data directory containing vmaps/ (overrides DataDir)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<String>,

    /// Console log level override (0=error, 1=warn, 2=info, 3=debug, 4=trace)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<i32>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that map tiles can be loaded, without loading them
    Check(CheckArgs),
    /// Line of sight between two points
    Los(LosArgs),
    /// First collision between two points
    Hit(HitArgs),
    /// Ground height below a point
    Height(HeightArgs),
    /// Area and liquid information at a point
    Area(AreaArgs),
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(long)]
    map: u32,

    /// Check a single tile (format: X,Y) instead of the whole grid
    #[arg(long, value_parser = parse_tile)]
    tile: Option<(u32, u32)>,
}

#[derive(Args, Debug)]
struct LosArgs {
    #[arg(long)]
    map: u32,

    /// Start point (format: X,Y,Z)
    #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
    from: Vec3,

    /// End point (format: X,Y,Z)
    #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
    to: Vec3,

    /// Ignore M2 (doodad) placements
    #[arg(long)]
    ignore_m2: bool,
}

#[derive(Args, Debug)]
struct HitArgs {
    #[arg(long)]
    map: u32,

    #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
    from: Vec3,

    #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
    to: Vec3,

    /// Distance to move the hit point along the ray (negative pulls it back)
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    modify_dist: f32,
}

#[derive(Args, Debug)]
struct HeightArgs {
    #[arg(long)]
    map: u32,

    #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
    pos: Vec3,

    /// Maximum search distance below the point
    #[arg(long, default_value_t = 100.0)]
    max_dist: f32,
}

#[derive(Args, Debug)]
struct AreaArgs {
    #[arg(long)]
    map: u32,

    #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
    pos: Vec3,

    /// Only report liquids whose type flags match this mask
    #[arg(long)]
    liquid_mask: Option<u32>,
}

fn parse_tile(value: &str) -> Result<(u32, u32), String> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| "Tile must be in format X,Y".to_string())?;
    let x: u32 = x.trim().parse().map_err(|_| "Invalid tile X".to_string())?;
    let y: u32 = y.trim().parse().map_err(|_| "Invalid tile Y".to_string())?;
    if x >= MAX_NUMBER_OF_GRIDS || y >= MAX_NUMBER_OF_GRIDS {
        return Err(format!("Tile coordinates must be below {}", MAX_NUMBER_OF_GRIDS));
    }
    Ok((x, y))
}

fn parse_point(value: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 3 {
        return Err("Point must be in format X,Y,Z".to_string());
    }
    let mut coords = [0.0f32; 3];
    for (coord, part) in coords.iter_mut().zip(&parts) {
        *coord = part
            .trim()
            .parse()
            .map_err(|_| format!("Invalid coordinate '{}'", part))?;
    }
    Ok(Vec3::new(coords[0], coords[1], coords[2]))
}

struct Point(Vec3);

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.0.x, self.0.y, self.0.z)
    }
}

#[derive(Serialize)]
struct TileStatus {
    x: u32,
    y: u32,
    result: LoadResult,
}

#[derive(Serialize)]
struct CheckReport {
    map_id: u32,
    counts: BTreeMap<String, usize>,
    /// Every tile that exists, readable or not
    tiles: Vec<TileStatus>,
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Map {}:", self.map_id)?;
        for tile in &self.tiles {
            writeln!(f, "  [{:02},{:02}] {}", tile.x, tile.y, tile.result)?;
        }
        for (result, count) in &self.counts {
            writeln!(f, "  {}: {}", result, count)?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct LosReport {
    map_id: u32,
    from: Vec3,
    to: Vec3,
    in_line_of_sight: bool,
}

impl fmt::Display for LosReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.in_line_of_sight { "clear" } else { "blocked" };
        write!(f, "Map {} {} -> {}: {}", self.map_id, Point(self.from), Point(self.to), state)
    }
}

#[derive(Serialize)]
struct HitReport {
    map_id: u32,
    from: Vec3,
    to: Vec3,
    hit: bool,
    position: Vec3,
}

impl fmt::Display for HitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hit {
            write!(f, "Map {} {} -> {}: hit at {}", self.map_id, Point(self.from), Point(self.to), Point(self.position))
        } else {
            write!(f, "Map {} {} -> {}: no hit", self.map_id, Point(self.from), Point(self.to))
        }
    }
}

#[derive(Serialize)]
struct HeightReport {
    map_id: u32,
    position: Vec3,
    height: Option<f32>,
}

impl fmt::Display for HeightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.height {
            Some(height) => write!(f, "Map {} {}: ground at {:.3}", self.map_id, Point(self.position), height),
            None => write!(f, "Map {} {}: no ground found", self.map_id, Point(self.position)),
        }
    }
}

#[derive(Serialize)]
struct AreaReport {
    map_id: u32,
    position: Vec3,
    data: Option<AreaAndLiquidData>,
}

impl fmt::Display for AreaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Map {} {}:", self.map_id, Point(self.position))?;
        let Some(data) = &self.data else {
            return write!(f, " no area data");
        };
        write!(f, " floor {:.3}", data.floor_z)?;
        if let Some(area) = &data.area_info {
            write!(
                f,
                ", root {} group {} adt {} flags 0x{:X} unique {}",
                area.root_id, area.group_id, area.adt_id, area.mogp_flags, area.unique_id
            )?;
        }
        if let Some(liquid) = &data.liquid_info {
            write!(f, ", liquid type {} level {:.3}", liquid.liquid_type, liquid.level)?;
        }
        Ok(())
    }
}

fn emit<T: Serialize + fmt::Display>(report: &T, json: bool) -> anyhow::Result<()> {
    if json {
        let text = serde_json::to_string_pretty(report).context("Could not serialize result")?;
        println!("{}", text);
    } else {
        println!("{}", report);
    }
    Ok(())
}

/// Load the tiles containing `points` so the query sees their geometry
fn load_tiles_for(manager: &VMapManager, map_id: u32, points: &[Vec3]) {
    for p in points {
        let (x, y) = grid_coords(p.x, p.y);
        let result = manager.load_map_tile(map_id, x, y);
        if result.is_success() {
            tracing::debug!("Loaded tile [{},{}] of map {}", x, y, map_id);
        } else {
            tracing::warn!("Tile [{},{}] of map {} not loaded: {}", x, y, map_id, result);
        }
    }
}

fn run_check(manager: &VMapManager, args: CheckArgs) -> CheckReport {
    let tiles: Vec<(u32, u32)> = match args.tile {
        Some(tile) => vec![tile],
        None => (0..MAX_NUMBER_OF_GRIDS)
            .flat_map(|x| (0..MAX_NUMBER_OF_GRIDS).map(move |y| (x, y)))
            .collect(),
    };
    tracing::info!("Checking {} tile(s) of map {}", tiles.len(), args.map);

    let mut statuses: Vec<TileStatus> = tiles
        .into_par_iter()
        .map(|(x, y)| TileStatus {
            x,
            y,
            result: manager.exists_map_tile(args.map, x, y),
        })
        .collect();
    statuses.sort_by_key(|s| (s.x, s.y));

    let mut counts = BTreeMap::new();
    for status in &statuses {
        *counts.entry(status.result.to_string()).or_insert(0) += 1;
    }
    // a full grid scan mostly finds missing files; only list a single requested tile regardless
    if args.tile.is_none() {
        statuses.retain(|s| s.result != LoadResult::FileNotFound);
    }

    CheckReport {
        map_id: args.map,
        counts,
        tiles: statuses,
    }
}

fn build_manager(cli: &Cli) -> anyhow::Result<VMapManager> {
    let mut vmap_config = {
        let config = get_config().lock();
        VmapConfig::from_config(&config)
    };
    if let Some(data_dir) = &cli.data_dir {
        vmap_config.vmap_dir = Path::new(data_dir).join("vmaps");
    }

    anyhow::ensure!(
        vmap_config.vmap_dir.is_dir(),
        "vmaps directory {} does not exist",
        vmap_config.vmap_dir.display()
    );
    tracing::info!("Using vmaps from {}", vmap_config.vmap_dir.display());
    Ok(VMapManager::new(vmap_config))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration; a missing file leaves defaults and environment overrides
    let config_found = {
        let mut config = get_config().lock();
        if config.set_source(&cli.config, ENV_PREFIX) {
            true
        } else {
            config.set_env_only(ENV_PREFIX);
            false
        }
    };

    let (log_dir, config_level) = {
        let config = get_config().lock();
        let dir = config.get_string_default("LogsDir", "");
        let level = config.get_int_default("LogLevel", 2);
        (if dir.is_empty() { None } else { Some(dir) }, level)
    };
    let level = map_log_level(cli.log_level.unwrap_or(config_level));
    initialize_logging(log_dir.as_deref(), "vmap-tool.log", level);

    if !config_found {
        tracing::warn!("Configuration file {} not found, using defaults", cli.config);
    }

    let manager = build_manager(&cli).context("Could not set up the vmap manager")?;
    let json = cli.json;

    match cli.command {
        Command::Check(args) => emit(&run_check(&manager, args), json),
        Command::Los(args) => {
            load_tiles_for(&manager, args.map, &[args.from, args.to]);
            let ignore = if args.ignore_m2 { ModelIgnoreFlags::M2 } else { ModelIgnoreFlags::NOTHING };
            let report = LosReport {
                map_id: args.map,
                from: args.from,
                to: args.to,
                in_line_of_sight: manager.is_in_line_of_sight(args.map, args.from, args.to, ignore),
            };
            emit(&report, json)
        }
        Command::Hit(args) => {
            load_tiles_for(&manager, args.map, &[args.from, args.to]);
            let (hit, position) = manager.get_object_hit_pos(args.map, args.from, args.to, args.modify_dist);
            let report = HitReport {
                map_id: args.map,
                from: args.from,
                to: args.to,
                hit,
                position,
            };
            emit(&report, json)
        }
        Command::Height(args) => {
            load_tiles_for(&manager, args.map, &[args.pos]);
            let height = manager.get_height(args.map, args.pos, args.max_dist);
            let report = HeightReport {
                map_id: args.map,
                position: args.pos,
                height: (height != VMAP_INVALID_HEIGHT_VALUE).then_some(height),
            };
            emit(&report, json)
        }
        Command::Area(args) => {
            load_tiles_for(&manager, args.map, &[args.pos]);
            let report = AreaReport {
                map_id: args.map,
                position: args.pos,
                data: manager.get_area_and_liquid_data(args.map, args.pos, args.liquid_mask),
            };
            emit(&report, json)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("1,-2.5, 3").unwrap(), Vec3::new(1.0, -2.5, 3.0));
        assert!(parse_point("1,2").is_err());
        assert!(parse_point("1,b,3").is_err());
    }

    #[test]
    fn test_parse_tile() {
        assert_eq!(parse_tile("32,31").unwrap(), (32, 31));
        assert!(parse_tile("64,0").is_err());
        assert!(parse_tile("3").is_err());
    }

    #[test]
    fn test_cli_parses_query_commands() {
        let cli = Cli::try_parse_from(["vmap-tool", "--json", "los", "--map", "0", "--from", "-1,2,3", "--to", "4,5,6"])
            .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Los(args) => {
                assert_eq!(args.from, Vec3::new(-1.0, 2.0, 3.0));
                assert!(!args.ignore_m2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
