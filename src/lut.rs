//! Direction lookup table: quantized delay signature -> mean source direction.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::geometry::{MicArray, Vec3};
use crate::sphere::golden_spiral;

const HEADER_LABELS: &str = "key_x, key_y, key_z, dir_x, dir_y, dir_z, count";
const PRECISION_TAG: &str = "| precision ";

/// Delay signature `(t0 - t1, t0 - t2, t0 - t3)` quantized to whole key cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LutKey(pub [i32; 3]);

impl LutKey {
    pub fn from_delays(delays: [f64; 3], precision: f64) -> Self {
        LutKey(delays.map(|d| (d / precision).round() as i32))
    }

    /// Centre of this key's cell, in samples.
    pub fn to_delays(self, precision: f64) -> [f64; 3] {
        self.0.map(|k| k as f64 * precision)
    }

    fn offset(self, d: [i32; 3]) -> Self {
        LutKey([self.0[0] + d[0], self.0[1] + d[1], self.0[2] + d[2]])
    }
}

/// Mean unit direction of every sampled point that landed in one key cell.
///
/// Not renormalized: a norm well below 1 means the contributing directions
/// were scattered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LutEntry {
    pub direction: Vec3,
    pub count: i32,
}

impl LutEntry {
    /// Returned when no cell within the ring bound is populated.
    pub const MISS: LutEntry = LutEntry {
        direction: [2.0, 2.0, 2.0],
        count: -1,
    };

    pub fn is_miss(&self) -> bool {
        self.count < 0
    }

    pub fn found(self) -> Option<LutEntry> {
        if self.is_miss() { None } else { Some(self) }
    }
}

/// Parameters that fully determine a table's contents.
#[derive(Debug, Clone, PartialEq)]
pub struct LutParams {
    pub array: MicArray,
    pub samples_per_meter: f64,
    pub precision: f64,
    pub points_per_shell: usize,
    pub shells: usize,
    pub range_meters: f64,
    pub dead_zone_meters: f64,
    pub max_rings: i32,
}

impl LutParams {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let array = MicArray::tetrahedron(config.sensor_spacing_meters() as f64);
        array.validate()?;
        Ok(Self {
            array,
            samples_per_meter: config.samples_per_meter() as f64,
            precision: config.lut_key_precision as f64,
            points_per_shell: config.lut_points,
            shells: config.lut_shells,
            range_meters: config.lut_range_meters as f64,
            dead_zone_meters: config.lut_dead_zone_meters as f64,
            max_rings: config.lut_max_rings,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectionLut {
    precision: f64,
    max_rings: i32,
    entries: HashMap<LutKey, LutEntry>,
}

impl DirectionLut {
    /// Samples spiral shells around the array and bucket-averages the unit
    /// direction of every point by its quantized delay signature.
    pub fn build(params: &LutParams) -> Self {
        let unit_points = golden_spiral(params.points_per_shell);
        let mut sums: HashMap<LutKey, ([f64; 3], i32)> = HashMap::new();
        let mut sampled = 0usize;

        for shell in 0..params.shells {
            let radius = params.range_meters * (shell + 1) as f64 / params.shells as f64;
            if radius <= params.dead_zone_meters {
                debug!(shell, radius, "shell inside dead zone, skipped");
                continue;
            }
            info!(shell = shell + 1, shells = params.shells, radius, "sampling lut shell");

            for unit in &unit_points {
                let point = [unit[0] * radius, unit[1] * radius, unit[2] * radius];
                let signature = params.array.delay_signature(&point, params.samples_per_meter);
                let key = LutKey::from_delays(signature, params.precision);

                let bucket = sums.entry(key).or_insert(([0.0; 3], 0));
                bucket.0[0] += unit[0];
                bucket.0[1] += unit[1];
                bucket.0[2] += unit[2];
                bucket.1 += 1;
                sampled += 1;
            }
        }

        let entries: HashMap<LutKey, LutEntry> = sums
            .into_iter()
            .map(|(key, (sum, count))| {
                let n = count as f64;
                let direction = [(sum[0] / n) as f32, (sum[1] / n) as f32, (sum[2] / n) as f32];
                (key, LutEntry { direction, count })
            })
            .collect();

        info!(points = sampled, keys = entries.len(), "lut built");

        Self {
            precision: params.precision,
            max_rings: params.max_rings,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key cell size in samples.
    pub fn precision(&self) -> f64 {
        self.precision
    }

    pub fn get(&self, key: &LutKey) -> Option<&LutEntry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LutKey, &LutEntry)> {
        self.entries.iter()
    }

    /// Direction for a measured delay signature, or [`LutEntry::MISS`].
    pub fn lookup(&self, delays: [f64; 3]) -> LutEntry {
        self.lookup_key(LutKey::from_delays(delays, self.precision))
    }

    /// Exact match, else spiral out over Chebyshev shells of neighbouring
    /// cells up to `max_rings`. Within the first shell holding any populated
    /// cell, the cell nearest the requested key wins.
    pub fn lookup_key(&self, key: LutKey) -> LutEntry {
        if let Some(entry) = self.entries.get(&key) {
            return *entry;
        }

        for ring in 1..=self.max_rings {
            let mut nearest: Option<(i32, &LutEntry)> = None;
            for dx in -ring..=ring {
                for dy in -ring..=ring {
                    for dz in -ring..=ring {
                        if dx.abs().max(dy.abs()).max(dz.abs()) != ring {
                            continue;
                        }
                        if let Some(entry) = self.entries.get(&key.offset([dx, dy, dz])) {
                            let d2 = dx * dx + dy * dy + dz * dz;
                            if nearest.is_none_or(|(best, _)| d2 < best) {
                                nearest = Some((d2, entry));
                            }
                        }
                    }
                }
            }
            if let Some((_, entry)) = nearest {
                return *entry;
            }
        }
        LutEntry::MISS
    }

    /// Writes the table as text: entry count, a label line carrying the key
    /// precision, then one `key_x, key_y, key_z, dir_x, dir_y, dir_z, count`
    /// row per key.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = fs::File::create(path)
            .map_err(|e| Error::Persistence(format!("create {}: {}", path.display(), e)))?;
        let mut out = BufWriter::new(file);

        let mut keys: Vec<&LutKey> = self.entries.keys().collect();
        keys.sort();

        writeln!(out, "{}", keys.len())?;
        writeln!(out, "{}{}", HEADER_LABELS, precision_label(self.precision))?;

        let mut rows = csv::WriterBuilder::new().has_headers(false).from_writer(out);
        for key in keys {
            let entry = &self.entries[key];
            let k = key.to_delays(self.precision);
            let d = entry.direction;
            rows.write_record([
                format!("{:>12.4}", k[0]),
                format!("{:>12.4}", k[1]),
                format!("{:>12.4}", k[2]),
                format!("{:>10.6}", d[0]),
                format!("{:>10.6}", d[1]),
                format!("{:>10.6}", d[2]),
                format!("{:>8}", entry.count),
            ])?;
        }
        rows.flush()?;
        info!(path = %path.display(), entries = self.entries.len(), "lut saved");
        Ok(())
    }

    /// Reads a saved table.
    ///
    /// `Ok(None)` when the file is absent, yields no entries, or was built
    /// at a different key precision. A malformed row ends the read; rows
    /// before it are kept.
    pub fn load(path: impl AsRef<Path>, precision: f64, max_rings: i32) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no saved lut");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        let mut line = String::new();
        reader.read_line(&mut line)?;
        let Ok(expected) = line.trim().parse::<usize>() else {
            warn!(path = %path.display(), "lut header is not an entry count");
            return Ok(None);
        };

        line.clear();
        reader.read_line(&mut line)?;
        match saved_precision(&line) {
            Some(saved) if (saved - precision).abs() <= 1e-9 * precision.abs().max(1.0) => {}
            saved => {
                info!(path = %path.display(), ?saved, precision, "lut built at another key precision");
                return Ok(None);
            }
        }

        let mut rows = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut entries = HashMap::with_capacity(expected);
        for (row, record) in rows.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!(row, error = %e, "lut read stopped");
                    break;
                }
            };
            match parse_record(&record, precision) {
                Some((key, entry)) => {
                    entries.insert(key, entry);
                }
                None => {
                    warn!(row, "malformed lut row, keeping {} entries read so far", entries.len());
                    break;
                }
            }
        }

        if entries.len() != expected {
            warn!(expected, found = entries.len(), "lut entry count mismatch");
        }
        if entries.is_empty() {
            return Ok(None);
        }
        info!(path = %path.display(), entries = entries.len(), "lut loaded");
        Ok(Some(Self {
            precision,
            max_rings,
            entries,
        }))
    }

    /// Loads the saved table, building and saving a fresh one when it is
    /// absent, empty, unreadable or built for another precision.
    pub fn load_or_build(path: impl AsRef<Path>, params: &LutParams) -> Self {
        let path = path.as_ref();
        match Self::load(path, params.precision, params.max_rings) {
            Ok(Some(lut)) => return lut,
            Ok(None) => info!(path = %path.display(), "building lut"),
            Err(e) => warn!(path = %path.display(), error = %e, "lut unreadable, rebuilding"),
        }

        let lut = Self::build(params);
        if let Err(e) = lut.save(path) {
            warn!(error = %e, "could not save lut; it will be rebuilt next start");
        }
        lut
    }
}

fn precision_label(precision: f64) -> String {
    format!(" {}{}", PRECISION_TAG, precision)
}

fn saved_precision(label_line: &str) -> Option<f64> {
    let (_, value) = label_line.rsplit_once(PRECISION_TAG)?;
    value.trim().parse().ok().filter(|p: &f64| p.is_finite() && *p > 0.0)
}

fn parse_record(record: &csv::StringRecord, precision: f64) -> Option<(LutKey, LutEntry)> {
    if record.len() != 7 {
        return None;
    }
    let mut values = [0.0f64; 6];
    for (value, field) in values.iter_mut().zip(record.iter()) {
        *value = field.parse().ok()?;
        if !value.is_finite() {
            return None;
        }
    }
    let count: i32 = record.get(6)?.parse().ok()?;
    if count <= 0 {
        return None;
    }
    let key = LutKey::from_delays([values[0], values[1], values[2]], precision);
    let direction = [values[3] as f32, values[4] as f32, values[5] as f32];
    Some((key, LutEntry { direction, count }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::norm;

    fn small_params() -> LutParams {
        let config = Config {
            lut_points: 4000,
            lut_shells: 2,
            ..Config::default()
        };
        LutParams::from_config(&config).unwrap()
    }

    #[test]
    fn test_key_quantization() {
        assert_eq!(LutKey::from_delays([0.4, -0.6, 2.5], 1.0), LutKey([0, -1, 3]));
        assert_eq!(LutKey::from_delays([0.4, -0.6, 2.5], 0.5), LutKey([1, -1, 5]));
        assert_eq!(LutKey([1, -1, 5]).to_delays(0.5), [0.5, -0.5, 2.5]);
    }

    #[test]
    fn test_build_entries_are_averaged_unit_vectors() {
        let lut = DirectionLut::build(&small_params());
        assert!(!lut.is_empty());
        let mut total = 0;
        for (_, entry) in lut.iter() {
            assert!(entry.count > 0);
            assert!(norm(&entry.direction) <= 1.0 + 1e-5);
            total += entry.count;
        }
        assert_eq!(total, 8000);
    }

    #[test]
    fn test_dead_zone_skips_inner_shell() {
        let mut params = small_params();
        params.dead_zone_meters = 3.0;
        let lut = DirectionLut::build(&params);
        let total: i32 = lut.iter().map(|(_, e)| e.count).sum();
        assert_eq!(total, 4000);
    }

    #[test]
    fn test_lookup_points_toward_source() {
        let params = small_params();
        let lut = DirectionLut::build(&params);
        let sources = [[0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.6, 0.0, -0.8]];
        for dir in sources {
            let point = [dir[0] * 4.0, dir[1] * 4.0, dir[2] * 4.0];
            let signature = params.array.delay_signature(&point, params.samples_per_meter);
            let entry = lut.lookup(signature);
            assert!(!entry.is_miss());
            let d = entry.direction;
            let len = norm(&d);
            let cos = (d[0] as f64 * dir[0] + d[1] as f64 * dir[1] + d[2] as f64 * dir[2]) / len as f64;
            assert!(cos > 0.8, "direction {:?} came back as {:?}", dir, d);
        }
    }

    #[test]
    fn test_spiral_out_finds_neighbour() {
        let mut entries = HashMap::new();
        let near = LutEntry { direction: [0.0, 1.0, 0.0], count: 3 };
        let far = LutEntry { direction: [1.0, 0.0, 0.0], count: 5 };
        entries.insert(LutKey([2, 0, 0]), near);
        entries.insert(LutKey([2, 2, 2]), far);
        let lut = DirectionLut { precision: 1.0, max_rings: 2, entries };

        // both at Chebyshev distance 2, the axis-aligned one is closer
        assert_eq!(lut.lookup_key(LutKey([0, 0, 0])), near);
        assert_eq!(lut.lookup_key(LutKey([2, 2, 1])), far);
        assert!(lut.lookup_key(LutKey([10, 10, 10])).is_miss());
    }

    #[test]
    fn test_miss_sentinel_outside_rings() {
        let lut = DirectionLut::build(&small_params());
        let entry = lut.lookup([500.0, -500.0, 500.0]);
        assert_eq!(entry, LutEntry::MISS);
        assert!(entry.found().is_none());
        assert!(norm(&entry.direction) > 1.0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lut.csv");
        let lut = DirectionLut::build(&small_params());
        lut.save(&path).unwrap();

        let loaded = DirectionLut::load(&path, 1.0, 3).unwrap().unwrap();
        assert_eq!(loaded.len(), lut.len());
        for (key, entry) in lut.iter() {
            let other = loaded.get(key).unwrap();
            assert_eq!(other.count, entry.count);
            for c in 0..3 {
                assert!((other.direction[c] - entry.direction[c]).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_missing_and_empty_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.csv");
        assert!(DirectionLut::load(&missing, 1.0, 3).unwrap().is_none());

        let empty = dir.path().join("empty.csv");
        fs::write(&empty, format!("0\n{}{}\n", HEADER_LABELS, precision_label(1.0))).unwrap();
        assert!(DirectionLut::load(&empty, 1.0, 3).unwrap().is_none());

        let garbage = dir.path().join("garbage.csv");
        fs::write(&garbage, "not a lut\n").unwrap();
        assert!(DirectionLut::load(&garbage, 1.0, 3).unwrap().is_none());
    }

    #[test]
    fn test_truncated_file_keeps_parsed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.csv");
        let content = format!(
            "3\n{}{}\n1.0, 2.0, -1.0, 0.5, 0.5, 0.5, 4\n0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2\n3.0, 1.0,",
            HEADER_LABELS,
            precision_label(1.0)
        );
        fs::write(&path, content).unwrap();

        let lut = DirectionLut::load(&path, 1.0, 3).unwrap().unwrap();
        assert_eq!(lut.len(), 2);
        assert_eq!(lut.get(&LutKey([1, 2, -1])).unwrap().count, 4);
    }

    #[test]
    fn test_load_or_build_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lut.csv");
        let params = small_params();
        let built = DirectionLut::load_or_build(&path, &params);
        assert!(path.exists());
        let cached = DirectionLut::load_or_build(&path, &params);
        assert_eq!(cached.len(), built.len());
    }

    #[test]
    fn test_other_precision_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lut.csv");
        let mut fine = small_params();
        fine.precision = 0.5;
        DirectionLut::build(&fine).save(&path).unwrap();
        assert!(DirectionLut::load(&path, 0.5, 3).unwrap().is_some());
        assert!(DirectionLut::load(&path, 1.0, 3).unwrap().is_none());

        let coarse = small_params();
        let reloaded = DirectionLut::load_or_build(&path, &coarse);
        let fresh = DirectionLut::build(&coarse);
        assert_eq!(reloaded.precision(), 1.0);
        assert_eq!(reloaded.len(), fresh.len());
        for (key, entry) in fresh.iter() {
            assert_eq!(reloaded.get(key).unwrap().count, entry.count);
        }
        // the cache now holds the coarse table
        assert!(DirectionLut::load(&path, 1.0, 3).unwrap().is_some());
    }

    #[test]
    fn test_label_without_precision_is_not_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.csv");
        let content = format!("1\n{}\n1.0, 2.0, -1.0, 0.5, 0.5, 0.5, 4\n", HEADER_LABELS);
        fs::write(&path, content).unwrap();
        assert!(DirectionLut::load(&path, 1.0, 3).unwrap().is_none());
        assert_eq!(saved_precision("key_x | precision 0.25\n"), Some(0.25));
    }
}
