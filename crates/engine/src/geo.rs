//! Geohash codec and geographic helpers
//!
//! A point is encoded as a 52-bit interleaved geohash (26 bits per axis)
//! stored as the member's sorted-set score; 52-bit integers are exact in a
//! double. Searches cover the area with the center cell plus its eight
//! neighbors at a radius-derived precision and filter candidates by exact
//! distance.

/// Bits per axis of the stored hash.
pub const GEO_STEP: u32 = 26;

pub const LON_MIN: f64 = -180.0;
pub const LON_MAX: f64 = 180.0;
/// Web-Mercator latitude clamp, as used by the wire format.
pub const LAT_MIN: f64 = -85.05112878;
pub const LAT_MAX: f64 = 85.05112878;

const EARTH_RADIUS_M: f64 = 6372797.560856;
const MERCATOR_MAX: f64 = 20037726.37;

/// A cell at a given precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeoCell {
    pub bits: u64,
    pub step: u32,
}

// Spread the low 32 bits of `v` into the even bit positions.
fn spread(v: u32) -> u64 {
    let mut x = v as u64;
    x = (x | (x << 16)) & 0x0000FFFF0000FFFF;
    x = (x | (x << 8)) & 0x00FF00FF00FF00FF;
    x = (x | (x << 4)) & 0x0F0F0F0F0F0F0F0F;
    x = (x | (x << 2)) & 0x3333333333333333;
    x = (x | (x << 1)) & 0x5555555555555555;
    x
}

// Collect the even bit positions of `v` into the low 32 bits.
fn squash(v: u64) -> u32 {
    let mut x = v & 0x5555555555555555;
    x = (x | (x >> 1)) & 0x3333333333333333;
    x = (x | (x >> 2)) & 0x0F0F0F0F0F0F0F0F;
    x = (x | (x >> 4)) & 0x00FF00FF00FF00FF;
    x = (x | (x >> 8)) & 0x0000FFFF0000FFFF;
    x = (x | (x >> 16)) & 0x00000000FFFFFFFF;
    x as u32
}

fn interleave(lat_bits: u32, lon_bits: u32) -> u64 {
    spread(lat_bits) | (spread(lon_bits) << 1)
}

fn deinterleave(bits: u64) -> (u32, u32) {
    (squash(bits), squash(bits >> 1))
}

/// Encode a point into a 52-bit hash. Returns None for out-of-range
/// coordinates.
pub fn encode(lon: f64, lat: f64) -> Option<u64> {
    if !(LON_MIN..=LON_MAX).contains(&lon) || !(LAT_MIN..=LAT_MAX).contains(&lat) {
        return None;
    }
    let cells = (1u64 << GEO_STEP) as f64;
    let lat_off = ((lat - LAT_MIN) / (LAT_MAX - LAT_MIN) * cells) as u64;
    let lon_off = ((lon - LON_MIN) / (LON_MAX - LON_MIN) * cells) as u64;
    let lat_off = lat_off.min((1 << GEO_STEP) - 1) as u32;
    let lon_off = lon_off.min((1 << GEO_STEP) - 1) as u32;
    Some(interleave(lat_off, lon_off))
}

/// Decode a 52-bit hash to the center of its cell.
pub fn decode(bits: u64) -> (f64, f64) {
    let (lat_idx, lon_idx) = deinterleave(bits);
    let cells = (1u64 << GEO_STEP) as f64;
    let lat_unit = (LAT_MAX - LAT_MIN) / cells;
    let lon_unit = (LON_MAX - LON_MIN) / cells;
    let lon = LON_MIN + (lon_idx as f64 + 0.5) * lon_unit;
    let lat = LAT_MIN + (lat_idx as f64 + 0.5) * lat_unit;
    (lon, lat)
}

/// Haversine distance in meters.
pub fn distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let lat1r = lat1.to_radians();
    let lat2r = lat2.to_radians();
    let u = ((lat2r - lat1r) / 2.0).sin();
    let v = ((lon2.to_radians() - lon1.to_radians()) / 2.0).sin();
    let a = u * u + lat1r.cos() * lat2r.cos() * v * v;
    2.0 * a.sqrt().asin() * EARTH_RADIUS_M
}

/// Precision (bits per axis) whose cell comfortably contains a radius
/// around a point at the given latitude.
pub fn estimate_step(radius_m: f64, lat: f64) -> u32 {
    if radius_m <= 0.0 {
        return GEO_STEP;
    }
    let mut step = 1u32;
    let mut r = radius_m;
    while r < MERCATOR_MAX && step < GEO_STEP {
        r *= 2.0;
        step += 1;
    }
    // leave margin so the 3x3 cover always contains the radius; cells
    // shrink near the poles, so back off further there
    let mut step = step.saturating_sub(2).max(1);
    if lat.abs() > 66.0 && step > 1 {
        step -= 1;
    }
    if lat.abs() > 80.0 && step > 1 {
        step -= 1;
    }
    step.min(GEO_STEP - 1)
}

/// The cell containing a point at a precision.
pub fn cell_of(lon: f64, lat: f64, step: u32) -> Option<GeoCell> {
    let full = encode(lon, lat)?;
    Some(GeoCell {
        bits: full >> (2 * (GEO_STEP - step)),
        step,
    })
}

/// The cell and its eight neighbors (deduplicated at the grid edges).
pub fn neighbors(cell: GeoCell) -> Vec<GeoCell> {
    let (lat_idx, lon_idx) = deinterleave(cell.bits);
    let max_idx = (1u32 << cell.step) - 1;
    let mut out = Vec::with_capacity(9);
    for dlat in [-1i64, 0, 1] {
        for dlon in [-1i64, 0, 1] {
            let lat_n = lat_idx as i64 + dlat;
            if lat_n < 0 || lat_n > max_idx as i64 {
                continue;
            }
            // longitude wraps around the antimeridian
            let lon_n = (lon_idx as i64 + dlon).rem_euclid((max_idx as i64) + 1);
            let c = GeoCell {
                bits: interleave(lat_n as u32, lon_n as u32),
                step: cell.step,
            };
            if !out.contains(&c) {
                out.push(c);
            }
        }
    }
    out
}

/// Score interval `[min, max)` of all 52-bit hashes inside a cell.
pub fn cell_score_range(cell: GeoCell) -> (u64, u64) {
    let shift = 2 * (GEO_STEP - cell.step);
    (cell.bits << shift, (cell.bits + 1) << shift)
}

/// Distance when the point lies inside the axis-aligned box, else None.
pub fn distance_if_in_box(
    width_m: f64,
    height_m: f64,
    lon_c: f64,
    lat_c: f64,
    lon: f64,
    lat: f64,
) -> Option<f64> {
    let lon_d = distance(lon_c, lat_c, lon, lat_c);
    let lat_d = distance(lon_c, lat_c, lon_c, lat);
    if lon_d > width_m / 2.0 || lat_d > height_m / 2.0 {
        return None;
    }
    Some(distance(lon_c, lat_c, lon, lat))
}

const BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Standard 11-character geohash string of a stored 52-bit hash. The
/// public format uses the full -90..90 latitude range and interleaves with
/// longitude first.
pub fn to_geohash_string(bits: u64) -> String {
    let (lon, lat) = decode(bits);
    let cells = (1u64 << GEO_STEP) as f64;
    let lat_off = ((lat + 90.0) / 180.0 * cells) as u64;
    let lon_off = ((lon + 180.0) / 360.0 * cells) as u64;
    let lat_b = (lat_off.min((1 << GEO_STEP) - 1)) as u32;
    let lon_b = (lon_off.min((1 << GEO_STEP) - 1)) as u32;
    let inter = spread(lat_b) | (spread(lon_b) << 1);
    // 52 bits, highest first, 5 per character, zero-padded to 55
    let mut out = String::with_capacity(11);
    for i in 0..11 {
        let shift = 52i32 - ((i + 1) * 5);
        let idx = if shift >= 0 {
            ((inter >> shift) & 0x1f) as usize
        } else {
            ((inter << (-shift)) & 0x1f) as usize
        };
        out.push(BASE32[idx] as char);
    }
    out
}

/// Meters per unit token (M/KM/FT/MI).
pub fn unit_to_meters(unit: &str) -> Option<f64> {
    match unit.to_ascii_uppercase().as_str() {
        "M" => Some(1.0),
        "KM" => Some(1000.0),
        "FT" => Some(0.3048),
        "MI" => Some(1609.34),
        _ => None,
    }
}
