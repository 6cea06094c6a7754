//! Geo commands
//!
//! Geo sets are plain sorted sets whose scores are 52-bit interleaved
//! geohashes, so all storage behavior (encodings, promotion) is inherited
//! from the sorted-set family. Searches cover the area with the 3x3 cell
//! neighborhood at a radius-derived precision, pull the candidates per
//! cell score range, and filter by exact distance on the coordinator.

use crate::error::{OpResult, OpStatus};
use crate::geo;
use crate::shard::OpArgs;
use crate::shard_set::ShardSet;
use crate::transaction::{LockMode, Transaction};
use crate::util::{parse_f64, parse_i64, upper};
use crate::zset_family::{op_zadd as zadd_op, op_zrange as zrange_op, ZParams, ZRangeBy, ZRangeParams};
use bytes::Bytes;
use ember_core::DbIndex;
use resp::RespValue;
use std::sync::Arc;
use storage::sorted_map::{ScoreBound, ScoreRange};

fn fmt_coord(v: f64) -> String {
    format!("{v:.17}")
}

fn fmt_dist(v: f64) -> String {
    format!("{v:.4}")
}

#[derive(Debug, Clone)]
struct GeoPoint {
    member: Vec<u8>,
    dist_m: f64,
    bits: u64,
    lon: f64,
    lat: f64,
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    Radius(f64),
    Box { width_m: f64, height_m: f64 },
}

impl Shape {
    fn cover_radius(&self) -> f64 {
        match self {
            Shape::Radius(r) => *r,
            Shape::Box { width_m, height_m } => {
                ((width_m / 2.0).powi(2) + (height_m / 2.0).powi(2)).sqrt()
            }
        }
    }

    fn accept(&self, lon_c: f64, lat_c: f64, lon: f64, lat: f64) -> Option<f64> {
        match self {
            Shape::Radius(r) => {
                let d = geo::distance(lon_c, lat_c, lon, lat);
                (d <= *r).then_some(d)
            }
            Shape::Box { width_m, height_m } => {
                geo::distance_if_in_box(*width_m, *height_m, lon_c, lat_c, lon, lat)
            }
        }
    }
}

async fn fetch_score(ss: &Arc<ShardSet>, db: DbIndex, key: Bytes, member: Bytes) -> OpResult<f64> {
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    tx.schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
        let cntx = op.db_cntx;
        let pos = op
            .shard
            .db_slice
            .find_read_only(&cntx, &key, Some(storage::ObjType::ZSet))?;
        let score = op
            .shard
            .db_slice
            .value(cntx.db_index, pos)
            .and_then(|v| v.payload())
            .and_then(|p| match p {
                storage::Payload::ZSet(z) => match z {
                    storage::ZSetPayload::SkipList(sm) => sm.get_score(&member),
                    storage::ZSetPayload::ListPack(_) => {
                        // scan through the generic extractor
                        None
                    }
                },
                _ => None,
            });
        match score {
            Some(s) => Ok(s),
            None => {
                // packed encoding or missing member: fall back to a range
                // walk over all entries
                let params = ZRangeParams {
                    by: ZRangeBy::Rank(0, i64::MAX),
                    reverse: false,
                    offset: 0,
                    limit: usize::MAX,
                };
                let all = zrange_op(op, &key, params)?;
                all.into_iter()
                    .find(|(m, _)| m.as_slice() == &member[..])
                    .map(|(_, s)| s)
                    .ok_or(OpStatus::MemberNotFound)
            }
        }
    }))
    .await
}

/// Collect, filter and sort the members inside the shape around a center.
async fn search_around(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    key: Bytes,
    center: (f64, f64),
    shape: Shape,
) -> OpResult<Vec<GeoPoint>> {
    let (lon_c, lat_c) = center;
    let step = geo::estimate_step(shape.cover_radius(), lat_c);
    let Some(cell) = geo::cell_of(lon_c, lat_c, step) else {
        return Err(OpStatus::InvalidValue("invalid longitude,latitude pair".into()));
    };
    let ranges: Vec<(u64, u64)> = geo::neighbors(cell)
        .into_iter()
        .map(geo::cell_score_range)
        .collect();

    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Shared);
    let candidates = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let mut out: Vec<(Vec<u8>, f64)> = Vec::new();
            for (lo, hi) in &ranges {
                let params = ZRangeParams {
                    by: ZRangeBy::Score(ScoreRange {
                        min: ScoreBound::Val {
                            v: *lo as f64,
                            incl: true,
                        },
                        max: ScoreBound::Val {
                            v: *hi as f64,
                            incl: false,
                        },
                    }),
                    reverse: false,
                    offset: 0,
                    limit: usize::MAX,
                };
                out.extend(zrange_op(op, &key, params)?);
            }
            Ok(out)
        }))
        .await?;

    let mut seen = std::collections::HashSet::new();
    let mut points = Vec::new();
    for (member, score) in candidates {
        if !seen.insert(member.clone()) {
            continue;
        }
        let bits = score as u64;
        let (lon, lat) = geo::decode(bits);
        if let Some(d) = shape.accept(lon_c, lat_c, lon, lat) {
            points.push(GeoPoint {
                member,
                dist_m: d,
                bits,
                lon,
                lat,
            });
        }
    }
    points.sort_by(|a, b| a.dist_m.partial_cmp(&b.dist_m).unwrap_or(std::cmp::Ordering::Equal));
    Ok(points)
}

// ==================== command handlers ====================

/// GEOADD key [NX|XX] [CH] longitude latitude member [...]
pub async fn geoadd(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 4 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let mut params = ZParams::default();
    let mut i = 1;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "NX" => params.flags.nx = true,
            "XX" => params.flags.xx = true,
            "CH" => params.ch = true,
            _ => break,
        }
        i += 1;
    }
    let rest = &args[i..];
    if rest.is_empty() || rest.len() % 3 != 0 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let mut pairs = Vec::with_capacity(rest.len() / 3);
    for chunk in rest.chunks(3) {
        let lon = match parse_f64(&chunk[0]) {
            Ok(v) => v,
            Err(e) => return e.to_resp(),
        };
        let lat = match parse_f64(&chunk[1]) {
            Ok(v) => v,
            Err(e) => return e.to_resp(),
        };
        let Some(bits) = geo::encode(lon, lat) else {
            return RespValue::error(format!(
                "ERR invalid longitude,latitude pair {lon:.6},{lat:.6}"
            ));
        };
        pairs.push((bits as f64, chunk[2].clone()));
    }

    let raw = args.to_vec();
    let tx = Transaction::new(ss, db, &[key.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let r = zadd_op(op, &key, params, &pairs);
            if r.is_ok() {
                op.record_journal("GEOADD", &raw);
            }
            r
        }))
        .await;
    match result {
        Ok(r) => {
            if params.ch {
                RespValue::Integer((r.added + r.updated) as i64)
            } else {
                RespValue::Integer(r.added as i64)
            }
        }
        Err(e) => e.to_resp(),
    }
}

/// GEOPOS key member [member ...]
pub async fn geopos(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let mut out = Vec::with_capacity(args.len() - 1);
    for member in &args[1..] {
        match fetch_score(ss, db, key.clone(), member.clone()).await {
            Ok(score) => {
                let (lon, lat) = geo::decode(score as u64);
                out.push(RespValue::array(vec![
                    RespValue::bulk(fmt_coord(lon)),
                    RespValue::bulk(fmt_coord(lat)),
                ]));
            }
            Err(OpStatus::MemberNotFound) | Err(OpStatus::KeyNotFound) => {
                out.push(RespValue::Null)
            }
            Err(e) => return e.to_resp(),
        }
    }
    RespValue::array(out)
}

/// GEODIST key member1 member2 [M|KM|FT|MI]
pub async fn geodist(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 3 || args.len() > 4 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let to_meters = match args.get(3) {
        Some(u) => match geo::unit_to_meters(&upper(u)) {
            Some(m) => m,
            None => return RespValue::error("ERR unsupported unit provided. please use M, KM, FT, MI"),
        },
        None => 1.0,
    };
    let key = args[0].clone();
    let s1 = fetch_score(ss, db, key.clone(), args[1].clone()).await;
    let s2 = fetch_score(ss, db, key.clone(), args[2].clone()).await;
    match (s1, s2) {
        (Ok(a), Ok(b)) => {
            let (lon1, lat1) = geo::decode(a as u64);
            let (lon2, lat2) = geo::decode(b as u64);
            let d = geo::distance(lon1, lat1, lon2, lat2) / to_meters;
            RespValue::bulk(fmt_dist(d))
        }
        (Err(OpStatus::MemberNotFound), _)
        | (_, Err(OpStatus::MemberNotFound))
        | (Err(OpStatus::KeyNotFound), _)
        | (_, Err(OpStatus::KeyNotFound)) => RespValue::nil(),
        (Err(e), _) | (_, Err(e)) => e.to_resp(),
    }
}

/// GEOHASH key member [member ...]
pub async fn geohash(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 2 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let mut out = Vec::with_capacity(args.len() - 1);
    for member in &args[1..] {
        match fetch_score(ss, db, key.clone(), member.clone()).await {
            Ok(score) => out.push(RespValue::bulk(geo::to_geohash_string(score as u64))),
            Err(OpStatus::MemberNotFound) | Err(OpStatus::KeyNotFound) => {
                out.push(RespValue::nil())
            }
            Err(e) => return e.to_resp(),
        }
    }
    RespValue::array(out)
}

#[derive(Debug, Clone, Default)]
struct SearchOpts {
    with_coord: bool,
    with_dist: bool,
    with_hash: bool,
    count: Option<usize>,
    desc: bool,
    store: Option<Bytes>,
    store_dist: Option<Bytes>,
    unit_m: f64,
}

fn reply_points(points: Vec<GeoPoint>, opts: &SearchOpts) -> RespValue {
    let plain = !opts.with_coord && !opts.with_dist && !opts.with_hash;
    RespValue::array(
        points
            .into_iter()
            .map(|p| {
                if plain {
                    return RespValue::bulk(p.member);
                }
                let mut item = vec![RespValue::bulk(p.member)];
                if opts.with_dist {
                    item.push(RespValue::bulk(fmt_dist(p.dist_m / opts.unit_m)));
                }
                if opts.with_hash {
                    item.push(RespValue::Integer(p.bits as i64));
                }
                if opts.with_coord {
                    item.push(RespValue::array(vec![
                        RespValue::bulk(fmt_coord(p.lon)),
                        RespValue::bulk(fmt_coord(p.lat)),
                    ]));
                }
                RespValue::array(item)
            })
            .collect(),
    )
}

async fn store_points(
    ss: &Arc<ShardSet>,
    db: DbIndex,
    dest: Bytes,
    pairs: Vec<(f64, Bytes)>,
    cmd: &'static str,
) -> RespValue {
    let card = pairs.len();
    let tx = Transaction::new(ss, db, &[dest.clone()], LockMode::Exclusive);
    let result = tx
        .schedule_single_hop(Arc::new(move |op: &mut OpArgs<'_>| {
            let cntx = op.db_cntx;
            op.shard.delete_key(&cntx, &dest);
            if !pairs.is_empty() {
                zadd_op(op, &dest, ZParams::default(), &pairs)?;
            }
            op.record_journal(cmd, std::slice::from_ref(&dest));
            Ok(())
        }))
        .await;
    match result {
        Ok(()) => RespValue::Integer(card as i64),
        Err(e) => e.to_resp(),
    }
}

/// GEOSEARCH key FROMMEMBER m | FROMLONLAT lon lat,
/// BYRADIUS r unit | BYBOX w h unit,
/// [ASC|DESC] [COUNT n [ANY]] [WITHCOORD] [WITHDIST] [WITHHASH]
pub async fn geosearch(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 4 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let mut from_member: Option<Bytes> = None;
    let mut from_lonlat: Option<(f64, f64)> = None;
    let mut shape: Option<Shape> = None;
    let mut opts = SearchOpts {
        unit_m: 1.0,
        ..Default::default()
    };

    let mut i = 1;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "FROMMEMBER" => {
                i += 1;
                from_member = Some(match args.get(i) {
                    Some(m) => m.clone(),
                    None => return OpStatus::SyntaxErr.to_resp(),
                });
            }
            "FROMLONLAT" => {
                let (Some(lon), Some(lat)) = (args.get(i + 1), args.get(i + 2)) else {
                    return OpStatus::SyntaxErr.to_resp();
                };
                let lon = match parse_f64(lon) {
                    Ok(v) => v,
                    Err(e) => return e.to_resp(),
                };
                let lat = match parse_f64(lat) {
                    Ok(v) => v,
                    Err(e) => return e.to_resp(),
                };
                from_lonlat = Some((lon, lat));
                i += 2;
            }
            "BYRADIUS" => {
                let (Some(r), Some(u)) = (args.get(i + 1), args.get(i + 2)) else {
                    return OpStatus::SyntaxErr.to_resp();
                };
                let r = match parse_f64(r) {
                    Ok(v) if v >= 0.0 => v,
                    _ => return RespValue::error("ERR radius cannot be negative"),
                };
                let Some(m) = geo::unit_to_meters(&upper(u)) else {
                    return RespValue::error(
                        "ERR unsupported unit provided. please use M, KM, FT, MI",
                    );
                };
                opts.unit_m = m;
                shape = Some(Shape::Radius(r * m));
                i += 2;
            }
            "BYBOX" => {
                let (Some(w), Some(h), Some(u)) =
                    (args.get(i + 1), args.get(i + 2), args.get(i + 3))
                else {
                    return OpStatus::SyntaxErr.to_resp();
                };
                let w = match parse_f64(w) {
                    Ok(v) if v >= 0.0 => v,
                    _ => return RespValue::error("ERR height or width cannot be negative"),
                };
                let h = match parse_f64(h) {
                    Ok(v) if v >= 0.0 => v,
                    _ => return RespValue::error("ERR height or width cannot be negative"),
                };
                let Some(m) = geo::unit_to_meters(&upper(u)) else {
                    return RespValue::error(
                        "ERR unsupported unit provided. please use M, KM, FT, MI",
                    );
                };
                opts.unit_m = m;
                shape = Some(Shape::Box {
                    width_m: w * m,
                    height_m: h * m,
                });
                i += 3;
            }
            "ASC" => opts.desc = false,
            "DESC" => opts.desc = true,
            "COUNT" => {
                i += 1;
                let n = match args.get(i).map(|a| parse_i64(a)) {
                    Some(Ok(v)) if v > 0 => v as usize,
                    _ => return RespValue::error("ERR COUNT must be > 0"),
                };
                opts.count = Some(n);
                if args.get(i + 1).map(|a| upper(a)) == Some("ANY".into()) {
                    i += 1;
                }
            }
            "WITHCOORD" => opts.with_coord = true,
            "WITHDIST" => opts.with_dist = true,
            "WITHHASH" => opts.with_hash = true,
            _ => return OpStatus::SyntaxErr.to_resp(),
        }
        i += 1;
    }

    let Some(shape) = shape else {
        return OpStatus::SyntaxErr.to_resp();
    };
    let center = match (from_lonlat, from_member) {
        (Some(c), None) => c,
        (None, Some(m)) => match fetch_score(ss, db, key.clone(), m).await {
            Ok(score) => geo::decode(score as u64),
            Err(OpStatus::MemberNotFound) | Err(OpStatus::KeyNotFound) => {
                return RespValue::error("ERR could not decode requested zset member");
            }
            Err(e) => return e.to_resp(),
        },
        _ => return OpStatus::SyntaxErr.to_resp(),
    };

    match search_around(ss, db, key, center, shape).await {
        Ok(mut points) => {
            if opts.desc {
                points.reverse();
            }
            if let Some(n) = opts.count {
                points.truncate(n);
            }
            reply_points(points, &opts)
        }
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}

/// GEORADIUSBYMEMBER key member radius unit [WITHCOORD] [WITHDIST]
/// [WITHHASH] [COUNT n] [ASC|DESC] [STORE key | STOREDIST key]
pub async fn georadiusbymember(ss: &Arc<ShardSet>, db: DbIndex, args: &[Bytes]) -> RespValue {
    if args.len() < 4 {
        return OpStatus::SyntaxErr.to_resp();
    }
    let key = args[0].clone();
    let member = args[1].clone();
    let radius = match parse_f64(&args[2]) {
        Ok(v) if v >= 0.0 => v,
        _ => return RespValue::error("ERR radius cannot be negative"),
    };
    let Some(unit_m) = geo::unit_to_meters(&upper(&args[3])) else {
        return RespValue::error("ERR unsupported unit provided. please use M, KM, FT, MI");
    };
    let mut opts = SearchOpts {
        unit_m,
        ..Default::default()
    };
    let mut i = 4;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "WITHCOORD" => opts.with_coord = true,
            "WITHDIST" => opts.with_dist = true,
            "WITHHASH" => opts.with_hash = true,
            "ASC" => opts.desc = false,
            "DESC" => opts.desc = true,
            "COUNT" => {
                i += 1;
                let n = match args.get(i).map(|a| parse_i64(a)) {
                    Some(Ok(v)) if v > 0 => v as usize,
                    _ => return RespValue::error("ERR COUNT must be > 0"),
                };
                opts.count = Some(n);
            }
            "STORE" => {
                i += 1;
                opts.store = Some(match args.get(i) {
                    Some(k) => k.clone(),
                    None => return OpStatus::SyntaxErr.to_resp(),
                });
            }
            "STOREDIST" => {
                i += 1;
                opts.store_dist = Some(match args.get(i) {
                    Some(k) => k.clone(),
                    None => return OpStatus::SyntaxErr.to_resp(),
                });
            }
            _ => return OpStatus::SyntaxErr.to_resp(),
        }
        i += 1;
    }
    if opts.store.is_some() && (opts.with_coord || opts.with_dist || opts.with_hash) {
        return RespValue::error(
            "ERR STORE option in GEORADIUS is not compatible with WITHCOORD, WITHDIST and WITHHASH options",
        );
    }

    let center = match fetch_score(ss, db, key.clone(), member).await {
        Ok(score) => geo::decode(score as u64),
        Err(OpStatus::MemberNotFound) | Err(OpStatus::KeyNotFound) => {
            return RespValue::error("ERR could not decode requested zset member");
        }
        Err(e) => return e.to_resp(),
    };

    match search_around(ss, db, key, center, Shape::Radius(radius * unit_m)).await {
        Ok(mut points) => {
            if opts.desc {
                points.reverse();
            }
            if let Some(n) = opts.count {
                points.truncate(n);
            }
            if let Some(dest) = opts.store.clone() {
                let pairs: Vec<(f64, Bytes)> = points
                    .iter()
                    .map(|p| (p.bits as f64, Bytes::from(p.member.clone())))
                    .collect();
                return store_points(ss, db, dest, pairs, "GEORADIUSBYMEMBER").await;
            }
            if let Some(dest) = opts.store_dist.clone() {
                let pairs: Vec<(f64, Bytes)> = points
                    .iter()
                    .map(|p| (p.dist_m / opts.unit_m, Bytes::from(p.member.clone())))
                    .collect();
                return store_points(ss, db, dest, pairs, "GEORADIUSBYMEMBER").await;
            }
            reply_points(points, &opts)
        }
        Err(OpStatus::KeyNotFound) => RespValue::array(Vec::new()),
        Err(e) => e.to_resp(),
    }
}
