//! Sorted set: order-statistic skip-list plus member index
//!
//! The promoted encoding for sorted sets. Ordering is by (score, member)
//! with lexicographic tie break; every link carries a span so rank queries
//! and nth-element lookups cost O(log n). Nodes live in an index arena
//! (no pointers) with level-0 backward links for reverse iteration. A
//! [`DenseTable`](crate::dense_table::DenseTable) maps member -> score for
//! O(1) score lookups, resumable scans and random sampling.

use crate::dense_table::DenseTable;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;

const MAX_LEVEL: usize = 32;
const NIL: u32 = u32::MAX;
const HEAD: u32 = 0;

#[derive(Clone, Copy, Default)]
struct Link {
    next: u32,
    span: u32,
}

struct Node {
    member: Box<[u8]>,
    score: f64,
    prev: u32,
    links: Vec<Link>,
}

impl Node {
    fn stub() -> Self {
        Self {
            member: Box::default(),
            score: 0.0,
            prev: NIL,
            links: Vec::new(),
        }
    }
}

/// Score interval endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    Val { v: f64, incl: bool },
    PosInf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRange {
    pub min: ScoreBound,
    pub max: ScoreBound,
}

impl ScoreRange {
    pub fn all() -> Self {
        Self {
            min: ScoreBound::NegInf,
            max: ScoreBound::PosInf,
        }
    }

    pub fn contains(&self, score: f64) -> bool {
        after_min(score, &self.min) && before_max(score, &self.max)
    }
}

/// Lex interval endpoint (all members assumed to share one score).
#[derive(Debug, Clone, PartialEq)]
pub enum LexBound {
    NegInf,
    PosInf,
    Closed(Vec<u8>),
    Open(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexRange {
    pub min: LexBound,
    pub max: LexBound,
}

impl LexRange {
    pub fn contains(&self, member: &[u8]) -> bool {
        lex_after_min(member, &self.min) && lex_before_max(member, &self.max)
    }
}

/// Conditional-insert flags; `CH` accounting is done by the caller from the
/// returned outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertFlags {
    pub nx: bool,
    pub xx: bool,
    pub gt: bool,
    pub lt: bool,
    pub incr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InsertResult {
    /// New member added with this score.
    Added(f64),
    /// Existing member, score changed to this value.
    Updated(f64),
    /// Existing member, score unchanged.
    Noop(f64),
    /// A conditional flag prevented the write.
    Skipped,
}

/// Arithmetic produced NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NanScore;

fn score_cmp(a: f64, b: f64) -> Ordering {
    // NaN never enters the structure
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn elem_lt(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> bool {
    match score_cmp(a_score, b_score) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a_member < b_member,
    }
}

fn after_min(score: f64, bound: &ScoreBound) -> bool {
    match bound {
        ScoreBound::NegInf => true,
        ScoreBound::PosInf => false,
        ScoreBound::Val { v, incl: true } => score >= *v,
        ScoreBound::Val { v, incl: false } => score > *v,
    }
}

fn before_max(score: f64, bound: &ScoreBound) -> bool {
    match bound {
        ScoreBound::PosInf => true,
        ScoreBound::NegInf => false,
        ScoreBound::Val { v, incl: true } => score <= *v,
        ScoreBound::Val { v, incl: false } => score < *v,
    }
}

fn lex_after_min(member: &[u8], bound: &LexBound) -> bool {
    match bound {
        LexBound::NegInf => true,
        LexBound::PosInf => false,
        LexBound::Closed(b) => member >= b.as_slice(),
        LexBound::Open(b) => member > b.as_slice(),
    }
}

fn lex_before_max(member: &[u8], bound: &LexBound) -> bool {
    match bound {
        LexBound::PosInf => true,
        LexBound::NegInf => false,
        LexBound::Closed(b) => member <= b.as_slice(),
        LexBound::Open(b) => member < b.as_slice(),
    }
}

pub struct SortedMap {
    arena: Vec<Node>,
    free: Vec<u32>,
    level: usize,
    len: usize,
    index: DenseTable<f64>,
    rng: StdRng,
}

impl Default for SortedMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SortedMap {
    pub fn new() -> Self {
        let mut head = Node::stub();
        head.links = vec![Link { next: NIL, span: 0 }; MAX_LEVEL];
        Self {
            arena: vec![head],
            free: Vec::new(),
            level: 1,
            len: 0,
            index: DenseTable::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get_score(&self, member: &[u8]) -> Option<f64> {
        self.index.get(member).copied()
    }

    pub fn contains(&self, member: &[u8]) -> bool {
        self.index.contains(member)
    }

    fn link(&self, node: u32, lvl: usize) -> Link {
        self.arena[node as usize].links[lvl]
    }

    fn node(&self, idx: u32) -> &Node {
        &self.arena[idx as usize]
    }

    fn random_level(&mut self) -> usize {
        let mut lvl = 1;
        while lvl < MAX_LEVEL && self.rng.gen::<u32>() & 0x3 == 0 {
            lvl += 1;
        }
        lvl
    }

    fn alloc_node(&mut self, member: &[u8], score: f64, height: usize) -> u32 {
        let node = Node {
            member: member.to_vec().into_boxed_slice(),
            score,
            prev: NIL,
            links: vec![Link { next: NIL, span: 0 }; height],
        };
        match self.free.pop() {
            Some(i) => {
                self.arena[i as usize] = node;
                i
            }
            None => {
                self.arena.push(node);
                (self.arena.len() - 1) as u32
            }
        }
    }

    /// Conditional insert per the ZADD flag set.
    pub fn insert(
        &mut self,
        score: f64,
        member: &[u8],
        flags: InsertFlags,
    ) -> Result<InsertResult, NanScore> {
        match self.index.get(member).copied() {
            Some(cur) => {
                if flags.nx {
                    return Ok(InsertResult::Skipped);
                }
                let new_score = if flags.incr { cur + score } else { score };
                if new_score.is_nan() {
                    return Err(NanScore);
                }
                if (flags.gt && new_score <= cur) || (flags.lt && new_score >= cur) {
                    return Ok(InsertResult::Skipped);
                }
                if new_score == cur {
                    return Ok(InsertResult::Noop(cur));
                }
                self.remove_node(cur, member);
                self.insert_node(new_score, member);
                self.index.insert(member, new_score);
                Ok(InsertResult::Updated(new_score))
            }
            None => {
                if flags.xx {
                    return Ok(InsertResult::Skipped);
                }
                if score.is_nan() {
                    return Err(NanScore);
                }
                self.insert_node(score, member);
                self.index.insert(member, score);
                Ok(InsertResult::Added(score))
            }
        }
    }

    /// Remove a member. Returns whether it existed.
    pub fn delete(&mut self, member: &[u8]) -> bool {
        match self.index.remove(member) {
            Some(score) => {
                self.remove_node(score, member);
                true
            }
            None => false,
        }
    }

    fn insert_node(&mut self, score: f64, member: &[u8]) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0u32; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            loop {
                let l = self.link(x, i);
                if l.next == NIL {
                    break;
                }
                let nxt = self.node(l.next);
                if elem_lt(nxt.score, &nxt.member, score, member) {
                    rank[i] += l.span;
                    x = l.next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let height = self.random_level();
        if height > self.level {
            for i in self.level..height {
                rank[i] = 0;
                update[i] = HEAD;
                self.arena[HEAD as usize].links[i].span = self.len as u32;
            }
            self.level = height;
        }

        let idx = self.alloc_node(member, score, height);
        for i in 0..height {
            let up = update[i];
            let ul = self.link(up, i);
            let crossed = rank[0] - rank[i];
            self.arena[idx as usize].links[i] = Link {
                next: ul.next,
                span: ul.span - crossed,
            };
            self.arena[up as usize].links[i] = Link {
                next: idx,
                span: crossed + 1,
            };
        }
        for i in height..self.level {
            self.arena[update[i] as usize].links[i].span += 1;
        }

        // level-0 backward link
        let prev = if update[0] == HEAD { NIL } else { update[0] };
        self.arena[idx as usize].prev = prev;
        let after = self.link(idx, 0).next;
        if after != NIL {
            self.arena[after as usize].prev = idx;
        }
        self.len += 1;
    }

    fn remove_node(&mut self, score: f64, member: &[u8]) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let l = self.link(x, i);
                if l.next == NIL {
                    break;
                }
                let nxt = self.node(l.next);
                if elem_lt(nxt.score, &nxt.member, score, member) {
                    x = l.next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }
        let target = self.link(update[0], 0).next;
        if target == NIL {
            return;
        }
        {
            let t = self.node(target);
            if score_cmp(t.score, score) != Ordering::Equal || &*t.member != member {
                return;
            }
        }
        let height = self.node(target).links.len();
        for i in 0..self.level {
            if i < height && self.link(update[i], i).next == target {
                let tl = self.link(target, i);
                let ul = self.link(update[i], i);
                self.arena[update[i] as usize].links[i] = Link {
                    next: tl.next,
                    span: ul.span + tl.span - 1,
                };
            } else {
                self.arena[update[i] as usize].links[i].span -= 1;
            }
        }
        let after = self.link(target, 0).next;
        if after != NIL {
            self.arena[after as usize].prev = self.node(target).prev;
        }
        while self.level > 1 && self.link(HEAD, self.level - 1).next == NIL {
            self.level -= 1;
        }
        self.arena[target as usize] = Node::stub();
        self.free.push(target);
        self.len -= 1;
    }

    /// 0-based rank of a member; `reverse` counts from the top.
    pub fn rank(&self, member: &[u8], reverse: bool) -> Option<usize> {
        let score = *self.index.get(member)?;
        let mut x = HEAD;
        let mut rank = 0u32;
        for i in (0..self.level).rev() {
            loop {
                let l = self.link(x, i);
                if l.next == NIL {
                    break;
                }
                let nxt = self.node(l.next);
                let not_after = elem_lt(nxt.score, &nxt.member, score, member)
                    || (score_cmp(nxt.score, score) == Ordering::Equal && &*nxt.member == member);
                if not_after {
                    rank += l.span;
                    x = l.next;
                } else {
                    break;
                }
            }
            if x != HEAD {
                let n = self.node(x);
                if score_cmp(n.score, score) == Ordering::Equal && &*n.member == member {
                    let fwd = rank as usize - 1;
                    return Some(if reverse { self.len - 1 - fwd } else { fwd });
                }
            }
        }
        None
    }

    /// Node at a 0-based rank.
    fn node_at_rank(&self, rank: usize) -> Option<u32> {
        if rank >= self.len {
            return None;
        }
        let target = (rank + 1) as u32;
        let mut x = HEAD;
        let mut traversed = 0u32;
        for i in (0..self.level).rev() {
            loop {
                let l = self.link(x, i);
                if l.next != NIL && traversed + l.span <= target {
                    traversed += l.span;
                    x = l.next;
                } else {
                    break;
                }
            }
            if traversed == target {
                return Some(x);
            }
        }
        None
    }

    /// Rank of the first node satisfying a monotone predicate (false* true*).
    fn rank_of_first<F: Fn(f64, &[u8]) -> bool>(&self, in_range: F) -> usize {
        let mut x = HEAD;
        let mut rank = 0u32;
        for i in (0..self.level).rev() {
            loop {
                let l = self.link(x, i);
                if l.next == NIL {
                    break;
                }
                let nxt = self.node(l.next);
                if !in_range(nxt.score, &nxt.member) {
                    rank += l.span;
                    x = l.next;
                } else {
                    break;
                }
            }
        }
        rank as usize
    }

    /// Inclusive 0-based rank range (callers normalize negatives).
    pub fn range_by_rank(&self, start: usize, end: usize, reverse: bool) -> Vec<(Vec<u8>, f64)> {
        if self.len == 0 || start > end || start >= self.len {
            return Vec::new();
        }
        let end = end.min(self.len - 1);
        let (fstart, fend) = if reverse {
            (self.len - 1 - end, self.len - 1 - start)
        } else {
            (start, end)
        };
        let mut out = Vec::with_capacity(fend - fstart + 1);
        let mut idx = match self.node_at_rank(fstart) {
            Some(i) => i,
            None => return Vec::new(),
        };
        for _ in fstart..=fend {
            let n = self.node(idx);
            out.push((n.member.to_vec(), n.score));
            idx = self.link(idx, 0).next;
            if idx == NIL {
                break;
            }
        }
        if reverse {
            out.reverse();
        }
        out
    }

    pub fn range_by_score(
        &self,
        range: &ScoreRange,
        offset: usize,
        limit: usize,
        reverse: bool,
    ) -> Vec<(Vec<u8>, f64)> {
        self.extract(
            |s, _| after_min(s, &range.min),
            |s, _| before_max(s, &range.max),
            offset,
            limit,
            reverse,
        )
    }

    pub fn range_by_lex(
        &self,
        range: &LexRange,
        offset: usize,
        limit: usize,
        reverse: bool,
    ) -> Vec<(Vec<u8>, f64)> {
        self.extract(
            |_, m| lex_after_min(m, &range.min),
            |_, m| lex_before_max(m, &range.max),
            offset,
            limit,
            reverse,
        )
    }

    fn extract<Fmin, Fmax>(
        &self,
        in_min: Fmin,
        in_max: Fmax,
        offset: usize,
        limit: usize,
        reverse: bool,
    ) -> Vec<(Vec<u8>, f64)>
    where
        Fmin: Fn(f64, &[u8]) -> bool,
        Fmax: Fn(f64, &[u8]) -> bool,
    {
        let mut out = Vec::new();
        if self.len == 0 || limit == 0 {
            return out;
        }
        if !reverse {
            let first = self.rank_of_first(|s, m| in_min(s, m));
            let mut idx = match self.node_at_rank(first) {
                Some(i) => i,
                None => return out,
            };
            let mut skipped = 0;
            loop {
                let n = self.node(idx);
                if !in_max(n.score, &n.member) {
                    break;
                }
                if skipped < offset {
                    skipped += 1;
                } else {
                    out.push((n.member.to_vec(), n.score));
                    if out.len() >= limit {
                        break;
                    }
                }
                idx = self.link(idx, 0).next;
                if idx == NIL {
                    break;
                }
            }
        } else {
            // last node inside the max bound, walk backward
            let beyond = self.rank_of_first(|s, m| !in_max(s, m));
            if beyond == 0 {
                return out;
            }
            let mut idx = match self.node_at_rank(beyond - 1) {
                Some(i) => i,
                None => return out,
            };
            let mut skipped = 0;
            loop {
                let n = self.node(idx);
                if !in_min(n.score, &n.member) {
                    break;
                }
                if skipped < offset {
                    skipped += 1;
                } else {
                    out.push((n.member.to_vec(), n.score));
                    if out.len() >= limit {
                        break;
                    }
                }
                idx = n.prev;
                if idx == NIL {
                    break;
                }
            }
        }
        out
    }

    pub fn count_by_score(&self, range: &ScoreRange) -> usize {
        let a = self.rank_of_first(|s, _| after_min(s, &range.min));
        let b = self.rank_of_first(|s, _| !before_max(s, &range.max));
        b.saturating_sub(a)
    }

    pub fn count_by_lex(&self, range: &LexRange) -> usize {
        let a = self.rank_of_first(|_, m| lex_after_min(m, &range.min));
        let b = self.rank_of_first(|_, m| !lex_before_max(m, &range.max));
        b.saturating_sub(a)
    }

    pub fn delete_range_by_rank(&mut self, start: usize, end: usize) -> usize {
        let victims = self.range_by_rank(start, end, false);
        for (m, _) in &victims {
            self.delete(m);
        }
        victims.len()
    }

    pub fn delete_range_by_score(&mut self, range: &ScoreRange) -> usize {
        let victims = self.range_by_score(range, 0, usize::MAX, false);
        for (m, _) in &victims {
            self.delete(m);
        }
        victims.len()
    }

    pub fn delete_range_by_lex(&mut self, range: &LexRange) -> usize {
        let victims = self.range_by_lex(range, 0, usize::MAX, false);
        for (m, _) in &victims {
            self.delete(m);
        }
        victims.len()
    }

    /// Remove and return up to `n` elements from the bottom (or top).
    pub fn pop_top(&mut self, n: usize, reverse: bool) -> Vec<(Vec<u8>, f64)> {
        if self.len == 0 || n == 0 {
            return Vec::new();
        }
        let n = n.min(self.len);
        let (start, end) = if reverse {
            (self.len - n, self.len - 1)
        } else {
            (0, n - 1)
        };
        let mut out = self.range_by_rank(start, end, false);
        for (m, _) in &out {
            self.delete(m);
        }
        if reverse {
            out.reverse();
        }
        out
    }

    /// Stateless resumable scan over (member, score).
    pub fn scan<F: FnMut(&[u8], f64)>(&self, cursor: u64, mut f: F) -> u64 {
        self.index.scan(cursor, |m, s| f(m, *s))
    }

    /// In-order iteration.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], f64)> {
        let mut idx = self.link(HEAD, 0).next;
        std::iter::from_fn(move || {
            if idx == NIL {
                return None;
            }
            let n = self.node(idx);
            idx = n.links[0].next;
            Some((&*n.member, n.score))
        })
    }

    /// Random live members for ZRANDMEMBER.
    pub fn random_members<R: Rng>(&self, k: usize, unique: bool, rng: &mut R) -> Vec<(Vec<u8>, f64)> {
        if self.len == 0 {
            return Vec::new();
        }
        if unique {
            let mut slots = self.index.live_slots();
            let k = k.min(slots.len());
            for i in 0..k {
                let j = rng.gen_range(i..slots.len());
                slots.swap(i, j);
            }
            slots
                .into_iter()
                .take(k)
                .filter_map(|i| self.index.slot_entry(i))
                .map(|(m, s)| (m.to_vec(), *s))
                .collect()
        } else {
            (0..k)
                .filter_map(|_| self.index.random_entry(rng))
                .map(|(m, s)| (m.to_vec(), *s))
                .collect()
        }
    }

    pub fn mem_used(&self) -> usize {
        let nodes: usize = self
            .arena
            .iter()
            .map(|n| n.member.len() + n.links.capacity() * std::mem::size_of::<Link>())
            .sum();
        nodes + self.index.mem_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(sm: &mut SortedMap, score: f64, member: &[u8]) {
        sm.insert(score, member, InsertFlags::default()).unwrap();
    }

    fn members(v: &[(Vec<u8>, f64)]) -> Vec<Vec<u8>> {
        v.iter().map(|(m, _)| m.clone()).collect()
    }

    #[test]
    fn test_insert_and_order() {
        let mut sm = SortedMap::new();
        add(&mut sm, 3.0, b"c");
        add(&mut sm, 1.0, b"a");
        add(&mut sm, 2.0, b"b");
        let all: Vec<_> = sm.iter().map(|(m, _)| m.to_vec()).collect();
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(sm.len(), 3);
    }

    #[test]
    fn test_tie_break_lexicographic() {
        let mut sm = SortedMap::new();
        add(&mut sm, 0.0, b"delta");
        add(&mut sm, 0.0, b"alpha");
        add(&mut sm, 0.0, b"charlie");
        let all: Vec<_> = sm.iter().map(|(m, _)| m.to_vec()).collect();
        assert_eq!(all, vec![b"alpha".to_vec(), b"charlie".to_vec(), b"delta".to_vec()]);
    }

    #[test]
    fn test_rank_monotonic_in_score() {
        let mut sm = SortedMap::new();
        for i in 0..100 {
            add(&mut sm, i as f64, format!("m{i:03}").as_bytes());
        }
        for i in 0..99 {
            let a = sm.rank(format!("m{i:03}").as_bytes(), false).unwrap();
            let b = sm.rank(format!("m{:03}", i + 1).as_bytes(), false).unwrap();
            assert!(a < b);
        }
        assert_eq!(sm.rank(b"m000", true), Some(99));
        assert_eq!(sm.rank(b"m099", true), Some(0));
        assert_eq!(sm.rank(b"missing", false), None);
    }

    #[test]
    fn test_update_score_moves_rank() {
        let mut sm = SortedMap::new();
        add(&mut sm, 1.0, b"a");
        add(&mut sm, 2.0, b"b");
        assert_eq!(sm.rank(b"a", false), Some(0));
        add(&mut sm, 3.0, b"a");
        assert_eq!(sm.rank(b"a", false), Some(1));
        assert_eq!(sm.get_score(b"a"), Some(3.0));
        assert_eq!(sm.len(), 2);
    }

    #[test]
    fn test_insert_flags() {
        let mut sm = SortedMap::new();
        add(&mut sm, 1.0, b"m");

        let nx = InsertFlags { nx: true, ..Default::default() };
        assert_eq!(sm.insert(9.0, b"m", nx).unwrap(), InsertResult::Skipped);
        assert_eq!(sm.get_score(b"m"), Some(1.0));

        let xx = InsertFlags { xx: true, ..Default::default() };
        assert_eq!(sm.insert(9.0, b"nope", xx).unwrap(), InsertResult::Skipped);
        assert!(!sm.contains(b"nope"));

        let gt = InsertFlags { gt: true, ..Default::default() };
        assert_eq!(sm.insert(0.5, b"m", gt).unwrap(), InsertResult::Skipped);
        assert_eq!(sm.insert(5.0, b"m", gt).unwrap(), InsertResult::Updated(5.0));

        let lt = InsertFlags { lt: true, ..Default::default() };
        assert_eq!(sm.insert(9.0, b"m", lt).unwrap(), InsertResult::Skipped);
        assert_eq!(sm.insert(2.0, b"m", lt).unwrap(), InsertResult::Updated(2.0));
    }

    #[test]
    fn test_incr_and_nan_guard() {
        let mut sm = SortedMap::new();
        add(&mut sm, 1.0, b"m");
        let incr = InsertFlags { incr: true, ..Default::default() };
        assert_eq!(sm.insert(2.5, b"m", incr).unwrap(), InsertResult::Updated(3.5));
        assert_eq!(sm.insert(0.0, b"m", incr).unwrap(), InsertResult::Noop(3.5));

        add(&mut sm, f64::INFINITY, b"inf");
        assert_eq!(sm.insert(f64::NEG_INFINITY, b"inf", incr), Err(NanScore));
        // score unchanged after the failed increment
        assert_eq!(sm.get_score(b"inf"), Some(f64::INFINITY));
    }

    #[test]
    fn test_range_by_rank() {
        let mut sm = SortedMap::new();
        for (s, m) in [(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")] {
            add(&mut sm, s, m.as_bytes());
        }
        assert_eq!(
            members(&sm.range_by_rank(1, 2, false)),
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(
            members(&sm.range_by_rank(0, 1, true)),
            vec![b"d".to_vec(), b"c".to_vec()]
        );
        assert_eq!(members(&sm.range_by_rank(2, 100, false)), vec![b"c".to_vec(), b"d".to_vec()]);
        assert!(sm.range_by_rank(7, 9, false).is_empty());
    }

    #[test]
    fn test_range_by_score() {
        let mut sm = SortedMap::new();
        for i in 1..=10 {
            add(&mut sm, i as f64, format!("m{i:02}").as_bytes());
        }
        let r = ScoreRange {
            min: ScoreBound::Val { v: 3.0, incl: true },
            max: ScoreBound::Val { v: 6.0, incl: false },
        };
        assert_eq!(
            members(&sm.range_by_score(&r, 0, usize::MAX, false)),
            vec![b"m03".to_vec(), b"m04".to_vec(), b"m05".to_vec()]
        );
        assert_eq!(
            members(&sm.range_by_score(&r, 1, 1, false)),
            vec![b"m04".to_vec()]
        );
        assert_eq!(
            members(&sm.range_by_score(&r, 0, usize::MAX, true)),
            vec![b"m05".to_vec(), b"m04".to_vec(), b"m03".to_vec()]
        );
        assert_eq!(sm.count_by_score(&r), 3);
        let all = ScoreRange { min: ScoreBound::NegInf, max: ScoreBound::PosInf };
        assert_eq!(sm.count_by_score(&all), 10);
    }

    #[test]
    fn test_range_by_lex() {
        let mut sm = SortedMap::new();
        for m in ["a", "b", "c", "d"] {
            add(&mut sm, 0.0, m.as_bytes());
        }
        let r = LexRange {
            min: LexBound::Closed(b"a".to_vec()),
            max: LexBound::Open(b"c".to_vec()),
        };
        assert_eq!(
            members(&sm.range_by_lex(&r, 0, usize::MAX, false)),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(
            members(&sm.range_by_lex(&r, 0, usize::MAX, true)),
            vec![b"b".to_vec(), b"a".to_vec()]
        );
        assert_eq!(sm.count_by_lex(&r), 2);
        let open = LexRange { min: LexBound::NegInf, max: LexBound::PosInf };
        assert_eq!(sm.count_by_lex(&open), 4);
    }

    #[test]
    fn test_delete_ranges_and_pop() {
        let mut sm = SortedMap::new();
        for i in 0..10 {
            add(&mut sm, i as f64, format!("m{i}").as_bytes());
        }
        assert_eq!(sm.delete_range_by_rank(0, 2), 3);
        assert_eq!(sm.len(), 7);
        let r = ScoreRange {
            min: ScoreBound::Val { v: 8.0, incl: true },
            max: ScoreBound::PosInf,
        };
        assert_eq!(sm.delete_range_by_score(&r), 2);
        assert_eq!(sm.len(), 5);

        let popped = sm.pop_top(2, false);
        assert_eq!(members(&popped), vec![b"m3".to_vec(), b"m4".to_vec()]);
        let popped = sm.pop_top(2, true);
        assert_eq!(members(&popped), vec![b"m7".to_vec(), b"m6".to_vec()]);
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn test_delete_and_levels_shrink() {
        let mut sm = SortedMap::new();
        for i in 0..500 {
            add(&mut sm, (i % 13) as f64, format!("k{i:04}").as_bytes());
        }
        for i in 0..500 {
            assert!(sm.delete(format!("k{i:04}").as_bytes()));
        }
        assert!(sm.is_empty());
        assert!(!sm.delete(b"k0000"));
    }

    #[test]
    fn test_scan_covers_members() {
        let mut sm = SortedMap::new();
        for i in 0..100 {
            add(&mut sm, i as f64, format!("m{i}").as_bytes());
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = sm.scan(cursor, |m, _| {
                seen.insert(m.to_vec());
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 100);
    }
}
