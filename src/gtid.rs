//! GTID (Global Transaction ID) 관리
//!
//! MySQL 형식: `uuid:1-100:200,uuid2:1-50` (UUID별 반열린 구간 `[start, stop)`)
//! MariaDB 형식: `domain-server-seq,...` (domain/server별 최대 sequence)

use crate::error::{BinlogError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::BufMut;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;
use uuid::Uuid;

/// GTID 구간 `[start, stop)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: u64,
    pub stop: u64,
}

/// MySQL 의 GNO 상한 (부호 있는 64비트)
pub const MAX_GNO: u64 = i64::MAX as u64;

impl Interval {
    pub fn new(start: u64, stop: u64) -> Result<Self> {
        if start >= stop {
            return Err(BinlogError::GtidError(format!(
                "Invalid interval: [{}, {})",
                start, stop
            )));
        }
        Ok(Interval { start, stop })
    }

    /// "5" 또는 "1-100"
    fn parse(s: &str) -> Result<Self> {
        let invalid = || BinlogError::GtidError(format!("Invalid interval: {}", s));
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (
                a.trim().parse::<u64>().map_err(|_| invalid())?,
                b.trim().parse::<u64>().map_err(|_| invalid())?,
            ),
            None => {
                let n = s.trim().parse::<u64>().map_err(|_| invalid())?;
                (n, n)
            }
        };
        if start == 0 || end < start || end > MAX_GNO {
            return Err(invalid());
        }
        Interval::new(start, end + 1)
    }

    pub fn contains(&self, gno: u64) -> bool {
        gno >= self.start && gno < self.stop
    }

    fn covers(&self, other: &Interval) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stop == self.start + 1 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.stop - 1)
        }
    }
}

/// 정렬 후 겹치거나 맞닿은 구간 병합
fn normalize(intervals: &mut Vec<Interval>) {
    if intervals.len() < 2 {
        return;
    }
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.stop => last.stop = last.stop.max(iv.stop),
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}

/// 한 서버(UUID)의 GTID 구간들
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidSet {
    pub sid: Uuid,
    pub intervals: Vec<Interval>,
}

impl UuidSet {
    pub fn new(sid: Uuid) -> Self {
        UuidSet {
            sid,
            intervals: Vec::new(),
        }
    }

    /// "uuid:1-5:7"
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.trim().split(':');
        let sid_str = parts.next().unwrap_or_default().trim();
        let sid = Uuid::parse_str(sid_str)
            .map_err(|e| BinlogError::GtidError(format!("Invalid server uuid '{}': {}", sid_str, e)))?;
        let mut set = UuidSet::new(sid);
        for part in parts {
            set.intervals.push(Interval::parse(part)?);
        }
        normalize(&mut set.intervals);
        Ok(set)
    }

    pub fn add_interval(&mut self, interval: Interval) {
        self.intervals.push(interval);
        normalize(&mut self.intervals);
    }

    pub fn contains_gno(&self, gno: u64) -> bool {
        self.intervals.iter().any(|iv| iv.contains(gno))
    }

    /// other의 모든 구간이 self에 포함되는지
    pub fn contain(&self, other: &UuidSet) -> bool {
        other
            .intervals
            .iter()
            .all(|o| self.intervals.iter().any(|s| s.covers(o)))
    }

    /// self - other
    pub fn subtract(&self, other: &UuidSet) -> UuidSet {
        let mut result = self.intervals.clone();
        for o in &other.intervals {
            let mut next = Vec::with_capacity(result.len() + 1);
            for iv in result {
                if iv.stop <= o.start || iv.start >= o.stop {
                    next.push(iv);
                    continue;
                }
                if iv.start < o.start {
                    next.push(Interval {
                        start: iv.start,
                        stop: o.start,
                    });
                }
                if iv.stop > o.stop {
                    next.push(Interval {
                        start: o.stop,
                        stop: iv.stop,
                    });
                }
            }
            result = next;
        }
        UuidSet {
            sid: self.sid,
            intervals: result,
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.sid.as_bytes());
        buf.put_u64_le(self.intervals.len() as u64);
        for iv in &self.intervals {
            buf.put_u64_le(iv.start);
            buf.put_u64_le(iv.stop);
        }
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut sid = [0u8; 16];
        cursor.read_exact(&mut sid)?;
        let n = cursor.read_u64::<LittleEndian>()?;
        let mut set = UuidSet::new(Uuid::from_bytes(sid));
        for _ in 0..n {
            let start = cursor.read_u64::<LittleEndian>()?;
            let stop = cursor.read_u64::<LittleEndian>()?;
            set.intervals.push(Interval::new(start, stop)?);
        }
        normalize(&mut set.intervals);
        Ok(set)
    }
}

impl fmt::Display for UuidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid)?;
        for iv in &self.intervals {
            write!(f, ":{}", iv)?;
        }
        Ok(())
    }
}

/// MySQL GTID 집합
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MysqlGtidSet {
    pub sets: BTreeMap<Uuid, UuidSet>,
}

impl MysqlGtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// GTID 문자열 파싱 (공백/개행 허용, 빈 문자열은 빈 집합)
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = MysqlGtidSet::new();
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("NULL") {
            return Ok(set);
        }
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            set.add_set(UuidSet::parse(part)?);
        }
        Ok(set)
    }

    /// 같은 UUID면 구간 병합
    pub fn add_set(&mut self, set: UuidSet) {
        match self.sets.get_mut(&set.sid) {
            Some(existing) => {
                existing.intervals.extend(set.intervals);
                normalize(&mut existing.intervals);
            }
            None => {
                self.sets.insert(set.sid, set);
            }
        }
    }

    /// 트랜잭션 하나 추가
    pub fn add_gtid(&mut self, sid: Uuid, gno: u64) -> Result<()> {
        if gno == 0 || gno > MAX_GNO {
            return Err(BinlogError::GtidError(format!("GNO out of range: {}", gno)));
        }
        let interval = Interval::new(gno, gno + 1)?;
        self.sets
            .entry(sid)
            .or_insert_with(|| UuidSet::new(sid))
            .add_interval(interval);
        Ok(())
    }

    /// "uuid:5" 또는 GTID 집합 문자열을 합침
    pub fn update(&mut self, gtid: &str) -> Result<()> {
        let other = MysqlGtidSet::parse(gtid)?;
        self.union(&other);
        Ok(())
    }

    pub fn union(&mut self, other: &MysqlGtidSet) {
        for set in other.sets.values() {
            self.add_set(set.clone());
        }
    }

    pub fn contains_gtid(&self, sid: &Uuid, gno: u64) -> bool {
        self.sets.get(sid).map(|s| s.contains_gno(gno)).unwrap_or(false)
    }

    /// other ⊆ self
    pub fn contain(&self, other: &MysqlGtidSet) -> bool {
        other.sets.iter().all(|(sid, o)| {
            if o.intervals.is_empty() {
                return true;
            }
            self.sets.get(sid).map(|s| s.contain(o)).unwrap_or(false)
        })
    }

    /// self - other (빈 UUID는 제거)
    pub fn subtract(&self, other: &MysqlGtidSet) -> MysqlGtidSet {
        let mut result = MysqlGtidSet::new();
        for (sid, set) in &self.sets {
            let rest = match other.sets.get(sid) {
                Some(o) => set.subtract(o),
                None => set.clone(),
            };
            if !rest.intervals.is_empty() {
                result.sets.insert(*sid, rest);
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|s| s.intervals.is_empty())
    }

    /// COM_BINLOG_DUMP_GTID / PREVIOUS_GTIDS 바이너리 형식
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u64_le(self.sets.len() as u64);
        for set in self.sets.values() {
            set.encode(&mut buf);
        }
        buf
    }

    pub fn encoded_len(&self) -> usize {
        8 + self
            .sets
            .values()
            .map(|s| 16 + 8 + s.intervals.len() * 16)
            .sum::<usize>()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let n = cursor.read_u64::<LittleEndian>()?;
        let mut set = MysqlGtidSet::new();
        for _ in 0..n {
            set.add_set(UuidSet::decode(&mut cursor)?);
        }
        Ok(set)
    }
}

impl fmt::Display for MysqlGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for set in self.sets.values().filter(|s| !s.intervals.is_empty()) {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}", set)?;
        }
        Ok(())
    }
}

impl FromStr for MysqlGtidSet {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        MysqlGtidSet::parse(s)
    }
}

/// MariaDB GTID `domain-server-seq`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl MariadbGtid {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || BinlogError::GtidError(format!("Invalid MariaDB GTID: {}", s));
        let mut parts = s.splitn(3, '-');
        let (Some(domain), Some(server), Some(seq)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        Ok(MariadbGtid {
            domain_id: domain.parse().map_err(|_| invalid())?,
            server_id: server.parse().map_err(|_| invalid())?,
            sequence: seq.parse().map_err(|_| invalid())?,
        })
    }

    /// 같은 domain에서 더 큰 sequence로만 전진
    pub fn forward(&mut self, newer: &MariadbGtid) -> Result<()> {
        if newer.domain_id != self.domain_id {
            return Err(BinlogError::GtidError(format!(
                "{} is not in the same domain as {}",
                newer, self
            )));
        }
        if newer.sequence > self.sequence {
            self.server_id = newer.server_id;
            self.sequence = newer.sequence;
        }
        Ok(())
    }
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence)
    }
}

/// MariaDB GTID 집합: domain → server → 최신 GTID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MariadbGtidSet {
    pub sets: BTreeMap<u32, BTreeMap<u32, MariadbGtid>>,
}

impl MariadbGtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut set = MariadbGtidSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            set.add(MariadbGtid::parse(part)?)?;
        }
        Ok(set)
    }

    pub fn add(&mut self, gtid: MariadbGtid) -> Result<()> {
        let servers = self.sets.entry(gtid.domain_id).or_default();
        match servers.get_mut(&gtid.server_id) {
            Some(existing) => existing.forward(&gtid),
            None => {
                servers.insert(gtid.server_id, gtid);
                Ok(())
            }
        }
    }

    pub fn update(&mut self, gtid: &str) -> Result<()> {
        for part in gtid.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            self.add(MariadbGtid::parse(part)?)?;
        }
        Ok(())
    }

    pub fn union(&mut self, other: &MariadbGtidSet) -> Result<()> {
        for gtid in other.iter() {
            self.add(*gtid)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MariadbGtid> {
        self.sets.values().flat_map(|servers| servers.values())
    }

    /// other의 각 (domain, server)가 self에서 같거나 앞서 있는지
    pub fn contain(&self, other: &MariadbGtidSet) -> bool {
        other.iter().all(|o| {
            self.sets
                .get(&o.domain_id)
                .and_then(|servers| servers.get(&o.server_id))
                .map(|s| s.sequence >= o.sequence)
                .unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|s| s.is_empty())
    }
}

impl fmt::Display for MariadbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|g| g.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// 서버 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    Mysql,
    Mariadb,
}

impl FromStr for Flavor {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Flavor::Mysql),
            "mariadb" => Ok(Flavor::Mariadb),
            _ => Err(BinlogError::ConfigError(format!("Unknown flavor '{}'", s))),
        }
    }
}

/// 종류별 GTID 집합
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GtidSet {
    Mysql(MysqlGtidSet),
    Mariadb(MariadbGtidSet),
}

impl GtidSet {
    pub fn parse(flavor: Flavor, s: &str) -> Result<Self> {
        Ok(match flavor {
            Flavor::Mysql => GtidSet::Mysql(MysqlGtidSet::parse(s)?),
            Flavor::Mariadb => GtidSet::Mariadb(MariadbGtidSet::parse(s)?),
        })
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            GtidSet::Mysql(_) => Flavor::Mysql,
            GtidSet::Mariadb(_) => Flavor::Mariadb,
        }
    }

    pub fn update(&mut self, gtid: &str) -> Result<()> {
        match self {
            GtidSet::Mysql(set) => set.update(gtid),
            GtidSet::Mariadb(set) => set.update(gtid),
        }
    }

    pub fn contain(&self, other: &GtidSet) -> bool {
        match (self, other) {
            (GtidSet::Mysql(a), GtidSet::Mysql(b)) => a.contain(b),
            (GtidSet::Mariadb(a), GtidSet::Mariadb(b)) => a.contain(b),
            _ => false,
        }
    }

    /// 덤프 요청에 싣는 형식 (MySQL은 바이너리, MariaDB는 텍스트)
    pub fn encode(&self) -> Vec<u8> {
        match self {
            GtidSet::Mysql(set) => set.encode(),
            GtidSet::Mariadb(set) => set.to_string().into_bytes(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            GtidSet::Mysql(set) => set.is_empty(),
            GtidSet::Mariadb(set) => set.is_empty(),
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtidSet::Mysql(set) => fmt::Display::fmt(set, f),
            GtidSet::Mariadb(set) => fmt::Display::fmt(set, f),
        }
    }
}

macro_rules! impl_string_serde {
    ($($ty:ty),*) => {
        $(
            impl Serialize for $ty {
                fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                    serializer.serialize_str(&self.to_string())
                }
            }

            impl<'de> Deserialize<'de> for $ty {
                fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                    let s = String::deserialize(deserializer)?;
                    <$ty>::parse(&s).map_err(serde::de::Error::custom)
                }
            }
        )*
    };
}

impl_string_serde!(MysqlGtidSet, MariadbGtidSet);

#[cfg(test)]
mod tests {
    use super::*;

    const SID1: &str = "550e8400-e29b-41d4-a716-446655440000";
    const SID2: &str = "de278ad0-2106-11e4-9f8e-6edd0ca20947";

    #[test]
    fn test_gtid_parse() {
        let s = format!("{}:1-100:200:150-160, {}:1-50\n", SID1, SID2);
        let set = MysqlGtidSet::parse(&s).unwrap();
        assert_eq!(set.sets.len(), 2);
        let sid1 = Uuid::parse_str(SID1).unwrap();
        assert_eq!(
            set.sets[&sid1].intervals,
            vec![
                Interval { start: 1, stop: 101 },
                Interval { start: 150, stop: 161 },
                Interval { start: 200, stop: 201 },
            ]
        );
        assert_eq!(set.to_string(), format!("{}:1-100:150-160:200,{}:1-50", SID1, SID2));
        assert!(MysqlGtidSet::parse("").unwrap().is_empty());
        assert!(MysqlGtidSet::parse("not-a-uuid:1").is_err());
        assert!(MysqlGtidSet::parse(&format!("{}:5-3", SID1)).is_err());
    }

    #[test]
    fn test_gno_upper_bound() {
        let max = format!("{}:1-{}", SID1, MAX_GNO);
        let set = MysqlGtidSet::parse(&max).unwrap();
        assert_eq!(set.to_string(), max);

        for s in [
            format!("{}:1-18446744073709551615", SID1),
            format!("{}:18446744073709551615", SID1),
            format!("{}:{}", SID1, MAX_GNO + 1),
        ] {
            assert!(matches!(MysqlGtidSet::parse(&s), Err(BinlogError::GtidError(_))), "{}", s);
        }

        let sid = Uuid::parse_str(SID1).unwrap();
        let mut set = MysqlGtidSet::new();
        assert!(matches!(set.add_gtid(sid, u64::MAX), Err(BinlogError::GtidError(_))));
        assert!(set.add_gtid(sid, 0).is_err());
        set.add_gtid(sid, MAX_GNO).unwrap();
        assert!(set.contains_gtid(&sid, MAX_GNO));
    }

    #[test]
    fn test_gtid_contains() {
        let mut set = MysqlGtidSet::new();
        let sid = Uuid::parse_str(SID1).unwrap();
        set.add_gtid(sid, 50).unwrap();
        assert!(set.contains_gtid(&sid, 50));
        assert!(!set.contains_gtid(&sid, 51));

        set.update(&format!("{}:51", SID1)).unwrap();
        set.update(&format!("{}:1-49", SID1)).unwrap();
        assert_eq!(set.sets[&sid].intervals, vec![Interval { start: 1, stop: 52 }]);
    }

    #[test]
    fn test_contain_relation() {
        let a = MysqlGtidSet::parse(&format!("{}:1-100,{}:1-10", SID1, SID2)).unwrap();
        let b = MysqlGtidSet::parse(&format!("{}:20-30", SID1)).unwrap();
        let c = MysqlGtidSet::parse(&format!("{}:25", SID1)).unwrap();
        assert!(a.contain(&b));
        assert!(b.contain(&c));
        assert!(a.contain(&c));
        assert!(!b.contain(&a));
        assert!(a.contain(&a.clone()));

        let split = MysqlGtidSet::parse(&format!("{}:1-5:7-9", SID1)).unwrap();
        let across = MysqlGtidSet::parse(&format!("{}:4-8", SID1)).unwrap();
        assert!(!split.contain(&across));
    }

    #[test]
    fn test_subtract() {
        let a = MysqlGtidSet::parse(&format!("{}:1-100,{}:1-10", SID1, SID2)).unwrap();
        let b = MysqlGtidSet::parse(&format!("{}:20-30,{}:1-10", SID1, SID2)).unwrap();
        assert_eq!(a.subtract(&b).to_string(), format!("{}:1-19:31-100", SID1));
    }

    #[test]
    fn test_binary_encoding() {
        let set = MysqlGtidSet::parse(&format!("{}:1-3:5", SID1)).unwrap();
        let encoded = set.encode();
        assert_eq!(encoded.len(), set.encoded_len());
        assert_eq!(&encoded[..8], &1u64.to_le_bytes());
        assert_eq!(&encoded[8..24], Uuid::parse_str(SID1).unwrap().as_bytes());
        assert_eq!(&encoded[24..32], &2u64.to_le_bytes());
        assert_eq!(&encoded[32..40], &1u64.to_le_bytes());
        assert_eq!(&encoded[40..48], &4u64.to_le_bytes());
        assert_eq!(MysqlGtidSet::decode(&encoded).unwrap(), set);
        assert!(MysqlGtidSet::decode(&encoded[..20]).is_err());
    }

    #[test]
    fn test_mariadb_gtid_set() {
        let mut set = MariadbGtidSet::parse("0-1-100, 1-2-5").unwrap();
        set.update("0-1-90").unwrap();
        assert_eq!(set.to_string(), "0-1-100,1-2-5");
        set.update("0-1-101").unwrap();
        assert_eq!(set.to_string(), "0-1-101,1-2-5");

        let other = MariadbGtidSet::parse("0-1-50").unwrap();
        assert!(set.contain(&other));
        assert!(!other.contain(&set));

        let mut gtid = MariadbGtid::parse("0-1-100").unwrap();
        assert!(gtid.forward(&MariadbGtid::parse("1-1-200").unwrap()).is_err());
        assert!(MariadbGtid::parse("0-1").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let set = GtidSet::parse(Flavor::Mysql, &format!("{}:1-5", SID1)).unwrap();
        let GtidSet::Mysql(inner) = &set else {
            panic!("expected mysql set");
        };
        let json = serde_json::to_string(inner).unwrap();
        assert_eq!(json, format!("\"{}:1-5\"", SID1));
        let back: MysqlGtidSet = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, inner);
    }
}
