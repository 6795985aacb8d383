//! GTID (Global Transaction ID) 관리
//!
//! GTID 형식: `UUID:sequence-number`
//! GTID 집합 형식: `"uuid1:1-100:200,uuid2:1-50"`

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 단일 트랜잭션 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub source_id: String,
    pub transaction_id: u64,
}

impl Gtid {
    pub fn new(source_id: impl Into<String>, transaction_id: u64) -> Self {
        Gtid {
            source_id: source_id.into(),
            transaction_id,
        }
    }
}

impl FromStr for Gtid {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (source_id, sequence) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", s)))?;

        if source_id.is_empty() {
            return Err(CdcError::GtidError(format!("Missing source id: {}", s)));
        }

        let transaction_id = sequence
            .parse::<u64>()
            .map_err(|_| CdcError::GtidError(format!("Invalid sequence: {}", sequence)))?;
        if transaction_id == 0 {
            return Err(CdcError::GtidError(format!("Sequence must start at 1: {}", s)));
        }

        Ok(Gtid::new(source_id, transaction_id))
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.transaction_id)
    }
}

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {} > {}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    fn parse(s: &str) -> Result<Self> {
        let invalid = || CdcError::GtidError(format!("Invalid range: {}", s));
        match s.split_once('-') {
            Some((start, end)) => GtidRange::new(
                start.trim().parse().map_err(|_| invalid())?,
                end.trim().parse().map_err(|_| invalid())?,
            ),
            None => {
                let seq = s.trim().parse().map_err(|_| invalid())?;
                GtidRange::new(seq, seq)
            }
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// 전체 GTID 집합 (source id별 범위 목록)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    pub sets: BTreeMap<String, Vec<GtidRange>>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet::default()
    }

    /// GTID 집합 문자열 파싱
    ///
    /// 서버가 돌려주는 `@@global.gtid_executed` 값은 줄바꿈을 포함할 수 있다.
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();
        let cleaned: String = gtid_str.chars().filter(|c| !c.is_whitespace()).collect();

        if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        for member in cleaned.split(',') {
            let mut parts = member.split(':');
            let source_id = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID set: {}", gtid_str)))?;

            let ranges = gtid_set.sets.entry(source_id.to_string()).or_default();
            let mut any = false;
            for range in parts {
                ranges.push(GtidRange::parse(range)?);
                any = true;
            }
            if !any {
                return Err(CdcError::GtidError(format!(
                    "Missing ranges for {}",
                    source_id
                )));
            }
            ranges.sort();
        }

        Ok(gtid_set)
    }

    /// 한 source의 `1..=upper` 범위만 담은 집합
    pub fn up_to(source_id: &str, upper: u64) -> Self {
        let mut gtid_set = GtidSet::new();
        let ranges = gtid_set.sets.entry(source_id.to_string()).or_default();
        if upper >= 1 {
            ranges.push(GtidRange { start: 1, end: upper });
        }
        gtid_set
    }

    /// source의 가장 큰 트랜잭션 번호
    pub fn last_transaction(&self, source_id: &str) -> Option<u64> {
        self.sets
            .get(source_id)
            .and_then(|ranges| ranges.iter().map(|r| r.end).max())
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.sets
            .get(&gtid.source_id)
            .map(|ranges| {
                ranges
                    .iter()
                    .any(|r| gtid.transaction_id >= r.start && gtid.transaction_id <= r.end)
            })
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|ranges| ranges.is_empty())
    }

    /// COM_BINLOG_DUMP_GTID 요청용 인코딩
    ///
    /// 요청 구간의 상한은 "처음으로 요청하는 트랜잭션"이므로 wire 포맷의
    /// 배타적 끝값으로 그대로 보낸다. 즉 `S:1-N`은 `[1, N)`이 이미 실행된 것으로
    /// 알리고 서버는 트랜잭션 N부터 보낸다.
    pub fn encode_request(&self) -> Result<Vec<u8>> {
        let sids: Vec<(&String, Vec<&GtidRange>)> = self
            .sets
            .iter()
            .map(|(sid, ranges)| (sid, ranges.iter().filter(|r| r.end > r.start).collect::<Vec<_>>()))
            .filter(|(_, ranges)| !ranges.is_empty())
            .collect();

        let mut data = Vec::new();
        data.extend_from_slice(&(sids.len() as u64).to_le_bytes());

        for (sid, ranges) in sids {
            data.extend_from_slice(&parse_uuid(sid)?);
            data.extend_from_slice(&(ranges.len() as u64).to_le_bytes());
            for range in ranges {
                data.extend_from_slice(&range.start.to_le_bytes());
                data.extend_from_slice(&range.end.to_le_bytes());
            }
        }

        Ok(data)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .iter()
            .filter(|(_, ranges)| !ranges.is_empty())
            .map(|(sid, ranges)| {
                let ranges: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
                format!("{}:{}", sid, ranges.join(":"))
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// UUID 문자열을 16바이트로 변환
fn parse_uuid(uuid: &str) -> Result<[u8; 16]> {
    let parsed = uuid::Uuid::parse_str(uuid)
        .map_err(|e| CdcError::GtidError(format!("Invalid server UUID {}: {}", uuid, e)))?;
    Ok(*parsed.as_bytes())
}
