//! MySQL Binlog 이벤트 파싱
//!
//! 복제 스트림의 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!
//! 연결 시 `@master_binlog_checksum = 'NONE'`을 설정하므로 이벤트 끝에
//! CRC32 체크섬은 붙지 않습니다.

use crate::error::{CdcError, Result};
use crate::events::column_type as ct;
use crate::events::*;
use crate::gtid::Gtid;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDate, Utc};
use std::io::{Cursor, Read};

const BINLOG_MAGIC: &[u8] = &[0xfe, 0x62, 0x69, 0x6e]; // ".bin" in ASCII
pub const EVENT_HEADER_SIZE: usize = 19;

/// Binlog 이벤트 파서
pub struct BinlogParser;

impl BinlogParser {
    /// Binlog 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < 4 {
            return Err(CdcError::BinlogParseError(
                "Invalid binlog: too short".to_string(),
            ));
        }

        if data[0..4] == BINLOG_MAGIC[..] {
            Ok(())
        } else {
            Err(CdcError::BinlogParseError(
                "Invalid binlog magic number".to_string(),
            ))
        }
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<(EventHeader, usize)> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(CdcError::BinlogParseError(
                "Invalid event header: too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let event_type = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok((
            EventHeader {
                timestamp,
                event_type: EventType::from_u8(event_type),
                server_id,
                event_length,
                next_pos,
                flags,
            },
            cursor.position() as usize,
        ))
    }

    /// 테이블 맵 이벤트 파싱 (19)
    pub fn parse_table_map_event(data: &[u8]) -> Result<TableMapData> {
        if data.len() < 8 {
            return Err(CdcError::BinlogParseError(
                "Invalid table map event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let table_id = cursor.read_u48::<LittleEndian>()?;
        let _flags = cursor.read_u16::<LittleEndian>()?;

        let database = read_length_prefixed_name(&mut cursor)?;
        let table = read_length_prefixed_name(&mut cursor)?;

        // 컬럼 개수
        let column_count = read_lcb(&mut cursor)? as usize;
        let mut column_types = vec![0u8; column_count];
        cursor.read_exact(&mut column_types)?;

        // Metadata
        let metadata_length = read_lcb(&mut cursor)? as usize;
        let mut metadata = vec![0u8; metadata_length];
        cursor.read_exact(&mut metadata)?;
        let column_meta = parse_column_meta(&column_types, &metadata)?;

        // nullable bitmap
        let nullable_count = (column_count + 7) / 8;
        let mut nullable_bitmap = vec![0u8; nullable_count];
        cursor.read_exact(&mut nullable_bitmap)?;

        Ok(TableMapData {
            table_id,
            database,
            table,
            column_types,
            column_meta,
            nullable_bitmap,
        })
    }

    /// row 이벤트의 테이블 ID만 읽기 (테이블 맵 조회용)
    pub fn peek_table_id(data: &[u8]) -> Result<u64> {
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_u48::<LittleEndian>()?)
    }

    /// WRITE/UPDATE/DELETE_ROWS 이벤트 파싱 (v1: 23-25, v2: 30-32)
    pub fn parse_rows_event(
        data: &[u8],
        event_type: EventType,
        table_map: &TableMapData,
    ) -> Result<RowsEventData> {
        let kind = event_type.row_kind().ok_or_else(|| {
            CdcError::InvalidEvent(format!("Not a rows event: {:?}", event_type))
        })?;
        if data.len() < 8 {
            return Err(CdcError::BinlogParseError(
                "Invalid rows event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let table_id = cursor.read_u48::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        if event_type.has_extra_row_data() {
            // 길이에 자기 자신(2 bytes)이 포함된다
            let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
            if extra_len > 2 {
                cursor.set_position(cursor.position() + extra_len - 2);
            }
        }

        // 컬럼 개수
        let column_count = read_lcb(&mut cursor)?;
        if column_count as usize != table_map.column_types.len() {
            return Err(CdcError::BinlogParseError(format!(
                "Column count mismatch for {}.{}: rows event has {}, table map has {}",
                table_map.database,
                table_map.table,
                column_count,
                table_map.column_types.len()
            )));
        }

        // 컬럼 존재 비트맵
        let bitmap_bytes = (column_count as usize + 7) / 8;
        let mut columns_present = vec![0u8; bitmap_bytes];
        cursor.read_exact(&mut columns_present)?;

        // UPDATE는 변경 후 이미지용 비트맵이 하나 더 있다
        let columns_after = if kind == OperationType::Update {
            let mut bitmap = vec![0u8; bitmap_bytes];
            cursor.read_exact(&mut bitmap)?;
            bitmap
        } else {
            columns_present.clone()
        };

        let mut rows = Vec::new();
        while (cursor.position() as usize) < data.len() {
            let row = match kind {
                OperationType::Insert => {
                    RowImage::insert(parse_row_image(&mut cursor, table_map, &columns_present)?)
                }
                OperationType::Delete => {
                    RowImage::delete(parse_row_image(&mut cursor, table_map, &columns_present)?)
                }
                OperationType::Update => {
                    let before = parse_row_image(&mut cursor, table_map, &columns_present)?;
                    let after = parse_row_image(&mut cursor, table_map, &columns_after)?;
                    RowImage::update(before, after)
                }
            };
            rows.push(row);
        }

        Ok(RowsEventData {
            table_id,
            flags,
            kind,
            column_count,
            rows,
        })
    }

    /// QUERY 이벤트 파싱 (2)
    pub fn parse_query_event(data: &[u8]) -> Result<QueryEventData> {
        if data.len() < 13 {
            return Err(CdcError::BinlogParseError(
                "Invalid query event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let thread_id = cursor.read_u32::<LittleEndian>()?;
        let exec_time = cursor.read_u32::<LittleEndian>()?;
        let db_len = cursor.read_u8()? as usize;
        let error_code = cursor.read_u16::<LittleEndian>()?;
        let status_len = cursor.read_u16::<LittleEndian>()? as u64;

        // Status variables skip
        cursor.set_position(cursor.position() + status_len);

        // 데이터베이스명
        let mut db_bytes = vec![0u8; db_len];
        cursor.read_exact(&mut db_bytes)?;
        let database = String::from_utf8_lossy(&db_bytes).to_string();

        // null terminator skip
        cursor.read_u8()?;

        // 쿼리
        let remaining = &data[cursor.position() as usize..];
        let query = String::from_utf8_lossy(remaining).to_string();

        Ok(QueryEventData {
            thread_id,
            exec_time,
            error_code,
            database,
            query,
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        if data.len() < 8 {
            return Err(CdcError::BinlogParseError(
                "Invalid rotate event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let position = cursor.read_u64::<LittleEndian>()?;
        let filename_bytes = &data[cursor.position() as usize..];
        let filename = String::from_utf8_lossy(filename_bytes)
            .trim_end_matches('\0')
            .to_string();

        Ok(RotateEventData {
            next_binlog_name: filename,
            position,
        })
    }

    /// GTID 이벤트 파싱 (33)
    pub fn parse_gtid_event(data: &[u8]) -> Result<GtidEventData> {
        if data.len() < 25 {
            return Err(CdcError::BinlogParseError(
                "Invalid GTID event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let flags = cursor.read_u8()?;
        let mut uuid_bytes = [0u8; 16];
        cursor.read_exact(&mut uuid_bytes)?;

        let uuid = format_uuid(&uuid_bytes);
        let sequence = cursor.read_u64::<LittleEndian>()?;

        Ok(GtidEventData {
            gtid: Gtid::new(uuid, sequence),
            committed: flags & 0x01 != 0,
        })
    }

    /// XID 이벤트 파싱 (16)
    pub fn parse_xid_event(data: &[u8]) -> Result<u64> {
        let mut cursor = Cursor::new(data);
        Ok(cursor.read_u64::<LittleEndian>()?)
    }
}

/// 1 byte 길이 + 이름 + NUL
fn read_length_prefixed_name(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    cursor.read_u8()?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// 테이블 맵의 타입별 메타데이터 해석
fn parse_column_meta(column_types: &[u8], metadata: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = Cursor::new(metadata);
    let mut column_meta = Vec::with_capacity(column_types.len());

    for &column_type in column_types {
        let meta = match column_type {
            ct::FLOAT
            | ct::DOUBLE
            | ct::BLOB
            | ct::TINY_BLOB
            | ct::MEDIUM_BLOB
            | ct::LONG_BLOB
            | ct::JSON
            | ct::GEOMETRY
            | ct::TIMESTAMP2
            | ct::DATETIME2
            | ct::TIME2 => cursor.read_u8()? as u16,
            ct::VARCHAR | ct::VAR_STRING => cursor.read_u16::<LittleEndian>()?,
            // (real_type, length) / (precision, scale) / (bits, bytes)
            ct::STRING | ct::ENUM | ct::SET | ct::NEWDECIMAL | ct::BIT => {
                cursor.read_u16::<BigEndian>()?
            }
            _ => 0,
        };
        column_meta.push(meta);
    }

    Ok(column_meta)
}

/// LCB (Length-Coded Binary) 읽기
pub fn read_lcb(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfb => Ok(0),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => Ok(cursor.read_u64::<LittleEndian>()?),
        0xff => Err(CdcError::BinlogParseError("Invalid LCB value".to_string())),
    }
}

/// UUID 바이트 배열을 문자열로 변환
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    uuid::Uuid::from_bytes(*bytes).hyphenated().to_string()
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map_or(false, |byte| byte & (1 << (idx % 8)) != 0)
}

/// row 이미지 하나 파싱
///
/// null 비트맵은 present 컬럼 수만큼의 비트를 가진다. present가 아닌 컬럼은
/// 이미지에 없으므로 `Null`로 채워 컬럼 순서를 유지한다.
fn parse_row_image(
    cursor: &mut Cursor<&[u8]>,
    table_map: &TableMapData,
    present_bitmap: &[u8],
) -> Result<Vec<CellValue>> {
    let column_count = table_map.column_types.len();
    let present_count = (0..column_count)
        .filter(|i| is_bit_set(present_bitmap, *i))
        .count();

    let mut null_bitmap = vec![0u8; (present_count + 7) / 8];
    cursor.read_exact(&mut null_bitmap)?;

    let mut row = Vec::with_capacity(column_count);
    let mut null_idx = 0;

    for col_idx in 0..column_count {
        if !is_bit_set(present_bitmap, col_idx) {
            row.push(CellValue::Null);
            continue;
        }

        let is_null = is_bit_set(&null_bitmap, null_idx);
        null_idx += 1;
        if is_null {
            row.push(CellValue::Null);
            continue;
        }

        row.push(decode_value(
            cursor,
            table_map.column_types[col_idx],
            table_map.column_meta[col_idx],
        )?);
    }

    Ok(row)
}

/// 컬럼 타입과 메타데이터로 값 하나를 디코딩
pub fn decode_value(cursor: &mut Cursor<&[u8]>, column_type: u8, meta: u16) -> Result<CellValue> {
    let value = match column_type {
        ct::TINY => CellValue::Int8(cursor.read_i8()?),
        ct::SHORT => CellValue::Int16(cursor.read_i16::<LittleEndian>()?),
        ct::INT24 => CellValue::Int32(cursor.read_i24::<LittleEndian>()?),
        ct::LONG => CellValue::Int32(cursor.read_i32::<LittleEndian>()?),
        ct::LONGLONG => CellValue::Int64(cursor.read_i64::<LittleEndian>()?),
        ct::FLOAT => CellValue::Float(cursor.read_f32::<LittleEndian>()?),
        ct::DOUBLE => CellValue::Double(cursor.read_f64::<LittleEndian>()?),
        ct::NULL => CellValue::Null,
        ct::YEAR => {
            let year = cursor.read_u8()? as u16;
            CellValue::UInt16(if year == 0 { 0 } else { year + 1900 })
        }
        ct::DATE | ct::NEWDATE => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Date(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0f,
                packed & 0x1f
            ))
        }
        ct::TIME => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Time(format!(
                "{:02}:{:02}:{:02}",
                packed / 10000,
                (packed / 100) % 100,
                packed % 100
            ))
        }
        ct::DATETIME => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            local_datetime(
                (packed / 10_000_000_000) as i32,
                ((packed / 100_000_000) % 100) as u32,
                ((packed / 1_000_000) % 100) as u32,
                ((packed / 10_000) % 100) as u32,
                ((packed / 100) % 100) as u32,
                (packed % 100) as u32,
                0,
            )
        }
        ct::TIMESTAMP => timestamp(cursor.read_u32::<LittleEndian>()? as i64, 0),
        ct::TIMESTAMP2 => {
            let secs = cursor.read_u32::<BigEndian>()? as i64;
            let micros = read_fraction(cursor, meta as u8)?;
            timestamp(secs, micros)
        }
        ct::DATETIME2 => {
            // 5 bytes big-endian, 부호 비트가 1로 저장된다
            let packed = cursor.read_uint::<BigEndian>(5)? as i64 - 0x80_0000_0000;
            let micros = read_fraction(cursor, meta as u8)?;
            let ymd = packed >> 17;
            let year_month = ymd >> 5;
            let hms = packed & 0x1ffff;
            local_datetime(
                (year_month / 13) as i32,
                (year_month % 13) as u32,
                (ymd & 0x1f) as u32,
                (hms >> 12) as u32,
                ((hms >> 6) & 0x3f) as u32,
                (hms & 0x3f) as u32,
                micros,
            )
        }
        ct::TIME2 => CellValue::Time(decode_time2(cursor, meta as u8)?),
        ct::VARCHAR | ct::VAR_STRING => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            text_or_bytes(read_bytes(cursor, len)?)
        }
        ct::STRING => decode_string(cursor, meta)?,
        ct::ENUM => decode_enum(cursor, (meta & 0xff) as usize)?,
        ct::SET => decode_set(cursor, (meta & 0xff) as usize)?,
        ct::BIT => {
            let bits = (meta >> 8) as usize;
            let bytes = (meta & 0xff) as usize;
            let len = bytes + usize::from(bits > 0);
            CellValue::UInt64(cursor.read_uint::<BigEndian>(len.clamp(1, 8))?)
        }
        ct::NEWDECIMAL => {
            CellValue::Decimal(decode_decimal(cursor, (meta >> 8) as usize, (meta & 0xff) as usize)?)
        }
        ct::BLOB | ct::TINY_BLOB | ct::MEDIUM_BLOB | ct::LONG_BLOB | ct::GEOMETRY => {
            let len = read_blob_length(cursor, meta)?;
            text_or_bytes(read_bytes(cursor, len)?)
        }
        ct::JSON => {
            let len = read_blob_length(cursor, meta)?;
            let bytes = read_bytes(cursor, len)?;
            CellValue::Json(json_binary::decode(&bytes)?)
        }
        other => {
            return Err(CdcError::BinlogParseError(format!(
                "Unsupported column type: {}",
                other
            )))
        }
    };

    Ok(value)
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn text_or_bytes(bytes: Vec<u8>) -> CellValue {
    match String::from_utf8(bytes) {
        Ok(text) => CellValue::String(text),
        Err(e) => CellValue::Bytes(e.into_bytes()),
    }
}

fn read_blob_length(cursor: &mut Cursor<&[u8]>, meta: u16) -> Result<usize> {
    match meta {
        1..=4 => Ok(cursor.read_uint::<LittleEndian>(meta as usize)? as usize),
        other => Err(CdcError::BinlogParseError(format!(
            "Invalid blob length size: {}",
            other
        ))),
    }
}

/// STRING 타입은 메타데이터의 real_type에 따라 CHAR, ENUM, SET이 된다
fn decode_string(cursor: &mut Cursor<&[u8]>, meta: u16) -> Result<CellValue> {
    let real_type = (meta >> 8) as u8;
    match real_type {
        ct::ENUM => decode_enum(cursor, (meta & 0xff) as usize),
        ct::SET => decode_set(cursor, (meta & 0xff) as usize),
        _ => {
            // 길이가 255를 넘는 CHAR는 real_type 바이트에 상위 비트가 섞여 있다
            let max_len = ((((meta >> 4) & 0x300) ^ 0x300) + (meta & 0xff)) as usize;
            let len = if max_len > 255 {
                cursor.read_u16::<LittleEndian>()? as usize
            } else {
                cursor.read_u8()? as usize
            };
            Ok(text_or_bytes(read_bytes(cursor, len)?))
        }
    }
}

fn decode_enum(cursor: &mut Cursor<&[u8]>, size: usize) -> Result<CellValue> {
    match size {
        1 => Ok(CellValue::UInt16(cursor.read_u8()? as u16)),
        2 => Ok(CellValue::UInt16(cursor.read_u16::<LittleEndian>()?)),
        other => Err(CdcError::BinlogParseError(format!(
            "Invalid enum size: {}",
            other
        ))),
    }
}

fn decode_set(cursor: &mut Cursor<&[u8]>, size: usize) -> Result<CellValue> {
    if !(1..=8).contains(&size) {
        return Err(CdcError::BinlogParseError(format!("Invalid set size: {}", size)));
    }
    Ok(CellValue::UInt64(cursor.read_uint::<LittleEndian>(size)?))
}

/// fsp 자리수의 소수 초를 마이크로초로
fn read_fraction(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let bytes = ((fsp + 1) / 2) as usize;
    if bytes == 0 {
        return Ok(0);
    }
    let value = cursor.read_uint::<BigEndian>(bytes)? as u32;
    // 저장 단위는 바이트 수 기준 (1 byte=1/100, 2 bytes=1/10000, 3 bytes=1/10^6)
    Ok(value * 10u32.pow(6 - 2 * bytes as u32))
}

fn timestamp(secs: i64, micros: u32) -> CellValue {
    if secs == 0 && micros == 0 {
        return CellValue::String("0000-00-00 00:00:00".to_string());
    }
    match DateTime::<Utc>::from_timestamp(secs, micros * 1000) {
        Some(dt) => CellValue::DateTime(dt),
        None => CellValue::Int64(secs),
    }
}

/// 0000-00-00 같은 값은 chrono로 표현할 수 없으므로 문자열로 남긴다
fn local_datetime(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> CellValue {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_micro_opt(hour, minute, second, micros))
        .map(CellValue::LocalDateTime)
        .unwrap_or_else(|| {
            CellValue::String(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ))
        })
}

/// TIME2: 3 bytes 정수부 + fsp 소수부, 음수는 보수로 저장
fn decode_time2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<String> {
    let packed: i64 = match fsp {
        0 => (cursor.read_uint::<BigEndian>(3)? as i64 - 0x80_0000) << 24,
        1 | 2 => {
            let mut int_part = cursor.read_uint::<BigEndian>(3)? as i64 - 0x80_0000;
            let mut frac = cursor.read_u8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = cursor.read_uint::<BigEndian>(3)? as i64 - 0x80_0000;
            let mut frac = cursor.read_u16::<BigEndian>()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        _ => cursor.read_uint::<BigEndian>(6)? as i64 - 0x8000_0000_0000,
    };

    let sign = if packed < 0 { "-" } else { "" };
    let packed = packed.abs();
    let hms = packed >> 24;
    let micros = packed % (1 << 24);
    let hour = (hms >> 12) % (1 << 10);
    let minute = (hms >> 6) % (1 << 6);
    let second = hms % (1 << 6);

    if fsp == 0 {
        Ok(format!("{}{:02}:{:02}:{:02}", sign, hour, minute, second))
    } else {
        Ok(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            sign, hour, minute, second, micros
        ))
    }
}

/// NEWDECIMAL: 9자리씩 4바이트로 묶은 big-endian 정수열
pub fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

    if scale > precision {
        return Err(CdcError::BinlogParseError(format!(
            "Invalid decimal: precision {} < scale {}",
            precision, scale
        )));
    }

    let integral = precision - scale;
    let int_words = integral / 9;
    let int_leftover = integral % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;
    let size = DIG2BYTES[int_leftover] + int_words * 4 + frac_words * 4 + DIG2BYTES[frac_leftover];

    let mut bytes = read_bytes(cursor, size)?;
    if bytes.is_empty() {
        return Ok("0".to_string());
    }

    // 양수는 첫 비트가 1, 음수는 전체 비트가 반전되어 저장된다
    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        bytes.iter_mut().for_each(|b| *b = !*b);
    }

    let mut digits = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();

    if int_leftover > 0 {
        let value = digits.read_uint::<BigEndian>(DIG2BYTES[int_leftover])?;
        int_part.push_str(&value.to_string());
    }
    for _ in 0..int_words {
        let value = digits.read_u32::<BigEndian>()?;
        int_part.push_str(&format!("{:09}", value));
    }

    let int_part = int_part.trim_start_matches('0');
    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(if int_part.is_empty() { "0" } else { int_part });

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            let value = digits.read_u32::<BigEndian>()?;
            result.push_str(&format!("{:09}", value));
        }
        if frac_leftover > 0 {
            let value = digits.read_uint::<BigEndian>(DIG2BYTES[frac_leftover])?;
            result.push_str(&format!("{:0width$}", value, width = frac_leftover));
        }
    }

    Ok(result)
}

/// MySQL JSON 바이너리 포맷 디코딩
mod json_binary {
    use crate::error::{CdcError, Result};
    use serde_json::{Map, Number, Value};

    const SMALL_OBJECT: u8 = 0x00;
    const LARGE_OBJECT: u8 = 0x01;
    const SMALL_ARRAY: u8 = 0x02;
    const LARGE_ARRAY: u8 = 0x03;
    const LITERAL: u8 = 0x04;
    const INT16: u8 = 0x05;
    const UINT16: u8 = 0x06;
    const INT32: u8 = 0x07;
    const UINT32: u8 = 0x08;
    const INT64: u8 = 0x09;
    const UINT64: u8 = 0x0a;
    const DOUBLE: u8 = 0x0b;
    const STRING: u8 = 0x0c;
    const OPAQUE: u8 = 0x0f;

    fn truncated() -> CdcError {
        CdcError::BinlogParseError("Truncated JSON value".to_string())
    }

    fn slice(data: &[u8], start: usize, len: usize) -> Result<&[u8]> {
        data.get(start..start + len).ok_or_else(truncated)
    }

    fn read_uint(data: &[u8], start: usize, len: usize) -> Result<u64> {
        let bytes = slice(data, start, len)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    pub fn decode(data: &[u8]) -> Result<Value> {
        match data.split_first() {
            None => Ok(Value::Null),
            Some((&type_byte, body)) => parse_value(type_byte, body),
        }
    }

    fn parse_value(type_byte: u8, data: &[u8]) -> Result<Value> {
        match type_byte {
            SMALL_OBJECT => parse_container(data, false, true),
            LARGE_OBJECT => parse_container(data, true, true),
            SMALL_ARRAY => parse_container(data, false, false),
            LARGE_ARRAY => parse_container(data, true, false),
            LITERAL => literal(read_uint(data, 0, 1)?),
            INT16 => Ok(Value::from(read_uint(data, 0, 2)? as u16 as i16)),
            UINT16 => Ok(Value::from(read_uint(data, 0, 2)? as u16)),
            INT32 => Ok(Value::from(read_uint(data, 0, 4)? as u32 as i32)),
            UINT32 => Ok(Value::from(read_uint(data, 0, 4)? as u32)),
            INT64 => Ok(Value::from(read_uint(data, 0, 8)? as i64)),
            UINT64 => Ok(Value::from(read_uint(data, 0, 8)?)),
            DOUBLE => {
                let value = f64::from_bits(read_uint(data, 0, 8)?);
                Ok(Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null))
            }
            STRING => {
                let (len, header) = read_variable_length(data)?;
                let bytes = slice(data, header, len)?;
                Ok(Value::from(String::from_utf8_lossy(bytes).to_string()))
            }
            OPAQUE => {
                // 1 byte 컬럼 타입 + 가변 길이 데이터
                let (len, header) = read_variable_length(data.get(1..).ok_or_else(truncated)?)?;
                let bytes = slice(data, 1 + header, len)?;
                Ok(Value::from(String::from_utf8_lossy(bytes).to_string()))
            }
            other => Err(CdcError::BinlogParseError(format!(
                "Unknown JSON type: {:#x}",
                other
            ))),
        }
    }

    fn literal(value: u64) -> Result<Value> {
        match value {
            0x00 => Ok(Value::Null),
            0x01 => Ok(Value::Bool(true)),
            0x02 => Ok(Value::Bool(false)),
            other => Err(CdcError::BinlogParseError(format!(
                "Unknown JSON literal: {:#x}",
                other
            ))),
        }
    }

    /// 7 bit 단위 가변 길이. (길이, 헤더 바이트 수)
    fn read_variable_length(data: &[u8]) -> Result<(usize, usize)> {
        let mut len = 0usize;
        for (i, byte) in data.iter().take(5).enumerate() {
            len |= ((byte & 0x7f) as usize) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok((len, i + 1));
            }
        }
        Err(truncated())
    }

    /// object/array 본문. offset은 본문 시작 기준이다.
    fn parse_container(data: &[u8], large: bool, is_object: bool) -> Result<Value> {
        let word = if large { 4 } else { 2 };
        let count = read_uint(data, 0, word)? as usize;
        let mut pos = 2 * word;

        let mut keys = Vec::with_capacity(if is_object { count } else { 0 });
        if is_object {
            for _ in 0..count {
                let key_offset = read_uint(data, pos, word)? as usize;
                let key_len = read_uint(data, pos + word, 2)? as usize;
                keys.push(String::from_utf8_lossy(slice(data, key_offset, key_len)?).to_string());
                pos += word + 2;
            }
        }

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let type_byte = read_uint(data, pos, 1)? as u8;
            let inline = match type_byte {
                LITERAL | INT16 | UINT16 => true,
                INT32 | UINT32 => large,
                _ => false,
            };
            let value = if inline {
                parse_value(type_byte, slice(data, pos + 1, word)?)?
            } else {
                let offset = read_uint(data, pos + 1, word)? as usize;
                parse_value(type_byte, data.get(offset..).ok_or_else(truncated)?)?
            };
            values.push(value);
            pos += 1 + word;
        }

        if is_object {
            Ok(Value::Object(keys.into_iter().zip(values).collect::<Map<_, _>>()))
        } else {
            Ok(Value::Array(values))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_map(column_types: Vec<u8>, column_meta: Vec<u16>) -> TableMapData {
        let nullable = vec![0xff; (column_types.len() + 7) / 8];
        TableMapData {
            table_id: 1,
            database: "shop".to_string(),
            table: "orders".to_string(),
            column_types,
            column_meta,
            nullable_bitmap: nullable,
        }
    }

    #[test]
    fn test_verify_magic() {
        let valid = vec![0xfe, 0x62, 0x69, 0x6e];
        assert!(BinlogParser::verify_magic(&valid).is_ok());

        let invalid = vec![0x00, 0x00, 0x00, 0x00];
        assert!(BinlogParser::verify_magic(&invalid).is_err());
    }

    #[test]
    fn test_format_uuid() {
        let bytes = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0,
                     0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0];
        assert_eq!(format_uuid(&bytes), "12345678-9abc-def0-1234-56789abcdef0");
    }

    #[test]
    fn test_parse_table_map_event() {
        let mut data = vec![0x2a, 0, 0, 0, 0, 0, 0x01, 0x00];
        data.extend_from_slice(&[4, b's', b'h', b'o', b'p', 0]);
        data.extend_from_slice(&[6, b'o', b'r', b'd', b'e', b'r', b's', 0]);
        data.push(3); // column count
        data.extend_from_slice(&[ct::LONG, ct::VARCHAR, ct::NEWDECIMAL]);
        data.push(4); // metadata length
        data.extend_from_slice(&[0xff, 0x00, 10, 2]);
        data.push(0b110);

        let map = BinlogParser::parse_table_map_event(&data).unwrap();
        assert_eq!(map.table_id, 42);
        assert_eq!(map.database, "shop");
        assert_eq!(map.table, "orders");
        assert_eq!(map.column_meta, vec![0, 255, (10 << 8) | 2]);
    }

    #[test]
    fn test_parse_write_rows_v2() {
        let map = table_map(vec![ct::LONG, ct::VARCHAR], vec![0, 64]);
        let mut data = vec![1, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&[2, 0]); // extra data length
        data.push(2); // column count
        data.push(0b11); // present
        // row 1: id=7, name="ab"
        data.push(0b00);
        data.extend_from_slice(&7i32.to_le_bytes());
        data.extend_from_slice(&[2, b'a', b'b']);
        // row 2: id=8, name=NULL
        data.push(0b10);
        data.extend_from_slice(&8i32.to_le_bytes());

        let rows = BinlogParser::parse_rows_event(&data, EventType::WriteRowsEvent, &map).unwrap();
        assert_eq!(rows.kind, OperationType::Insert);
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(
            rows.rows[0],
            RowImage::insert(vec![CellValue::Int32(7), CellValue::String("ab".into())])
        );
        assert_eq!(
            rows.rows[1],
            RowImage::insert(vec![CellValue::Int32(8), CellValue::Null])
        );
    }

    #[test]
    fn test_parse_update_rows_v1_before_and_after() {
        let map = table_map(vec![ct::TINY], vec![0]);
        let mut data = vec![1, 0, 0, 0, 0, 0, 0, 0];
        data.push(1); // column count
        data.push(0b1); // before bitmap
        data.push(0b1); // after bitmap
        data.extend_from_slice(&[0, 5, 0, 6]);

        let rows = BinlogParser::parse_rows_event(&data, EventType::UpdateRowsEventV1, &map).unwrap();
        assert_eq!(
            rows.rows,
            vec![RowImage::update(vec![CellValue::Int8(5)], vec![CellValue::Int8(6)])]
        );
    }

    #[test]
    fn test_column_count_mismatch() {
        let map = table_map(vec![ct::TINY], vec![0]);
        let data = vec![1, 0, 0, 0, 0, 0, 0, 0, 2, 0b11];
        assert!(BinlogParser::parse_rows_event(&data, EventType::DeleteRowsEventV1, &map).is_err());
    }

    #[test]
    fn test_parse_query_event() {
        let mut data = Vec::new();
        data.extend_from_slice(&11u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(2); // db len
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(&[9, 9, 9]); // status vars
        data.extend_from_slice(b"db\0");
        data.extend_from_slice(b"BEGIN");

        let query = BinlogParser::parse_query_event(&data).unwrap();
        assert_eq!(query.thread_id, 11);
        assert_eq!(query.database, "db");
        assert_eq!(query.query, "BEGIN");
    }

    #[test]
    fn test_parse_rotate_event() {
        let mut data = 4u64.to_le_bytes().to_vec();
        data.extend_from_slice(b"mysql-bin.000002");
        let rotate = BinlogParser::parse_rotate_event(&data).unwrap();
        assert_eq!(rotate.position, 4);
        assert_eq!(rotate.next_binlog_name, "mysql-bin.000002");
    }

    #[test]
    fn test_parse_gtid_event() {
        let mut data = vec![0x01];
        data.extend_from_slice(&[0x3e, 0x11, 0xfa, 0x47, 0x71, 0xca, 0x11, 0xe1,
                                 0x9e, 0x33, 0xc8, 0x0a, 0xa9, 0x42, 0x95, 0x62]);
        data.extend_from_slice(&23u64.to_le_bytes());
        let gtid = BinlogParser::parse_gtid_event(&data).unwrap();
        assert_eq!(gtid.gtid.to_string(), "3e11fa47-71ca-11e1-9e33-c80aa9429562:23");
    }

    #[test]
    fn test_decode_decimal() {
        // DECIMAL(10,2) 1234.56: int 8 digits (0 words + 8 leftover -> 4 bytes), frac 2 digits (1 byte)
        let mut data = (1234u32 | 0x8000_0000).to_be_bytes().to_vec();
        data.push(56);
        let mut cursor = Cursor::new(data.as_slice());
        assert_eq!(decode_decimal(&mut cursor, 10, 2).unwrap(), "1234.56");

        // -1234.56
        let mut data = (1234u32 | 0x8000_0000).to_be_bytes().to_vec();
        data.push(56);
        let data: Vec<u8> = data.into_iter().map(|b| !b).collect();
        let mut cursor = Cursor::new(data.as_slice());
        assert_eq!(decode_decimal(&mut cursor, 10, 2).unwrap(), "-1234.56");

        // 0.05
        let data = [0x80, 0x00, 0x00, 0x00, 5];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(decode_decimal(&mut cursor, 10, 2).unwrap(), "0.05");
    }

    #[test]
    fn test_decode_datetime2() {
        // 2021-03-04 05:06:07, fsp 0
        let ym = 2021 * 13 + 3;
        let ymd = (ym << 5) | 4;
        let hms = (5 << 12) | (6 << 6) | 7;
        let packed: i64 = ((ymd << 17) | hms) + 0x80_0000_0000;
        let bytes = packed.to_be_bytes();
        let mut cursor = Cursor::new(&bytes[3..]);
        let value = decode_value(&mut cursor, ct::DATETIME2, 0).unwrap();
        assert_eq!(value.as_string().unwrap(), "2021-03-04 05:06:07");
    }

    #[test]
    fn test_decode_time2_and_date() {
        // 10:20:30
        let packed: u32 = ((10 << 12) | (20 << 6) | 30) + 0x80_0000;
        let bytes = packed.to_be_bytes();
        let mut cursor = Cursor::new(&bytes[1..]);
        assert_eq!(
            decode_value(&mut cursor, ct::TIME2, 0).unwrap(),
            CellValue::Time("10:20:30".to_string())
        );

        let packed: u32 = (2020 << 9) | (2 << 5) | 29;
        let bytes = packed.to_le_bytes();
        let mut cursor = Cursor::new(&bytes[..3]);
        assert_eq!(
            decode_value(&mut cursor, ct::DATE, 0).unwrap(),
            CellValue::Date("2020-02-29".to_string())
        );
    }

    #[test]
    fn test_decode_string_enum_and_char() {
        // CHAR(10): real_type STRING, length 10
        let meta = ((ct::STRING as u16) << 8) | 10;
        let data = [3, b'a', b'b', b'c'];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(
            decode_value(&mut cursor, ct::STRING, meta).unwrap(),
            CellValue::String("abc".to_string())
        );

        let meta = ((ct::ENUM as u16) << 8) | 1;
        let data = [2];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(decode_value(&mut cursor, ct::STRING, meta).unwrap(), CellValue::UInt16(2));
    }

    #[test]
    fn test_decode_blob_and_timestamp2() {
        let data = [2, 0, 0xff, 0xfe];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(
            decode_value(&mut cursor, ct::BLOB, 2).unwrap(),
            CellValue::Bytes(vec![0xff, 0xfe])
        );

        let data = 1_600_000_000u32.to_be_bytes();
        let mut cursor = Cursor::new(&data[..]);
        let value = decode_value(&mut cursor, ct::TIMESTAMP2, 0).unwrap();
        assert_eq!(value.as_epoch_seconds(), Some(1_600_000_000));
    }
}
