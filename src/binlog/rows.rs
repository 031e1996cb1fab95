//! 행 이벤트 디코딩과 변환
//!
//! 행 이미지를 하나씩 읽으면서 결과 이벤트 바이트(`out`)를 함께 만듭니다.
//! flashback, update→write 변환, 테이블/행 필터가 여기서 적용되고, 마지막에
//! `event_size` 를 고치고 CRC32 를 다시 붙입니다.

use super::{seal_event, ParseOptions};
use crate::error::{BinlogError, Result};
use crate::events::{
    decompress_mariadb, put_table_id, EventHeader, EventType, FormatDescriptionEvent, RowsEvent, RowsKind,
    TableMapEvent, EVENT_HEADER_SIZE,
};
use crate::protocol::codec::{bit_is_set, bitmap_len, popcount, put_lenenc_int, ReadMysqlExt};
use crate::types::decimal::decode_decimal;
use crate::types::json::json_binary_to_string;
use crate::types::temporal::{
    decode_date, decode_datetime, decode_datetime2, decode_time, decode_time2, decode_timestamp, decode_timestamp2,
};
use crate::types::{CellValue, ColumnType};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

/// 행 이벤트 디코딩에 필요한 파서 상태
pub(crate) struct RowsContext<'a> {
    pub fde: &'a FormatDescriptionEvent,
    pub tables: &'a HashMap<u64, Arc<TableMapEvent>>,
    /// TABLE_MAP 에서 이미 필터에 걸린 table id. 저장된 schema 는 rewrite 후 이름일 수 있음
    pub excluded_tables: &'a HashSet<u64>,
    pub options: &'a ParseOptions,
    /// 결과 이벤트에 CRC32 를 붙일지
    pub checksum: bool,
}

/// 디코딩 결과: 이벤트, 재작성된 헤더, 재작성된 전체 바이트
pub(crate) struct DecodedRows {
    pub event: RowsEvent,
    pub header: EventHeader,
    pub raw: Vec<u8>,
}

/// 변환 후 이벤트 종류
fn output_kind(kind: RowsKind, options: &ParseOptions) -> RowsKind {
    let kind = match (kind, options.flashback) {
        (RowsKind::Write, true) => RowsKind::Delete,
        (RowsKind::Delete, true) => RowsKind::Write,
        (kind, _) => kind,
    };
    if kind == RowsKind::Update && options.convert_update_to_write {
        RowsKind::Write
    } else {
        kind
    }
}

fn header_only(mut header: EventHeader) -> (EventHeader, Vec<u8>) {
    header.event_size = EVENT_HEADER_SIZE as u32;
    let mut raw = Vec::with_capacity(EVENT_HEADER_SIZE);
    header.encode(&mut raw);
    (header, raw)
}

/// 행 이벤트 본문(체크섬 제외) 디코딩
pub(crate) fn decode_rows_event(ctx: &RowsContext<'_>, header: &EventHeader, body: &[u8]) -> Result<DecodedRows> {
    let (kind, version, compressed) = header.event_type.rows_info().ok_or_else(|| {
        BinlogError::BinlogParseError(format!("{:?} is not a rows event", header.event_type))
    })?;
    let options = ctx.options;
    let table_id_size = ctx.fde.table_id_size(header.event_type);

    let mut cursor = Cursor::new(body);
    let table_id = if table_id_size == 4 {
        cursor.read_u32::<LittleEndian>()? as u64
    } else {
        cursor.read_u48::<LittleEndian>()?
    };
    let flags = cursor.read_u16::<LittleEndian>()?;
    let extra_data = if version == 2 {
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;
        cursor.take_bytes(extra_len.saturating_sub(2))?.to_vec()
    } else {
        Vec::new()
    };

    let decompressed;
    let mut cursor = if compressed {
        decompressed = decompress_mariadb(cursor.rest())?;
        Cursor::new(decompressed.as_slice())
    } else {
        Cursor::new(cursor.rest())
    };

    let column_count = cursor
        .read_lenenc_int()?
        .ok_or_else(|| BinlogError::BinlogParseError("NULL column count".to_string()))? as usize;
    let present_len = bitmap_len(column_count);
    let columns_before = cursor.take_bytes(present_len)?.to_vec();
    let columns_after = if kind == RowsKind::Update {
        cursor.take_bytes(present_len)?.to_vec()
    } else {
        columns_before.clone()
    };

    let table = ctx.tables.get(&table_id).cloned();
    let mut event = RowsEvent {
        kind,
        version,
        table_id,
        flags,
        extra_data,
        column_count,
        columns_before,
        columns_after,
        table: table.clone(),
        rows: Vec::new(),
        rows_count: 0,
        rows_matched: 0,
    };

    let new_kind = output_kind(kind, options);
    let mut out_header = *header;
    out_header.event_type = EventType::rows_event_type(new_kind, version);

    let Some(table) = table else {
        // 모든 테이블이 걸러졌을 때 MySQL이 보내는 빈 STMT_END 이벤트
        if cursor.remaining() == 0 {
            let (header, raw) = header_only(*header);
            return Ok(DecodedRows { event, header, raw });
        }
        return Err(BinlogError::BinlogParseError(format!(
            "no table map for table id {}",
            table_id
        )));
    };
    if table.column_count != column_count {
        return Err(BinlogError::BinlogParseError(format!(
            "rows event has {} columns, table map {}.{} has {}",
            column_count, table.schema, table.table, table.column_count
        )));
    }

    let excluded_table = ctx.excluded_tables.contains(&table_id);
    let excluded_kind = options
        .rows_event_types
        .as_ref()
        .is_some_and(|kinds| !kinds.contains(&kind));
    if excluded_table || excluded_kind {
        let (header, raw) = header_only(*header);
        return Ok(DecodedRows { event, header, raw });
    }

    // 출력 이벤트의 post header + column count + 비트맵
    let mut out = Vec::with_capacity(body.len() + EVENT_HEADER_SIZE + 4);
    out_header.encode(&mut out);
    put_table_id(&mut out, table_id, table_id_size);
    out.extend_from_slice(&flags.to_le_bytes());
    if version == 2 {
        out.extend_from_slice(&((event.extra_data.len() + 2) as u16).to_le_bytes());
        out.extend_from_slice(&event.extra_data);
    }
    put_lenenc_int(&mut out, column_count as u64);
    match (kind, new_kind) {
        (RowsKind::Update, RowsKind::Update) if options.flashback => {
            out.extend_from_slice(&event.columns_after);
            out.extend_from_slice(&event.columns_before);
        }
        (RowsKind::Update, RowsKind::Update) => {
            out.extend_from_slice(&event.columns_before);
            out.extend_from_slice(&event.columns_after);
        }
        // update → write: flashback이면 원래 before가 남음
        (RowsKind::Update, _) if options.flashback => out.extend_from_slice(&event.columns_before),
        (RowsKind::Update, _) => out.extend_from_slice(&event.columns_after),
        _ => out.extend_from_slice(&event.columns_before),
    }

    let data = cursor.rest();
    let mut pos = 0usize;
    while pos < data.len() {
        let (first, first_len) = decode_image(&table, &event.columns_before, &data[pos..], options)?;
        let first_bytes = &data[pos..pos + first_len];
        pos += first_len;

        let second = if kind == RowsKind::Update {
            let (after, after_len) = decode_image(&table, &event.columns_after, &data[pos..], options)?;
            let after_bytes = &data[pos..pos + after_len];
            pos += after_len;
            Some((after, after_bytes))
        } else {
            None
        };

        event.rows_count += 1;
        let matched = match &options.row_filter {
            None => true,
            Some(filter) => {
                filter.matches(&first, &table)?
                    || match &second {
                        Some((after, _)) => filter.matches(after, &table)?,
                        None => false,
                    }
            }
        };
        if !matched {
            continue;
        }
        event.rows_matched += 1;

        match second {
            None => {
                out.extend_from_slice(first_bytes);
                event.rows.push(first);
            }
            Some((after, after_bytes)) => {
                // (출력 첫 이미지, 출력 둘째 이미지)
                let (a, a_bytes, b, b_bytes) = if options.flashback {
                    (after, after_bytes, first, first_bytes)
                } else {
                    (first, first_bytes, after, after_bytes)
                };
                if new_kind == RowsKind::Write {
                    out.extend_from_slice(b_bytes);
                    event.rows.push(b);
                } else {
                    out.extend_from_slice(a_bytes);
                    out.extend_from_slice(b_bytes);
                    event.rows.push(a);
                    event.rows.push(b);
                }
            }
        }
    }

    if options.row_filter.is_some() && event.rows_matched == 0 {
        let (header, raw) = header_only(*header);
        return Ok(DecodedRows { event, header, raw });
    }

    event.kind = new_kind;
    if new_kind != kind {
        if kind == RowsKind::Update {
            let kept = if options.flashback {
                event.columns_before.clone()
            } else {
                event.columns_after.clone()
            };
            event.columns_before = kept.clone();
            event.columns_after = kept;
        }
    } else if kind == RowsKind::Update && options.flashback {
        std::mem::swap(&mut event.columns_before, &mut event.columns_after);
    }

    let raw = seal_event(out, ctx.checksum);
    out_header.event_size = raw.len() as u32;
    Ok(DecodedRows {
        event,
        header: out_header,
        raw,
    })
}

/// 이미지 하나 디코딩. 없는 컬럼은 Null. 반환: (값, 소비 바이트)
pub fn decode_image(
    table: &TableMapEvent,
    present: &[u8],
    data: &[u8],
    options: &ParseOptions,
) -> Result<(Vec<CellValue>, usize)> {
    let column_count = table.column_count;
    let null_len = bitmap_len(popcount(present, column_count));
    if data.len() < null_len {
        return Err(BinlogError::UnexpectedEof);
    }
    let null_bitmap = &data[..null_len];
    let mut pos = null_len;
    let mut row = Vec::with_capacity(column_count);
    let mut present_index = 0;

    for i in 0..column_count {
        if !bit_is_set(present, i) {
            row.push(CellValue::Null);
            continue;
        }
        let is_null = bit_is_set(null_bitmap, present_index);
        present_index += 1;
        if is_null {
            row.push(CellValue::Null);
            continue;
        }
        let (ty, meta) = table.real_type(i)?;
        let (value, used) = decode_value(ty, meta, table.is_unsigned(i), &data[pos..], options.json_trailing_zero)
            .map_err(|e| {
                BinlogError::BinlogParseError(format!(
                    "column {} ({:?}) of {}.{}: {}",
                    i, ty, table.schema, table.table, e
                ))
            })?;
        pos += used;
        row.push(value);
    }
    Ok((row, pos))
}

fn need(data: &[u8], n: usize) -> Result<()> {
    if data.len() < n {
        Err(BinlogError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn text_or_bytes(data: &[u8]) -> CellValue {
    match std::str::from_utf8(data) {
        Ok(s) => CellValue::String(s.to_string()),
        Err(_) => CellValue::Bytes(data.to_vec()),
    }
}

/// 길이 접두사 + 본문
fn read_prefixed(data: &[u8], prefix: usize) -> Result<(&[u8], usize)> {
    need(data, prefix)?;
    let len = LittleEndian::read_uint(data, prefix) as usize;
    need(data, prefix + len)?;
    Ok((&data[prefix..prefix + len], prefix + len))
}

/// 단일 컬럼 값 디코딩. 반환: (값, 소비 바이트)
pub fn decode_value(
    ty: ColumnType,
    meta: u16,
    unsigned: bool,
    data: &[u8],
    json_trailing_zero: bool,
) -> Result<(CellValue, usize)> {
    macro_rules! int {
        ($n:expr, $signed:expr, $unsigned:expr) => {{
            need(data, $n)?;
            let value = if unsigned {
                CellValue::Unsigned($unsigned as u64)
            } else {
                CellValue::Signed($signed as i64)
            };
            (value, $n)
        }};
    }

    let decoded = match ty {
        ColumnType::Tiny => int!(1, data[0] as i8, data[0]),
        ColumnType::Short => int!(2, LittleEndian::read_i16(data), LittleEndian::read_u16(data)),
        ColumnType::Int24 => int!(3, LittleEndian::read_i24(data), LittleEndian::read_u24(data)),
        ColumnType::Long => int!(4, LittleEndian::read_i32(data), LittleEndian::read_u32(data)),
        ColumnType::LongLong => int!(8, LittleEndian::read_i64(data), LittleEndian::read_u64(data)),
        ColumnType::Float => {
            need(data, 4)?;
            (CellValue::Float(LittleEndian::read_f32(data)), 4)
        }
        ColumnType::Double => {
            need(data, 8)?;
            (CellValue::Double(LittleEndian::read_f64(data)), 8)
        }
        ColumnType::NewDecimal => {
            let (text, used) = decode_decimal(data, (meta >> 8) as usize, (meta & 0xFF) as usize)?;
            (CellValue::Decimal(text), used)
        }
        ColumnType::Year => {
            need(data, 1)?;
            let year = if data[0] == 0 { 0 } else { 1900 + data[0] as u16 };
            (CellValue::Year(year), 1)
        }
        ColumnType::Date | ColumnType::NewDate => (CellValue::Date(decode_date(data)?), 3),
        ColumnType::Time => (CellValue::Time(decode_time(data)?), 3),
        ColumnType::DateTime => (CellValue::DateTime(decode_datetime(data)?), 8),
        ColumnType::Timestamp => (CellValue::Timestamp(decode_timestamp(data)?), 4),
        ColumnType::Timestamp2 => {
            let (text, used) = decode_timestamp2(data, meta as u8)?;
            (CellValue::Timestamp(text), used)
        }
        ColumnType::DateTime2 => {
            let (text, used) = decode_datetime2(data, meta as u8)?;
            (CellValue::DateTime(text), used)
        }
        ColumnType::Time2 => {
            let (text, used) = decode_time2(data, meta as u8)?;
            (CellValue::Time(text), used)
        }
        ColumnType::VarChar | ColumnType::VarString => {
            let prefix = if meta < 256 { 1 } else { 2 };
            let (bytes, used) = read_prefixed(data, prefix)?;
            (text_or_bytes(bytes), used)
        }
        ColumnType::String => {
            let prefix = if meta < 256 { 1 } else { 2 };
            let (bytes, used) = read_prefixed(data, prefix)?;
            (text_or_bytes(bytes), used)
        }
        ColumnType::Enum => {
            let size = (meta & 0xFF) as usize;
            need(data, size)?;
            match size {
                1 => (CellValue::Enum(data[0] as u16), 1),
                2 => (CellValue::Enum(LittleEndian::read_u16(data)), 2),
                n => {
                    return Err(BinlogError::BinlogParseError(format!("invalid ENUM pack length {}", n)));
                }
            }
        }
        ColumnType::Set => {
            let size = (meta & 0xFF) as usize;
            if size == 0 || size > 8 {
                return Err(BinlogError::BinlogParseError(format!("invalid SET pack length {}", size)));
            }
            need(data, size)?;
            (CellValue::Set(LittleEndian::read_uint(data, size)), size)
        }
        ColumnType::Bit => {
            let bits = (meta >> 8) as usize * 8 + (meta & 0xFF) as usize;
            let size = (bits + 7) / 8;
            if size > 8 {
                return Err(BinlogError::BinlogParseError(format!("invalid BIT length {}", bits)));
            }
            need(data, size)?;
            let value = if size == 0 { 0 } else { BigEndian::read_uint(data, size) };
            (CellValue::Bit(value), size)
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry
        | ColumnType::Vector => {
            let prefix = meta as usize;
            if !(1..=4).contains(&prefix) {
                return Err(BinlogError::BinlogParseError(format!("invalid BLOB prefix {}", prefix)));
            }
            let (bytes, used) = read_prefixed(data, prefix)?;
            (CellValue::Bytes(bytes.to_vec()), used)
        }
        ColumnType::Json => {
            let prefix = meta as usize;
            if !(1..=4).contains(&prefix) {
                return Err(BinlogError::BinlogParseError(format!("invalid JSON prefix {}", prefix)));
            }
            let (bytes, used) = read_prefixed(data, prefix)?;
            (CellValue::Json(json_binary_to_string(bytes, json_trailing_zero)?), used)
        }
        other => {
            return Err(BinlogError::BinlogParseError(format!(
                "unsupported column type {:?} in rows event",
                other
            )));
        }
    };
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::expr::RowFilter;
    use crate::events::ChecksumAlgorithm;

    fn fde() -> FormatDescriptionEvent {
        let mut fde = FormatDescriptionEvent::default_v4();
        fde.server_version = "8.0.36".into();
        fde.checksum_algorithm = ChecksumAlgorithm::Crc32;
        fde
    }

    fn table() -> Arc<TableMapEvent> {
        Arc::new(TableMapEvent {
            table_id: 5,
            flags: 1,
            schema: "test".into(),
            table: "t1".into(),
            column_count: 2,
            column_types: vec![ColumnType::Long as u8, ColumnType::VarChar as u8],
            column_meta: vec![0, 256],
            null_bitmap: vec![0b10],
            signedness: None,
            column_names: Vec::new(),
            primary_key: Vec::new(),
            enum_values: Vec::new(),
            set_values: Vec::new(),
            optional_metadata: Vec::new(),
        })
    }

    fn image(id: i32, name: &str) -> Vec<u8> {
        let mut buf = vec![0u8];
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf
    }

    fn rows_body(kind: RowsKind, images: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&5u64.to_le_bytes()[..6]);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.push(2);
        body.push(0b11);
        if kind == RowsKind::Update {
            body.push(0b11);
        }
        for image in images {
            body.extend_from_slice(image);
        }
        body
    }

    fn header(event_type: EventType, body_len: usize) -> EventHeader {
        EventHeader {
            timestamp: 1,
            event_type,
            server_id: 1,
            event_size: (EVENT_HEADER_SIZE + body_len + 4) as u32,
            log_pos: 500,
            flags: 0,
        }
    }

    fn decode(event_type: EventType, body: &[u8], options: &ParseOptions) -> DecodedRows {
        let fde = fde();
        let mut tables = HashMap::new();
        let table = table();
        // TABLE_MAP 단계의 필터 결정
        let mut excluded_tables = HashSet::new();
        if options
            .ddl_filter
            .as_ref()
            .is_some_and(|f| !f.match_table(&table.schema, &table.table))
        {
            excluded_tables.insert(5);
        }
        tables.insert(5, table);
        let ctx = RowsContext {
            fde: &fde,
            tables: &tables,
            excluded_tables: &excluded_tables,
            options,
            checksum: true,
        };
        decode_rows_event(&ctx, &header(event_type, body.len()), body).unwrap()
    }

    #[test]
    fn test_write_rows_v2() {
        let body = rows_body(RowsKind::Write, &[image(42, "abc")]);
        let decoded = decode(EventType::WriteRowsV2, &body, &ParseOptions::default());
        assert_eq!(
            decoded.event.rows,
            vec![vec![CellValue::Signed(42), CellValue::String("abc".into())]]
        );
        assert_eq!(decoded.event.rows_count, 1);
        assert_eq!(decoded.raw.len(), EVENT_HEADER_SIZE + body.len() + 4);
        assert_eq!(&decoded.raw[EVENT_HEADER_SIZE..EVENT_HEADER_SIZE + body.len()], body.as_slice());
    }

    #[test]
    fn test_flashback_write_becomes_delete() {
        let body = rows_body(RowsKind::Write, &[image(42, "abc")]);
        let options = ParseOptions {
            flashback: true,
            ..Default::default()
        };
        let decoded = decode(EventType::WriteRowsV2, &body, &options);
        assert_eq!(decoded.raw[4], EventType::DeleteRowsV2.as_u8());
        assert_eq!(decoded.header.event_type, EventType::DeleteRowsV2);
        let (payload, crc) = decoded.raw.split_at(decoded.raw.len() - 4);
        assert_eq!(crc32fast::hash(payload).to_le_bytes(), crc);
        assert_eq!(
            LittleEndian::read_u32(&decoded.raw[9..13]) as usize,
            decoded.raw.len()
        );
        assert_eq!(decoded.event.kind, RowsKind::Delete);
        assert_eq!(
            decoded.event.rows,
            vec![vec![CellValue::Signed(42), CellValue::String("abc".into())]]
        );
    }

    #[test]
    fn test_update_flashback_and_convert() {
        let body = rows_body(RowsKind::Update, &[image(1, "old"), image(1, "new")]);

        let flash = decode(
            EventType::UpdateRowsV2,
            &body,
            &ParseOptions {
                flashback: true,
                ..Default::default()
            },
        );
        assert_eq!(flash.event.rows[0][1], CellValue::String("new".into()));
        assert_eq!(flash.event.rows[1][1], CellValue::String("old".into()));
        let pairs: Vec<_> = flash.event.update_pairs().collect();
        assert_eq!(pairs.len(), 1);

        let converted = decode(
            EventType::UpdateRowsV2,
            &body,
            &ParseOptions {
                convert_update_to_write: true,
                ..Default::default()
            },
        );
        assert_eq!(converted.header.event_type, EventType::WriteRowsV2);
        assert_eq!(converted.event.rows, vec![vec![CellValue::Signed(1), CellValue::String("new".into())]]);
        // before 이미지와 before 비트맵이 빠짐
        assert_eq!(converted.raw.len(), EVENT_HEADER_SIZE + body.len() - 1 - image(1, "old").len() + 4);
    }

    #[test]
    fn test_filters_truncate_to_header() {
        let body = rows_body(RowsKind::Write, &[image(1, "a"), image(2, "b")]);
        let options = ParseOptions {
            row_filter: Some(RowFilter::parse("col[0] > 10").unwrap()),
            ..Default::default()
        };
        let decoded = decode(EventType::WriteRowsV2, &body, &options);
        assert_eq!(decoded.raw.len(), EVENT_HEADER_SIZE);
        assert_eq!(decoded.event.rows_count, 2);
        assert_eq!(decoded.event.rows_matched, 0);

        let options = ParseOptions {
            row_filter: Some(RowFilter::parse("col[0] = 2").unwrap()),
            ..Default::default()
        };
        let decoded = decode(EventType::WriteRowsV2, &body, &options);
        assert_eq!(decoded.event.rows, vec![vec![CellValue::Signed(2), CellValue::String("b".into())]]);

        let options = ParseOptions {
            ddl_filter: Some(crate::binlog::filter::DdlFilter::from_lists("other", "", "", "").unwrap()),
            ..Default::default()
        };
        assert_eq!(decode(EventType::WriteRowsV2, &body, &options).raw.len(), EVENT_HEADER_SIZE);
    }

    #[test]
    fn test_decode_value_types() {
        let (v, n) = decode_value(ColumnType::Tiny, 0, true, &[0xFF], false).unwrap();
        assert_eq!((v, n), (CellValue::Unsigned(255), 1));
        let (v, _) = decode_value(ColumnType::Int24, 0, false, &[0xFF, 0xFF, 0xFF], false).unwrap();
        assert_eq!(v, CellValue::Signed(-1));
        let (v, n) = decode_value(ColumnType::NewDecimal, (13 << 8) | 2, false, &[127, 255, 255, 248, 99, 241], false).unwrap();
        assert_eq!((v, n), (CellValue::Decimal("-1948.14".into()), 6));
        let (v, n) = decode_value(ColumnType::Bit, 0x0104, false, &[0x01, 0x02], false).unwrap();
        assert_eq!((v, n), (CellValue::Bit(0x0102), 2));
        let (v, n) = decode_value(ColumnType::Blob, 2, false, &[3, 0, 1, 2, 3], false).unwrap();
        assert_eq!((v, n), (CellValue::Bytes(vec![1, 2, 3]), 5));
        assert!(decode_value(ColumnType::Long, 0, false, &[1, 2], false).is_err());
        assert!(decode_value(ColumnType::Decimal, 0, false, &[1, 2], false).is_err());
    }
}
