mod common;

use common::*;
use rust_mysql_binlog::binlog::FileParser;
use rust_mysql_binlog::config::DumpOptions;
use rust_mysql_binlog::error::BinlogError;
use rust_mysql_binlog::events::{BinlogEvent, EventData, EventType, BINLOG_MAGIC};
use rust_mysql_binlog::types::CellValue;
use std::fs;
use std::path::Path;

/// 매직 + FDE + 트랜잭션 하나. log_pos 는 이벤트 끝 오프셋
fn binlog_file(gno: u64, id: i32) -> Vec<u8> {
    let bodies = vec![
        (EventType::FormatDescription, fde_body()),
        (EventType::Gtid, gtid_body(SERVER_UUID, gno)),
        (EventType::Query, query_body("test", "BEGIN")),
        (EventType::TableMap, table_map_body(9, "test", "t1")),
        (EventType::WriteRowsV2, write_rows_body(9, id, "row")),
        (EventType::Xid, xid_body(gno)),
    ];
    let mut data = BINLOG_MAGIC.to_vec();
    for (event_type, body) in bodies {
        let end = data.len() + 19 + body.len() + 4;
        data.extend_from_slice(&build_event(event_type, end as u32, &body, true));
    }
    data
}

fn write_files(dir: &Path) {
    fs::write(dir.join("mysql-bin.000001"), binlog_file(1, 1)).unwrap();
    fs::write(dir.join("mysql-bin.000002"), binlog_file(2, 2)).unwrap();
    fs::write(dir.join("mysql-bin.000003"), binlog_file(3, 3)).unwrap();
}

fn run(options: &DumpOptions, first: &Path) -> Vec<BinlogEvent> {
    let mut parser = FileParser::new(options.parse_options().unwrap(), options.time_filter().unwrap()).unwrap();
    let mut events = Vec::new();
    parser
        .parse_files(first, options.stop_file.as_deref(), |event| {
            events.push(event.clone());
            Ok(())
        })
        .unwrap();
    events
}

fn written_ids(events: &[BinlogEvent]) -> Vec<CellValue> {
    events
        .iter()
        .filter(|e| !e.is_skipped())
        .filter_map(|e| match &e.data {
            EventData::Rows(rows) => rows.rows.first().map(|row| row[0].clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_files_in_sequence_until_stop_file() {
    let dir = tempfile::tempdir().unwrap();
    write_files(dir.path());
    let options = DumpOptions {
        stop_file: Some("mysql-bin.000002".to_string()),
        ..Default::default()
    };
    let events = run(&options, &dir.path().join("mysql-bin.000001"));
    let done = events.iter().filter(|e| e.header.event_type == EventType::FakeDone).count();
    assert_eq!(done, 2);
    assert_eq!(written_ids(&events), vec![CellValue::Signed(1), CellValue::Signed(2)]);
}

#[test]
fn test_positions_apply_to_first_and_last_file() {
    let dir = tempfile::tempdir().unwrap();
    write_files(dir.path());
    let table_map_offset = binlog_offset_of(EventType::TableMap);
    let options = DumpOptions {
        // 첫 파일은 TABLE_MAP 부터, 마지막 파일은 TABLE_MAP 전에서 멈춤
        start_position: Some(table_map_offset),
        stop_position: Some(table_map_offset),
        ..Default::default()
    };
    let events = run(&options, &dir.path().join("mysql-bin.000001"));
    assert_eq!(written_ids(&events), vec![CellValue::Signed(1), CellValue::Signed(2)]);

    let first_file: Vec<EventType> = events
        .iter()
        .take_while(|e| e.header.event_type != EventType::FakeDone)
        .map(|e| e.header.event_type)
        .collect();
    assert_eq!(
        first_file,
        vec![EventType::FormatDescription, EventType::TableMap, EventType::WriteRowsV2, EventType::Xid]
    );
    assert_eq!(events.last().map(|e| e.header.event_type), Some(EventType::FakeDone));
}

/// binlog_file 안에서 해당 이벤트의 시작 오프셋
fn binlog_offset_of(target: EventType) -> u64 {
    let data = binlog_file(1, 1);
    let mut offset = 4;
    while offset < data.len() {
        let size = u32::from_le_bytes([data[offset + 9], data[offset + 10], data[offset + 11], data[offset + 12]]);
        if data[offset + 4] == target.as_u8() {
            return offset as u64;
        }
        offset += size as usize;
    }
    panic!("{:?} not found", target)
}

#[test]
fn test_flashback_and_database_filter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mysql-bin.000001");
    fs::write(&path, binlog_file(1, 7)).unwrap();

    let options = DumpOptions {
        flashback: true,
        ..Default::default()
    };
    let events = run(&options, &path);
    let rows: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.data, EventData::Rows(_)))
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].header.event_type, EventType::DeleteRowsV2);
    assert_eq!(rows[0].raw[4], EventType::DeleteRowsV2.as_u8());

    let options = DumpOptions {
        databases: "other".to_string(),
        ..Default::default()
    };
    let events = run(&options, &path);
    assert!(written_ids(&events).is_empty());
    let table_map = events
        .iter()
        .find(|e| e.header.event_type == EventType::TableMap)
        .unwrap();
    assert!(table_map.is_skipped());
}

#[test]
fn test_rewrite_db_and_row_filter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mysql-bin.000001");
    fs::write(&path, binlog_file(1, 7)).unwrap();

    let options = DumpOptions {
        rewrite_db: Some("test:test_copy".to_string()),
        rows_filter: Some("col[0] > 5".to_string()),
        ..Default::default()
    };
    let events = run(&options, &path);
    let schemas: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.data {
            EventData::Query(q) => Some(q.schema.as_str()),
            EventData::TableMap(t) => Some(t.schema.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(schemas, vec!["test_copy", "test_copy"]);
    assert_eq!(written_ids(&events), vec![CellValue::Signed(7)]);

    let options = DumpOptions {
        rows_filter: Some("col[0] > 10".to_string()),
        ..Default::default()
    };
    assert!(written_ids(&run(&options, &path)).is_empty());
}

#[test]
fn test_database_filter_with_rewrite_db() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mysql-bin.000001");
    fs::write(&path, binlog_file(1, 7)).unwrap();

    let options = DumpOptions {
        databases: "test".to_string(),
        rewrite_db: Some("test:test_copy".to_string()),
        ..Default::default()
    };
    let events = run(&options, &path);
    assert_eq!(written_ids(&events), vec![CellValue::Signed(7)]);
    let rows = events
        .iter()
        .find(|e| e.header.event_type == EventType::WriteRowsV2)
        .unwrap();
    assert!(!rows.is_skipped());
    match &rows.data {
        EventData::Rows(r) => assert_eq!(r.table.as_ref().map(|t| t.schema.as_str()), Some("test_copy")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_stdin_style_reader_and_bad_magic() {
    let data = binlog_file(4, 4);
    let mut parser = FileParser::new(Default::default(), Default::default()).unwrap();
    let mut count = 0;
    parser
        .parse_reader(data.as_slice(), 0, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
    // 이벤트 6개 + FakeDone
    assert_eq!(count, 7);

    let result = parser.parse_reader(&b"\x00\x00\x00\x00"[..], 0, |_| Ok(()));
    assert!(matches!(result, Err(BinlogError::BinlogParseError(_))));

    // 이벤트 중간에서 끝난 파일
    let truncated = &data[..data.len() - 10];
    let result = parser.parse_reader(truncated, 0, |_| Ok(()));
    assert!(matches!(result, Err(BinlogError::UnexpectedEof)));
}
