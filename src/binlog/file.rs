//! 로컬 binlog 파일 파서
//!
//! 파일 구조: 매직 `0xFE 'bin'` 다음에 이벤트가 이어지고, 첫 이벤트는
//! FORMAT_DESCRIPTION 입니다. 파일 하나를 다 읽으면 `FakeDone` 이벤트를 하나
//! 만들어 콜백에 넘깁니다.

use super::{BinlogParser, ParseOptions};
use crate::error::{BinlogError, Result};
use crate::events::{BinlogEvent, EventHeader, EventType, BINLOG_MAGIC, EVENT_HEADER_SIZE};
use crate::protocol::MAX_ALLOWED_PACKET_LIMIT;
use chrono::NaiveDateTime;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 시간/위치 범위 필터
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeFilter {
    /// 이 시각 이전 이벤트는 건너뜀 (unix 초)
    pub start_ts: Option<u32>,
    /// 이 시각 이후 이벤트에서 중단
    pub stop_ts: Option<u32>,
    /// 이 위치 이전 이벤트는 건너뜀
    pub start_pos: Option<u64>,
    /// 이 위치 이후 이벤트에서 중단
    pub stop_pos: Option<u64>,
}

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// "YYYY-MM-DD HH:MM:SS" (UTC) → unix 초
pub fn parse_datetime(text: &str) -> Result<u32> {
    let dt = NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT)
        .map_err(|e| BinlogError::ConfigError(format!("Invalid datetime '{}': {}", text, e)))?;
    u32::try_from(dt.and_utc().timestamp())
        .map_err(|_| BinlogError::ConfigError(format!("Datetime '{}' out of range", text)))
}

impl TimeFilter {
    pub fn from_datetimes(start: Option<&str>, stop: Option<&str>) -> Result<Self> {
        Ok(TimeFilter {
            start_ts: start.map(parse_datetime).transpose()?,
            stop_ts: stop.map(parse_datetime).transpose()?,
            start_pos: None,
            stop_pos: None,
        })
    }

    /// 콜백 전에 건너뛸 이벤트인지
    fn skip(&self, header: &EventHeader, offset: u64) -> bool {
        if self.start_pos.is_some_and(|start| offset < start) {
            return true;
        }
        // timestamp 0 은 서버가 만든 가짜 이벤트
        header.timestamp != 0 && self.start_ts.is_some_and(|start| header.timestamp < start)
    }

    /// 여기서 읽기를 끝낼지
    fn stop(&self, header: &EventHeader, offset: u64) -> bool {
        if self.stop_pos.is_some_and(|stop| offset >= stop) {
            return true;
        }
        header.timestamp != 0 && self.stop_ts.is_some_and(|stop| header.timestamp > stop)
    }
}

/// 파일 하나의 파싱 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// 파일 끝까지 읽음
    Completed,
    /// stop 조건에 걸려 중단
    Stopped,
}

/// 이름의 마지막 숫자 그룹을 1 증가 ("mysql-bin.000009" → "mysql-bin.000010")
pub fn next_file_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let end = bytes.iter().rposition(u8::is_ascii_digit)? + 1;
    let start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map(|p| p + 1)
        .unwrap_or(0);
    let digits = &name[start..end];
    let next = digits.parse::<u64>().ok()?.checked_add(1)?;
    Some(format!(
        "{}{:0width$}{}",
        &name[..start],
        next,
        &name[end..],
        width = digits.len()
    ))
}

/// 파일 단위 binlog 파서
#[derive(Debug)]
pub struct FileParser {
    parser: BinlogParser,
    filter: TimeFilter,
}

impl FileParser {
    pub fn new(options: ParseOptions, filter: TimeFilter) -> Result<Self> {
        Ok(FileParser {
            parser: BinlogParser::new(options)?,
            filter,
        })
    }

    pub fn parser(&self) -> &BinlogParser {
        &self.parser
    }

    pub fn filter(&self) -> &TimeFilter {
        &self.filter
    }

    /// 파일 하나 파싱. `start_offset` 이전 이벤트는 FORMAT_DESCRIPTION 외에는 디코딩하지 않음
    pub fn parse_file<F>(&mut self, path: impl AsRef<Path>, start_offset: u64, on_event: F) -> Result<ParseOutcome>
    where
        F: FnMut(&BinlogEvent) -> Result<()>,
    {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| BinlogError::IoError(format!("{}: {}", path.display(), e)))?;
        info!("Parsing binlog file {}", path.display());
        let filter = self.filter;
        self.parse_with_filter(BufReader::new(file), start_offset, filter, on_event)
    }

    /// 임의의 reader (stdin, 파이프) 에서 파싱
    pub fn parse_reader<R, F>(&mut self, reader: R, start_offset: u64, on_event: F) -> Result<ParseOutcome>
    where
        R: Read,
        F: FnMut(&BinlogEvent) -> Result<()>,
    {
        let filter = self.filter;
        self.parse_with_filter(reader, start_offset, filter, on_event)
    }

    /// `first` 부터 숫자를 올려가며 `stop_file` 까지 (없으면 존재하는 마지막 파일까지) 파싱.
    /// start 위치는 첫 파일에만, stop 위치는 마지막 파일에만 적용
    pub fn parse_files<F>(&mut self, first: impl AsRef<Path>, stop_file: Option<&str>, mut on_event: F) -> Result<()>
    where
        F: FnMut(&BinlogEvent) -> Result<()>,
    {
        let mut path: PathBuf = first.as_ref().to_path_buf();
        let mut is_first = true;
        loop {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| BinlogError::ConfigError(format!("Invalid binlog path {}", path.display())))?;
            let next = next_file_name(&name).map(|n| path.with_file_name(n));
            let is_last = match stop_file {
                Some(stop) => name == stop,
                None => next.as_ref().map_or(true, |n| !n.exists()),
            };

            let mut filter = self.filter;
            if !is_first {
                filter.start_pos = None;
            }
            if !is_last {
                filter.stop_pos = None;
            }
            let file = File::open(&path)
                .map_err(|e| BinlogError::IoError(format!("{}: {}", path.display(), e)))?;
            info!("Parsing binlog file {}", path.display());
            let outcome = self.parse_with_filter(BufReader::new(file), 0, filter, &mut on_event)?;
            if outcome == ParseOutcome::Stopped || is_last {
                return Ok(());
            }
            match next {
                Some(next) => path = next,
                None => return Ok(()),
            }
            is_first = false;
        }
    }

    fn parse_with_filter<R, F>(
        &mut self,
        mut reader: R,
        start_offset: u64,
        filter: TimeFilter,
        mut on_event: F,
    ) -> Result<ParseOutcome>
    where
        R: Read,
        F: FnMut(&BinlogEvent) -> Result<()>,
    {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        BinlogParser::verify_magic(&magic)?;
        self.parser.reset();

        let mut offset = BINLOG_MAGIC.len() as u64;
        let mut last: Option<EventHeader> = None;
        let mut outcome = ParseOutcome::Completed;

        while let Some(raw) = read_event(&mut reader)? {
            let header = EventHeader::parse(&raw)?;
            let event_offset = offset;
            offset += raw.len() as u64;
            last = Some(header);

            let is_fde = header.event_type == EventType::FormatDescription;
            if !is_fde && event_offset < start_offset {
                continue;
            }
            if !is_fde && filter.stop(&header, event_offset) {
                debug!("Stop condition reached at offset {}", event_offset);
                outcome = ParseOutcome::Stopped;
                break;
            }
            let event = self.parser.parse_event(&raw)?;
            if !is_fde && filter.skip(&header, event_offset) {
                continue;
            }
            on_event(&event)?;
        }

        let (timestamp, server_id) = last.map(|h| (h.timestamp, h.server_id)).unwrap_or((0, 0));
        on_event(&BinlogEvent::fake_done(timestamp, server_id, offset as u32))?;
        Ok(outcome)
    }
}

/// 이벤트 하나 읽기. 이벤트 경계에서 끝나면 None
fn read_event<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; EVENT_HEADER_SIZE];
    let mut filled = 0;
    while filled < EVENT_HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(BinlogError::UnexpectedEof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let size = EventHeader::parse(&header)?.event_size as usize;
    if !(EVENT_HEADER_SIZE..=MAX_ALLOWED_PACKET_LIMIT as usize).contains(&size) {
        return Err(BinlogError::BinlogParseError(format!("invalid event size {}", size)));
    }
    let mut raw = vec![0u8; size];
    raw[..EVENT_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut raw[EVENT_HEADER_SIZE..])?;
    Ok(Some(raw))
}
