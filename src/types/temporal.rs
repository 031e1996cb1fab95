//! DATE / TIME / DATETIME / TIMESTAMP 인코딩
//!
//! 두 가지 형식을 다룹니다.
//! - 바이너리 프로토콜 (prepared statement 결과): 길이 0/4/7/11, TIME은 0/8/12
//! - binlog 행 이벤트: 구형 packed 정수와 MySQL 5.6+ 의 *2 형식 (big-endian + fsp)

use crate::error::{BinlogError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::DateTime;

const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;
const TIMEF_INT_OFS: i64 = 0x80_0000;
const TIMEF_OFS: i64 = 0x8000_0000_0000;

fn need(data: &[u8], n: usize) -> Result<()> {
    if data.len() < n {
        Err(BinlogError::UnexpectedEof)
    } else {
        Ok(())
    }
}

/// 바이너리 프로토콜 DATE (길이 0 또는 4 이상)
pub fn format_binary_date(data: &[u8]) -> Result<String> {
    match data.len() {
        0 => Ok("0000-00-00".to_string()),
        n if n >= 4 => Ok(format!(
            "{:04}-{:02}-{:02}",
            LittleEndian::read_u16(&data[0..2]),
            data[2],
            data[3]
        )),
        n => Err(BinlogError::MalformedPacket(format!("invalid DATE length {}", n))),
    }
}

/// 바이너리 프로토콜 DATETIME / TIMESTAMP (길이 0, 4, 7, 11)
pub fn format_binary_datetime(data: &[u8]) -> Result<String> {
    match data.len() {
        0 => Ok("0000-00-00 00:00:00".to_string()),
        4 => Ok(format!("{} 00:00:00", format_binary_date(data)?)),
        7 | 11 => {
            let mut s = format!(
                "{} {:02}:{:02}:{:02}",
                format_binary_date(&data[..4])?,
                data[4],
                data[5],
                data[6]
            );
            if data.len() == 11 {
                s.push_str(&format!(".{:06}", LittleEndian::read_u32(&data[7..11])));
            }
            Ok(s)
        }
        n => Err(BinlogError::MalformedPacket(format!("invalid DATETIME length {}", n))),
    }
}

/// 바이너리 프로토콜 TIME (길이 0, 8, 12). 시간은 days*24 + hours
pub fn format_binary_time(data: &[u8]) -> Result<String> {
    match data.len() {
        0 => Ok("00:00:00".to_string()),
        8 | 12 => {
            let sign = if data[0] == 1 { "-" } else { "" };
            let days = LittleEndian::read_u32(&data[1..5]) as u64;
            let hours = days * 24 + data[5] as u64;
            let mut s = format!("{}{:02}:{:02}:{:02}", sign, hours, data[6], data[7]);
            if data.len() == 12 {
                s.push_str(&format!(".{:06}", LittleEndian::read_u32(&data[8..12])));
            }
            Ok(s)
        }
        n => Err(BinlogError::MalformedPacket(format!("invalid TIME length {}", n))),
    }
}

/// "YYYY-MM-DD[ HH:MM:SS[.ffffff]]" → 바이너리 프로토콜 DATETIME
pub fn encode_binary_datetime(text: &str) -> Result<Vec<u8>> {
    let invalid = || BinlogError::ProtocolError(format!("invalid datetime literal '{}'", text));
    let (date, time) = text.split_once(' ').unwrap_or((text, ""));
    let mut parts = date.splitn(3, '-').map(|p| p.parse::<u32>());
    let year = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
    let month = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
    let day = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;

    let mut out = Vec::with_capacity(12);
    out.push(0);
    out.extend_from_slice(&(year as u16).to_le_bytes());
    out.push(month as u8);
    out.push(day as u8);
    if time.is_empty() {
        out[0] = 4;
        return Ok(out);
    }
    let (hms, frac) = time.split_once('.').unwrap_or((time, ""));
    let mut hms = hms.splitn(3, ':').map(|p| p.parse::<u8>());
    for _ in 0..3 {
        out.push(hms.next().ok_or_else(invalid)?.map_err(|_| invalid())?);
    }
    if frac.is_empty() {
        out[0] = 7;
    } else {
        let micros: u32 = format!("{:0<6}", &frac[..frac.len().min(6)])
            .parse()
            .map_err(|_| invalid())?;
        out.extend_from_slice(&micros.to_le_bytes());
        out[0] = 11;
    }
    Ok(out)
}

/// binlog DATE (3 bytes LE)
pub fn decode_date(data: &[u8]) -> Result<String> {
    need(data, 3)?;
    let v = LittleEndian::read_u24(data);
    if v == 0 {
        return Ok("0000-00-00".to_string());
    }
    Ok(format!("{:04}-{:02}-{:02}", v >> 9, (v >> 5) & 0x0F, v & 0x1F))
}

/// binlog 구형 TIME (3 bytes LE, HHMMSS)
pub fn decode_time(data: &[u8]) -> Result<String> {
    need(data, 3)?;
    let raw = LittleEndian::read_i24(data);
    let sign = if raw < 0 { "-" } else { "" };
    let v = raw.unsigned_abs();
    Ok(format!("{}{:02}:{:02}:{:02}", sign, v / 10000, (v % 10000) / 100, v % 100))
}

/// binlog 구형 DATETIME (8 bytes LE, YYYYMMDDhhmmss)
pub fn decode_datetime(data: &[u8]) -> Result<String> {
    need(data, 8)?;
    let v = LittleEndian::read_u64(data);
    let date = v / 1_000_000;
    let time = v % 1_000_000;
    Ok(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        date / 10000,
        (date % 10000) / 100,
        date % 100,
        time / 10000,
        (time % 10000) / 100,
        time % 100
    ))
}

/// binlog TIMESTAMP (4 bytes LE, unix 초) → UTC 문자열
pub fn decode_timestamp(data: &[u8]) -> Result<String> {
    need(data, 4)?;
    Ok(format_unix(LittleEndian::read_u32(data) as i64, 0, 0))
}

/// fsp 자리수에 해당하는 소수 바이트 수
fn frac_bytes(fsp: u8) -> usize {
    (fsp as usize + 1) / 2
}

/// 소수부를 마이크로초로
fn read_frac(data: &[u8], fsp: u8) -> u32 {
    match fsp {
        1 | 2 => data[0] as u32 * 10_000,
        3 | 4 => BigEndian::read_u16(data) as u32 * 100,
        5 | 6 => BigEndian::read_u24(data),
        _ => 0,
    }
}

fn push_frac(s: &mut String, micros: u32, fsp: u8) {
    if fsp > 0 {
        let digits = format!("{:06}", micros);
        s.push('.');
        s.push_str(&digits[..(fsp as usize).min(6)]);
    }
}

fn format_unix(secs: i64, micros: u32, fsp: u8) -> String {
    if secs == 0 && micros == 0 {
        let mut s = "0000-00-00 00:00:00".to_string();
        push_frac(&mut s, 0, fsp);
        return s;
    }
    let mut s = DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string());
    push_frac(&mut s, micros, fsp);
    s
}

/// binlog TIMESTAMP2 (4 bytes BE + 소수). 반환: (문자열, 소비 바이트)
pub fn decode_timestamp2(data: &[u8], fsp: u8) -> Result<(String, usize)> {
    let n = 4 + frac_bytes(fsp);
    need(data, n)?;
    let secs = BigEndian::read_u32(data) as i64;
    let micros = read_frac(&data[4..], fsp);
    Ok((format_unix(secs, micros, fsp), n))
}

/// binlog DATETIME2 (5 bytes BE packed + 소수)
pub fn decode_datetime2(data: &[u8], fsp: u8) -> Result<(String, usize)> {
    let n = 5 + frac_bytes(fsp);
    need(data, n)?;
    let int_part = BigEndian::read_uint(data, 5) as i64 - DATETIMEF_INT_OFS;
    let micros = read_frac(&data[5..], fsp);
    if int_part == 0 {
        let mut s = "0000-00-00 00:00:00".to_string();
        push_frac(&mut s, micros, fsp);
        return Ok((s, n));
    }
    let v = int_part.unsigned_abs();
    let ymd = v >> 17;
    let ym = ymd >> 5;
    let hms = v % (1 << 17);
    let mut s = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        ym / 13,
        ym % 13,
        ymd % (1 << 5),
        hms >> 12,
        (hms >> 6) % (1 << 6),
        hms % (1 << 6)
    );
    push_frac(&mut s, micros, fsp);
    Ok((s, n))
}

/// binlog TIME2 (3 bytes BE + 소수, 음수 지원)
pub fn decode_time2(data: &[u8], fsp: u8) -> Result<(String, usize)> {
    let n = 3 + frac_bytes(fsp);
    need(data, n)?;
    let (int_part, frac) = match fsp {
        1 | 2 => {
            let mut int_part = BigEndian::read_uint(data, 3) as i64 - TIMEF_INT_OFS;
            let mut frac = data[3] as i64;
            if int_part < 0 && frac > 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part, frac * 10_000)
        }
        3 | 4 => {
            let mut int_part = BigEndian::read_uint(data, 3) as i64 - TIMEF_INT_OFS;
            let mut frac = BigEndian::read_u16(&data[3..5]) as i64;
            if int_part < 0 && frac > 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part, frac * 100)
        }
        5 | 6 => {
            let tmp = BigEndian::read_uint(data, 6) as i64 - TIMEF_OFS;
            let int_part = tmp >> 24;
            let frac = tmp - (int_part << 24);
            (int_part, frac)
        }
        _ => (BigEndian::read_uint(data, 3) as i64 - TIMEF_INT_OFS, 0),
    };

    let sign = if int_part < 0 || frac < 0 { "-" } else { "" };
    let int_part = int_part.unsigned_abs();
    let frac = frac.unsigned_abs() as u32;
    let mut s = format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        (int_part >> 12) % (1 << 10),
        (int_part >> 6) % (1 << 6),
        int_part % (1 << 6)
    );
    push_frac(&mut s, frac, fsp);
    Ok((s, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_datetime_lengths() {
        assert_eq!(format_binary_datetime(&[]).unwrap(), "0000-00-00 00:00:00");
        let d4 = [0xE8, 0x07, 3, 15];
        assert_eq!(format_binary_datetime(&d4).unwrap(), "2024-03-15 00:00:00");
        let d7 = [0xE8, 0x07, 3, 15, 10, 20, 30];
        assert_eq!(format_binary_datetime(&d7).unwrap(), "2024-03-15 10:20:30");
        let d11 = [0xE8, 0x07, 3, 15, 10, 20, 30, 0x40, 0xE2, 0x01, 0x00];
        assert_eq!(format_binary_datetime(&d11).unwrap(), "2024-03-15 10:20:30.123456");
        assert!(format_binary_datetime(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_binary_time() {
        assert_eq!(format_binary_time(&[]).unwrap(), "00:00:00");
        let t = [1, 1, 0, 0, 0, 2, 3, 4];
        assert_eq!(format_binary_time(&t).unwrap(), "-26:03:04");
        let t12 = [0, 0, 0, 0, 0, 1, 2, 3, 0x0A, 0, 0, 0];
        assert_eq!(format_binary_time(&t12).unwrap(), "01:02:03.000010");
    }

    #[test]
    fn test_encode_binary_datetime() {
        let enc = encode_binary_datetime("2024-03-15 10:20:30.5").unwrap();
        assert_eq!(enc[0], 11);
        assert_eq!(format_binary_datetime(&enc[1..]).unwrap(), "2024-03-15 10:20:30.500000");
        let date_only = encode_binary_datetime("2024-03-15").unwrap();
        assert_eq!(date_only[0], 4);
        assert!(encode_binary_datetime("yesterday").is_err());
    }

    #[test]
    fn test_decode_date() {
        // 2024-03-15 → 2024*512 + 3*32 + 15
        let v: u32 = 2024 * 512 + 3 * 32 + 15;
        let bytes = v.to_le_bytes();
        assert_eq!(decode_date(&bytes[..3]).unwrap(), "2024-03-15");
    }

    #[test]
    fn test_decode_datetime2() {
        // 2024-03-15 10:20:30, fsp=0
        let ym: i64 = 2024 * 13 + 3;
        let ymd = (ym << 5) | 15;
        let hms = (10 << 12) | (20 << 6) | 30;
        let packed = ((ymd << 17) | hms) + DATETIMEF_INT_OFS;
        let bytes = packed.to_be_bytes();
        let (s, n) = decode_datetime2(&bytes[3..], 0).unwrap();
        assert_eq!(s, "2024-03-15 10:20:30");
        assert_eq!(n, 5);

        let mut with_frac = bytes[3..].to_vec();
        with_frac.extend_from_slice(&[0x01, 0xE2, 0x40]);
        let (s, n) = decode_datetime2(&with_frac, 6).unwrap();
        assert_eq!(s, "2024-03-15 10:20:30.123456");
        assert_eq!(n, 8);
    }

    #[test]
    fn test_decode_time2() {
        let hms: i64 = (1 << 12) | (2 << 6) | 3;
        let bytes = (hms + TIMEF_INT_OFS).to_be_bytes();
        assert_eq!(decode_time2(&bytes[5..], 0).unwrap(), ("01:02:03".to_string(), 3));
        let neg = (TIMEF_INT_OFS - hms).to_be_bytes();
        assert_eq!(decode_time2(&neg[5..], 0).unwrap().0, "-01:02:03");
    }

    #[test]
    fn test_decode_timestamp2() {
        let mut data = 1_700_000_000u32.to_be_bytes().to_vec();
        data.push(50);
        let (s, n) = decode_timestamp2(&data, 2).unwrap();
        assert_eq!(s, "2023-11-14 22:13:20.50");
        assert_eq!(n, 5);
        assert_eq!(decode_timestamp2(&[0, 0, 0, 0], 0).unwrap().0, "0000-00-00 00:00:00");
    }

    #[test]
    fn test_decode_old_time_and_datetime() {
        let t = 102030i32.to_le_bytes();
        assert_eq!(decode_time(&t[..3]).unwrap(), "10:20:30");
        let dt = 20240315102030u64.to_le_bytes();
        assert_eq!(decode_datetime(&dt).unwrap(), "2024-03-15 10:20:30");
    }
}
