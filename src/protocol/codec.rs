//! 프로토콜 기본 타입 인코딩/디코딩
//!
//! length-encoded 정수/문자열, null 종료 문자열, 고정 길이 정수, 비트맵

use crate::error::{BinlogError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;
use std::io::Cursor;

/// `Cursor<&[u8]>` 위에서 MySQL 기본 타입을 읽는 확장 트레이트
///
/// 고정 길이 정수는 byteorder의 `ReadBytesExt`를 그대로 사용하고,
/// 여기서는 복사 없이 원본 슬라이스를 빌려오는 읽기만 제공합니다.
pub trait ReadMysqlExt<'a> {
    /// 남은 바이트 수
    fn remaining(&self) -> usize;

    /// n 바이트를 빌려서 읽기
    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]>;

    /// 남은 바이트 전부
    fn rest(&mut self) -> &'a [u8];

    /// n 바이트 건너뛰기
    fn skip(&mut self, n: usize) -> Result<()> {
        self.take_bytes(n).map(|_| ())
    }

    /// length-encoded 정수 (0xFB는 NULL → None)
    fn read_lenenc_int(&mut self) -> Result<Option<u64>>;

    /// length-encoded 문자열 (NULL → None)
    fn read_lenenc_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        match self.read_lenenc_int()? {
            None => Ok(None),
            Some(len) => {
                let len = usize::try_from(len).map_err(|_| BinlogError::UnexpectedEof)?;
                self.take_bytes(len).map(Some)
            }
        }
    }

    /// length-encoded 문자열을 String으로 (NULL은 빈 문자열)
    fn read_lenenc_string(&mut self) -> Result<String> {
        Ok(self
            .read_lenenc_bytes()?
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default())
    }

    /// null 종료 바이트열 (종료 바이트는 소비하고 결과에서 제외)
    fn read_null_terminated(&mut self) -> Result<&'a [u8]>;

    fn read_null_terminated_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.read_null_terminated()?).into_owned())
    }
}

impl<'a> ReadMysqlExt<'a> for Cursor<&'a [u8]> {
    fn remaining(&self) -> usize {
        let pos = self.position() as usize;
        self.get_ref().len().saturating_sub(pos)
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let buf: &'a [u8] = *self.get_ref();
        let pos = self.position() as usize;
        let end = pos.checked_add(n).ok_or(BinlogError::UnexpectedEof)?;
        if end > buf.len() {
            return Err(BinlogError::UnexpectedEof);
        }
        self.set_position(end as u64);
        Ok(&buf[pos..end])
    }

    fn rest(&mut self) -> &'a [u8] {
        let buf: &'a [u8] = *self.get_ref();
        let pos = (self.position() as usize).min(buf.len());
        self.set_position(buf.len() as u64);
        &buf[pos..]
    }

    fn read_lenenc_int(&mut self) -> Result<Option<u64>> {
        let first = self.take_bytes(1)?[0];
        let value = match first {
            0xFB => return Ok(None),
            0xFC => LittleEndian::read_u16(self.take_bytes(2)?) as u64,
            0xFD => LittleEndian::read_u24(self.take_bytes(3)?) as u64,
            0xFE => LittleEndian::read_u64(self.take_bytes(8)?),
            // 0xFF는 정의되지 않은 prefix (ERR 패킷 헤더와 겹침)
            0xFF => {
                return Err(BinlogError::MalformedPacket(
                    "invalid length-encoded integer prefix 0xff".to_string(),
                ))
            }
            n => n as u64,
        };
        Ok(Some(value))
    }

    fn read_null_terminated(&mut self) -> Result<&'a [u8]> {
        let buf: &'a [u8] = *self.get_ref();
        let pos = (self.position() as usize).min(buf.len());
        match buf[pos..].iter().position(|&b| b == 0) {
            Some(idx) => {
                self.set_position((pos + idx + 1) as u64);
                Ok(&buf[pos..pos + idx])
            }
            None => Err(BinlogError::UnexpectedEof),
        }
    }
}

/// length-encoded 정수 디코딩: (값, 소비한 바이트 수). NULL은 값이 None.
pub fn length_encoded_int(buf: &[u8]) -> Result<(Option<u64>, usize)> {
    let mut cursor = Cursor::new(buf);
    let value = cursor.read_lenenc_int()?;
    Ok((value, cursor.position() as usize))
}

/// length-encoded 문자열 디코딩: (바이트열, 소비한 바이트 수). NULL은 None.
pub fn length_encoded_string(buf: &[u8]) -> Result<(Option<&[u8]>, usize)> {
    let mut cursor = Cursor::new(buf);
    let value = cursor.read_lenenc_bytes()?;
    Ok((value, cursor.position() as usize))
}

/// 1/2/3/4/6/8 바이트 little-endian 정수
pub fn fixed_length_int(buf: &[u8]) -> u64 {
    buf.iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (b as u64) << (8 * i))
}

/// length-encoded 정수를 인코딩했을 때의 크기
pub fn lenenc_int_size(value: u64) -> usize {
    match value {
        0..=250 => 1,
        251..=0xFFFF => 3,
        0x1_0000..=0xFF_FFFF => 4,
        _ => 9,
    }
}

pub fn put_lenenc_int<B: BufMut>(buf: &mut B, value: u64) {
    match value {
        0..=250 => buf.put_u8(value as u8),
        251..=0xFFFF => {
            buf.put_u8(0xFC);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            buf.put_u8(0xFD);
            buf.put_uint_le(value, 3);
        }
        _ => {
            buf.put_u8(0xFE);
            buf.put_u64_le(value);
        }
    }
}

pub fn put_lenenc_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    put_lenenc_int(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn put_null_terminated<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_slice(data);
    buf.put_u8(0);
}

/// 비트맵의 i번째 비트
#[inline]
pub fn bit_is_set(bitmap: &[u8], i: usize) -> bool {
    bitmap
        .get(i / 8)
        .map(|b| b & (1 << (i % 8)) != 0)
        .unwrap_or(false)
}

/// 앞쪽 n개의 비트 중 켜진 비트 수
pub fn popcount(bitmap: &[u8], n: usize) -> usize {
    (0..n).filter(|&i| bit_is_set(bitmap, i)).count()
}

/// n 비트를 담는 비트맵 바이트 수
#[inline]
pub fn bitmap_len(n: usize) -> usize {
    (n + 7) / 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;

    #[test]
    fn test_lenenc_int_forms() {
        assert_eq!(length_encoded_int(&[0xFA]).unwrap(), (Some(250), 1));
        assert_eq!(length_encoded_int(&[0xFB]).unwrap(), (None, 1));
        assert_eq!(length_encoded_int(&[0xFC, 0x34, 0x12]).unwrap(), (Some(0x1234), 3));
        assert_eq!(
            length_encoded_int(&[0xFD, 0x56, 0x34, 0x12]).unwrap(),
            (Some(0x123456), 4)
        );
        let mut eight = vec![0xFE];
        eight.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(length_encoded_int(&eight).unwrap(), (Some(0x0102_0304_0506_0708), 9));
    }

    #[test]
    fn test_lenenc_encode_sizes() {
        for value in [0u64, 250, 251, 0xFFFF, 0x10000, 0xFF_FFFF, 0x100_0000, u64::MAX] {
            let mut buf = Vec::new();
            put_lenenc_int(&mut buf, value);
            assert_eq!(buf.len(), lenenc_int_size(value));
            assert_eq!(length_encoded_int(&buf).unwrap(), (Some(value), buf.len()));
        }
    }

    #[test]
    fn test_lenenc_string_too_long_is_eof() {
        let buf = [0x05, b'a', b'b'];
        assert!(matches!(length_encoded_string(&buf), Err(BinlogError::UnexpectedEof)));
    }

    #[test]
    fn test_lenenc_string_null() {
        assert_eq!(length_encoded_string(&[0xFB]).unwrap(), (None, 1));
        let mut cursor = Cursor::new(&[0xFBu8][..]);
        assert_eq!(cursor.read_lenenc_string().unwrap(), "");
    }

    #[test]
    fn test_cursor_mixed_reads() {
        let data = [0x03, b'a', b'b', b'c', b'x', 0, 0x2A, 0x00];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(cursor.read_lenenc_bytes().unwrap(), Some(&b"abc"[..]));
        assert_eq!(cursor.read_null_terminated().unwrap(), b"x");
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 42);
        assert_eq!(cursor.remaining(), 0);
        assert!(cursor.read_null_terminated().is_err());
    }

    #[test]
    fn test_fixed_length_int() {
        assert_eq!(fixed_length_int(&[0x01, 0x02, 0x03]), 0x030201);
        assert_eq!(fixed_length_int(&[0xFF; 6]), 0xFFFF_FFFF_FFFF);
    }

    #[test]
    fn test_bitmap_helpers() {
        let bitmap = [0b0000_0101, 0b0000_0001];
        assert!(bit_is_set(&bitmap, 0));
        assert!(!bit_is_set(&bitmap, 1));
        assert!(bit_is_set(&bitmap, 8));
        assert_eq!(popcount(&bitmap, 9), 3);
        assert_eq!(popcount(&bitmap, 8), 2);
        assert_eq!(bitmap_len(9), 2);
    }
}
