//! DECIMAL (NEWDECIMAL) 바이너리 형식
//!
//! 정수부/소수부를 각각 9자리 단위(4 bytes, big-endian)로 묶고 나머지 자리수는
//! 최소 바이트로 저장합니다. 부호 비트는 반전되어 있고 음수는 전체 비트가 반전됩니다.

use crate::error::{BinlogError, Result};

const DIGITS_PER_WORD: usize = 9;
const WORD_SIZE: usize = 4;
const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// (precision, scale) DECIMAL이 차지하는 바이트 수
pub fn decimal_bin_size(precision: usize, scale: usize) -> usize {
    let integral = precision.saturating_sub(scale);
    let int_words = integral / DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    int_words * WORD_SIZE
        + DIG_TO_BYTES[integral % DIGITS_PER_WORD]
        + frac_words * WORD_SIZE
        + DIG_TO_BYTES[scale % DIGITS_PER_WORD]
}

/// DECIMAL 디코딩. 반환: ("[-]d*.d*", 소비한 바이트 수)
pub fn decode_decimal(data: &[u8], precision: usize, scale: usize) -> Result<(String, usize)> {
    if scale > precision || precision == 0 {
        return Err(BinlogError::BinlogParseError(format!(
            "invalid decimal precision {} scale {}",
            precision, scale
        )));
    }
    let size = decimal_bin_size(precision, scale);
    if data.len() < size {
        return Err(BinlogError::UnexpectedEof);
    }

    let mut buf = data[..size].to_vec();
    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        for b in buf.iter_mut() {
            *b = !*b;
        }
    }

    let integral = precision - scale;
    let int_words = integral / DIGITS_PER_WORD;
    let int_leftover = integral % DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    let frac_leftover = scale % DIGITS_PER_WORD;

    let mut pos = 0;
    let mut take = |n: usize| -> u32 {
        let v = buf[pos..pos + n]
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32);
        pos += n;
        v
    };

    let mut digits = String::with_capacity(precision + 2);
    if int_leftover > 0 {
        let v = take(DIG_TO_BYTES[int_leftover]);
        digits.push_str(&format!("{:0width$}", v, width = int_leftover));
    }
    for _ in 0..int_words {
        let v = take(WORD_SIZE);
        digits.push_str(&format!("{:09}", v));
    }
    let trimmed = digits.trim_start_matches('0');
    let mut result = String::with_capacity(precision + 2);
    if negative {
        result.push('-');
    }
    result.push_str(if trimmed.is_empty() { "0" } else { trimmed });

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            let v = take(WORD_SIZE);
            result.push_str(&format!("{:09}", v));
        }
        if frac_leftover > 0 {
            let v = take(DIG_TO_BYTES[frac_leftover]);
            result.push_str(&format!("{:0width$}", v, width = frac_leftover));
        }
    }

    Ok((result, size))
}

/// DECIMAL 문자열을 바이너리로 인코딩 (테스트 서버 및 행 이벤트 생성용)
pub fn encode_decimal(value: &str, precision: usize, scale: usize) -> Result<Vec<u8>> {
    let (negative, body) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (int_str, frac_str) = body.split_once('.').unwrap_or((body, ""));
    let integral = precision.saturating_sub(scale);
    let int_str = int_str.trim_start_matches('0');
    if int_str.len() > integral || !int_str.bytes().chain(frac_str.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(BinlogError::BinlogParseError(format!(
            "value {} does not fit DECIMAL({},{})",
            value, precision, scale
        )));
    }

    let int_digits = format!("{:0>width$}", int_str, width = integral);
    let mut frac_digits: String = frac_str.chars().take(scale).collect();
    while frac_digits.len() < scale {
        frac_digits.push('0');
    }

    let mut out = Vec::with_capacity(decimal_bin_size(precision, scale));
    let mut put = |digits: &str| {
        let n = digits.len();
        let v: u32 = digits.parse().unwrap_or(0);
        let bytes = v.to_be_bytes();
        let size = if n == DIGITS_PER_WORD { WORD_SIZE } else { DIG_TO_BYTES[n] };
        out.extend_from_slice(&bytes[WORD_SIZE - size..]);
    };

    let leftover = integral % DIGITS_PER_WORD;
    if leftover > 0 {
        put(&int_digits[..leftover]);
    }
    for chunk in int_digits.as_bytes()[leftover..].chunks(DIGITS_PER_WORD) {
        put(std::str::from_utf8(chunk).unwrap_or("0"));
    }
    for chunk in frac_digits.as_bytes().chunks(DIGITS_PER_WORD) {
        put(std::str::from_utf8(chunk).unwrap_or("0"));
    }

    if negative {
        for b in out.iter_mut() {
            *b = !*b;
        }
    }
    if let Some(first) = out.first_mut() {
        *first ^= 0x80;
    }
    Ok(out)
}
