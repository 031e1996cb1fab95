//! 압축 프로토콜 프레이밍
//!
//! 압축 프레임 헤더 (7 bytes):
//!   - compressed_len (3 bytes)
//!   - compressed sequence (1 byte)
//!   - uncompressed_len (3 bytes, 0이면 압축하지 않은 원본)

use crate::error::{BinlogError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// 이보다 짧은 페이로드는 압축하지 않고 보냄
pub const MIN_COMPRESS_LENGTH: usize = 50;

const MAX_FRAME_LEN: usize = 0xFF_FFFF;

/// 프로토콜 압축 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Zlib,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionAlgorithm::Zstd => Ok(zstd::stream::encode_all(data, 3)?),
        }
    }

    pub fn decompress(self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            CompressionAlgorithm::None => data.to_vec(),
            CompressionAlgorithm::Zlib => {
                let mut out = Vec::with_capacity(expected_len);
                ZlibDecoder::new(data).read_to_end(&mut out).map_err(|e| {
                    BinlogError::MalformedPacket(format!("zlib decompress failed: {}", e))
                })?;
                out
            }
            CompressionAlgorithm::Zstd => zstd::stream::decode_all(data).map_err(|e| {
                BinlogError::MalformedPacket(format!("zstd decompress failed: {}", e))
            })?,
        };
        if out.len() != expected_len {
            return Err(BinlogError::MalformedPacket(format!(
                "decompressed length {} != declared {}",
                out.len(),
                expected_len
            )));
        }
        Ok(out)
    }
}

/// 압축 프레임 헤더 파싱: (compressed_len, sequence, uncompressed_len)
pub fn parse_frame_header(header: &[u8; COMPRESSED_HEADER_SIZE]) -> (usize, u8, usize) {
    (
        LittleEndian::read_u24(&header[0..3]) as usize,
        header[3],
        LittleEndian::read_u24(&header[4..7]) as usize,
    )
}

/// 압축 프로토콜 상태 (시퀀스 + 아직 소비하지 않은 압축 해제 바이트)
#[derive(Debug)]
pub struct CompressedFramer {
    algorithm: CompressionAlgorithm,
    sequence: u8,
    pending: BytesMut,
}

impl CompressedFramer {
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        CompressedFramer {
            algorithm,
            sequence: 0,
            pending: BytesMut::new(),
        }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 버퍼된 압축 해제 데이터를 out에 채우고 채운 바이트 수 반환
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.pending.len());
        out[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }

    /// 수신한 압축 프레임 본문을 풀어서 버퍼에 추가
    pub fn accept_frame(&mut self, sequence: u8, uncompressed_len: usize, body: &[u8]) -> Result<()> {
        self.sequence = sequence.wrapping_add(1);
        if uncompressed_len == 0 {
            self.pending.extend_from_slice(body);
        } else {
            let data = self.algorithm.decompress(body, uncompressed_len)?;
            self.pending.extend_from_slice(&data);
        }
        Ok(())
    }

    /// 평문 패킷 바이트열(헤더 포함)을 압축 프레임으로 감싸서 out에 기록
    pub fn encode_frames(&mut self, packets: &[u8], out: &mut BytesMut) -> Result<()> {
        for chunk in packets.chunks(MAX_FRAME_LEN) {
            let compressed = if chunk.len() < MIN_COMPRESS_LENGTH {
                None
            } else {
                let c = self.algorithm.compress(chunk)?;
                (c.len() < chunk.len()).then_some(c)
            };
            match compressed {
                Some(body) => {
                    out.put_uint_le(body.len() as u64, 3);
                    out.put_u8(self.sequence);
                    out.put_uint_le(chunk.len() as u64, 3);
                    out.put_slice(&body);
                }
                None => {
                    out.put_uint_le(chunk.len() as u64, 3);
                    out.put_u8(self.sequence);
                    out.put_uint_le(0, 3);
                    out.put_slice(chunk);
                }
            }
            self.sequence = self.sequence.wrapping_add(1);
        }
        Ok(())
    }
}
