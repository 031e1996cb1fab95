//! 바이트 버퍼 풀
//!
//! 패킷 조립에 쓰는 `BytesMut`를 재사용합니다. lock-free 큐에 보관하며
//! 64 KiB 이하 버퍼만 돌려받습니다.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// 풀에 보관하는 버퍼의 최대 용량
pub const MAX_POOLED_CAPACITY: usize = 64 * 1024;

const DEFAULT_INITIAL_CAPACITY: usize = 4 * 1024;
const DEFAULT_POOL_SIZE: usize = 64;

#[derive(Clone)]
pub struct BufferPool {
    free: Arc<ArrayQueue<BytesMut>>,
    initial_capacity: usize,
}

impl BufferPool {
    pub fn new(size: usize, initial_capacity: usize) -> Self {
        BufferPool {
            free: Arc::new(ArrayQueue::new(size.max(1))),
            initial_capacity: initial_capacity.min(MAX_POOLED_CAPACITY),
        }
    }

    /// 비어 있는 버퍼 하나 꺼내기 (없으면 새로 할당)
    pub fn get(&self) -> BytesMut {
        self.free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.initial_capacity))
    }

    /// 버퍼 반납. 길이는 0으로 초기화되고, 너무 크거나 풀이 가득 차면 버려짐
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let _ = self.free.push(buf);
    }

    /// 현재 보관 중인 버퍼 수
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(DEFAULT_POOL_SIZE, DEFAULT_INITIAL_CAPACITY)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.free.len())
            .field("capacity", &self.free.capacity())
            .finish()
    }
}
