//! Lock-free 单生产者单消费者环形缓冲区
//!
//! 写入模式下：调用方线程（生产者）写入，引擎线程（消费者）读出
//! - 零锁：双方都只做原子读写
//! - 零分配：容量在创建时一次性分配
//! - 读写游标各自独占 cache line，避免 false sharing

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// SPSC 环形缓冲区
///
/// 游标单调递增（wrapping），通过 mask 取下标，容量必须是 2 的幂
pub struct RingBuffer<T: Copy + Default> {
    slots: Box<[UnsafeCell<T>]>,
    mask: usize,

    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,

    memory_locked: AtomicBool,
}

unsafe impl<T: Copy + Default + Send> Send for RingBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// capacity 必须是 2 的幂
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");

        let slots: Vec<UnsafeCell<T>> = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 向上取整到 2 的幂
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self::new(min_capacity.max(1).next_power_of_two())
    }

    /// 锁定缓冲区内存，避免引擎线程读到换出的页
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.slots.as_ptr() as *const libc::c_void;
        let len = self.slots.len() * std::mem::size_of::<UnsafeCell<T>>();

        if unsafe { libc::mlock(ptr, len) } == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        let ptr = self.slots.as_ptr() as *const libc::c_void;
        let len = self.slots.len() * std::mem::size_of::<UnsafeCell<T>>();
        unsafe {
            libc::munlock(ptr, len);
        }
    }

    /// 生产者写入，返回实际写入数，从不阻塞
    #[inline]
    pub fn push_slice(&self, data: &[T]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        let used = tail.wrapping_sub(head);
        debug_assert!(used <= self.slots.len());

        let n = data.len().min(self.slots.len() - used);
        for (i, &value) in data[..n].iter().enumerate() {
            let idx = tail.wrapping_add(i) & self.mask;
            unsafe {
                *self.slots[idx].get() = value;
            }
        }

        self.tail.store(tail.wrapping_add(n), Ordering::Release);
        n
    }

    /// 消费者读出，返回实际读出数，从不阻塞
    #[inline]
    pub fn pop_slice(&self, output: &mut [T]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let n = output.len().min(tail.wrapping_sub(head));
        for (i, slot) in output[..n].iter_mut().enumerate() {
            let idx = head.wrapping_add(i) & self.mask;
            *slot = unsafe { *self.slots[idx].get() };
        }

        self.head.store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// 可读数量
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 可写空间
    #[inline]
    pub fn free_space(&self) -> usize {
        self.slots.len() - self.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T: Copy + Default> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let rb = RingBuffer::<i16>::new(8);
        assert_eq!(rb.push_slice(&[1, 2, 3]), 3);
        assert_eq!(rb.len(), 3);

        let mut out = [0i16; 3];
        assert_eq!(rb.pop_slice(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_wrap_around() {
        let rb = RingBuffer::<i16>::new(4);
        assert_eq!(rb.push_slice(&[1, 2, 3, 4]), 4);

        let mut half = [0i16; 2];
        rb.pop_slice(&mut half);
        assert_eq!(half, [1, 2]);

        assert_eq!(rb.push_slice(&[5, 6]), 2);
        let mut all = [0i16; 4];
        assert_eq!(rb.pop_slice(&mut all), 4);
        assert_eq!(all, [3, 4, 5, 6]);
    }

    #[test]
    fn test_full_and_empty() {
        let rb = RingBuffer::<i16>::new(4);
        assert_eq!(rb.push_slice(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(rb.free_space(), 0);
        assert_eq!(rb.push_slice(&[7]), 0);

        let mut out = [0i16; 8];
        assert_eq!(rb.pop_slice(&mut out), 4);
        assert_eq!(rb.pop_slice(&mut out), 0);
    }

    #[test]
    fn test_min_capacity_rounds_up() {
        assert_eq!(RingBuffer::<i16>::with_min_capacity(1000).capacity(), 1024);
        assert_eq!(RingBuffer::<i16>::with_min_capacity(0).capacity(), 1);
    }

    #[test]
    fn test_cross_thread_transfer() {
        use std::sync::Arc;

        let rb = Arc::new(RingBuffer::<i16>::new(64));
        let producer = Arc::clone(&rb);

        let handle = std::thread::spawn(move || {
            let data: Vec<i16> = (0..1000).collect();
            let mut sent = 0;
            while sent < data.len() {
                sent += producer.push_slice(&data[sent..]);
                std::thread::yield_now();
            }
        });

        let mut received = Vec::with_capacity(1000);
        let mut chunk = [0i16; 16];
        while received.len() < 1000 {
            let n = rb.pop_slice(&mut chunk);
            received.extend_from_slice(&chunk[..n]);
            std::thread::yield_now();
        }
        handle.join().unwrap();

        let expected: Vec<i16> = (0..1000).collect();
        assert_eq!(received, expected);
    }
}
