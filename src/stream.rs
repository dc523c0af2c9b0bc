// ============================================================================
// src/stream.rs - ストリームエンジン
// ============================================================================
//!
//! BDL + ソフトウェアリングバッファ + 割り込みリフィルのソフトウェア側ロジック。
//! レジスタ(CTL0/LPIBなど)の読み書きは `controller.rs` が行い、
//! ここではハードウェアバッファへのコピーとリングバッファの管理のみを担う。

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{HdaError, HdaResult};
use crate::kernel_api::KernelServices;
use crate::regs::{BDL_PAGE_SIZE, DEFAULT_BDL_COUNT, HARDWARE_BUFFER_SIZE};
use crate::sync::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// バイト単位のソフトウェアリングバッファ。
pub struct RingBuffer {
    data: Vec<u8>,
    capacity: usize,
    read_pos: usize,
    write_pos: usize,
    size: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: alloc::vec![0u8; capacity],
            capacity,
            read_pos: 0,
            write_pos: 0,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn free_space(&self) -> usize {
        self.capacity - self.size
    }

    /// 書き込めるだけ書き込み、実際に書き込んだバイト数を返す。ブロックしない。
    fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free_space());
        for &b in &bytes[..n] {
            self.data[self.write_pos] = b;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
        self.size += n;
        n
    }

    /// 読み出せるだけ読み出し、実際に読み出したバイト数を返す。
    fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.size);
        for slot in out.iter_mut().take(n) {
            *slot = self.data[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.capacity;
        }
        self.size -= n;
        n
    }

    fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.size = 0;
    }
}

type FillCallback = Box<dyn FnMut(&mut [u8]) -> usize + Send>;
type TripCallback = Box<dyn FnMut(usize) + Send>;

struct StreamState {
    ring: RingBuffer,
    /// 次にリフィルすべきハードウェアバッファ内のバイトオフセット
    fill_pos: usize,
    /// 直近のIRQで観測したDMA位置
    prev_irq_pos: usize,
    buffer_trip_threshold: usize,
    fill_callback: Option<FillCallback>,
    trip_callback: Option<TripCallback>,
}

fn round_up_4k(n: usize) -> usize {
    (n + BDL_PAGE_SIZE - 1) / BDL_PAGE_SIZE * BDL_PAGE_SIZE
}

fn software_ahead(fill_pos: usize, hw_pos: usize) -> usize {
    (fill_pos + HARDWARE_BUFFER_SIZE - hw_pos) % HARDWARE_BUFFER_SIZE
}

/// IRQリフィルの結果。
pub enum RefillOutcome {
    /// 既に十分先行しているため何もしなかった（再入の可能性を含む）。
    TooFarAhead,
    /// `bytes` バイトをハードウェアバッファへ書き戻した。
    Refilled { bytes: usize },
}

/// 1本のDMAストリーム。128エントリのBDLと128枚の4KiBページを所有する。
pub struct Stream<K: KernelServices> {
    pub index: u8,
    pub direction: Direction,
    bdl_phys: u64,
    bdl_virt: *mut u8,
    page_phys: Vec<u64>,
    page_virt: Vec<*mut u8>,
    state: SpinLock<K, StreamState>,
}

// SAFETY: 生ポインタはDMAコヒーレントメモリを指し、全アクセスは `state` の
// スピンロックを経由して直列化される。
unsafe impl<K: KernelServices> Send for Stream<K> {}
unsafe impl<K: KernelServices> Sync for Stream<K> {}

impl<K: KernelServices> Stream<K> {
    /// 指定容量のリングバッファを持つストリームを確保する。
    /// BDLページと128枚のオーディオページを物理確保してマップする。
    pub fn new(
        kernel: &K,
        index: u8,
        direction: Direction,
        lock_handle: K::SpinLockHandle,
        ring_capacity: usize,
    ) -> HdaResult<Self> {
        let bdl_size = DEFAULT_BDL_COUNT * crate::regs::BDL_ENTRY_SIZE;
        let bdl_phys = kernel.allocate_physical(round_up_4k(bdl_size))?;
        let bdl_virt = kernel.map(bdl_phys, round_up_4k(bdl_size))?;

        let mut page_phys = Vec::with_capacity(DEFAULT_BDL_COUNT);
        let mut page_virt = Vec::with_capacity(DEFAULT_BDL_COUNT);
        for _ in 0..DEFAULT_BDL_COUNT {
            let phys = kernel.allocate_physical(BDL_PAGE_SIZE).map_err(|e| {
                for (&p, &v) in page_phys.iter().zip(page_virt.iter()) {
                    kernel.unmap(v, BDL_PAGE_SIZE);
                    kernel.deallocate_physical(p, BDL_PAGE_SIZE);
                }
                e
            })?;
            let virt = kernel.map(phys, BDL_PAGE_SIZE)?;
            page_phys.push(phys);
            page_virt.push(virt);
        }

        // SAFETY: bdl_virt points to a freshly mapped, page-aligned region of
        // at least DEFAULT_BDL_COUNT * BDL_ENTRY_SIZE bytes.
        unsafe {
            for i in 0..DEFAULT_BDL_COUNT {
                let entry_ptr = bdl_virt.add(i * crate::regs::BDL_ENTRY_SIZE) as *mut u32;
                let phys = page_phys[i];
                core::ptr::write_volatile(entry_ptr, phys as u32);
                core::ptr::write_volatile(entry_ptr.add(1), (phys >> 32) as u32);
                core::ptr::write_volatile(entry_ptr.add(2), BDL_PAGE_SIZE as u32);
                core::ptr::write_volatile(entry_ptr.add(3), crate::regs::BDL_IOC);
            }
        }

        Ok(Self {
            index,
            direction,
            bdl_phys,
            bdl_virt,
            page_phys,
            page_virt,
            state: SpinLock::new(
                lock_handle,
                StreamState {
                    ring: RingBuffer::new(ring_capacity),
                    fill_pos: 0,
                    prev_irq_pos: 0,
                    buffer_trip_threshold: 0,
                    fill_callback: None,
                    trip_callback: None,
                },
            ),
        })
    }

    pub fn bdl_phys(&self) -> u64 {
        self.bdl_phys
    }

    pub fn destroy(&mut self, kernel: &K) {
        let bdl_size = round_up_4k(DEFAULT_BDL_COUNT * crate::regs::BDL_ENTRY_SIZE);
        kernel.unmap(self.bdl_virt, bdl_size);
        kernel.deallocate_physical(self.bdl_phys, bdl_size);
        for (&phys, &virt) in self.page_phys.iter().zip(self.page_virt.iter()) {
            kernel.unmap(virt, BDL_PAGE_SIZE);
            kernel.deallocate_physical(phys, BDL_PAGE_SIZE);
        }
    }

    pub fn set_fill_callback(&self, kernel: &K, cb: FillCallback) {
        self.state.lock(kernel).fill_callback = Some(cb);
    }

    pub fn set_trip_callback(&self, kernel: &K, threshold: usize, cb: TripCallback) {
        let mut state = self.state.lock(kernel);
        state.buffer_trip_threshold = threshold;
        state.trip_callback = Some(cb);
    }

    /// リングバッファへ書き込めるだけ書き込む。溢れる分は書き込まれない。
    pub fn queue_data(&self, kernel: &K, data: &[u8]) -> usize {
        if matches!(self.direction, Direction::Input) {
            return 0;
        }
        self.state.lock(kernel).ring.write(data)
    }

    pub fn clear_queue(&self, kernel: &K) {
        self.state.lock(kernel).ring.clear();
    }

    pub fn remaining(&self, kernel: &K) -> usize {
        self.state.lock(kernel).ring.len()
    }

    pub fn buffer_size(&self) -> usize {
        HARDWARE_BUFFER_SIZE
    }

    /// 再生開始前に、許容される先行量までハードウェアバッファを事前充填する。
    pub fn prepare_play(&self, kernel: &K, hardware_pos: usize) {
        let mut state = self.state.lock(kernel);
        let ahead = software_ahead(state.fill_pos, hardware_pos);
        if ahead < crate::regs::ALLOWED_SOFTWARE_AHEAD {
            let to_fill = round_up_4k(crate::regs::ALLOWED_SOFTWARE_AHEAD - ahead);
            self.write_into_pages(&mut state, to_fill);
        }
        state.prev_irq_pos = hardware_pos;
    }

    /// 割り込みハンドラから呼ばれるリフィル処理。`hardware_pos` はIRQ時点の
    /// DMA位置 (`SDnLPIB` またはDMA位置バッファから読む)。
    pub fn refill(&self, kernel: &K, hardware_pos: usize) -> RefillOutcome {
        let mut state = self.state.lock(kernel);

        let ahead = software_ahead(state.fill_pos, hardware_pos);
        if ahead > crate::regs::ALLOWED_SOFTWARE_AHEAD {
            state.prev_irq_pos = hardware_pos;
            return RefillOutcome::TooFarAhead;
        }

        let bytes_since_prev =
            (hardware_pos + HARDWARE_BUFFER_SIZE - state.prev_irq_pos) % HARDWARE_BUFFER_SIZE;

        if state.buffer_trip_threshold > 0 && state.ring.len() < state.buffer_trip_threshold {
            let size = state.ring.len();
            if let Some(cb) = state.trip_callback.as_mut() {
                cb(size);
            }
        }

        self.write_into_pages(&mut state, bytes_since_prev);
        state.prev_irq_pos = hardware_pos;

        RefillOutcome::Refilled { bytes: bytes_since_prev }
    }

    /// `fill_pos` から `len` バイト分、リング（不足分はコールバック、
    /// それでも足りなければ無音）でBDLページを埋め、`fill_pos` を進める。
    fn write_into_pages(&self, state: &mut StreamState, len: usize) {
        let mut remaining = len;
        let mut pos = state.fill_pos;

        while remaining > 0 {
            let page_idx = pos / BDL_PAGE_SIZE;
            let page_off = pos % BDL_PAGE_SIZE;
            let chunk = remaining.min(BDL_PAGE_SIZE - page_off);

            // SAFETY: page_idx < DEFAULT_BDL_COUNT because pos < HARDWARE_BUFFER_SIZE
            // and page_off < BDL_PAGE_SIZE, each page_virt entry is a distinct
            // BDL_PAGE_SIZE-byte mapped region.
            let dest = unsafe {
                core::slice::from_raw_parts_mut(self.page_virt[page_idx].add(page_off), chunk)
            };

            let mut written = state.ring.read(dest);
            if written < chunk {
                if let Some(cb) = state.fill_callback.as_mut() {
                    let mut scratch = [0u8; BDL_PAGE_SIZE];
                    let n = cb(&mut scratch);
                    state.ring.write(&scratch[..n]);
                    written += state.ring.read(&mut dest[written..chunk]);
                }
            }
            if written < chunk {
                for b in &mut dest[written..chunk] {
                    *b = 0;
                }
            }

            pos = (pos + chunk) % HARDWARE_BUFFER_SIZE;
            remaining -= chunk;
        }

        state.fill_pos = pos;
    }
}

impl Direction {
    pub fn require_output(self) -> HdaResult<()> {
        match self {
            Direction::Output => Ok(()),
            Direction::Input => Err(HdaError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_wrap_scenario() {
        let mut ring = RingBuffer::new(8);
        assert_eq!(ring.write(b"ABCDE"), 5);
        let mut out = [0u8; 3];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out, b"ABC");
        assert_eq!(ring.write(b"FGH"), 3);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.read_pos, 3);
        assert_eq!(ring.write_pos, 0);

        let mut rest = [0u8; 5];
        ring.read(&mut rest);
        assert_eq!(&rest, b"DEFGH");
    }

    #[test]
    fn test_ring_saturation_is_idempotent() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.write(b"ABCD"), 4);
        assert_eq!(ring.write(b"EFGH"), 0);
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn test_software_ahead_wraps() {
        assert_eq!(software_ahead(10, 5), 5);
        assert_eq!(software_ahead(5, HARDWARE_BUFFER_SIZE - 5), 10);
    }

    #[test]
    fn test_round_up_4k() {
        assert_eq!(round_up_4k(1), BDL_PAGE_SIZE);
        assert_eq!(round_up_4k(BDL_PAGE_SIZE), BDL_PAGE_SIZE);
        assert_eq!(round_up_4k(BDL_PAGE_SIZE + 1), BDL_PAGE_SIZE * 2);
    }
}
