// ============================================================================
// src/controller.rs - コントローラライフサイクルとVerb伝送
// ============================================================================
//!
//! Intel HDA コントローラの初期化/サスペンド/レジューム/破棄と、
//! CORB/RIRB を介した同期verb送信を実装する。

use alloc::vec::Vec;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::codec::{Codec, VerbTransport};
use crate::error::{HdaError, HdaResult};
use crate::format::PcmFormat;
use crate::kernel_api::{KernelServices, PciAccessSize};
use crate::path::Path;
use crate::program;
use crate::regs::*;
use crate::stream::{Direction, RefillOutcome, Stream};
use crate::sync::SpinLock;

struct Ring {
    phys: u64,
    virt: *mut u8,
    /// エントリ数 (2, 16, または256)
    depth: usize,
}

/// verbロックが保護するCORB/RIRBの可変状態。
struct VerbState {
    corb: Ring,
    rirb: Ring,
    /// これまでに発行したverbの総数。16ビットの `CORBWP`/`RIRBWP` を
    /// 小さいリング深度でも一意に解釈するために used。
    issued: u64,
}

/// `KernelServices::pci_allocate_irq` へ渡すトランポリン。`arg` は
/// `init` で登録した `Controller<K>` 自身へのポインタ。
fn irq_trampoline<K: KernelServices>(arg: *mut ()) -> bool {
    // SAFETY: `arg` was registered in `init` as a pointer to this very
    // `Controller<K>`, which stays alive (and at this address) for as long
    // as the IRQ remains allocated; `destroy` deallocates the IRQ before
    // the controller is torn down.
    let controller = unsafe { &*(arg as *const Controller<K>) };
    controller.handle_interrupt()
}

/// Intel HD Audio コントローラ。
pub struct Controller<K: KernelServices> {
    kernel: K,
    device: K::Device,
    mmio_base: *mut u8,
    mmio_bar: u32,
    irq: Option<K::IrqHandle>,
    num_input_streams: u32,
    num_output_streams: u32,
    ok64: bool,
    verb: SpinLock<K, VerbState>,
    streams: Vec<Stream<K>>,
    codecs: SpinLock<K, Vec<Codec>>,
    initialized: AtomicBool,
}

// SAFETY: 全ての可変共有状態 (CORB/RIRB/レスポンス/コーデック一覧) は
// SpinLock またはアトミックを経由してのみアクセスされる。mmio_base は
// コントローラの生存期間中不変のMMIO領域を指す。
unsafe impl<K: KernelServices> Send for Controller<K> {}
unsafe impl<K: KernelServices> Sync for Controller<K> {}

impl<K: KernelServices> Controller<K> {
    #[inline]
    fn read8(&self, offset: u32) -> u8 {
        // SAFETY: mmio_base はinit時にBARからマップされた有効なMMIO領域を指す。
        unsafe { read_volatile(self.mmio_base.add(offset as usize)) }
    }

    #[inline]
    fn write8(&self, offset: u32, value: u8) {
        unsafe { write_volatile(self.mmio_base.add(offset as usize), value) }
    }

    #[inline]
    fn read16(&self, offset: u32) -> u16 {
        unsafe { read_volatile(self.mmio_base.add(offset as usize) as *const u16) }
    }

    #[inline]
    fn write16(&self, offset: u32, value: u16) {
        unsafe { write_volatile(self.mmio_base.add(offset as usize) as *mut u16, value) }
    }

    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        unsafe { read_volatile(self.mmio_base.add(offset as usize) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        unsafe { write_volatile(self.mmio_base.add(offset as usize) as *mut u32, value) }
    }

    fn poll_until<F: Fn(&Self) -> bool>(&self, timeout_us: u32, step_us: u32, cond: F) -> HdaResult<()> {
        let mut remaining = timeout_us / step_us;
        loop {
            if cond(self) {
                return Ok(());
            }
            if remaining == 0 {
                return Err(HdaError::Timeout);
            }
            self.kernel.delay_us(step_us);
            remaining -= 1;
        }
    }

    /// コントローラを確保するが、初期化（レジューム）はまだ行わない。
    pub fn init(kernel: K, device: K::Device, bar: u32, spinlock_handle: K::SpinLockHandle) -> HdaResult<Self> {
        // PCI command register: bus master + memory space
        let cmd = kernel.pci_read(device, 0x04, PciAccessSize::Word);
        kernel.pci_write(device, 0x04, PciAccessSize::Word, cmd | 0x0006);

        let mmio_base = kernel.pci_map_bar(device, bar)?;

        let mut controller = Self {
            kernel,
            device,
            mmio_base,
            mmio_bar: bar,
            irq: None,
            num_input_streams: 0,
            num_output_streams: 0,
            ok64: false,
            verb: SpinLock::new(
                spinlock_handle,
                VerbState {
                    corb: Ring { phys: 0, virt: core::ptr::null_mut(), depth: 0 },
                    rirb: Ring { phys: 0, virt: core::ptr::null_mut(), depth: 0 },
                    issued: 0,
                },
            ),
            streams: Vec::new(),
            codecs: SpinLock::new(spinlock_handle, Vec::new()),
            initialized: AtomicBool::new(false),
        };

        // デバイスの生涯に一度だけ割り当てる。`arg` は `controller` 自身を指す。
        let irq = controller.kernel.pci_allocate_irq(
            device,
            irq_trampoline::<K>,
            &controller as *const Self as *mut (),
        )?;
        controller.irq = Some(irq);

        controller.resume()?;
        Ok(controller)
    }

    /// サスペンド状態からコントローラを復帰させ、コーデックを再検出する。
    pub fn resume(&mut self) -> HdaResult<()> {
        let cmd = self.kernel.pci_read(self.device, 0x04, PciAccessSize::Word);
        self.kernel.pci_write(self.device, 0x04, PciAccessSize::Word, cmd | 0x0006);

        // 既に走っていれば一度リセットする
        self.suspend_inner(false);

        if let Some(irq) = self.irq {
            self.kernel.pci_enable_irq(self.device, irq, true);
        }

        let gctl = self.read32(REG_GCTL);
        self.write32(REG_GCTL, gctl | Gctl::CRST.bits());
        self.poll_until(RESET_TIMEOUT_US, RESET_POLL_STEP_US, |s| {
            s.read32(REG_GCTL) & Gctl::CRST.bits() != 0
        })?;

        let gcap = self.read16(REG_GCAP);
        self.ok64 = gcap & GCAP_OK64 as u16 != 0;
        if !self.ok64 {
            return Err(HdaError::Unsupported);
        }
        self.num_input_streams = ((gcap as u32 & GCAP_ISS_MASK) >> GCAP_ISS_SHIFT) as u32;
        self.num_output_streams = ((gcap as u32 & GCAP_OSS_MASK) >> GCAP_OSS_SHIFT) as u32;

        self.init_corb_rirb()?;

        self.write16(REG_RINTCNT, 255);
        self.write8(REG_RIRBCTL, RIRBCTL_DMAEN);
        {
            let mut verb = self.verb.lock(&self.kernel);
            self.write8(REG_CORBCTL, CORBCTL_CORBRUN);
            verb.issued = 0;
        }

        // コーデック自己識別を待つ
        self.kernel.delay_us(1000);

        let sie_bits = IntCtl::SIE_MASK.bits() & ((1u32 << (self.num_input_streams + self.num_output_streams)) - 1);
        self.write32(REG_INTCTL, sie_bits | IntCtl::CIE.bits() | IntCtl::GIE.bits());

        let statests = self.read16(REG_STATESTS);
        let addresses = Codec::present_addresses(statests);
        let mut discovered = Vec::new();
        for addr in addresses {
            match Codec::discover(self, addr) {
                Ok(mut codec) => {
                    codec.compute_output_paths();
                    discovered.push(codec);
                }
                Err(HdaError::Timeout) => {
                    log::warn!("codec {} timed out during init, skipping", addr);
                }
                Err(e) => return Err(e),
            }
        }
        self.write16(REG_STATESTS, statests);
        *self.codecs.lock(&self.kernel) = discovered;

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// コントローラを静止状態にする。IRQを無効化し、全ストリームとCORB/RIRBを止める。
    pub fn suspend(&mut self) -> HdaResult<()> {
        self.suspend_inner(true)
    }

    fn suspend_inner(&self, require_poll: bool) -> HdaResult<()> {
        if let Some(irq) = self.irq {
            self.kernel.pci_enable_irq(self.device, irq, false);
        }

        if self.read32(REG_GCTL) & Gctl::CRST.bits() != 0 {
            self.write8(REG_CORBCTL, 0);
            self.write8(REG_RIRBCTL, 0);

            for i in 0..(self.num_input_streams + self.num_output_streams) {
                let is_output = i >= self.num_input_streams;
                let idx = if is_output { i - self.num_input_streams } else { i };
                let base = stream_offset(is_output, self.num_input_streams, idx);
                self.write8(base + REG_SD_CTL0, 0);
            }

            let gctl = self.read32(REG_GCTL);
            self.write32(REG_GCTL, gctl & !Gctl::CRST.bits());

            let result = self.poll_until(RESET_TIMEOUT_US, RESET_POLL_STEP_US, |s| {
                s.read32(REG_GCTL) & Gctl::CRST.bits() == 0
            });
            if require_poll {
                result?;
            }
            self.kernel.delay_us(200);
        }
        Ok(())
    }

    /// コントローラを完全に破棄する。サスペンド失敗時も後始末は継続する。
    pub fn destroy(mut self) {
        let _ = self.suspend();
        if let Some(irq) = self.irq.take() {
            self.kernel.pci_deallocate_irq(self.device, irq);
        }
        for stream in self.streams.iter_mut() {
            stream.destroy(&self.kernel);
        }
        let verb = self.verb.lock(&self.kernel);
        if !verb.corb.virt.is_null() {
            let size = verb.corb.depth * CORB_ENTRY_SIZE;
            self.kernel.unmap(verb.corb.virt, size);
            self.kernel.deallocate_physical(verb.corb.phys, size);
        }
        if !verb.rirb.virt.is_null() {
            let size = verb.rirb.depth * RIRB_ENTRY_SIZE;
            self.kernel.unmap(verb.rirb.virt, size);
            self.kernel.deallocate_physical(verb.rirb.phys, size);
        }
        drop(verb);
        self.kernel.pci_unmap_bar(self.device, self.mmio_bar, self.mmio_base);
    }

    fn init_corb_rirb(&self) -> HdaResult<()> {
        let mut verb = self.verb.lock(&self.kernel);

        self.write8(REG_CORBCTL, 0);
        let corb_szcap = (self.read8(REG_CORBSIZE) >> CORBSIZE_SZCAP_SHIFT) & 0x0F;
        let (corb_depth, corb_reg) = if corb_szcap & 0x04 != 0 {
            (256, CORBSIZE_256)
        } else if corb_szcap & 0x02 != 0 {
            (16, CORBSIZE_16)
        } else {
            (2, CORBSIZE_2)
        };
        let corb_phys = self.kernel.allocate_physical(4096)?;
        let corb_virt = self.kernel.map(corb_phys, 4096)?;
        self.write32(REG_CORBLBASE, corb_phys as u32);
        self.write32(REG_CORBUBASE, (corb_phys >> 32) as u32);
        self.write8(REG_CORBSIZE, corb_reg);
        self.write16(REG_CORBRP, CORBRP_RST);
        self.poll_until(CODEC_TIMEOUT_US, RESET_POLL_STEP_US, |s| {
            s.read16(REG_CORBRP) & CORBRP_RST != 0
        })?;
        self.write16(REG_CORBRP, 0);
        self.write16(REG_CORBWP, 0);
        verb.corb = Ring { phys: corb_phys, virt: corb_virt, depth: corb_depth };

        self.write8(REG_RIRBCTL, 0);
        let rirb_szcap = (self.read8(REG_RIRBSIZE) >> RIRBSIZE_SZCAP_SHIFT) & 0x0F;
        let (rirb_depth, rirb_reg) = if rirb_szcap & 0x04 != 0 {
            (256, RIRBSIZE_256)
        } else if rirb_szcap & 0x02 != 0 {
            (16, RIRBSIZE_16)
        } else {
            (2, RIRBSIZE_2)
        };
        let rirb_phys = self.kernel.allocate_physical(4096)?;
        let rirb_virt = self.kernel.map(rirb_phys, 4096)?;
        self.write32(REG_RIRBLBASE, rirb_phys as u32);
        self.write32(REG_RIRBUBASE, (rirb_phys >> 32) as u32);
        self.write8(REG_RIRBSIZE, rirb_reg);
        self.write16(REG_RIRBWP, RIRBWP_RST);
        verb.rirb = Ring { phys: rirb_phys, virt: rirb_virt, depth: rirb_depth };

        Ok(())
    }

    /// CORB/RIRBを介して1個のverbを同期的に送信し、応答を返す。
    pub fn send_command_raw(&self, codec_addr: u8, nid: u8, verb: u32) -> HdaResult<u32> {
        let mut state = self.verb.lock(&self.kernel);

        let wp = self.read16(REG_CORBWP);
        let next_wp = (wp as usize + 1) % state.corb.depth;
        let entry = make_corb_entry(codec_addr, nid, verb);

        // SAFETY: corb.virt はinit_corb_rirbで確保した depth * CORB_ENTRY_SIZE
        // バイトのDMAコヒーレント領域を指す。next_wp < depth。
        unsafe {
            let ptr = state.corb.virt.add(next_wp * CORB_ENTRY_SIZE) as *mut u32;
            write_volatile(ptr, entry);
        }
        self.write16(REG_CORBWP, next_wp as u16);
        state.issued += 1;
        let issued = state.issued;

        let depth = state.rirb.depth;
        let rirb_virt = state.rirb.virt;
        drop(state);

        // 16ビットの RIRBWP を、発行済みverb総数(issued)のmod depthと比較する
        // ことで、深度が小さいリングでの巻き戻り誤判定を避ける。
        let target_index = (issued % depth as u64) as u16;
        self.poll_until(CMD_TIMEOUT_US, RESET_POLL_STEP_US, |s| {
            s.read16(REG_RIRBWP) == target_index
        })?;

        // SAFETY: rirb_virt points to depth * RIRB_ENTRY_SIZE valid bytes;
        // target_index < depth.
        let response = unsafe {
            let ptr = rirb_virt.add(target_index as usize * RIRB_ENTRY_SIZE) as *const u32;
            read_volatile(ptr)
        };
        Ok(response)
    }

    /// ストリームのリフィルで使うDMA位置を読む。DMA位置バッファが無い前提で
    /// `SDnLPIB` を読む。
    pub fn stream_dma_pos(&self, stream_index: u8, is_output: bool) -> u32 {
        let idx = stream_index as u32;
        let base = stream_offset(is_output, self.num_input_streams, idx);
        self.read32(base + REG_SD_LPIB)
    }

    /// コントローラのIRQハンドラから呼ばれる。自分が発生させた割り込みなら `true`。
    pub fn handle_interrupt(&self) -> bool {
        let sts = self.read32(REG_INTSTS);
        if sts == 0 {
            return false;
        }
        for i in 0..(self.num_input_streams + self.num_output_streams) {
            if sts & (1 << i) == 0 {
                continue;
            }
            let is_output = i >= self.num_input_streams;
            let idx = if is_output { i - self.num_input_streams } else { i };
            let base = stream_offset(is_output, self.num_input_streams, idx);
            let stream_sts = self.read8(base + REG_SD_STS);
            if stream_sts & SdSts::BCIS.bits() != 0 {
                if let Some(stream) = self.streams.iter().find(|s| {
                    s.index == idx as u8
                        && matches!(s.direction, Direction::Output) == is_output
                }) {
                    let pos = self.stream_dma_pos(idx as u8, is_output) as usize;
                    let _ = match stream.refill(&self.kernel, pos) {
                        RefillOutcome::Refilled { bytes } => bytes,
                        RefillOutcome::TooFarAhead => 0,
                    };
                }
                self.write8(base + REG_SD_STS, SdSts::BCIS.bits());
            }
        }
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn with_codecs<R>(&self, f: impl FnOnce(&[Codec]) -> R) -> R {
        f(&self.codecs.lock(&self.kernel))
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// 指定ピンへの、`existing` と同時使用可能な出力パスを探す。
    pub fn find_path(&self, codec: &Codec, pin_nid: u8, existing: &[&Path], same_stream: bool) -> HdaResult<Path> {
        crate::path::find_path(codec, pin_nid, existing, same_stream)
    }

    /// 新しい出力ストリームを確保し、そのインデックスを返す。
    /// `lock_handle` は呼び出し側があらかじめ割り当てたスピンロックハンドル。
    pub fn stream_setup(
        &mut self,
        direction: Direction,
        lock_handle: K::SpinLockHandle,
        ring_capacity: usize,
    ) -> HdaResult<u8> {
        let limit = match direction {
            Direction::Output => self.num_output_streams,
            Direction::Input => self.num_input_streams,
        };
        let used: alloc::collections::BTreeSet<u8> = self
            .streams
            .iter()
            .filter(|s| s.direction == direction)
            .map(|s| s.index)
            .collect();
        let index = (0..limit as u8)
            .find(|i| !used.contains(i))
            .ok_or(HdaError::Unsupported)?;

        let stream = Stream::new(&self.kernel, index, direction, lock_handle, ring_capacity)?;
        let is_output = matches!(direction, Direction::Output);
        let base = stream_offset(is_output, self.num_input_streams, index as u32);

        self.write8(base + REG_SD_CTL0, SdCtl0::SRST.bits());
        self.poll_until(STREAM_TIMEOUT_US, RESET_POLL_STEP_US, |s| {
            s.read8(base + REG_SD_CTL0) & SdCtl0::SRST.bits() != 0
        })?;
        self.write8(base + REG_SD_CTL0, 0);
        self.poll_until(STREAM_TIMEOUT_US, RESET_POLL_STEP_US, |s| {
            s.read8(base + REG_SD_CTL0) & SdCtl0::SRST.bits() == 0
        })?;

        self.write32(base + REG_SD_BDPL, stream.bdl_phys() as u32);
        self.write32(base + REG_SD_BDPU, (stream.bdl_phys() >> 32) as u32);
        self.write32(base + REG_SD_CBL, HARDWARE_BUFFER_SIZE as u32);
        self.write16(base + REG_SD_LVI, (DEFAULT_BDL_COUNT - 1) as u16);
        self.write8(base + REG_SD_CTL2, ((index + 1) << SD_CTL2_STRM_SHIFT) & SdCtl2::STRM_MASK.bits());

        self.streams.push(stream);
        Ok(index)
    }

    fn stream(&self, direction: Direction, index: u8) -> HdaResult<&Stream<K>> {
        self.streams
            .iter()
            .find(|s| s.index == index && s.direction == direction)
            .ok_or(HdaError::Unsupported)
    }

    /// パスに沿ってフォーマットを設定し、ストリームをハードウェア的に開始する。
    pub fn stream_play(
        &self,
        codec: &Codec,
        path: &Path,
        direction: Direction,
        index: u8,
        format: PcmFormat,
    ) -> HdaResult<()> {
        direction.require_output()?;
        program::path_setup(self, codec, path, index, format)?;

        let stream = self.stream(direction, index)?;
        let base = stream_offset(true, self.num_input_streams, index as u32);
        let hw_pos = self.read32(base + REG_SD_LPIB) as usize;
        stream.prepare_play(&self.kernel, hw_pos);

        self.write16(base + REG_SD_FMT, format.encode());
        let ctl0 = self.read8(base + REG_SD_CTL0);
        self.write8(base + REG_SD_CTL0, ctl0 | SdCtl0::RUN.bits() | SdCtl0::IOCE.bits());
        Ok(())
    }

    /// ストリームを停止し、パスを電源オフにする。
    pub fn stream_shutdown(&self, codec: &Codec, path: &Path, direction: Direction, index: u8) -> HdaResult<()> {
        let is_output = matches!(direction, Direction::Output);
        let base = stream_offset(is_output, self.num_input_streams, index as u32);
        let ctl0 = self.read8(base + REG_SD_CTL0);
        self.write8(base + REG_SD_CTL0, ctl0 & !SdCtl0::RUN.bits());
        if let Ok(stream) = self.stream(direction, index) {
            stream.clear_queue(&self.kernel);
        }
        program::path_shutdown(self, codec, path)
    }

    /// 再生データをソフトウェアリングバッファへ積む。
    pub fn stream_queue_data(&self, direction: Direction, index: u8, data: &[u8]) -> HdaResult<usize> {
        Ok(self.stream(direction, index)?.queue_data(&self.kernel, data))
    }

    pub fn stream_clear_queue(&self, direction: Direction, index: u8) -> HdaResult<()> {
        self.stream(direction, index)?.clear_queue(&self.kernel);
        Ok(())
    }

    pub fn stream_get_remaining(&self, direction: Direction, index: u8) -> HdaResult<usize> {
        Ok(self.stream(direction, index)?.remaining(&self.kernel))
    }

    pub fn stream_get_buffer_size(&self, direction: Direction, index: u8) -> HdaResult<usize> {
        Ok(self.stream(direction, index)?.buffer_size())
    }

    /// ストリームディスクリプタの `SDnSTS` を読む (実行中/FIFOエラー等)。
    pub fn stream_get_status(&self, direction: Direction, index: u8) -> HdaResult<u8> {
        let is_output = matches!(direction, Direction::Output);
        let base = stream_offset(is_output, self.num_input_streams, index as u32);
        Ok(self.read8(base + REG_SD_STS))
    }
}

impl<K: KernelServices> VerbTransport for Controller<K> {
    fn send_command(&self, codec_addr: u8, nid: u8, verb: u32) -> HdaResult<u32> {
        self.send_command_raw(codec_addr, nid, verb)
    }

    fn delay_us(&self, microseconds: u32) {
        self.kernel.delay_us(microseconds)
    }
}
