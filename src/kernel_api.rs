// ============================================================================
// src/kernel_api.rs - Kernel Services 抽象化
// ============================================================================
//!
//! ホストカーネルが実装すべき外部コラボレータのインタフェース。
//! PCI設定空間アクセス、IRQ登録、物理/仮想メモリ、スピンロック、遅延を提供する。
//! 一般ヒープ割り当てとログ出力はこのトレイトの責務ではない
//! (`extern crate alloc` と `log` クレートが担う)。

use crate::error::HdaResult;

/// PCI設定空間アクセスのアクセス幅
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciAccessSize {
    Byte,
    Word,
    DWord,
}

/// IRQハンドラ。`true` を返すとこのデバイスが割り込みを処理したことを意味する。
pub type IrqHandlerFn = fn(*mut ()) -> bool;

/// ホストカーネルが実装する外部サービス群。
///
/// すべての操作は同期的であり、無期限にブロックしてはならない。
/// `Device` はこのトレイトの実装側が自由に選べるPCIデバイスハンドル型。
pub trait KernelServices {
    /// PCIデバイスハンドル
    type Device: Copy;
    /// 割り当て済みIRQのハンドル
    type IrqHandle: Copy;
    /// `lock_spinlock` が返す割り込み状態トークン
    type IrqState: Copy;
    /// スピンロックのハンドル（ホスト側の実体を指す不透明値）
    type SpinLockHandle: Copy;

    /// PCI設定空間から読み取る
    fn pci_read(&self, dev: Self::Device, offset: u8, size: PciAccessSize) -> u32;
    /// PCI設定空間へ書き込む
    fn pci_write(&self, dev: Self::Device, offset: u8, size: PciAccessSize, value: u32);

    /// デバイスにIRQを1本割り当てる。HDAは生涯に一度しか呼ばない。
    fn pci_allocate_irq(
        &self,
        dev: Self::Device,
        handler: IrqHandlerFn,
        arg: *mut (),
    ) -> HdaResult<Self::IrqHandle>;
    /// 割り込みが無効化された後にのみ呼ばれる
    fn pci_deallocate_irq(&self, dev: Self::Device, irq: Self::IrqHandle);
    /// 割り当て済みIRQの有効/無効を切り替える
    fn pci_enable_irq(&self, dev: Self::Device, irq: Self::IrqHandle, enable: bool);

    /// PCI BARを仮想アドレス空間へマップする
    fn pci_map_bar(&self, dev: Self::Device, bar: u32) -> HdaResult<*mut u8>;
    /// マップ済みBARを解除する
    fn pci_unmap_bar(&self, dev: Self::Device, bar: u32, virt: *mut u8);

    /// `size` バイトの4KiB整列された連続物理メモリを確保する
    fn allocate_physical(&self, size: usize) -> HdaResult<u64>;
    /// 対になる解放
    fn deallocate_physical(&self, phys: u64, size: usize);

    /// 物理アドレス範囲をキャッシュ禁止でマップする
    fn map(&self, phys: u64, size: usize) -> HdaResult<*mut u8>;
    /// マップを解除する
    fn unmap(&self, virt: *mut u8, size: usize);

    /// 指定マイクロ秒だけビジーウェイトする。IRQコンテキストから呼んでも安全。
    fn delay_us(&self, microseconds: u32);

    /// スピンロックを取得し、割り込みを禁止する。戻り値は元の割り込み状態。
    fn lock_spinlock(&self, lock: Self::SpinLockHandle) -> Self::IrqState;
    /// スピンロックを解放し、割り込み状態を復元する。
    fn unlock_spinlock(&self, lock: Self::SpinLockHandle, state: Self::IrqState);
}

#[cfg(test)]
pub(crate) mod test_support {
    //! ホスト上でのユニットテスト用カーネルサービス実装。
    //! 実メモリマップドI/Oの代わりにヒープ確保で代替する。
    use super::*;
    use alloc::alloc::{alloc_zeroed, dealloc, Layout};
    use core::cell::Cell;
    use core::sync::atomic::{AtomicBool, Ordering};

    /// `MockKernel` のスピンロックは単一の `AtomicBool` を共有する。
    pub struct MockKernel {
        locked: AtomicBool,
        irq_disabled: Cell<bool>,
    }

    impl MockKernel {
        pub fn new() -> Self {
            Self {
                locked: AtomicBool::new(false),
                irq_disabled: Cell::new(false),
            }
        }
    }

    impl Default for MockKernel {
        fn default() -> Self {
            Self::new()
        }
    }

    impl KernelServices for MockKernel {
        type Device = ();
        type IrqHandle = ();
        type IrqState = bool;
        type SpinLockHandle = ();

        fn pci_read(&self, _dev: (), _offset: u8, _size: PciAccessSize) -> u32 {
            0
        }
        fn pci_write(&self, _dev: (), _offset: u8, _size: PciAccessSize, _value: u32) {}

        fn pci_allocate_irq(&self, _dev: (), _handler: IrqHandlerFn, _arg: *mut ()) -> HdaResult<()> {
            Ok(())
        }
        fn pci_deallocate_irq(&self, _dev: (), _irq: ()) {}
        fn pci_enable_irq(&self, _dev: (), _irq: (), _enable: bool) {}

        fn pci_map_bar(&self, _dev: (), _bar: u32) -> HdaResult<*mut u8> {
            Err(crate::error::HdaError::Unsupported)
        }
        fn pci_unmap_bar(&self, _dev: (), _bar: u32, _virt: *mut u8) {}

        fn allocate_physical(&self, size: usize) -> HdaResult<u64> {
            let layout = Layout::from_size_align(size, 0x1000)
                .map_err(|_| crate::error::HdaError::NoMemory)?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(crate::error::HdaError::NoMemory);
            }
            Ok(ptr as u64)
        }

        fn deallocate_physical(&self, phys: u64, size: usize) {
            if let Ok(layout) = Layout::from_size_align(size, 0x1000) {
                unsafe { dealloc(phys as *mut u8, layout) };
            }
        }

        fn map(&self, phys: u64, _size: usize) -> HdaResult<*mut u8> {
            Ok(phys as *mut u8)
        }
        fn unmap(&self, _virt: *mut u8, _size: usize) {}

        fn delay_us(&self, _microseconds: u32) {}

        fn lock_spinlock(&self, _lock: ()) -> bool {
            let was_disabled = self.irq_disabled.replace(true);
            while self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
            !was_disabled
        }

        fn unlock_spinlock(&self, _lock: (), state: bool) {
            self.locked.store(false, Ordering::Release);
            if state {
                self.irq_disabled.set(false);
            }
        }
    }
}
