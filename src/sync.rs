// ============================================================================
// src/sync.rs - 割り込み禁止スピンロック
//
// 問題: spin::Mutex はロック中でも割り込みを許可する
// → 割り込みハンドラが同じMutexをロックしようとするとデッドロック
//
// 解決: KernelServices::lock_spinlock でロック取得時に割り込みを禁止し、
//       KernelServices::unlock_spinlock で解放時に元の状態を復元する。
//       実際の排他制御自体は spin::Mutex に任せる。
// ============================================================================

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::kernel_api::KernelServices;

/// 割り込み禁止スピンロック。
///
/// `K::lock_spinlock`/`unlock_spinlock` で割り込みマスクを行い、
/// その内側で `spin::Mutex` による排他制御を行う。
pub struct SpinLock<K: KernelServices, T> {
    handle: K::SpinLockHandle,
    inner: spin::Mutex<T>,
    _kernel: PhantomData<K>,
}

// SAFETY: SpinLock は排他的アクセスを保証する。内部の spin::Mutex<T> が
// 既に Send を要求するため、K::SpinLockHandle が Send/Sync であれば十分。
unsafe impl<K: KernelServices, T: Send> Send for SpinLock<K, T> {}
unsafe impl<K: KernelServices, T: Send> Sync for SpinLock<K, T> {}

impl<K: KernelServices, T> SpinLock<K, T> {
    /// 新しい `SpinLock` を作成する。`handle` はホストが割り当てた
    /// スピンロックの不透明なハンドル。
    pub const fn new(handle: K::SpinLockHandle, data: T) -> Self {
        Self {
            handle,
            inner: spin::Mutex::new(data),
            _kernel: PhantomData,
        }
    }

    /// ロックを取得する。割り込みを禁止してから `spin::Mutex` を取得し、
    /// ガードがドロップされると両方が元に戻る。
    pub fn lock<'a>(&'a self, kernel: &'a K) -> SpinLockGuard<'a, K, T> {
        let irq_state = kernel.lock_spinlock(self.handle);
        let guard = self.inner.lock();
        SpinLockGuard {
            lock: self,
            kernel,
            irq_state,
            guard: Some(guard),
        }
    }
}

/// `SpinLock::lock` のガード。ドロップ時にロックを解放し、
/// 割り込み状態を復元する。
pub struct SpinLockGuard<'a, K: KernelServices, T> {
    lock: &'a SpinLock<K, T>,
    kernel: &'a K,
    irq_state: K::IrqState,
    guard: Option<spin::MutexGuard<'a, T>>,
}

impl<K: KernelServices, T> Deref for SpinLockGuard<'_, K, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<K: KernelServices, T> DerefMut for SpinLockGuard<'_, K, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<K: KernelServices, T> Drop for SpinLockGuard<'_, K, T> {
    fn drop(&mut self) {
        // 1. spin::Mutex を解放
        self.guard.take();
        // 2. 割り込み状態を復元
        self.kernel.unlock_spinlock(self.lock.handle, self.irq_state);
    }
}
