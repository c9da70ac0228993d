//! Step 状态机使用的同步原语。
//!
//! 常规构建使用 `core` 原子与 `spin::Mutex`；启用 `--cfg loom`（或 `spark_loom`）时切换到
//! `loom` 提供的实现，使模型检查能够枚举 `complete`/`attach` 的全部交错。
//! `Arc` 保持标准实现，以保留 `Arc<dyn Trait>` 的非定长转换能力。

#[cfg(not(any(loom, spark_loom)))]
pub(crate) use core::sync::atomic::{AtomicU8, Ordering};
#[cfg(any(loom, spark_loom))]
pub(crate) use loom::sync::atomic::{AtomicU8, Ordering};

/// 一次性写入槽位。
///
/// # 契约说明（What）
/// - `put_if_empty`：槽位为空时写入并返回 `Ok(())`，否则把值原样退回；
/// - `take`：取出当前内容，之后槽位重新为空；
/// - `inspect`：在锁内以引用读取当前内容，不改变槽位；
/// - 锁只在写入/取出/读取的瞬间持有；`inspect` 的读取闭包之外，临界区内不会调用任何用户代码。
pub(crate) struct Slot<T> {
    #[cfg(not(any(loom, spark_loom)))]
    cell: spin::Mutex<Option<T>>,
    #[cfg(any(loom, spark_loom))]
    cell: loom::sync::Mutex<Option<T>>,
}

impl<T> Slot<T> {
    pub(crate) fn empty() -> Self {
        Self {
            #[cfg(not(any(loom, spark_loom)))]
            cell: spin::Mutex::new(None),
            #[cfg(any(loom, spark_loom))]
            cell: loom::sync::Mutex::new(None),
        }
    }

    pub(crate) fn filled(value: T) -> Self {
        let slot = Self::empty();
        // 新建槽位不可能已被占用。
        let _ = slot.put_if_empty(value);
        slot
    }

    pub(crate) fn put_if_empty(&self, value: T) -> Result<(), T> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(value);
        }
        *guard = Some(value);
        Ok(())
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub(crate) fn inspect<R>(&self, read: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().as_ref().map(read)
    }

    #[cfg(not(any(loom, spark_loom)))]
    fn lock(&self) -> spin::MutexGuard<'_, Option<T>> {
        self.cell.lock()
    }

    #[cfg(any(loom, spark_loom))]
    fn lock(&self) -> loom::sync::MutexGuard<'_, Option<T>> {
        self.cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::Slot;

    #[test]
    fn slot_accepts_only_first_value() {
        let slot = Slot::empty();
        assert!(slot.put_if_empty(1_u32).is_ok());
        assert_eq!(slot.put_if_empty(2), Err(2), "第二次写入应被退回");
        assert_eq!(slot.take(), Some(1));
        assert_eq!(slot.take(), None);
    }
}
