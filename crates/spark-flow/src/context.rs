//! 传播上下文：随执行流跨线程携带的请求级元数据。
//!
//! # 设计背景（Why）
//! - 拦截链在调用前建立的请求上下文（追踪标识、租户信息等）需要被异步阶段、响应式管道
//!   乃至其他线程上的续体看到；
//! - 上下文是“只增不减”的：`put` 永远返回新的快照，旧快照保持不变，便于在多个分支之间安全共享。
//!
//! # 逻辑解析（How）
//! - 条目按插入顺序保存在 `Arc<Vec<..>>` 中，克隆成本为一次引用计数；
//! - 同名键后写覆盖先写，查找时自尾向头扫描；
//! - 线程本地的“当前上下文”通过 [`PropagatedContext::enter`] 安装，返回的
//!   [`ContextScope`] 在析构时恢复先前的上下文，支持嵌套。

use std::{
    any::Any,
    borrow::Cow,
    cell::RefCell,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

type Entry = (Cow<'static, str>, Arc<dyn Any + Send + Sync>);

/// 有序、持久化、只增的键值上下文。
#[derive(Clone, Default)]
pub struct PropagatedContext {
    entries: Arc<Vec<Entry>>,
}

thread_local! {
    static CURRENT: RefCell<PropagatedContext> = RefCell::new(PropagatedContext::default());
}

impl PropagatedContext {
    /// 创建空上下文。
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个键值并返回新的上下文。
    ///
    /// # 契约说明（What）
    /// - 不修改 `self`；同名键在新快照中遮蔽旧值；
    /// - 值需满足 `Send + Sync + 'static`，以便随续体跨线程传递。
    pub fn put<V>(&self, key: impl Into<Cow<'static, str>>, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend(self.entries.iter().cloned());
        entries.push((key.into(), Arc::new(value) as Arc<dyn Any + Send + Sync>));
        Self {
            entries: Arc::new(entries),
        }
    }

    /// 读取指定键的值；键不存在或类型不符时返回 `None`。
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.entries
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .and_then(|(_, value)| value.downcast_ref::<V>())
    }

    /// 是否包含指定键。
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(name, _)| name == key)
    }

    /// 合并两个上下文，`other` 中的条目遮蔽 `self` 中的同名条目。
    pub fn merge(&self, other: &PropagatedContext) -> Self {
        if other.is_empty() || Arc::ptr_eq(&self.entries, &other.entries) {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut entries = Vec::with_capacity(self.entries.len() + other.entries.len());
        entries.extend(self.entries.iter().cloned());
        entries.extend(other.entries.iter().cloned());
        Self {
            entries: Arc::new(entries),
        }
    }

    /// 按首次出现顺序列出去重后的键。
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(self.entries.len());
        for (name, _) in self.entries.iter() {
            let name: &str = name;
            if !keys.contains(&name) {
                keys.push(name);
            }
        }
        keys
    }

    /// 去重后的键数量。
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 读取当前线程的环境上下文。
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// 将 `self` 安装为当前线程的环境上下文，直到返回的守卫被析构。
    #[must_use = "上下文在守卫析构时即被恢复"]
    pub fn enter(&self) -> ContextScope {
        let previous = CURRENT.with(|current| current.replace(self.clone()));
        ContextScope {
            previous: Some(previous),
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for PropagatedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagatedContext")
            .field("keys", &self.keys())
            .finish()
    }
}

/// [`PropagatedContext::enter`] 返回的作用域守卫。
///
/// 守卫绑定在创建它的线程上（`!Send`），析构时恢复进入前的上下文。
pub struct ContextScope {
    previous: Option<PropagatedContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // 线程退出阶段 TLS 可能已销毁，此时无需恢复。
            let _ = CURRENT.try_with(|current| current.replace(previous));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PropagatedContext;

    #[test]
    fn put_is_additive_and_shadows() {
        let base = PropagatedContext::new().put("tenant", "a".to_string());
        let next = base.put("tenant", "b".to_string()).put("trace", 7_u64);

        assert_eq!(base.get::<String>("tenant").map(String::as_str), Some("a"));
        assert_eq!(next.get::<String>("tenant").map(String::as_str), Some("b"));
        assert_eq!(next.get::<u64>("trace"), Some(&7));
        assert_eq!(next.keys(), vec!["tenant", "trace"]);
        assert_eq!(next.len(), 2);
        assert!(next.get::<u32>("trace").is_none(), "类型不符时应返回 None");
    }

    #[test]
    fn enter_restores_previous_scope() {
        let outer = PropagatedContext::new().put("layer", 1_u8);
        let inner = PropagatedContext::new().put("layer", 2_u8);

        let outer_guard = outer.enter();
        {
            let _inner_guard = inner.enter();
            assert_eq!(PropagatedContext::current().get::<u8>("layer"), Some(&2));
        }
        assert_eq!(PropagatedContext::current().get::<u8>("layer"), Some(&1));
        drop(outer_guard);
        assert!(PropagatedContext::current().is_empty());
    }

    #[test]
    fn merge_prefers_right_hand_side() {
        let left = PropagatedContext::new().put("k", 1_i32).put("only_left", true);
        let right = PropagatedContext::new().put("k", 2_i32);
        let merged = left.merge(&right);
        assert_eq!(merged.get::<i32>("k"), Some(&2));
        assert!(merged.contains_key("only_left"));
    }
}
