//! 类型转换服务：当拦截链产出的类型与方法声明不一致时的兜底转换。
//!
//! # 设计背景（Why）
//! - 不同拦截器可能产出不同的 Future/响应式实现，边界处必须转换成方法签名声明的确切类型；
//! - 转换服务以构造参数注入分派器，而非全局单例，测试与多租户场景可以各自持有独立实例。
//!
//! # 契约说明（What）
//! - [`ConversionService::convert`] 成功返回转换后的值，失败时把原值原样退回，调用方可继续尝试其他途径；
//! - [`ConversionService::is_publisher_convertible`] 决定某个返回类型能否走 Publisher 策略。

use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet},
    fmt,
};

use crate::value::{Publisher, ReturnType, Single, Value, type_of};

/// 转换服务契约。
pub trait ConversionService: Send + Sync {
    /// 尝试把 `value` 转换为 `target` 描述的类型；无法转换时退回原值。
    fn convert(&self, value: Value, target: &ReturnType) -> Result<Value, Value>;

    /// 给定类型能否与响应式流互相转换。
    fn is_publisher_convertible(&self, target: TypeId) -> bool;
}

type Converter = Box<dyn Fn(Value) -> Result<Value, Value> + Send + Sync>;

/// 基于 `(源类型, 目标类型)` 查表的默认实现。
///
/// # 逻辑解析（How）
/// - 值已是目标类型时直接返回；
/// - 否则按 `(TypeId 源, TypeId 目标)` 查找转换器；
/// - 默认注册 `Publisher ⇄ Single`，并把两者登记为响应式类型。
pub struct DefaultConversionService {
    converters: HashMap<(TypeId, TypeId), Converter>,
    publishers: HashSet<TypeId>,
}

impl DefaultConversionService {
    /// 含内置响应式转换的实例。
    pub fn new() -> Self {
        let mut service = Self::bare();
        service.register_publisher::<Publisher>();
        service.register_publisher::<Single>();
        service.register(|single: Single| Publisher::from(single));
        service.register(|publisher: Publisher| Single::from(publisher));
        service
    }

    /// 不含任何转换器的实例。
    pub fn bare() -> Self {
        Self {
            converters: HashMap::new(),
            publishers: HashSet::new(),
        }
    }

    /// 注册 `S -> D` 转换器；同一对类型重复注册时后者覆盖前者。
    pub fn register<S, D, F>(&mut self, convert: F) -> &mut Self
    where
        S: Any + Send,
        D: Any + Send,
        F: Fn(S) -> D + Send + Sync + 'static,
    {
        let converter: Converter = Box::new(move |value: Value| {
            value
                .downcast::<S>()
                .map(|source| Box::new(convert(*source)) as Value)
        });
        self.converters
            .insert((TypeId::of::<S>(), TypeId::of::<D>()), converter);
        self
    }

    /// 登记响应式类型。
    pub fn register_publisher<P: Any>(&mut self) -> &mut Self {
        self.publishers.insert(TypeId::of::<P>());
        self
    }
}

impl Default for DefaultConversionService {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionService for DefaultConversionService {
    fn convert(&self, value: Value, target: &ReturnType) -> Result<Value, Value> {
        let source = type_of(&value);
        if source == target.type_id() {
            return Ok(value);
        }
        match self.converters.get(&(source, target.type_id())) {
            Some(converter) => converter(value),
            None => {
                tracing::trace!(return_type = %target, "no converter registered");
                Err(value)
            }
        }
    }

    fn is_publisher_convertible(&self, target: TypeId) -> bool {
        self.publishers.contains(&target)
    }
}

impl fmt::Debug for DefaultConversionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultConversionService")
            .field("converters", &self.converters.len())
            .field("publishers", &self.publishers.len())
            .finish()
    }
}
