use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

use strata_core::{PropertyBag, PropertyValue, Result};

use super::{BindingContext, BindingError};
use crate::{ChannelFactory, ChannelListener, ChannelShape};

/// 绑定元素。
///
/// # 契约说明（What）
/// - `can_build_*` 缺省委托给上下文中的下一层：非传输元素只要下层能构建，它就能构建；
///   传输元素必须覆盖这两个方法；
/// - `build_*` 缺省返回 [`BindingError::UnsupportedShape`]；
/// - `property` 缺省委托给下一层，元素只回答自己认识的类型；
/// - 对象安全：通道栈以 `Box<dyn BindingElement>` 保存元素，[`clone_element`](Self::clone_element)
///   提供克隆能力。
pub trait BindingElement: Send + Sync + fmt::Debug {
    /// 用于诊断与“未消费元素”错误的名称。
    fn name(&self) -> &str;

    fn clone_element(&self) -> Box<dyn BindingElement>;

    fn can_build_channel_factory(&self, shape: ChannelShape, context: &BindingContext) -> bool {
        context.can_build_inner_channel_factory(shape)
    }

    fn can_build_channel_listener(&self, shape: ChannelShape, context: &BindingContext) -> bool {
        context.can_build_inner_channel_listener(shape)
    }

    fn build_channel_factory(
        &self,
        shape: ChannelShape,
        context: &mut BindingContext,
    ) -> Result<Arc<dyn ChannelFactory>> {
        let _ = context;
        Err(BindingError::UnsupportedShape {
            element: self.name().to_owned(),
            shape,
            role: "factory",
        }
        .into())
    }

    fn build_channel_listener(
        &self,
        shape: ChannelShape,
        context: &mut BindingContext,
    ) -> Result<Arc<dyn ChannelListener>> {
        let _ = context;
        Err(BindingError::UnsupportedShape {
            element: self.name().to_owned(),
            shape,
            role: "listener",
        }
        .into())
    }

    fn property(&self, type_id: TypeId, context: &BindingContext) -> Option<PropertyValue> {
        context.inner_property(type_id)
    }
}

impl Clone for Box<dyn BindingElement> {
    fn clone(&self) -> Self {
        self.clone_element()
    }
}

/// 构建期在元素之间传递的参数，以类型为键。
#[derive(Clone, Default)]
pub struct BindingParameters {
    bag: PropertyBag,
}

impl BindingParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加参数，返回同类型的旧值。
    pub fn add<T: Any + Send + Sync>(&mut self, value: T) -> Option<Arc<T>> {
        self.bag.insert(value)
    }

    pub fn find<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.bag.get::<T>()
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.bag.contains::<T>()
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        self.bag.remove::<T>()
    }

    pub fn len(&self) -> usize {
        self.bag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bag.is_empty()
    }
}

impl fmt::Debug for BindingParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingParameters")
            .field("len", &self.bag.len())
            .finish()
    }
}
