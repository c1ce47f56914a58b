use std::{
    any::{Any, TypeId},
    collections::VecDeque,
    fmt,
    sync::Arc,
};

use strata_core::{ChannelTimeouts, PropertyValue, Result};

use super::{Binding, BindingElement, BindingError, BindingParameters};
use crate::{ChannelFactory, ChannelListener, ChannelShape, EndpointAddress};

/// 监听地址设置：基准地址 + 相对路径。
#[derive(Clone, Debug, Default)]
pub struct ListenUriSettings {
    base_address: Option<EndpointAddress>,
    relative_address: String,
}

impl ListenUriSettings {
    pub fn new(base_address: EndpointAddress) -> Self {
        Self {
            base_address: Some(base_address),
            relative_address: String::new(),
        }
    }

    pub fn with_relative_address(mut self, relative: impl Into<String>) -> Self {
        self.relative_address = relative.into();
        self
    }

    pub fn base_address(&self) -> Option<&EndpointAddress> {
        self.base_address.as_ref()
    }

    pub fn relative_address(&self) -> &str {
        &self.relative_address
    }

    /// 拼接后的监听地址；未设置基准地址时返回 `None`。
    pub fn listen_uri(&self) -> Option<Result<EndpointAddress>> {
        self.base_address
            .as_ref()
            .map(|base| base.join(&self.relative_address))
    }
}

/// 构建上下文。
///
/// 克隆得到独立的剩余元素列表，供 `can_build_*` 试探使用。
#[derive(Clone)]
pub struct BindingContext {
    binding_name: Arc<str>,
    remaining: VecDeque<Box<dyn BindingElement>>,
    parameters: BindingParameters,
    listen: ListenUriSettings,
    timeouts: ChannelTimeouts,
}

impl BindingContext {
    pub fn new(binding: &Binding, parameters: BindingParameters) -> Self {
        Self {
            binding_name: binding.name().into(),
            remaining: binding.elements().iter().cloned().collect(),
            parameters,
            listen: ListenUriSettings::default(),
            timeouts: binding.timeouts(),
        }
    }

    /// 直接以元素列表构造，主要用于测试与单元素绑定。
    pub fn from_elements(
        elements: impl IntoIterator<Item = Box<dyn BindingElement>>,
        parameters: BindingParameters,
    ) -> Self {
        Self {
            binding_name: Arc::from("custom"),
            remaining: elements.into_iter().collect(),
            parameters,
            listen: ListenUriSettings::default(),
            timeouts: ChannelTimeouts::default(),
        }
    }

    pub fn with_listen_uri(mut self, listen: ListenUriSettings) -> Self {
        self.listen = listen;
        self
    }

    pub fn binding_name(&self) -> &str {
        &self.binding_name
    }

    pub fn parameters(&self) -> &BindingParameters {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut BindingParameters {
        &mut self.parameters
    }

    pub fn listen_uri(&self) -> &ListenUriSettings {
        &self.listen
    }

    /// 所属绑定的默认超时，由工厂与监听器继承。
    pub fn timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }

    pub fn remaining_binding_elements(&self) -> &VecDeque<Box<dyn BindingElement>> {
        &self.remaining
    }

    /// 弹出下一个元素并让它构建工厂。
    pub fn build_inner_channel_factory(
        &mut self,
        shape: ChannelShape,
    ) -> Result<Arc<dyn ChannelFactory>> {
        let element = self
            .remaining
            .pop_front()
            .ok_or(BindingError::NoChannelBuilder { shape })?;
        tracing::trace!(
            binding = %self.binding_name,
            binding.element = element.name(),
            %shape,
            "building channel factory"
        );
        element.build_channel_factory(shape, self)
    }

    /// 弹出下一个元素并让它构建监听器。
    pub fn build_inner_channel_listener(
        &mut self,
        shape: ChannelShape,
    ) -> Result<Arc<dyn ChannelListener>> {
        let element = self
            .remaining
            .pop_front()
            .ok_or(BindingError::NoChannelBuilder { shape })?;
        tracing::trace!(
            binding = %self.binding_name,
            binding.element = element.name(),
            %shape,
            "building channel listener"
        );
        element.build_channel_listener(shape, self)
    }

    pub fn can_build_inner_channel_factory(&self, shape: ChannelShape) -> bool {
        let mut lookahead = self.clone();
        match lookahead.remaining.pop_front() {
            Some(element) => element.can_build_channel_factory(shape, &lookahead),
            None => false,
        }
    }

    pub fn can_build_inner_channel_listener(&self, shape: ChannelShape) -> bool {
        let mut lookahead = self.clone();
        match lookahead.remaining.pop_front() {
            Some(element) => element.can_build_channel_listener(shape, &lookahead),
            None => false,
        }
    }

    /// 向下一层查询属性，不消费上下文。
    pub fn inner_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        let mut lookahead = self.clone();
        let element = lookahead.remaining.pop_front()?;
        element.property(type_id, &lookahead)
    }

    pub fn get_inner_property<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner_property(TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// 顶层构建之后调用：剩余元素必须为空。
    pub fn validate_binding_elements_consumed(&self) -> Result<()> {
        if self.remaining.is_empty() {
            return Ok(());
        }
        let elements = self
            .remaining
            .iter()
            .map(|element| element.name())
            .collect::<Vec<_>>()
            .join(", ");
        Err(BindingError::UnconsumedElements { elements }.into())
    }
}

impl fmt::Debug for BindingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingContext")
            .field("binding", &self.binding_name)
            .field("remaining", &self.remaining)
            .field("parameters", &self.parameters)
            .field("listen", &self.listen)
            .finish()
    }
}
