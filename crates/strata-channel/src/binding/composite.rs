use std::{
    any::{Any, TypeId},
    sync::Arc,
};

use strata_core::{ChannelTimeouts, Result};

use super::{BindingContext, BindingElement, BindingParameters, ListenUriSettings};
use crate::{ChannelFactory, ChannelListener, ChannelShape};

/// 绑定：有序的元素列表 + 默认超时。
///
/// 元素自上而下排列，最后一个必须是传输元素。
#[derive(Clone, Debug)]
pub struct Binding {
    name: String,
    elements: Vec<Box<dyn BindingElement>>,
    timeouts: ChannelTimeouts,
}

impl Binding {
    pub fn new(name: impl Into<String>, elements: Vec<Box<dyn BindingElement>>) -> Self {
        Self {
            name: name.into(),
            elements,
            timeouts: ChannelTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ChannelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elements(&self) -> &[Box<dyn BindingElement>] {
        &self.elements
    }

    pub fn timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }

    /// 构建通道工厂并校验所有元素都被消费。
    pub fn build_channel_factory(
        &self,
        shape: ChannelShape,
        parameters: BindingParameters,
    ) -> Result<Arc<dyn ChannelFactory>> {
        let mut context = BindingContext::new(self, parameters);
        let factory = context.build_inner_channel_factory(shape)?;
        context.validate_binding_elements_consumed()?;
        tracing::debug!(binding = %self.name, %shape, "channel factory built");
        Ok(factory)
    }

    /// 构建通道监听器并校验所有元素都被消费。
    pub fn build_channel_listener(
        &self,
        shape: ChannelShape,
        listen: ListenUriSettings,
        parameters: BindingParameters,
    ) -> Result<Arc<dyn ChannelListener>> {
        let mut context = BindingContext::new(self, parameters).with_listen_uri(listen);
        let listener = context.build_inner_channel_listener(shape)?;
        context.validate_binding_elements_consumed()?;
        tracing::debug!(binding = %self.name, %shape, "channel listener built");
        Ok(listener)
    }

    pub fn can_build_channel_factory(&self, shape: ChannelShape, parameters: BindingParameters) -> bool {
        BindingContext::new(self, parameters).can_build_inner_channel_factory(shape)
    }

    pub fn can_build_channel_listener(
        &self,
        shape: ChannelShape,
        parameters: BindingParameters,
    ) -> bool {
        BindingContext::new(self, parameters).can_build_inner_channel_listener(shape)
    }

    /// 沿元素栈查询属性。
    pub fn get_property<T: Any + Send + Sync>(&self, parameters: BindingParameters) -> Option<Arc<T>> {
        BindingContext::new(self, parameters)
            .inner_property(TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }
}
