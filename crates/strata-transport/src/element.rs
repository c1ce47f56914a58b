//! 面向连接的传输绑定元素。
//!
//! # 教案式说明
//! - **意图（Why）**：传输元素位于绑定最底层，把 [`ConnectionTransport`] 的“建连/监听”能力
//!   包装为通道工厂与通道监听器，使编码元素与上层通道无需了解介质。
//! - **逻辑（How）**：
//!   - `Output` 形态构建 [`ConnectionOutputChannelFactory`]，`Input` 形态构建
//!     [`ConnectionInputChannelListener`]，其余形态报告不支持；
//!   - 编码器取自绑定参数中的 [`EncoderParameter`]，缺省为 [`BinaryMessageEncoder`]；
//!   - 工厂与监听器继承绑定的默认超时。
//! - **契约（What）**：
//!   - 传输元素是终端元素：不再调用 `build_inner_*`，属性查询只回答自己认识的类型；
//!   - 监听器要求上下文提供监听地址，缺失时返回 [`BindingError::MissingParameter`]。

use std::{any::TypeId, fmt, sync::Arc};

use strata_channel::{
    BinaryMessageEncoder, BindingContext, BindingElement, BindingError, ChannelFactory,
    ChannelListener, ChannelShape, EncoderParameter, MessageEncoder,
};
use strata_core::{BufferSettings, PoolSettings, PropertyValue, Result};

use crate::{
    ConnectionInputChannelListener, ConnectionOutputChannelFactory, ConnectionTransport,
    TransportContext,
};

/// 传输元素。
#[derive(Clone)]
pub struct ConnectionTransportElement {
    transport: Arc<dyn ConnectionTransport>,
    pool_settings: PoolSettings,
    buffer_settings: BufferSettings,
    context: Arc<TransportContext>,
}

impl ConnectionTransportElement {
    pub fn new(transport: Arc<dyn ConnectionTransport>, context: Arc<TransportContext>) -> Self {
        Self {
            transport,
            pool_settings: PoolSettings::default(),
            buffer_settings: context.buffers().settings().clone(),
            context,
        }
    }

    pub fn with_pool_settings(mut self, settings: PoolSettings) -> Self {
        self.pool_settings = settings;
        self
    }

    /// 覆盖消息尺寸配额；缓冲仍从上下文的共享管理器租借。
    pub fn with_buffer_settings(mut self, settings: BufferSettings) -> Self {
        self.buffer_settings = settings;
        self
    }

    pub fn pool_settings(&self) -> &PoolSettings {
        &self.pool_settings
    }

    pub fn buffer_settings(&self) -> &BufferSettings {
        &self.buffer_settings
    }

    pub fn transport(&self) -> &Arc<dyn ConnectionTransport> {
        &self.transport
    }

    fn encoder(context: &BindingContext) -> Arc<dyn MessageEncoder> {
        context
            .parameters()
            .find::<EncoderParameter>()
            .map_or_else(
                || Arc::new(BinaryMessageEncoder::new()) as Arc<dyn MessageEncoder>,
                |parameter| parameter.encoder(),
            )
    }

    fn unsupported(&self, shape: ChannelShape, role: &'static str) -> BindingError {
        BindingError::UnsupportedShape {
            element: self.name().to_owned(),
            shape,
            role,
        }
    }
}

impl BindingElement for ConnectionTransportElement {
    fn name(&self) -> &str {
        self.transport.scheme()
    }

    fn clone_element(&self) -> Box<dyn BindingElement> {
        Box::new(self.clone())
    }

    fn can_build_channel_factory(&self, shape: ChannelShape, _context: &BindingContext) -> bool {
        shape == ChannelShape::Output
    }

    fn can_build_channel_listener(&self, shape: ChannelShape, _context: &BindingContext) -> bool {
        shape == ChannelShape::Input
    }

    fn build_channel_factory(
        &self,
        shape: ChannelShape,
        context: &mut BindingContext,
    ) -> Result<Arc<dyn ChannelFactory>> {
        if shape != ChannelShape::Output {
            return Err(self.unsupported(shape, "factory").into());
        }
        Ok(ConnectionOutputChannelFactory::new(
            Arc::clone(&self.transport),
            Self::encoder(context),
            self.pool_settings.clone(),
            self.buffer_settings.max_received_message_size(),
            Arc::clone(&self.context),
            context.timeouts(),
        ))
    }

    fn build_channel_listener(
        &self,
        shape: ChannelShape,
        context: &mut BindingContext,
    ) -> Result<Arc<dyn ChannelListener>> {
        if shape != ChannelShape::Input {
            return Err(self.unsupported(shape, "listener").into());
        }
        let uri = context
            .listen_uri()
            .listen_uri()
            .ok_or_else(|| BindingError::MissingParameter {
                element: self.name().to_owned(),
                parameter: "listen uri",
            })??;
        Ok(ConnectionInputChannelListener::new(
            uri,
            Arc::clone(&self.transport),
            Self::encoder(context),
            self.buffer_settings.max_received_message_size(),
            Arc::clone(&self.context),
            context.timeouts(),
        ))
    }

    fn property(&self, type_id: TypeId, _context: &BindingContext) -> Option<PropertyValue> {
        if type_id == TypeId::of::<PoolSettings>() {
            return Some(Arc::new(self.pool_settings.clone()));
        }
        if type_id == TypeId::of::<BufferSettings>() {
            return Some(Arc::new(self.buffer_settings.clone()));
        }
        None
    }
}

impl fmt::Debug for ConnectionTransportElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTransportElement")
            .field("scheme", &self.transport.scheme())
            .field("pool", &self.pool_settings)
            .field("buffers", &self.buffer_settings)
            .finish()
    }
}
