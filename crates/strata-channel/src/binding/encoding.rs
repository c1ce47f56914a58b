use std::{any::TypeId, sync::Arc};

use strata_core::{PropertyValue, Result};

use super::{BindingContext, BindingElement};
use crate::{
    BinaryMessageEncoder, ChannelFactory, ChannelListener, ChannelShape, EncoderParameter,
    MessageEncoder,
};

/// 编码元素：把编码器放入绑定参数，然后交给下一层构建。
///
/// 该元素只消费自身，不产生任何通道包装。
#[derive(Clone, Debug)]
pub struct EncodingBindingElement {
    encoder: Arc<dyn MessageEncoder>,
}

impl EncodingBindingElement {
    pub fn new(encoder: Arc<dyn MessageEncoder>) -> Self {
        Self { encoder }
    }

    pub fn binary() -> Self {
        Self::new(Arc::new(BinaryMessageEncoder::new()))
    }

    pub fn encoder(&self) -> &Arc<dyn MessageEncoder> {
        &self.encoder
    }

    fn register(&self, context: &mut BindingContext) {
        context
            .parameters_mut()
            .add(EncoderParameter::new(Arc::clone(&self.encoder)));
    }
}

impl BindingElement for EncodingBindingElement {
    fn name(&self) -> &str {
        "encoding"
    }

    fn clone_element(&self) -> Box<dyn BindingElement> {
        Box::new(self.clone())
    }

    fn build_channel_factory(
        &self,
        shape: ChannelShape,
        context: &mut BindingContext,
    ) -> Result<Arc<dyn ChannelFactory>> {
        self.register(context);
        context.build_inner_channel_factory(shape)
    }

    fn build_channel_listener(
        &self,
        shape: ChannelShape,
        context: &mut BindingContext,
    ) -> Result<Arc<dyn ChannelListener>> {
        self.register(context);
        context.build_inner_channel_listener(shape)
    }

    fn property(&self, type_id: TypeId, context: &BindingContext) -> Option<PropertyValue> {
        if type_id == TypeId::of::<EncoderParameter>() {
            return Some(Arc::new(EncoderParameter::new(Arc::clone(&self.encoder))));
        }
        context.inner_property(type_id)
    }
}
