//! 绑定元素组合契约测试。
//!
//! # 测试目标（Why）
//! - 验证构建过程每层恰好消费一个元素，上层放入的绑定参数对下层可见；
//! - 验证元素耗尽、元素未消费两类组合错误的错误码与消息；
//! - 验证 `can_build_*` 与属性查询只在副本上试探，不消费真实上下文。

use std::{
    any::TypeId,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use strata_channel::{
    Binding, BindingContext, BindingElement, BindingParameters, ChannelFactory, ChannelShape,
    EncoderParameter, EncodingBindingElement, EndpointAddress, ListenUriSettings,
};
use strata_core::{
    ChannelTimeouts, CommunicationObject, CommunicationState, ErrorCategory, Lifecycle,
    LifecycleHooks, PropertySource, PropertyValue, Result, async_trait, codes,
};

/// 只支持输出形态的桩传输元素，记录构建时看到的上下文。
#[derive(Clone, Debug)]
struct StubTransport {
    observed: Arc<Mutex<Observed>>,
}

#[derive(Clone, Debug, Default)]
struct Observed {
    remaining_at_transport: Option<usize>,
    content_type: Option<String>,
}

impl StubTransport {
    fn new() -> Self {
        Self {
            observed: Arc::new(Mutex::new(Observed::default())),
        }
    }

    fn observed(&self) -> Observed {
        self.observed.lock().clone()
    }
}

impl BindingElement for StubTransport {
    fn name(&self) -> &str {
        "stub-transport"
    }

    fn clone_element(&self) -> Box<dyn BindingElement> {
        Box::new(self.clone())
    }

    fn can_build_channel_factory(&self, shape: ChannelShape, _context: &BindingContext) -> bool {
        shape == ChannelShape::Output
    }

    fn can_build_channel_listener(&self, _shape: ChannelShape, _context: &BindingContext) -> bool {
        false
    }

    fn build_channel_factory(
        &self,
        shape: ChannelShape,
        context: &mut BindingContext,
    ) -> Result<Arc<dyn ChannelFactory>> {
        let mut observed = self.observed.lock();
        observed.remaining_at_transport = Some(context.remaining_binding_elements().len());
        observed.content_type = context
            .parameters()
            .find::<EncoderParameter>()
            .map(|parameter| parameter.encoder().content_type().to_owned());
        Ok(Arc::new(StubFactory {
            lifecycle: Lifecycle::new("stub factory"),
            shape,
            timeouts: context.timeouts(),
        }))
    }

    fn property(&self, type_id: TypeId, _context: &BindingContext) -> Option<PropertyValue> {
        (type_id == TypeId::of::<u32>()).then(|| Arc::new(7_u32) as PropertyValue)
    }
}

/// 不消费任何层的占位元素，用于制造“未消费元素”。
#[derive(Clone, Debug)]
struct Leftover;

impl BindingElement for Leftover {
    fn name(&self) -> &str {
        "leftover"
    }

    fn clone_element(&self) -> Box<dyn BindingElement> {
        Box::new(self.clone())
    }
}

struct StubFactory {
    lifecycle: Lifecycle,
    shape: ChannelShape,
    timeouts: ChannelTimeouts,
}

impl LifecycleHooks for StubFactory {}

#[async_trait]
impl CommunicationObject for StubFactory {
    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.lifecycle.open(self, timeout).await
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.lifecycle.close(self, timeout).await
    }

    fn abort(&self) {
        self.lifecycle.abort(self);
    }
}

impl PropertySource for StubFactory {
    fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        (type_id == TypeId::of::<ChannelTimeouts>()).then(|| Arc::new(self.timeouts) as PropertyValue)
    }
}

impl ChannelFactory for StubFactory {
    fn shape(&self) -> ChannelShape {
        self.shape
    }

    fn create_channel(
        &self,
        _address: &EndpointAddress,
        _via: Option<&EndpointAddress>,
    ) -> Result<Arc<dyn strata_channel::Channel>> {
        Err(strata_core::CoreError::invalid_state("stub factory does not create channels"))
    }
}

#[test]
fn transport_only_binding_builds_factory() {
    let transport = StubTransport::new();
    let binding = Binding::new("plain", vec![Box::new(transport.clone())]);

    let factory = binding
        .build_channel_factory(ChannelShape::Output, BindingParameters::new())
        .expect("单传输元素应可构建");

    assert_eq!(factory.shape(), ChannelShape::Output);
    assert_eq!(transport.observed().remaining_at_transport, Some(0));
    assert_eq!(transport.observed().content_type, None);
}

#[test]
fn encoding_parameter_reaches_transport() {
    let transport = StubTransport::new();
    let binding = Binding::new(
        "binary",
        vec![
            Box::new(EncodingBindingElement::binary()),
            Box::new(transport.clone()),
        ],
    );

    binding
        .build_channel_factory(ChannelShape::Output, BindingParameters::new())
        .expect("编码 + 传输应可构建");

    let observed = transport.observed();
    assert_eq!(observed.remaining_at_transport, Some(0));
    assert_eq!(
        observed.content_type.as_deref(),
        Some("application/x-strata-binary")
    );
}

#[test]
fn binding_timeouts_flow_into_factory() {
    let timeouts = ChannelTimeouts {
        open: Duration::from_secs(3),
        ..ChannelTimeouts::default()
    };
    let binding = Binding::new("timed", vec![Box::new(StubTransport::new())]).with_timeouts(timeouts);

    let factory = binding
        .build_channel_factory(ChannelShape::Output, BindingParameters::new())
        .expect("构建失败");
    let inherited = factory
        .query_property(TypeId::of::<ChannelTimeouts>())
        .and_then(|value| value.downcast::<ChannelTimeouts>().ok())
        .expect("工厂应回答超时属性");
    assert_eq!(inherited.open, Duration::from_secs(3));
}

#[test]
fn element_below_transport_is_reported_unconsumed() {
    let binding = Binding::new(
        "broken",
        vec![Box::new(StubTransport::new()), Box::new(Leftover)],
    );

    let err = binding
        .build_channel_factory(ChannelShape::Output, BindingParameters::new())
        .err().expect("传输之下的元素不会被消费");
    assert_eq!(err.code(), codes::BINDING_UNCONSUMED_ELEMENTS);
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.message().contains("leftover"), "消息应列出元素名：{}", err.message());
}

#[test]
fn exhausted_elements_report_missing_builder() {
    let binding = Binding::new("no-transport", vec![Box::new(EncodingBindingElement::binary())]);

    let err = binding
        .build_channel_factory(ChannelShape::Output, BindingParameters::new())
        .err().expect("没有传输元素时无法构建");
    assert_eq!(err.code(), codes::BINDING_NO_CHANNEL_BUILDER);
}

#[test]
fn non_transport_element_rejects_listener_by_default() {
    let binding = Binding::new("leftover-only", vec![Box::new(Leftover)]);

    let err = binding
        .build_channel_listener(
            ChannelShape::Input,
            ListenUriSettings::default(),
            BindingParameters::new(),
        )
        .err().expect("缺省实现不支持任何形态");
    assert_eq!(err.code(), codes::BINDING_UNSUPPORTED_SHAPE);
}

#[test]
fn can_build_checks_without_consuming() {
    let binding = Binding::new(
        "binary",
        vec![
            Box::new(EncodingBindingElement::binary()),
            Box::new(StubTransport::new()),
        ],
    );
    let context = BindingContext::new(&binding, BindingParameters::new());

    assert!(context.can_build_inner_channel_factory(ChannelShape::Output));
    assert!(context.can_build_inner_channel_factory(ChannelShape::Output));
    assert!(!context.can_build_inner_channel_factory(ChannelShape::Duplex));
    assert!(!context.can_build_inner_channel_listener(ChannelShape::Input));
    assert_eq!(context.remaining_binding_elements().len(), 2);

    assert!(binding.can_build_channel_factory(ChannelShape::Output, BindingParameters::new()));
    assert!(!Binding::new("empty", Vec::new())
        .can_build_channel_factory(ChannelShape::Output, BindingParameters::new()));
}

#[test]
fn properties_are_answered_by_the_first_element_that_knows_them() {
    let binding = Binding::new(
        "binary",
        vec![
            Box::new(EncodingBindingElement::binary()),
            Box::new(StubTransport::new()),
        ],
    );

    let encoder = binding
        .get_property::<EncoderParameter>(BindingParameters::new())
        .expect("编码元素应回答编码器");
    assert_eq!(encoder.encoder().content_type(), "application/x-strata-binary");
    assert_eq!(
        binding.get_property::<u32>(BindingParameters::new()).as_deref(),
        Some(&7)
    );
    assert!(binding.get_property::<String>(BindingParameters::new()).is_none());
}

#[test]
fn listen_uri_joins_base_and_relative_address() {
    let base = EndpointAddress::parse("mem://host/services/").expect("地址应合法");
    let listen = ListenUriSettings::new(base).with_relative_address("orders");
    let uri = listen
        .listen_uri()
        .expect("设置了基准地址")
        .expect("拼接应成功");
    assert_eq!(uri.path(), "/services/orders");
    assert!(ListenUriSettings::default().listen_uri().is_none());
}
