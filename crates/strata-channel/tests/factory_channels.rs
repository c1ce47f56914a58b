//! 工厂与其产出通道的级联契约测试。
//!
//! # 测试目标（Why）
//! - 验证工厂关闭时级联关闭全部存活通道，等待中的接收者得到“输入结束”；
//! - 验证通道自行关闭后从工厂登记表中移除，不会被工厂重复处理；
//! - 验证工厂关闭后无法再创建通道；
//! - 验证通道回答不了的属性经由弱引用转交给工厂，工厂释放后不再转交。

use std::{
    any::TypeId,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use strata_channel::{
    Channel, ChannelFactory, ChannelFactoryBase, ChannelShape, EndpointAddress, InputQueueChannel,
    ManagerLink, Message, MessageFeeder, MessageSource,
};
use strata_core::{
    ChannelTimeouts, CommunicationObject, CommunicationState, InlineScheduler, LifecycleHooks,
    PropertySource, PropertySourceExt, PropertyValue, Result, TimeoutBudget, async_trait, codes,
};

/// 只有工厂才回答的属性。
#[derive(Debug, PartialEq, Eq)]
struct FactoryTag(&'static str);

struct LoopbackFactory {
    base: ChannelFactoryBase,
    link: ManagerLink,
}

impl LoopbackFactory {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let owner: Weak<dyn PropertySource + Send + Sync> = this.clone();
            Self {
                base: ChannelFactoryBase::new("loopback factory", ChannelTimeouts::default()),
                link: ManagerLink::new(owner),
            }
        })
    }

    fn create_with_feeder(&self, address: &EndpointAddress) -> Result<(Arc<dyn Channel>, MessageFeeder)> {
        let handle = self.base.reserve_channel()?;
        let channel = Arc::new(
            InputQueueChannel::new(address.clone(), self.base.timeouts(), Arc::new(InlineScheduler))
                .with_manager(self.link.clone()),
        );
        let feeder = channel.feeder();
        self.base.track_channel(&handle, channel.clone(), address)?;
        channel.set_handle(handle);
        Ok((channel, feeder))
    }
}

#[async_trait]
impl LifecycleHooks for LoopbackFactory {
    async fn on_close(&self, budget: TimeoutBudget) -> Result<()> {
        self.base.close_channels(budget).await
    }

    fn on_abort(&self) {
        self.base.abort_channels();
    }
}

#[async_trait]
impl CommunicationObject for LoopbackFactory {
    fn state(&self) -> CommunicationState {
        self.base.lifecycle().state()
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.base.lifecycle().open(self, timeout).await
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.base.lifecycle().close(self, timeout).await
    }

    fn abort(&self) {
        self.base.lifecycle().abort(self);
    }
}

impl PropertySource for LoopbackFactory {
    fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        if type_id == TypeId::of::<FactoryTag>() {
            return Some(Arc::new(FactoryTag("loopback")));
        }
        self.base.query_property(type_id)
    }
}

impl ChannelFactory for LoopbackFactory {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Input
    }

    fn create_channel(
        &self,
        address: &EndpointAddress,
        _via: Option<&EndpointAddress>,
    ) -> Result<Arc<dyn Channel>> {
        self.create_with_feeder(address).map(|(channel, _)| channel)
    }
}

fn address() -> EndpointAddress {
    EndpointAddress::parse("mem://loopback/inbox").expect("地址应合法")
}

#[tokio::test]
async fn factory_close_cascades_to_live_channels() {
    let factory = LoopbackFactory::new();
    factory.open(Duration::from_secs(1)).await.expect("工厂打开失败");
    let (channel, feeder) = factory.create_with_feeder(&address()).expect("创建通道失败");
    channel.open(Duration::from_secs(1)).await.expect("通道打开失败");
    assert_eq!(factory.base.channels().len(), 1);

    feeder.deliver(Message::new("ping", Bytes::from_static(b"x")), true);
    let source = channel.as_source().expect("输入通道应可接收");
    let received = source
        .receive(Duration::from_secs(1))
        .await
        .expect("接收失败")
        .expect("应收到消息");
    assert_eq!(received.action(), "ping");

    let waiting = {
        let channel = channel.clone();
        tokio::spawn(async move {
            let source = channel.as_source().expect("输入通道应可接收");
            source.receive(Duration::from_secs(30)).await
        })
    };
    tokio::task::yield_now().await;

    factory.close(Duration::from_secs(1)).await.expect("工厂关闭失败");
    assert_eq!(channel.state(), CommunicationState::Closed);
    let outcome = waiting.await.expect("接收任务 panic").expect("关闭不应报错");
    assert!(outcome.is_none(), "关闭后等待中的接收者应得到输入结束");
}

#[tokio::test]
async fn self_closed_channel_leaves_registry() {
    let factory = LoopbackFactory::new();
    factory.open(Duration::from_secs(1)).await.expect("工厂打开失败");
    let channel = factory
        .create_channel(&address(), None)
        .expect("创建通道失败");
    channel.open(Duration::from_secs(1)).await.expect("通道打开失败");

    channel.close(Duration::from_secs(1)).await.expect("通道关闭失败");
    assert!(factory.base.channels().is_empty());

    factory.close(Duration::from_secs(1)).await.expect("工厂关闭失败");
    let err = factory
        .create_channel(&address(), None)
        .err().expect("关闭后不能再创建通道");
    assert_eq!(err.code(), codes::LIFECYCLE_DISPOSED);
}

#[tokio::test]
async fn factory_abort_aborts_channels() {
    let factory = LoopbackFactory::new();
    factory.open(Duration::from_secs(1)).await.expect("工厂打开失败");
    let channel = factory
        .create_channel(&address(), None)
        .expect("创建通道失败");
    channel.open(Duration::from_secs(1)).await.expect("通道打开失败");

    factory.abort();
    assert_eq!(factory.state(), CommunicationState::Closed);
    assert_eq!(channel.state(), CommunicationState::Closed);
    assert!(factory.base.channels().is_closed());
}

#[tokio::test]
async fn channels_inherit_factory_timeouts() {
    let factory = LoopbackFactory::new();
    factory.open(Duration::from_secs(1)).await.expect("工厂打开失败");
    let channel = factory
        .create_channel(&address(), None)
        .expect("创建通道失败");
    let timeouts = channel
        .query_property(TypeId::of::<ChannelTimeouts>())
        .and_then(|value| value.downcast::<ChannelTimeouts>().ok())
        .expect("通道应回答超时属性");
    assert_eq!(*timeouts, ChannelTimeouts::default());
    assert!(channel.as_sink().is_none());
}

#[tokio::test]
async fn unanswered_properties_are_forwarded_to_the_factory() {
    let factory = LoopbackFactory::new();
    factory.open(Duration::from_secs(1)).await.expect("工厂打开失败");
    let channel = factory
        .create_channel(&address(), None)
        .expect("创建通道失败");

    assert_eq!(
        channel.get_property::<FactoryTag>().as_deref(),
        Some(&FactoryTag("loopback"))
    );
    assert_eq!(
        channel.get_property::<EndpointAddress>().as_deref(),
        Some(&address()),
        "通道自身能回答的属性不转交"
    );

    factory.abort();
    drop(factory);
    assert!(channel.get_property::<FactoryTag>().is_none(), "工厂释放后不再转交");
}
