//! TCP 环回测试。
//!
//! # 测试目标（Why）
//! - 验证同一套通道栈在真实套接字上工作：系统分配端口、收发消息、连接复用；
//! - 验证连接不存在的端口时以建连错误失败，通道保持未打开。

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use strata_channel::{
    Binding, BindingElement, BindingParameters, ChannelShape, EncodingBindingElement,
    EndpointAddress, ListenUriSettings, Message,
};
use strata_core::{
    BufferSettings, CommunicationObject, CommunicationState, DefaultScheduler, PropertySourceExt, codes,
};
use strata_transport::{
    Connection, ConnectionInitiator, ConnectionTransportElement, PoolKey, TcpTransport,
    TransportContext,
};

const BUDGET: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_cross_a_real_socket() {
    let context = Arc::new(TransportContext::new(BufferSettings::default(), Arc::new(DefaultScheduler)));
    let binding = Binding::new(
        "binary over tcp",
        vec![
            Box::new(EncodingBindingElement::binary()) as Box<dyn BindingElement>,
            Box::new(ConnectionTransportElement::new(Arc::new(TcpTransport::new()), Arc::clone(&context))),
        ],
    );

    let listen = ListenUriSettings::new(EndpointAddress::parse("tcp://127.0.0.1:0/").expect("地址应合法"))
        .with_relative_address("echo");
    let listener = binding
        .build_channel_listener(ChannelShape::Input, listen, BindingParameters::new())
        .expect("构建监听器失败");
    listener.open(BUDGET).await.expect("监听器打开失败");
    let address = listener.uri().clone();
    assert_ne!(address.port(), Some(0), "监听地址应带系统分配的端口");
    assert_eq!(address.path(), "/echo");

    let factory = binding
        .build_channel_factory(ChannelShape::Output, BindingParameters::new())
        .expect("构建工厂失败");
    factory.open(BUDGET).await.expect("工厂打开失败");

    let outbound = factory.create_channel(&address, None).expect("创建通道失败");
    assert_eq!(
        outbound.get_property::<PoolKey>().as_deref(),
        Some(&PoolKey::Tcp(address.authority(808)))
    );
    outbound.open(BUDGET).await.expect("输出通道打开失败");
    let inbound = listener
        .accept_channel(BUDGET)
        .await
        .expect("接受通道失败")
        .expect("监听器不应已关闭");
    inbound.open(BUDGET).await.expect("输入通道打开失败");

    for index in 0..3_u8 {
        outbound
            .as_sink()
            .expect("输出通道应可发送")
            .send(Message::new("echo", Bytes::from(vec![index; 32])), BUDGET)
            .await
            .expect("发送失败");
    }
    for index in 0..3_u8 {
        let message = inbound
            .as_source()
            .expect("输入通道应可接收")
            .receive(BUDGET)
            .await
            .expect("接收失败")
            .expect("应收到消息");
        assert_eq!(&message.body()[..], &[index; 32][..], "同一连接上的消息保持发送顺序");
    }

    outbound.close(BUDGET).await.expect("输出通道关闭失败");
    let pool = context
        .registry()
        .lookup(&strata_core::PoolSettings::default());
    assert_eq!(pool.statistics().total_idle(), 1, "关闭的通道应把连接归还到池中");
    context.registry().release(&pool, BUDGET).await.expect("释放失败");

    factory.close(BUDGET).await.expect("工厂关闭失败");
    listener.close(BUDGET).await.expect("监听器关闭失败");
    assert_eq!(inbound.state(), CommunicationState::Closed);
}

#[tokio::test]
async fn connecting_to_a_closed_port_fails() {
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("绑定失败");
    let port = reserved.local_addr().expect("本地地址").port();
    drop(reserved);

    let address = EndpointAddress::parse(&format!("tcp://127.0.0.1:{port}/")).expect("地址应合法");
    let err = TcpTransport::new()
        .connect(&address, BUDGET)
        .await
        .expect_err("无人监听的端口应拒绝连接");
    assert!(
        err.code() == codes::TRANSPORT_CONNECT || err.is_timeout(),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn raw_connections_exchange_bytes() {
    let transport = TcpTransport::new();
    let acceptor = strata_transport::ConnectionTransport::listen(
        &transport,
        &EndpointAddress::parse("tcp://127.0.0.1:0/").expect("地址应合法"),
    )
    .await
    .expect("绑定失败");
    let target = acceptor.local_address().clone();

    let (client, server) = tokio::join!(transport.connect(&target, BUDGET), acceptor.accept(BUDGET));
    let client = client.expect("建连失败");
    let server = server.expect("接受失败");

    client.write(b"ping", true, BUDGET).await.expect("写入失败");
    let mut buf = [0_u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        filled += server.read(&mut buf[filled..], BUDGET).await.expect("读取失败");
    }
    assert_eq!(&buf, b"ping");

    client.close(BUDGET).await.expect("关闭失败");
    assert_eq!(server.read(&mut buf, BUDGET).await.expect("读取失败"), 0);
}
