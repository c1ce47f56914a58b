//! 管道名池键缓存测试。
//!
//! # 测试目标（Why）
//! - 验证同一地址在失效前只解析一次，映射按管道名失效后重新解析；
//! - 验证服务端改名发布后，旧管道名上的连接中止通知能让客户端拿到新池键；
//! - 以属性测试约束候选名的数量与优先级顺序。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use proptest::prelude::*;
use strata_channel::EndpointAddress;
use strata_core::{Result, codes};
use strata_transport::{PipeKeyCache, PipeNameResolver, PoolKey, PublishedPipes, pipe_name_candidates};

fn address(uri: &str) -> EndpointAddress {
    EndpointAddress::parse(uri).expect("地址应合法")
}

#[test]
fn resolution_is_cached_until_the_pipe_aborts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let resolver = move |_: &EndpointAddress| -> Result<String> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok("+/orders".to_owned())
    };
    let cache = PipeKeyCache::new();
    let orders = address("pipe://box/orders");
    let nested = address("pipe://box/orders/eu");

    assert_eq!(cache.resolve(&orders, &resolver).expect("解析失败"), PoolKey::pipe("+/orders"));
    assert_eq!(cache.resolve(&orders, &resolver).expect("解析失败"), PoolKey::pipe("+/orders"));
    cache.resolve(&nested, &resolver).expect("解析失败");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);

    assert_eq!(cache.on_connection_aborted("+/orders"), 2, "同名管道下的全部地址都应失效");
    assert!(cache.is_empty());
    assert_eq!(cache.on_connection_aborted("+/orders"), 0);

    cache.resolve(&orders, &resolver).expect("解析失败");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn renamed_pipe_is_picked_up_after_abort() {
    let pipes = PublishedPipes::new();
    pipes.publish("box/orders");
    let cache = PipeKeyCache::new();
    let target = address("pipe://box/orders/eu");

    assert_eq!(cache.resolve(&target, &pipes).expect("解析失败"), PoolKey::pipe("box/orders"));

    assert!(pipes.unpublish("box/orders"));
    pipes.publish("+/orders/eu");
    assert_eq!(
        cache.resolve(&target, &pipes).expect("解析失败"),
        PoolKey::pipe("box/orders"),
        "未收到中止通知前仍使用缓存"
    );

    cache.on_connection_aborted("box/orders");
    assert_eq!(cache.resolve(&target, &pipes).expect("解析失败"), PoolKey::pipe("+/orders/eu"));
}

#[test]
fn unresolvable_address_is_not_cached() {
    let pipes = PublishedPipes::new();
    let cache = PipeKeyCache::new();
    let err = cache
        .resolve(&address("pipe://box/missing"), &pipes as &dyn PipeNameResolver)
        .expect_err("没有发布的管道时应失败");
    assert_eq!(err.code(), codes::TRANSPORT_CONNECT);
    assert!(cache.is_empty());
}

proptest! {
    #[test]
    fn candidates_cover_every_prefix_in_priority_order(
        host in "[a-z]{1,8}",
        segments in prop::collection::vec("[a-z0-9]{1,6}", 0..5),
    ) {
        let uri = format!("pipe://{host}/{}", segments.join("/"));
        let candidates = pipe_name_candidates(&address(&uri));
        let per_host = segments.len() + 1;
        prop_assert_eq!(candidates.len(), 3 * per_host);

        let full_path = segments.join("/");
        prop_assert_eq!(&candidates[0], &format!("+/{full_path}"));
        prop_assert_eq!(&candidates[per_host], &format!("{host}/{full_path}"));
        prop_assert_eq!(&candidates[2 * per_host], &format!("*/{full_path}"));
        prop_assert_eq!(candidates.last().map(String::as_str), Some("*/"));
    }
}
