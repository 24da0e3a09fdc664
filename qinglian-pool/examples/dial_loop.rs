//! 跑一个最小的服务池：sled 持久化 + 合成发现源，模拟几轮会话后
//! 观察节点进入有价值集合。
//!
//! RUST_LOG=debug cargo run --example dial_loop

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use qinglian_core::{
    common::{
        clock::{Clock, SystemClock},
        error::Error,
    },
    kv::SledStore,
};
use qinglian_pool::{
    common::{Id, Node},
    iter::NodeSource,
    nodestate::NodeStateMachine,
    pool::ServerPool,
    value::ValueTracker,
};
use rand::Rng;

/// 每 200ms 编造一个新节点的发现源
struct SyntheticDiscovery;

impl NodeSource for SyntheticDiscovery {
    fn next(&mut self) -> BoxFuture<'_, Option<Node>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let port: u16 = rand::thread_rng().gen_range(30000..40000);
            Some(Node::new(
                Id::random(),
                SocketAddr::from(([127, 0, 0, 1], port)),
            ))
        })
    }

    fn close(&mut self) {}
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let dir = std::env::temp_dir().join("qinglian-dial-loop");
    let db = Arc::new(SledStore::open(&dir)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let ns = NodeStateMachine::new(db.clone(), b"ns-", clock.clone());
    let vt = Arc::new(ValueTracker::new(clock.clone(), Duration::from_secs(3600)));
    let pool = ServerPool::new(
        db,
        b"sp-",
        ns.clone(),
        vt.clone(),
        Some(Box::new(SyntheticDiscovery)),
        clock,
        &[],
        false,
    )?;

    ns.start()?;
    pool.start();

    for round in 0..5 {
        let node = match pool.next_candidate().await {
            Some(node) => node,
            None => break,
        };
        println!("round {}: dialing {}", round, node);

        // 模拟一次握手成功、响应良好的短会话
        pool.register_peer(&node);
        for _ in 0..8 {
            vt.add_sample(&node.id, Duration::from_millis(40));
        }
        pool.unregister_peer(&node);
    }

    println!("suggested soft timeout: {:?}", pool.get_timeout());

    pool.stop().await;
    ns.stop();

    Ok(())
}
