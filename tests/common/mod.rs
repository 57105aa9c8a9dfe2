#![allow(dead_code)]

use brrtrpc::transport::local::{self, LocalClient};
use brrtrpc::{CallOutcome, DoneCallback, RpcServer, RpcService, ServerConfig};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub struct TestService;

impl RpcService for TestService {
    const NAME: &'static str = "test.Calc";
}

/// Never registered with any server.
pub struct UnregisteredService;

impl RpcService for UnregisteredService {
    const NAME: &'static str = "test.Nobody";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddReply {
    pub sum: i64,
    pub queue: usize,
}

/// Non-strict so usage errors come back as `Err` instead of panicking.
pub fn test_config(threads: usize) -> ServerConfig {
    ServerConfig::default()
        .with_listen_addr("127.0.0.1:0")
        .with_threads(threads)
        .with_strict_usage(false)
}

/// INITED server on the in-process transport, nothing registered.
pub fn local_server(threads: usize) -> (RpcServer, LocalClient) {
    let (builder, client) = local::channel();
    let server = RpcServer::with_transport(test_config(threads), Box::new(builder)).unwrap();
    (server, client)
}

/// RUNNING server with `TestService` registered and no methods yet.
pub fn running_server(threads: usize) -> (RpcServer, LocalClient) {
    let (server, client) = local_server(threads);
    server.register_service::<TestService>().unwrap();
    server.run(None).unwrap();
    (server, client)
}

/// Registers `TestService/Add`, answered synchronously.
pub fn register_add(server: &RpcServer, on_done: Option<DoneCallback>) -> usize {
    server
        .register_method::<TestService, AddRequest, AddReply>(
            "Add",
            |_| {},
            |call| {
                let sum = call.request().a + call.request().b;
                let queue = call.queue();
                call.respond(AddReply { sum, queue });
            },
            on_done,
        )
        .unwrap()
}

/// A completion callback and the outcomes it collects.
pub fn outcome_recorder() -> (DoneCallback, Arc<Mutex<Vec<CallOutcome>>>) {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let callback: DoneCallback = Box::new(move |outcome: &CallOutcome| {
        sink.lock().unwrap().push(outcome.clone());
    });
    (callback, outcomes)
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub const WAIT: Duration = Duration::from_secs(5);
