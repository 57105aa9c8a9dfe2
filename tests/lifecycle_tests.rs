#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use brrtrpc::transport::local;
use brrtrpc::{
    RegistrationError, Responder, RpcServer, ServerError, ServerState, StatusCode, ThreadStartHook,
};
use common::*;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

#[test]
fn test_state_advances_in_order() {
    let (server, _client) = local_server(2);
    assert_eq!(server.state(), ServerState::Inited);

    server.register_service::<TestService>().unwrap();
    server.run(None).unwrap();
    assert_eq!(server.state(), ServerState::Running);
    assert!(!server.is_terminated());

    server.shutdown().unwrap();
    assert_eq!(server.state(), ServerState::Terminated);
    assert!(server.is_terminated());
}

#[test]
fn test_shutdown_is_idempotent() {
    let (server, _client) = running_server(1);
    server.shutdown().unwrap();
    server.shutdown().unwrap();
    assert!(server.is_terminated());
}

#[test]
fn test_shutdown_before_run() {
    let (server, _client) = local_server(3);
    server.register_service::<TestService>().unwrap();
    server.shutdown().unwrap();
    assert!(server.is_terminated());
    assert!(matches!(
        server.run(None),
        Err(ServerError::InvalidState {
            actual: ServerState::Terminated,
            ..
        })
    ));
}

#[test]
fn test_usage_errors_in_wrong_state() {
    let (server, _client) = local_server(1);
    server.register_service::<TestService>().unwrap();

    let early = server.register_method::<TestService, AddRequest, AddReply>(
        "Add",
        |_| {},
        |_| {},
        None,
    );
    assert!(matches!(
        early,
        Err(RegistrationError::InvalidState {
            expected: ServerState::Running,
            actual: ServerState::Inited,
            ..
        })
    ));

    server.run(None).unwrap();
    assert!(matches!(
        server.register_service::<UnregisteredService>(),
        Err(RegistrationError::InvalidState {
            expected: ServerState::Inited,
            actual: ServerState::Running,
            ..
        })
    ));
    assert!(matches!(
        server.run(None),
        Err(ServerError::InvalidState { .. })
    ));
    assert_eq!(server.service_names(), vec!["test.Calc"]);
    server.shutdown().unwrap();
}

#[test]
#[should_panic(expected = "RPC server usage error")]
fn test_strict_usage_panics_on_misuse() {
    let (builder, _client) = local::channel();
    let server =
        RpcServer::with_transport(test_config(1).with_strict_usage(true), Box::new(builder))
            .unwrap();
    server.register_service::<TestService>().unwrap();
    let _ = server.register_method::<TestService, AddRequest, AddReply>(
        "Add",
        |_| {},
        |_| {},
        None,
    );
}

#[test]
fn test_duplicate_service_keeps_one_entry() {
    let (server, _client) = local_server(1);
    server.register_service::<TestService>().unwrap();
    assert!(matches!(
        server.register_service::<TestService>(),
        Err(RegistrationError::DuplicateService(ref name)) if name == "test.Calc"
    ));
    assert_eq!(server.service_names(), vec!["test.Calc"]);
    assert_eq!(server.state(), ServerState::Inited);
}

#[test]
fn test_zero_threads_is_rejected() {
    let (builder, _client) = local::channel();
    let err = RpcServer::with_transport(test_config(0), Box::new(builder)).unwrap_err();
    assert!(matches!(err, ServerError::Config(_)));
}

#[test]
fn test_thread_start_hook_runs_on_every_worker() {
    let (server, _client) = local_server(3);
    server.register_service::<TestService>().unwrap();

    let started = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&started);
    let hook: ThreadStartHook = Arc::new(move |index| {
        let name = std::thread::current().name().map(str::to_string);
        record.lock().unwrap().push((index, name));
    });
    server.run(Some(hook)).unwrap();

    assert!(wait_until(WAIT, || started.lock().unwrap().len() == 3));
    let mut started = started.lock().unwrap().clone();
    started.sort();
    assert_eq!(
        started,
        (0..3)
            .map(|i| (i, Some(format!("brrtrpc-cq-{i}"))))
            .collect::<Vec<_>>()
    );
    server.shutdown().unwrap();
}

#[test]
fn test_shutdown_finalizes_processing_calls() {
    let (server, client) = running_server(2);
    let (on_done, outcomes) = outcome_recorder();
    let held: Arc<Mutex<Vec<Responder<AddReply>>>> = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&held);
    server
        .register_method::<TestService, AddRequest, AddReply>(
            "Hold",
            |_| {},
            move |call| {
                if let Some(responder) = call.defer() {
                    store.lock().unwrap().push(responder);
                }
            },
            Some(on_done),
        )
        .unwrap();

    let pending: Vec<_> = (0..4)
        .map(|_| {
            client
                .submit("test.Calc", "Hold", &AddRequest::default())
                .unwrap()
        })
        .collect();
    assert!(wait_until(WAIT, || {
        held.lock().unwrap().len() == 4 && server.active_calls().iter().sum::<usize>() == 4
    }));

    server.shutdown().unwrap();

    for reply in pending {
        assert_eq!(reply.wait().unwrap_err().code, StatusCode::Unavailable);
    }
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| !o.ok));
    assert!(outcomes
        .iter()
        .all(|o| o.status.code == StatusCode::Unavailable));

    // The queues are drained; late replies go nowhere.
    let late = held.lock().unwrap().pop().unwrap();
    assert!(!late.respond(AddReply { sum: 0, queue: 0 }));
}

#[test]
fn test_calls_after_shutdown_are_unavailable() {
    let (server, client) = running_server(1);
    register_add(&server, None);
    server.shutdown().unwrap();
    let status = client
        .call::<_, AddReply>("test.Calc", "Add", &AddRequest::default())
        .unwrap_err();
    assert_eq!(status.code, StatusCode::Unavailable);
}

#[test]
fn test_pending_accepts_are_cancelled_on_shutdown() {
    let (server, _client) = running_server(2);
    let index = register_add(&server, None);
    assert_eq!(server.accept_slots(index), vec![1, 1]);
    server.shutdown().unwrap();
    assert_eq!(server.accept_slots(index), vec![0, 0]);
    let cancelled: u64 = server.queue_metrics().iter().map(|m| m.cancelled).sum();
    assert_eq!(cancelled, 2);
}

#[test]
fn test_shutdown_from_worker_is_refused() {
    let (server, client) = running_server(1);
    let server = Arc::new(server);
    let weak: Weak<RpcServer> = Arc::downgrade(&server);
    let (result_tx, result_rx) = mpsc::channel();
    let result_tx = Mutex::new(result_tx);
    server
        .register_method::<TestService, AddRequest, AddReply>(
            "Stop",
            |_| {},
            move |call| {
                if let Some(server) = weak.upgrade() {
                    let refused = matches!(server.shutdown(), Err(ServerError::ShutdownFromWorker));
                    result_tx.lock().unwrap().send(refused).unwrap();
                }
                call.respond(AddReply { sum: 0, queue: 0 });
            },
            None,
        )
        .unwrap();

    let _: AddReply = client.call("test.Calc", "Stop", &AddRequest::default()).unwrap();
    assert!(result_rx.recv().unwrap());
    assert_eq!(server.state(), ServerState::Running);
    server.shutdown().unwrap();
}

#[test]
fn test_drop_shuts_down() {
    let (server, client) = running_server(2);
    register_add(&server, None);
    drop(server);
    let status = client
        .call::<_, AddReply>("test.Calc", "Add", &AddRequest::default())
        .unwrap_err();
    assert_eq!(status.code, StatusCode::Unavailable);
}

#[test]
fn test_no_method_is_appended_once_shutdown_begins() {
    let (server, _client) = running_server(2);
    let server = Arc::new(server);
    let registrar = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            let mut accepted = 0;
            loop {
                let name = format!("M{accepted}");
                match server.register_method::<TestService, AddRequest, AddReply>(
                    &name,
                    |_| {},
                    |call| call.respond(AddReply { sum: 0, queue: 0 }),
                    None,
                ) {
                    Ok(_) => accepted += 1,
                    Err(RegistrationError::InvalidState { actual, .. }) => {
                        assert_ne!(actual, ServerState::Running);
                        return accepted;
                    }
                    Err(other) => panic!("unexpected registration error: {other}"),
                }
            }
        })
    };

    assert!(wait_until(WAIT, || server.method_count() >= 10));
    server.shutdown().unwrap();
    let accepted = registrar.join().unwrap();

    assert!(server.is_terminated());
    assert_eq!(server.method_count(), accepted);
    assert!((0..accepted)
        .all(|index| server.accept_slots(index).iter().all(|&slots| slots == 0)));
}
