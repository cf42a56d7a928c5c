//! Session-level end-to-end tests: invocation, failure reconstruction,
//! asynchronous methods, callbacks and pipes.

mod common;

use common::*;
use remi_core::{RemoteRef, SessionError, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_echo_string_with_supplementary_code_point() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let service = client.lookup("service").await.unwrap();
    let reply = service
        .invoke(test_ord::ECHO, vec![Value::from("héllo 𝄞")])
        .await
        .unwrap();
    assert_eq!(reply.into_str().unwrap(), "héllo 𝄞");
}

#[tokio::test]
async fn test_echo_null_string() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let service = client.lookup("service").await.unwrap();
    let reply = service
        .invoke(test_ord::ECHO, vec![Value::Null])
        .await
        .unwrap();
    assert!(reply.is_null());
}

#[tokio::test]
async fn test_remote_throw_reconstructs_and_stitches() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let service = client.lookup("service").await.unwrap();
    let err = service
        .invoke(test_ord::FAIL, vec![Value::from("bad")])
        .await
        .unwrap_err();

    let SessionError::RemoteFailure(throwable) = err else {
        panic!("expected a remote failure, got {err}");
    };
    assert_eq!(throwable.class_name, "test::InvalidState");
    assert_eq!(throwable.message.as_deref(), Some("bad"));

    // Remote frames come first, then the local call site (the stub frame
    // itself is dropped).
    assert!(throwable.frames.len() >= 2);
    assert_eq!(throwable.frames[0].class_name, "test::Service");
    let local = throwable.frames.last().unwrap();
    assert_eq!(local.class_name, "<local>");
    assert!(local
        .file_name
        .as_deref()
        .unwrap()
        .ends_with("session_tests.rs"));
}

#[tokio::test]
async fn test_async_notify_returns_without_reply() {
    init_logging();
    let (client, _server, service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    let reply = stub
        .invoke(test_ord::NOTIFY, vec![Value::Int(42)])
        .await
        .unwrap();
    assert!(reply.is_null());

    // The callee runs exactly once.
    tokio::time::timeout(Duration::from_secs(2), service.notify_signal.notified())
        .await
        .expect("notify did not reach the service");
    assert_eq!(*service.notified.lock(), vec![42]);

    // The channel went straight back to the pool.
    assert!(client.channels_opened() <= 2);
}

#[tokio::test]
async fn test_async_failure_goes_to_error_sink() {
    init_logging();
    let (client, server, _service) = service_pair().await;

    let (tx, rx) = std::sync::mpsc::channel();
    server.set_error_sink(move |err| {
        let _ = tx.send(err);
    });

    let stub = client.lookup("service").await.unwrap();
    let reply = stub
        .invoke(test_ord::NOTIFY, vec![Value::Int(-1)])
        .await
        .unwrap();
    assert!(reply.is_null());

    let reported = tokio::task::spawn_blocking(move || {
        rx.recv_timeout(Duration::from_secs(2)).expect("sink report")
    })
    .await
    .unwrap();
    match reported {
        SessionError::AsynchronousInvocation { method, cause } => {
            assert_eq!(method, "notify");
            assert!(cause.to_string().contains("refusing -1"));
        }
        other => panic!("unexpected sink report: {other}"),
    }

    // The failure never travelled over the invocation channel; the session
    // keeps working.
    let reply = stub
        .invoke(test_ord::ECHO, vec![Value::from("still up")])
        .await
        .unwrap();
    assert_eq!(reply.into_str().unwrap(), "still up");
}

#[tokio::test]
async fn test_stub_identity_is_shared() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let a = client.lookup("service").await.unwrap();
    let b = client.lookup("service").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_lookup_unknown_binding_fails() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let err = client.lookup("nonexistent").await.unwrap_err();
    let SessionError::RemoteFailure(throwable) = err else {
        panic!("expected a remote failure");
    };
    assert_eq!(throwable.class_name, "remi::NoSuchBinding");
    assert_eq!(throwable.message.as_deref(), Some("nonexistent"));
}

#[tokio::test]
async fn test_callback_invokes_client_object() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let callback = Arc::new(Callback {
        pinged: AtomicI64::new(0),
    });
    let stub = client.lookup("service").await.unwrap();
    let reply = stub
        .invoke(
            test_ord::CALL_ME,
            vec![Value::Remote(RemoteRef::local(
                Arc::clone(&callback) as Arc<dyn remi_core::RemoteObject>,
                callback_factory(),
            ))],
        )
        .await
        .unwrap();

    // The server called ping() on our object and added one.
    assert_eq!(reply.as_int().unwrap(), 100);
    assert_eq!(callback.pinged.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_create_returns_shared_remote() {
    init_logging();
    let (client, _server, service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    let first = stub
        .invoke(test_ord::CREATE, Vec::new())
        .await
        .unwrap()
        .into_remote()
        .unwrap()
        .into_stub()
        .unwrap();
    let second = stub
        .invoke(test_ord::CREATE, Vec::new())
        .await
        .unwrap()
        .into_remote()
        .unwrap()
        .into_stub()
        .unwrap();

    // Both references name the same server object and share one stub.
    assert!(Arc::ptr_eq(&first, &second));

    assert_eq!(
        first.invoke(0, Vec::new()).await.unwrap().as_long().unwrap(),
        1
    );
    assert_eq!(
        second.invoke(0, Vec::new()).await.unwrap().as_long().unwrap(),
        2
    );
    assert_eq!(service.counter.value.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_pipe_method_hands_over_the_channel() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    let mut pipe = stub
        .invoke_pipe(test_ord::STREAM_SUM, vec![Value::Int(5)])
        .await
        .unwrap();

    {
        let out = pipe.writer().unwrap();
        for n in 1..=5 {
            out.write_int(n);
        }
        out.flush().await.unwrap();
    }
    let sum = pipe.reader().unwrap().read_long().await.unwrap();
    assert_eq!(sum, 15);
    pipe.close();
}

#[tokio::test]
async fn test_unimplemented_method_replies_not_ok() {
    init_logging();
    let (client, server) = session_pair().await;

    // The interface declares two methods but the implementation only
    // provides one, as happens when a skeleton predates its interface.
    let info = remi_core::RemoteInfo::builder("test::Partial")
        .method("works")
        .returns(remi_core::RemoteParameter::new(
            remi_core::ParamKind::Int,
            "int",
        ))
        .done()
        .method("missing")
        .done()
        .build();
    let factory = remi_core::SkeletonFactory::builder(info)
        .method("works", |_target, _args| async { Ok(Value::Int(7)) })
        .build()
        .unwrap();
    server.bind("partial", Arc::new(()) as Arc<dyn remi_core::RemoteObject>, &factory);

    let stub = client.lookup("partial").await.unwrap();
    assert_eq!(
        stub.invoke(0, Vec::new()).await.unwrap().as_int().unwrap(),
        7
    );

    let err = stub.invoke(1, Vec::new()).await.unwrap_err();
    let SessionError::RemoteFailure(throwable) = err else {
        panic!("expected a remote failure");
    };
    assert_eq!(throwable.class_name, "remi::UnimplementedMethod");
    assert!(throwable.message.as_deref().unwrap().contains("missing"));

    // The channel stayed clean and keeps serving.
    assert_eq!(
        stub.invoke(0, Vec::new()).await.unwrap().as_int().unwrap(),
        7
    );
}

#[tokio::test]
async fn test_graceful_shutdown_notifies_peer() {
    init_logging();
    let (client, server, _service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    stub.invoke(test_ord::ECHO, vec![Value::from("warm")])
        .await
        .unwrap();

    client.shutdown().await.unwrap();
    assert!(client.is_closed());

    // The peer observes the shutdown notice or the transport going away.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !server.is_closed() {
        assert!(std::time::Instant::now() < deadline, "peer never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = stub
        .invoke(test_ord::ECHO, vec![Value::from("late")])
        .await
        .unwrap_err();
    assert!(err.is_connection_closed(), "got {err}");
}
