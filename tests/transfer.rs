use std::io;
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use httpmock::prelude::*;

use catalog_tms::transfer::{
    CancelToken, Credential, FailureKind, HttpTransfer, TransferBody, TransferConfig,
    TransferEvent, TransferRequest, TransferResult,
};

fn transfer() -> HttpTransfer {
    HttpTransfer::new(&TransferConfig {
        timeout: Duration::from_secs(5),
        ..TransferConfig::default()
    })
    .unwrap()
}

fn run(request: &TransferRequest) -> (TransferResult, Vec<TransferEvent>) {
    let mut events = Vec::new();
    let mut sink = |event: TransferEvent| -> io::Result<()> {
        events.push(event);
        Ok(())
    };
    let result = transfer().run(request, &CancelToken::new(), &mut sink);
    (result, events)
}

#[test]
fn buffered_success_returns_body_and_headers() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/scene");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"ok":true}"#);
    });

    let (result, _) = run(&TransferRequest::get(server.url("/scene")));
    let response = result.into_result().unwrap();
    assert_eq!(response.headers.status, 200);
    assert!(response.headers.is_json());
    assert_eq!(response.text(), r#"{"ok":true}"#);
    assert!(response.tls_warnings.is_empty());
    mock.assert();
}

#[test]
fn streaming_emits_chunks_and_returns_byte_count() {
    let body = vec![7u8; 40_000];
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/tile.png");
        then.status(200)
            .header("content-type", "image/png")
            .body(body.clone());
    });

    let (result, events) = run(&TransferRequest::get(server.url("/tile.png")).streaming());
    let response = result.into_result().unwrap();
    assert_eq!(response.body, TransferBody::Streamed { byte_count: 40_000 });
    assert!(response.bytes().is_empty());

    let streamed = events
        .iter()
        .filter_map(|event| match event {
            TransferEvent::Chunk(chunk) => Some(chunk.clone()),
            _ => None,
        })
        .flatten()
        .collect::<Vec<_>>();
    assert_eq!(streamed, body);

    let last_progress = events.iter().rev().find_map(|event| match event {
        TransferEvent::Progress { received, .. } => Some(*received),
        _ => None,
    });
    assert_eq!(last_progress, Some(40_000));
}

#[test]
fn non_200_status_maps_to_fixed_message() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/missing");
        then.status(404);
    });

    let (result, _) = run(&TransferRequest::get(server.url("/missing")));
    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.kind, FailureKind::HttpStatus(404));
    assert_eq!(failure.http_status, Some(404));
    assert_eq!(failure.message, "Not found");
}

#[test]
fn unknown_status_is_error_network() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/teapot");
        then.status(418);
    });

    let (result, _) = run(&TransferRequest::get(server.url("/teapot")));
    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.kind, FailureKind::HttpStatus(418));
    assert_eq!(failure.message, "Error network");
}

#[test]
fn redirect_is_followed_transparently() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/old");
        then.status(302).header("location", "/new");
    });
    let target = server.mock(|when, then| {
        when.method(GET).path("/new");
        then.status(200).header("content-type", "text/plain").body("moved");
    });

    let (result, _) = run(&TransferRequest::get(server.url("/old")));
    let response = result.into_result().unwrap();
    assert_eq!(response.text(), "moved");
    assert!(response.headers.final_url.ends_with("/new"));
    target.assert();
}

#[test]
fn redirect_loop_stops_at_limit() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/a");
        then.status(302).header("location", "/b");
    });
    server.mock(|when, then| {
        when.method(GET).path("/b");
        then.status(302).header("location", "/a");
    });

    let (result, _) = run(&TransferRequest::get(server.url("/a")));
    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Network);
    assert_eq!(failure.message, "too many redirects (limit 10)");
    assert_eq!(failure.http_status, None);
}

#[test]
fn post_redirect_is_reissued_as_get() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/submit");
        then.status(303).header("location", "/result");
    });
    let target = server.mock(|when, then| {
        when.method(GET).path("/result");
        then.status(200).body("done");
    });

    let request = TransferRequest::post_json(server.url("/submit"), serde_json::json!({"a": 1}));
    let (result, _) = run(&request);
    assert_eq!(result.into_result().unwrap().text(), "done");
    target.assert();
}

#[test]
fn challenge_without_credential_is_unauthorized() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/secure");
        then.status(401);
    });

    let (result, _) = run(&TransferRequest::get(server.url("/secure")));
    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Unauthorized);
    assert_eq!(failure.message, "Unauthorized");
}

#[test]
fn challenge_is_answered_once_with_credential() {
    let server = MockServer::start();
    // "user:secret"
    let authorized = server.mock(|when, then| {
        when.method(GET)
            .path("/secure")
            .header("authorization", "Basic dXNlcjpzZWNyZXQ=");
        then.status(200).body("welcome");
    });
    server.mock(|when, then| {
        when.method(GET).path("/secure");
        then.status(401);
    });

    let request = TransferRequest::get(server.url("/secure")).with_credential(Some(Credential {
        user: "user".to_string(),
        password: "secret".to_string(),
    }));
    let (result, _) = run(&request);
    assert_eq!(result.into_result().unwrap().text(), "welcome");
    authorized.assert();
}

#[test]
fn second_challenge_is_unauthorized() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/locked");
        then.status(401);
    });

    let request = TransferRequest::get(server.url("/locked")).with_credential(Some(Credential {
        user: "user".to_string(),
        password: "wrong".to_string(),
    }));
    let (result, _) = run(&request);
    assert_eq!(result.into_result().unwrap_err().kind, FailureKind::Unauthorized);
}

#[test]
fn refused_connection_is_network_failure() {
    let (result, _) = run(&TransferRequest::get("http://127.0.0.1:1/"));
    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Network);
    assert_eq!(failure.http_status, None);
}

#[test]
fn canceled_token_stops_before_sending() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/never");
        then.status(500);
    });

    let cancel = CancelToken::new();
    cancel.cancel();
    let result = transfer().run(
        &TransferRequest::get(server.url("/never")),
        &cancel,
        &mut |_| Ok(()),
    );
    assert_matches!(result, TransferResult::Failure(failure) if failure.kind == FailureKind::Canceled);
}

#[test]
fn handle_cancel_returns_canceled_promptly() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(Duration::from_secs(3)).body("late");
    });

    let handle = transfer().execute(TransferRequest::get(server.url("/slow")));
    handle.cancel();
    let result = handle.wait();
    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Canceled);
    assert_eq!(failure.message, "Canceled request");
}

#[test]
fn handle_delivers_result_and_progress() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/small");
        then.status(200).header("content-type", "text/plain").body("hello");
    });

    let handle = transfer().execute(TransferRequest::get(server.url("/small")));
    let events = handle.events().iter().collect::<Vec<_>>();
    assert_eq!(
        events.last(),
        Some(&TransferEvent::Progress {
            received: 5,
            total: Some(5)
        })
    );
    let response = handle.wait().into_result().unwrap();
    assert_eq!(response.text(), "hello");
}

#[test]
fn exchange_forwards_chunks_on_calling_thread() {
    let body = vec![3u8; 50_000];
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/tile.png");
        then.status(200)
            .header("content-type", "image/png")
            .body(body.clone());
    });

    let mut written = Vec::new();
    let result = transfer().exchange(
        TransferRequest::get(server.url("/tile.png")).streaming(),
        &CancelToken::new(),
        &mut |event| {
            if let TransferEvent::Chunk(chunk) = event {
                written.extend_from_slice(&chunk);
            }
            Ok(())
        },
    );
    let response = result.into_result().unwrap();
    assert_eq!(response.byte_count(), 50_000);
    assert_eq!(written, body);
}

#[test]
fn exchange_sink_error_fails_the_exchange() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/tile.png");
        then.status(200).body(vec![1u8; 1_000]);
    });

    let result = transfer().exchange(
        TransferRequest::get(server.url("/tile.png")).streaming(),
        &CancelToken::new(),
        &mut |_| Err(io::Error::other("disk full")),
    );
    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Io);
    assert_eq!(failure.message, "disk full");
}

#[test]
fn exchange_stops_when_caller_cancels_mid_flight() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(Duration::from_secs(4)).body("late");
    });

    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        remote.cancel();
    });

    let started = Instant::now();
    let result = transfer().exchange(
        TransferRequest::get(server.url("/slow")),
        &cancel,
        &mut |_| Ok(()),
    );
    canceler.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_matches!(result, TransferResult::Failure(failure) if failure.kind == FailureKind::Canceled);
}

#[test]
fn child_token_follows_ancestors_only() {
    let root = CancelToken::new();
    let child = root.child();
    let grandchild = child.child();

    grandchild.cancel();
    assert!(grandchild.is_canceled());
    assert!(!child.is_canceled());
    assert!(!root.is_canceled());

    grandchild.reset();
    root.cancel();
    assert!(child.is_canceled());
    assert!(grandchild.is_canceled());
}

#[test]
fn dropping_bound_handle_leaves_caller_token_alone() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(Duration::from_secs(2)).body("late");
    });

    let cancel = CancelToken::new();
    let handle = transfer().execute_with(TransferRequest::get(server.url("/slow")), &cancel);
    handle.cancel();
    drop(handle);
    assert!(!cancel.is_canceled());
}
