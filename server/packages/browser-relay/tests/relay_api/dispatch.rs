use super::*;

#[tokio::test]
async fn fake_mode_buffered_returns_exact_body() {
    let test_app = TestApp::new(StreamingMode::Fake);
    let mut agent = test_app.connect("alice@example.com");
    let uri = format!(
        "/v1beta/models/gemini-pro:generateContent?key={}&foo=bar",
        agent.key()
    );

    let pending = test_app.spawn_request(
        Method::POST,
        &uri,
        Some(json!({"contents": []})),
        &[("x-custom", "1")],
    );
    let envelope = agent.next_envelope().await;
    assert_eq!(envelope.method, "POST");
    assert_eq!(envelope.path, "/v1beta/models/gemini-pro:generateContent");
    assert_eq!(envelope.streaming_mode, StreamingMode::Fake);
    assert!(!envelope.is_openai);
    assert_eq!(
        envelope.query_params,
        BTreeMap::from([("foo".to_string(), "bar".to_string())])
    );
    assert_eq!(envelope.body.as_deref(), Some(r#"{"contents":[]}"#));
    assert_eq!(envelope.headers.get("x-custom").map(String::as_str), Some("1"));
    assert!(!envelope.headers.contains_key("host"));

    agent.headers(
        &envelope.request_id,
        200,
        &[
            ("content-type", "application/json; charset=UTF-8"),
            ("content-length", "9999"),
            ("content-encoding", "gzip"),
        ],
    );
    agent.chunk(&envelope.request_id, VENDOR_BODY);
    agent.close(&envelope.request_id);

    let (status, headers, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body_text(&body), VENDOR_BODY);
    assert_eq!(
        headers[header::CONTENT_TYPE],
        "application/json; charset=UTF-8"
    );
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(agent.session.open_queue_count(), 0);
}

#[tokio::test]
async fn fake_mode_accepts_missing_payload() {
    let test_app = TestApp::new(StreamingMode::Fake);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::GET,
        "/v1beta/models/gemini-pro",
        None,
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    assert_eq!(envelope.body, None);
    agent.headers(&envelope.request_id, 204, &[]);
    agent.close(&envelope.request_id);

    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
}

#[tokio::test]
async fn real_mode_refragments_openai_stream() {
    let test_app = TestApp::new(StreamingMode::Real);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::POST,
        "/v1/chat/completions",
        Some(json!({
            "model": "gemini-2.0-flash",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        })),
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    assert!(envelope.is_openai);
    assert_eq!(envelope.streaming_mode, StreamingMode::Real);
    assert_eq!(
        envelope.path,
        "/v1beta/models/gemini-2.0-flash:streamGenerateContent"
    );
    assert_eq!(envelope.query_params.get("alt").map(String::as_str), Some("sse"));
    assert!(!envelope.headers.contains_key("authorization"));

    let id = envelope.request_id.clone();
    agent.headers(&id, 200, &[]);
    agent.chunk(&id, r#"data: {"candidates":[{"content":{"parts":[{"text":"Hel"#);
    agent.chunk(&id, "lo\"}]}}]}\n\n");
    agent.chunk(
        &id,
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" there\"}]},\"finishReason\":\"STOP\"}]}\n\n",
    );
    agent.close(&id);

    let (status, headers, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    let payloads = sse_payloads(&body_text(&body));
    assert_eq!(payloads.len(), 3);
    let first: Value = serde_json::from_str(&payloads[0]).expect("first chunk");
    let second: Value = serde_json::from_str(&payloads[1]).expect("second chunk");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hello");
    assert_eq!(first["choices"][0]["finish_reason"], Value::Null);
    assert_eq!(second["choices"][0]["delta"]["content"], " there");
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
    assert_eq!(second["model"], "gemini-2.0-flash");
    assert_eq!(payloads[2], "[DONE]");
}

#[tokio::test]
async fn real_mode_converts_openai_completion() {
    let test_app = TestApp::new(StreamingMode::Real);
    let mut agent = test_app.connect("alice@example.com");
    let uri = format!("/v1/chat/completions?key={}", agent.key());

    let pending = test_app.spawn_request(
        Method::POST,
        &uri,
        Some(json!({"stream": false, "messages": [{"role": "user", "content": "hi"}]})),
        &[],
    );
    let envelope = agent.next_envelope().await;
    assert_eq!(envelope.path, "/v1beta/models/gemini-pro:generateContent");
    assert!(envelope.query_params.is_empty());

    let id = envelope.request_id.clone();
    agent.headers(&id, 200, &[("content-type", "application/json")]);
    agent.chunk(&id, r#"{"candidates":[{"content":{"parts":[{"text":"hel"#);
    agent.chunk(&id, r#"lo"}]},"finishReason":"STOP"}]}"#);
    agent.close(&id);

    let (status, headers, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    let completion = parse_json(&body);
    assert_eq!(completion["object"], "chat.completion");
    assert_eq!(completion["model"], "gemini-pro");
    assert_eq!(completion["choices"][0]["message"]["content"], "hello");
    assert_eq!(completion["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn agent_error_before_headers_keeps_status() {
    let test_app = TestApp::new(StreamingMode::Real);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::POST,
        "/v1/chat/completions",
        Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    agent.send(
        &envelope.request_id,
        ResponseEvent::Error {
            status: 504,
            message: "browser error: upstream 500".to_string(),
        },
    );
    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        parse_json(&body),
        json!({"error": {"message": "browser error: upstream 500"}})
    );

    let pending = test_app.spawn_request(
        Method::POST,
        "/v1beta/models/gemini-pro:generateContent",
        Some(json!({})),
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    agent.send(
        &envelope.request_id,
        ResponseEvent::Error {
            status: 504,
            message: "browser error: request aborted".to_string(),
        },
    );
    let (status, headers, body) = finish(pending).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .expect("content type")
        .starts_with("text/plain"));
    assert_eq!(body_text(&body), "browser error: request aborted");
}

#[tokio::test]
async fn disconnect_mid_stream_ends_with_error_frame() {
    let test_app = TestApp::new(StreamingMode::Real);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::POST,
        "/v1beta/models/gemini-pro:streamGenerateContent?alt=sse",
        Some(json!({})),
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    agent.headers(&envelope.request_id, 200, &[("content-type", "text/event-stream")]);
    agent.chunk(&envelope.request_id, "data: {\"partial\":true}\n\n");
    tokio::time::sleep(Duration::from_millis(20)).await;
    agent.disconnect();

    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    let payloads = sse_payloads(&body_text(&body));
    assert_eq!(payloads[0], "{\"partial\":true}");
    let failure: Value = serde_json::from_str(payloads.last().expect("error frame")).expect("json");
    assert!(failure["error"]["message"]
        .as_str()
        .expect("message")
        .starts_with("[proxy] "));
}

#[tokio::test]
async fn disconnect_before_headers_fails_request() {
    let test_app = TestApp::new(StreamingMode::Fake);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::POST,
        "/v1/chat/completions",
        Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
        &[("authorization", bearer.as_str())],
    );
    let _ = agent.next_envelope().await;
    agent.disconnect();

    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(parse_json(&body)["error"]["message"], "queue closed");
}

#[tokio::test]
async fn fake_stream_sends_keepalives_then_payload() {
    let test_app = TestApp::with_config(
        AuthConfig::disabled(),
        RelayConfig {
            mode: StreamingMode::Fake,
            keepalive_interval: Duration::from_millis(10),
            ..RelayConfig::default()
        },
    );
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::POST,
        "/v1/chat/completions",
        Some(json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]})),
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    assert_eq!(envelope.streaming_mode, StreamingMode::Fake);
    assert_eq!(
        envelope.path,
        "/v1beta/models/gemini-pro:streamGenerateContent"
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    agent.headers(&envelope.request_id, 200, &[]);
    agent.chunk(&envelope.request_id, VENDOR_BODY);
    agent.close(&envelope.request_id);

    let (status, headers, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    let payloads = sse_payloads(&body_text(&body));
    assert!(payloads.len() >= 3, "expected keepalives before payload: {payloads:?}");

    let keepalive: Value = serde_json::from_str(&payloads[0]).expect("keepalive json");
    assert!(keepalive["id"].as_str().expect("id").starts_with("cmpl-"));
    assert_eq!(keepalive["choices"][0]["delta"], json!({}));

    let chunk: Value =
        serde_json::from_str(&payloads[payloads.len() - 2]).expect("payload chunk");
    assert_eq!(chunk["choices"][0]["delta"]["content"], "X");
    assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
    assert_eq!(payloads[payloads.len() - 1], "[DONE]");
}

#[tokio::test]
async fn fake_stream_reports_agent_error_in_band() {
    let test_app = TestApp::new(StreamingMode::Fake);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::POST,
        "/v1beta/models/gemini-pro:streamGenerateContent",
        Some(json!({})),
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    agent.send(
        &envelope.request_id,
        ResponseEvent::Error {
            status: 504,
            message: "browser error: timeout".to_string(),
        },
    );

    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body_text(&body),
        "data: {\"error\":{\"message\":\"[proxy] browser error: timeout\"}}\n\n"
    );
}

#[tokio::test]
async fn fake_stream_native_payload_is_one_frame() {
    let test_app = TestApp::new(StreamingMode::Fake);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::POST,
        "/v1beta/models/gemini-pro:streamGenerateContent?alt=sse",
        Some(json!({})),
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    agent.headers(&envelope.request_id, 200, &[]);
    agent.chunk(&envelope.request_id, VENDOR_BODY);
    agent.close(&envelope.request_id);

    let (_, _, body) = finish(pending).await;
    assert_eq!(body_text(&body), format!("data: {VENDOR_BODY}\n\n"));
}

#[tokio::test]
async fn models_route_converts_vendor_list() {
    let test_app = TestApp::new(StreamingMode::Real);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::GET,
        "/v1/models",
        None,
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    assert_eq!(envelope.method, "GET");
    assert_eq!(envelope.path, "/v1beta/models");
    assert_eq!(envelope.streaming_mode, StreamingMode::Fake);
    assert!(envelope.headers.is_empty());

    agent.headers(&envelope.request_id, 200, &[]);
    agent.chunk(
        &envelope.request_id,
        r#"{"models":[{"name":"models/gemini-pro","updateTime":"2024-01-02T03:04:05Z"}]}"#,
    );
    agent.close(&envelope.request_id);

    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        parse_json(&body),
        json!({
            "object": "list",
            "data": [{
                "id": "gemini-pro",
                "object": "model",
                "created": 1704164645,
                "owned_by": "google"
            }]
        })
    );
}

#[tokio::test]
async fn models_route_without_payload_is_server_error() {
    let test_app = TestApp::new(StreamingMode::Real);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::GET,
        "/v1/models",
        None,
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    agent.headers(&envelope.request_id, 200, &[]);
    agent.close(&envelope.request_id);

    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        parse_json(&body),
        json!({"error": {"message": "unable to fetch model list"}})
    );
}

#[tokio::test]
async fn frames_for_other_requests_are_ignored() {
    let test_app = TestApp::new(StreamingMode::Fake);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let pending = test_app.spawn_request(
        Method::GET,
        "/v1beta/models",
        None,
        &[("authorization", bearer.as_str())],
    );
    let envelope = agent.next_envelope().await;
    agent.headers("unknown-request", 500, &[]);
    agent.chunk("unknown-request", "noise");
    agent.registry.handle_frame(&agent.session, "{\"event_type\":");
    agent.headers(&envelope.request_id, 200, &[]);
    agent.chunk(&envelope.request_id, "signal");
    agent.close(&envelope.request_id);

    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body_text(&body), "signal");
}

#[tokio::test]
async fn rejects_missing_and_unknown_keys() {
    let test_app = TestApp::new(StreamingMode::Real);
    let _agent = test_app.connect("alice@example.com");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat/completions",
        Some(json!({"messages": []})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(parse_json(&body)["error"]["message"], "unauthorized");

    let (status, headers, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1beta/models?key=wrong",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .expect("content type")
        .starts_with("text/plain"));
}

#[tokio::test]
async fn disconnected_account_is_unavailable() {
    let test_app = TestApp::new(StreamingMode::Real);
    let agent = test_app.connect("alice@example.com");
    let key = agent.key();
    agent.disconnect();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/chat/completions?key={key}"),
        Some(json!({"messages": []})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        parse_json(&body)["error"]["message"],
        "account alice@example.com is not connected"
    );
}

#[tokio::test]
async fn replacement_routes_to_newest_connection() {
    let test_app = TestApp::new(StreamingMode::Fake);
    let mut first = test_app.connect("alice@example.com");
    let mut second = test_app.connect("Alice@Example.com");
    assert_eq!(first.key(), second.key());

    let replaced = first.outbound.recv().await.expect("close for replaced agent");
    assert_eq!(
        replaced,
        Outbound::Close {
            code: 1000,
            reason: "Replaced by new connection".to_string()
        }
    );

    let bearer = second.bearer();
    let pending = test_app.spawn_request(
        Method::GET,
        "/v1beta/models",
        None,
        &[("authorization", bearer.as_str())],
    );
    let envelope = second.next_envelope().await;
    first.disconnect();
    second.headers(&envelope.request_id, 200, &[]);
    second.chunk(&envelope.request_id, "from second");
    second.close(&envelope.request_id);

    let (status, _, body) = finish(pending).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body_text(&body), "from second");
}

#[tokio::test]
async fn shared_key_routing() {
    let test_app = TestApp::with_config(
        AuthConfig::disabled().with_shared_key("shared-secret".to_string()),
        RelayConfig {
            mode: StreamingMode::Fake,
            ..RelayConfig::default()
        },
    );

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1beta/models?key=shared-secret",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let mut alice = test_app.connect("alice@example.com");
    let pending = test_app.spawn_request(
        Method::GET,
        "/v1beta/models?key=shared-secret",
        None,
        &[],
    );
    let envelope = alice.next_envelope().await;
    alice.headers(&envelope.request_id, 200, &[]);
    alice.chunk(&envelope.request_id, "alice");
    alice.close(&envelope.request_id);
    assert_eq!(body_text(&finish(pending).await.2), "alice");

    let mut bob = test_app.connect("bob@example.com");
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat/completions",
        Some(json!({"messages": []})),
        &[("authorization", "Bearer shared-secret")],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(parse_json(&body)["error"]["message"]
        .as_str()
        .expect("message")
        .contains("2 accounts"));

    let pending = test_app.spawn_request(
        Method::GET,
        "/v1beta/models",
        None,
        &[
            ("authorization", "Bearer shared-secret"),
            ("x-relay-account", "BOB@example.com"),
        ],
    );
    let envelope = bob.next_envelope().await;
    assert!(!envelope.headers.contains_key("x-relay-account"));
    bob.headers(&envelope.request_id, 200, &[]);
    bob.chunk(&envelope.request_id, "bob");
    bob.close(&envelope.request_id);
    assert_eq!(body_text(&finish(pending).await.2), "bob");
}

#[tokio::test]
async fn concurrent_requests_share_one_tunnel() {
    let test_app = TestApp::new(StreamingMode::Fake);
    let mut agent = test_app.connect("alice@example.com");
    let bearer = agent.bearer();

    let first = test_app.spawn_request(
        Method::GET,
        "/v1beta/models/a",
        None,
        &[("authorization", bearer.as_str())],
    );
    let first_envelope = agent.next_envelope().await;
    let second = test_app.spawn_request(
        Method::GET,
        "/v1beta/models/b",
        None,
        &[("authorization", bearer.as_str())],
    );
    let second_envelope = agent.next_envelope().await;
    assert_ne!(first_envelope.request_id, second_envelope.request_id);

    // Answer in reverse order.
    for (envelope, body) in [(&second_envelope, "b"), (&first_envelope, "a")] {
        agent.headers(&envelope.request_id, 200, &[]);
        agent.chunk(&envelope.request_id, body);
        agent.close(&envelope.request_id);
    }

    assert_eq!(body_text(&finish(first).await.2), "a");
    assert_eq!(body_text(&finish(second).await.2), "b");
}
