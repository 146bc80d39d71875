use super::*;

const ADMIN_TOKEN: &str = "admin-secret";

fn admin_app() -> TestApp {
    TestApp::with_config(
        AuthConfig::disabled().with_admin_token(ADMIN_TOKEN.to_string()),
        RelayConfig::default(),
    )
}

#[tokio::test]
async fn set_and_get_mode() {
    let test_app = TestApp::new(StreamingMode::Real);

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/admin/get-mode", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"mode": "real"}));

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/admin/set-mode?mode=fake",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"mode": "fake"}));
    assert_eq!(test_app.state.mode(), StreamingMode::Fake);

    let (_, _, body) =
        send_request(&test_app.app, Method::GET, "/admin/get-mode", None, &[]).await;
    assert_eq!(parse_json(&body), json!({"mode": "fake"}));
}

#[tokio::test]
async fn invalid_mode_is_problem() {
    let test_app = TestApp::new(StreamingMode::Fake);

    for uri in ["/admin/set-mode?mode=turbo", "/admin/set-mode"] {
        let (status, headers, body) =
            send_request(&test_app.app, Method::GET, uri, None, &[]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
        let problem = parse_json(&body);
        assert_eq!(problem["type"], "urn:browser-relay:error:mode_invalid");
        assert_eq!(problem["status"], 400);
    }
    assert_eq!(test_app.state.mode(), StreamingMode::Fake);
}

#[tokio::test]
async fn admin_routes_require_token_when_configured() {
    let test_app = admin_app();

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/admin/get-mode", None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:browser-relay:error:token_invalid"
    );

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/admin/set-mode?mode=fake",
        None,
        &[("authorization", "Bearer wrong")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(test_app.state.mode(), StreamingMode::Real);

    let bearer = format!("Bearer {ADMIN_TOKEN}");
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/admin/set-mode?mode=fake",
        None,
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"mode": "fake"}));
}

#[tokio::test]
async fn account_key_lookup() {
    let test_app = TestApp::new(StreamingMode::Real);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/alice@example.com",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body_text(&body), "account not connected");

    let agent = test_app.connect("alice@example.com");
    let (status, headers, body) = send_request(
        &test_app.app,
        Method::GET,
        "/Alice@Example.com",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .expect("content type")
        .starts_with("text/plain"));
    assert_eq!(body_text(&body), agent.key());
    assert_eq!(agent.key().len(), 24);

    agent.disconnect();
    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/alice@example.com",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn account_key_lookup_requires_admin_token() {
    let test_app = admin_app();
    let agent = test_app.connect("alice@example.com");

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/alice@example.com",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let bearer = format!("Bearer {ADMIN_TOKEN}");
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/alice@example.com",
        None,
        &[("authorization", bearer.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body_text(&body), agent.key());
}

#[tokio::test]
async fn single_segment_without_at_sign_is_relayed() {
    let test_app = TestApp::new(StreamingMode::Fake);

    let (status, headers, body) =
        send_request(&test_app.app, Method::GET, "/v1beta", None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .expect("content type")
        .starts_with("text/plain"));
    assert_eq!(body_text(&body), "unauthorized");

    let mut agent = test_app.connect("alice@example.com");
    let uri = format!("/v1beta?key={}", agent.key());
    let pending = test_app.spawn_request(Method::GET, &uri, None, &[]);
    let envelope = agent.next_envelope().await;
    assert_eq!(envelope.path, "/v1beta");
    agent.headers(&envelope.request_id, 200, &[]);
    agent.chunk(&envelope.request_id, "ok");
    agent.close(&envelope.request_id);
    assert_eq!(body_text(&finish(pending).await.2), "ok");
}

#[tokio::test]
async fn root_summary_reflects_connections() {
    let test_app = TestApp::new(StreamingMode::Fake);

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/", None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        parse_json(&body),
        json!({"online": false, "accounts": [], "mode": "fake"})
    );

    let _bob = test_app.connect("bob@example.com");
    let _alice = test_app.connect("alice@example.com");
    let (status, _, body) = send_request(&test_app.app, Method::GET, "/", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        parse_json(&body),
        json!({
            "online": true,
            "accounts": ["alice@example.com", "bob@example.com"],
            "mode": "fake"
        })
    );
}

#[tokio::test]
async fn favicon_and_preflight() {
    let test_app = TestApp::new(StreamingMode::Real);

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/favicon.ico", None, &[]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    for uri in ["/v1/chat/completions", "/v1beta/models/gemini-pro:generateContent", "/"] {
        let (status, _, _) = send_request(&test_app.app, Method::OPTIONS, uri, None, &[]).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
    }
}
