//! Drives [`PhpIpamClient`] against a local HTTP server that speaks the
//! phpIPAM REST dialect, backed by [`MemoryIpam`].

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::{Value, json};

use ipamlease::client::ClientResult;
use ipamlease::models::ApiResponse;
use ipamlease::{
    AddressSpec, ClientError, Config, Error, IpamApi, MemoryIpam, Orchestrator, PhpIpamClient,
};

const APP_ID: &str = "tests";
/// base64("admin:secret")
const BASIC_CREDENTIALS: &str = "Basic YWRtaW46c2VjcmV0";

struct Emulator {
    ipam: MemoryIpam,
    logins: AtomicUsize,
    /// Token issued by the latest login; empty once revoked.
    token: Mutex<String>,
    token_expires: String,
    garbage: AtomicBool,
}

impl Emulator {
    fn new(token_expires: &str) -> Arc<Self> {
        let ipam = MemoryIpam::new();
        let customers = ipam.add_section("Customers");
        ipam.add_subnet(&customers, Ipv4Addr::new(10, 10, 1, 0), 24, "servers");
        ipam.add_subnet(&customers, Ipv4Addr::new(10, 10, 2, 0), 24, "desktops");

        Arc::new(Self {
            ipam,
            logins: AtomicUsize::new(0),
            token: Mutex::new(String::new()),
            token_expires: token_expires.to_string(),
            garbage: AtomicBool::new(false),
        })
    }
}

fn reply<T: Serialize>(result: ClientResult<ApiResponse<T>>) -> Response {
    match result {
        Ok(envelope) => {
            let status = StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::OK);
            (status, Json(serde_json::to_value(envelope).unwrap())).into_response()
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "code": 500, "success": false, "message": error.to_string() })),
        )
            .into_response(),
    }
}

fn body_field(body: &Bytes, field: &str) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get(field).and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

async fn phpipam(
    State(emulator): State<Arc<Emulator>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let prefix = format!("/api/{}/", APP_ID);
    let Some(path) = uri.path().strip_prefix(&prefix) else {
        return (StatusCode::NOT_FOUND, "unknown application").into_response();
    };
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    };

    if method == Method::POST && segments == ["user"] {
        if header("authorization") != BASIC_CREDENTIALS {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "code": 500, "success": false, "message": "Invalid username or password" })),
            )
                .into_response();
        }
        let login = emulator.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("token-{}", login);
        *emulator.token.lock().unwrap() = token.clone();
        return Json(json!({
            "code": 200,
            "success": true,
            "data": { "token": token, "expires": emulator.token_expires }
        }))
        .into_response();
    }

    let current_token = emulator.token.lock().unwrap().clone();
    if current_token.is_empty() || header("token") != current_token {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": 401, "success": false, "message": "Please provide token" })),
        )
            .into_response();
    }

    if emulator.garbage.load(Ordering::SeqCst) {
        return (StatusCode::BAD_GATEWAY, "<html>Bad Gateway</html>").into_response();
    }

    let ipam = &emulator.ipam;
    match (method.as_str(), segments.as_slice()) {
        ("GET", ["sections"]) => reply(ipam.list_sections().await),
        ("GET", ["sections", id, "subnets"]) => reply(ipam.list_section_subnets(id).await),
        ("GET", ["sections", id]) => reply(ipam.get_section(id).await),
        ("GET", ["subnets", id]) => reply(ipam.get_subnet(id).await),
        ("GET", ["addresses", "search_hostname", hostname]) => {
            reply(ipam.search_hostname(hostname).await)
        }
        ("GET", ["addresses", "search", ip]) => reply(ipam.search_ip(ip).await),
        ("POST", ["addresses", "first_free", subnet_id]) => reply(
            ipam.create_first_free(
                subnet_id,
                &body_field(&body, "hostname"),
                &body_field(&body, "owner"),
            )
            .await,
        ),
        ("GET", ["addresses", id, "ping"]) => reply(ipam.ping_address(id).await),
        ("GET", ["addresses", id]) => reply(ipam.get_address(id).await),
        ("PATCH", ["addresses", id]) => {
            reply(ipam.update_hostname(id, &body_field(&body, "hostname")).await)
        }
        ("DELETE", ["addresses", id]) => reply(ipam.delete_address(id).await),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": 400, "success": false, "message": "Invalid request" })),
        )
            .into_response(),
    }
}

async fn serve(emulator: Arc<Emulator>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let app = Router::new().fallback(phpipam).with_state(emulator);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", address)
}

fn config(server_url: String, password: &str) -> Config {
    Config {
        server_url: Some(server_url),
        app_id: APP_ID.to_string(),
        username: Some("admin".to_string()),
        password: Some(password.to_string()),
        client_tag: "http-tests".to_string(),
        timeout_seconds: 5,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_lifecycle_over_http() {
    let emulator = Emulator::new("2999-01-01 00:00:00");
    let server_url = serve(emulator.clone()).await;
    let client = Arc::new(PhpIpamClient::new(&config(server_url, "secret")).unwrap());
    let orchestrator = Orchestrator::new(client, "http-tests");

    let current = AddressSpec::new("Customers", "servers", "web-01");
    let id = orchestrator.create(&current, false).await.unwrap();
    let record = orchestrator.read(&id).await.unwrap();
    assert_eq!(record.ip, "10.10.1.2");
    assert_eq!(record.gateway, "10.10.1.1");
    assert_eq!(emulator.ipam.get(&id).unwrap().owner, "http-tests");

    let (renamed_id, record) = orchestrator
        .update(&id, &current, &AddressSpec::new("Customers", "servers", "web-02"))
        .await
        .unwrap();
    assert_eq!(renamed_id, id);
    assert_eq!(record.hostname, "web-02");

    let (moved_id, record) = orchestrator
        .update(
            &id,
            &record.spec(),
            &AddressSpec::new("Customers", "desktops", "web-02"),
        )
        .await
        .unwrap();
    assert_ne!(moved_id, id);
    assert_eq!(record.ip, "10.10.2.2");
    assert!(matches!(
        orchestrator.read(&id).await,
        Err(Error::AddressNotFound(_))
    ));

    orchestrator.delete(&moved_id, false).await.unwrap();
    assert!(emulator.ipam.addresses().is_empty());
    assert_eq!(emulator.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_live_address_is_not_released_over_http() {
    let emulator = Emulator::new("2999-01-01 00:00:00");
    let server_url = serve(emulator.clone()).await;
    let client = Arc::new(PhpIpamClient::new(&config(server_url, "secret")).unwrap());
    let orchestrator = Orchestrator::new(client, "http-tests");

    let id = orchestrator
        .create(&AddressSpec::new("Customers", "servers", "db-01"), false)
        .await
        .unwrap();
    emulator.ipam.set_live(&id, true);

    assert!(matches!(
        orchestrator.delete(&id, false).await,
        Err(Error::AddressStillLive(_))
    ));
    assert!(emulator.ipam.get(&id).is_some());
}

#[tokio::test]
async fn test_expired_token_is_renewed() {
    let emulator = Emulator::new("2000-01-01 00:00:00");
    let server_url = serve(emulator.clone()).await;
    let client = PhpIpamClient::new(&config(server_url, "secret")).unwrap();

    assert!(client.list_sections().await.unwrap().is_ok());
    assert!(client.list_sections().await.unwrap().is_ok());
    assert_eq!(emulator.logins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_revoked_token_is_renewed_on_rejection() {
    let emulator = Emulator::new("2999-01-01 00:00:00");
    let server_url = serve(emulator.clone()).await;
    let client = Arc::new(PhpIpamClient::new(&config(server_url, "secret")).unwrap());
    let orchestrator = Orchestrator::new(client.clone(), "http-tests");

    assert!(client.list_sections().await.unwrap().is_ok());
    emulator.token.lock().unwrap().clear();

    let id = orchestrator
        .create(&AddressSpec::new("Customers", "servers", "web-01"), false)
        .await
        .unwrap();
    assert_eq!(emulator.ipam.get(&id).unwrap().hostname, "web-01");
    assert_eq!(emulator.logins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let emulator = Emulator::new("2999-01-01 00:00:00");
    let server_url = serve(emulator.clone()).await;
    let client = Arc::new(PhpIpamClient::new(&config(server_url, "wrong")).unwrap());

    assert!(matches!(
        client.list_sections().await,
        Err(ClientError::Authentication(message)) if message == "Invalid username or password"
    ));

    let orchestrator = Orchestrator::new(client, "http-tests");
    let error = orchestrator
        .create(&AddressSpec::new("Customers", "servers", "web-01"), false)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        Error::GettingSectionId(ref cause)
            if matches!(**cause, Error::Client(ClientError::Authentication(_)))
    ));
}

#[tokio::test]
async fn test_not_found_status_is_decoded() {
    let emulator = Emulator::new("2999-01-01 00:00:00");
    let server_url = serve(emulator.clone()).await;
    let client = PhpIpamClient::new(&config(server_url, "secret")).unwrap();

    let response = client.get_address("4242").await.unwrap();
    assert_eq!(response.code, 404);
    assert!(!response.success);

    let search = client.search_hostname("nobody").await.unwrap();
    assert!(search.into_records().unwrap().is_empty());
}

#[tokio::test]
async fn test_undecodable_body() {
    let emulator = Emulator::new("2999-01-01 00:00:00");
    let server_url = serve(emulator.clone()).await;
    let client = PhpIpamClient::new(&config(server_url, "secret")).unwrap();
    emulator.garbage.store(true, Ordering::SeqCst);

    assert!(matches!(
        client.list_sections().await,
        Err(ClientError::Decode { status: 502, .. })
    ));
}

#[tokio::test]
async fn test_unreachable_server() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let client = PhpIpamClient::new(&config(format!("http://{}", address), "secret")).unwrap();
    assert!(matches!(
        client.list_sections().await,
        Err(ClientError::Http(_))
    ));
}
