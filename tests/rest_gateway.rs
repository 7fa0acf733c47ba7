//! REST gateway against a mock array controller

use assert_matches::assert_matches;
use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use block_array_driver::array::model::codes;
use block_array_driver::{ArrayAuthConfig, ArrayClient, ArrayGateway, Error, RestGateway};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

const DEVICE_ID: &str = "2102351234";

#[derive(Default)]
struct Controller {
    logins: u32,
    logouts: u32,
    valid_token: String,
    account_state: String,
}

type Shared = Arc<Mutex<Controller>>;

fn envelope(data: Value, code: i64, description: &str) -> Json<Value> {
    Json(json!({
        "data": data,
        "error": {"code": code, "description": description}
    }))
}

fn authorized(controller: &Shared, headers: &HeaderMap) -> bool {
    let token = headers
        .get("iBaseToken")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let controller = controller.lock();
    !controller.valid_token.is_empty() && controller.valid_token == token
}

async fn login(State(controller): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut controller = controller.lock();
    if body["password"] != "secret" {
        return (
            [(header::SET_COOKIE, String::new())],
            envelope(Value::Null, 1077987870, "incorrect user name or password"),
        );
    }
    controller.logins += 1;
    controller.valid_token = format!("token-{}", controller.logins);
    let state = if controller.account_state.is_empty() {
        "1".to_string()
    } else {
        controller.account_state.clone()
    };
    (
        [(header::SET_COOKIE, format!("session={}", controller.logins))],
        envelope(
            json!({
                "deviceid": DEVICE_ID,
                "iBaseToken": controller.valid_token,
                "accountstate": state,
            }),
            0,
            "",
        ),
    )
}

async fn logout(State(controller): State<Shared>) -> Json<Value> {
    let mut controller = controller.lock();
    controller.logouts += 1;
    controller.valid_token.clear();
    envelope(Value::Null, 0, "")
}

async fn system(State(controller): State<Shared>, headers: HeaderMap) -> Json<Value> {
    if !authorized(&controller, &headers) {
        return envelope(Value::Null, codes::UNAUTHORIZED, "unauthorized");
    }
    envelope(
        json!({"ID": DEVICE_ID, "NAME": "mock-array", "WWN": "2100aabbccddeeff"}),
        0,
        "",
    )
}

async fn missing_lun(State(controller): State<Shared>, headers: HeaderMap) -> Json<Value> {
    if !authorized(&controller, &headers) {
        return envelope(Value::Null, codes::UNAUTHORIZED, "unauthorized");
    }
    envelope(Value::Null, codes::OBJECT_NOT_FOUND, "the object does not exist")
}

async fn create_host(
    State(controller): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    if !authorized(&controller, &headers) {
        return envelope(Value::Null, codes::SESSION_EXPIRED, "session expired");
    }
    if body["NAME"] == "taken" {
        return envelope(Value::Null, codes::PARAMETER_ERROR, "parameter error");
    }
    envelope(json!({"ID": "7", "NAME": body["NAME"]}), 0, "")
}

async fn start_controller() -> (Shared, String) {
    let controller: Shared = Arc::new(Mutex::new(Controller::default()));
    let prefix = format!("/{}", DEVICE_ID);
    let app = Router::new()
        .route("/xxxxx/sessions", post(login))
        .route(&format!("{}/sessions", prefix), axum::routing::delete(logout))
        .route(&format!("{}/system/", prefix), get(system))
        .route(&format!("{}/lun/404", prefix), get(missing_lun))
        .route(&format!("{}/host", prefix), post(create_host))
        .with_state(controller.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (controller, format!("http://{}", addr))
}

fn auth(endpoints: Vec<String>) -> ArrayAuthConfig {
    ArrayAuthConfig {
        endpoints,
        username: "admin".into(),
        password: "secret".into(),
        insecure: false,
        request_timeout_secs: 5,
    }
}

#[tokio::test]
async fn test_login_falls_through_to_answering_endpoint() {
    let (controller, endpoint) = start_controller().await;
    let gateway = RestGateway::connect(
        "mock",
        auth(vec!["http://127.0.0.1:1".into(), endpoint]),
    )
    .await
    .unwrap();

    let info = ArrayClient::new(Arc::new(gateway)).system_info().await.unwrap();
    assert_eq!(info.name, "mock-array");
    assert_eq!(controller.lock().logins, 1);
}

#[tokio::test]
async fn test_expired_session_is_renewed_once() {
    let (controller, endpoint) = start_controller().await;
    let gateway = RestGateway::connect("mock", auth(vec![endpoint])).await.unwrap();

    controller.lock().valid_token.clear();
    let data = gateway.get("/system/").await.unwrap();
    assert_eq!(data["NAME"], "mock-array");
    assert_eq!(controller.lock().logins, 2);

    controller.lock().valid_token.clear();
    let created = gateway
        .create("/host", json!({"NAME": "node01"}))
        .await
        .unwrap();
    assert_eq!(created["ID"], "7");
    assert_eq!(controller.lock().logins, 3);
}

#[tokio::test]
async fn test_other_error_codes_propagate() {
    let (controller, endpoint) = start_controller().await;
    let gateway = Arc::new(RestGateway::connect("mock", auth(vec![endpoint])).await.unwrap());

    assert_matches!(
        gateway.create("/host", json!({"NAME": "taken"})).await,
        Err(Error::RemoteObject { code, .. }) if code == codes::PARAMETER_ERROR
    );
    assert_matches!(
        ArrayClient::new(gateway.clone()).get_lun("404").await,
        Err(Error::NotFound { .. })
    );
    assert_eq!(controller.lock().logins, 1);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let (_, endpoint) = start_controller().await;
    let mut config = auth(vec![endpoint]);
    config.password = "wrong".into();
    assert_matches!(
        RestGateway::connect("mock", config).await,
        Err(Error::Authentication(_))
    );
}

#[tokio::test]
async fn test_account_needing_password_change_is_refused() {
    let (controller, endpoint) = start_controller().await;
    controller.lock().account_state = "3".into();
    assert_matches!(
        RestGateway::connect("mock", auth(vec![endpoint])).await,
        Err(Error::Authentication(_))
    );
}

#[tokio::test]
async fn test_logout_closes_session() {
    let (controller, endpoint) = start_controller().await;
    let gateway = RestGateway::connect("mock", auth(vec![endpoint])).await.unwrap();

    gateway.logout().await.unwrap();
    assert_eq!(controller.lock().logouts, 1);
    assert!(controller.lock().valid_token.is_empty());

    // The next call opens a new session
    gateway.get("/system/").await.unwrap();
    assert_eq!(controller.lock().logins, 2);
}
