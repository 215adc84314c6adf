//! Router-level test fixtures.
#![allow(dead_code)]

use std::collections::HashMap;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use db::{DBService, test_utils::create_test_pool};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use server::{AppState, config::ServerConfig, routes};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE=";
pub const CREDENTIALS_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";
pub const PASSWORD: &str = "correct horse battery";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    _dir: TempDir,
}

pub struct Session {
    pub token: String,
    pub user_id: String,
    pub organization_id: String,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }
}

/// Build the app on a fresh database. `vars` adds to or overrides the base
/// configuration.
pub async fn test_app(vars: &[(&str, &str)]) -> TestApp {
    let (pool, dir) = create_test_pool().await;
    let db = DBService { pool };

    let mut env: HashMap<String, String> = HashMap::from([
        ("JWT_SECRET".to_string(), JWT_SECRET.to_string()),
        ("CREDENTIALS_KEY".to_string(), CREDENTIALS_KEY.to_string()),
        (
            "PUBLIC_BASE_URL".to_string(),
            "http://feedback.test".to_string(),
        ),
    ]);
    for (k, v) in vars {
        env.insert(k.to_string(), v.to_string());
    }
    let config = ServerConfig::from_lookup(|name| env.get(name).cloned()).unwrap();

    let state = AppState::new(db, config, CancellationToken::new()).unwrap();
    TestApp {
        router: routes::router(state.clone()),
        state,
        _dir: dir,
    }
}

impl TestApp {
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str, token: &str) -> TestResponse {
        self.request(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> TestResponse {
        self.request(Method::POST, uri, Some(token), Some(body)).await
    }

    pub async fn patch(&self, uri: &str, token: &str, body: Value) -> TestResponse {
        self.request(Method::PATCH, uri, Some(token), Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> TestResponse {
        self.request(Method::DELETE, uri, Some(token), None).await
    }

    /// Sign up a new organization and return the owner's session.
    pub async fn signup(&self, organization: &str, email: &str) -> Session {
        let response = self
            .request(
                Method::POST,
                "/v1/auth/signup",
                None,
                Some(json!({
                    "organization_name": organization,
                    "name": "Owner",
                    "email": email,
                    "password": PASSWORD,
                })),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        session_from(&response)
    }

    pub async fn login(&self, email: &str) -> Session {
        let response = self
            .request(
                Method::POST,
                "/v1/auth/login",
                None,
                Some(json!({ "email": email, "password": PASSWORD })),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "{}", response.body);
        session_from(&response)
    }

    /// Add a user through the API and log in as them.
    pub async fn add_user(&self, manager: &Session, email: &str, role: &str) -> Session {
        let response = self
            .post(
                "/v1/users",
                &manager.token,
                json!({ "email": email, "name": email, "password": PASSWORD, "role": role }),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        self.login(email).await
    }
}

fn session_from(response: &TestResponse) -> Session {
    let data = response.data();
    Session {
        token: data["token"]["access_token"].as_str().unwrap().to_string(),
        user_id: data["user"]["id"].as_str().unwrap().to_string(),
        organization_id: data["organization"]["id"].as_str().unwrap().to_string(),
    }
}
