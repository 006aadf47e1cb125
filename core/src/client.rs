//! Stateless HTTP request builder and response parser for the hosted
//! auth + data service.
//!
//! # Design
//! `ServiceClient` holds only the base URL and the public anon key. Each
//! remote operation is split into a `build_*` method that produces an
//! `HttpRequest` and a `parse_*` method that consumes an `HttpResponse`.
//! The caller executes the round-trip in between, which keeps this type
//! deterministic and free of I/O.
//!
//! Auth endpoints live under `/auth/v1`, the `todos` table under `/rest/v1`.
//! Row filters use the `column=eq.value` query syntax.

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;

use crate::error::ApiError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::types::{AuthOutcome, Credentials, Identity, InsertTodo, Session, SessionBody, Todo, UpdateTodo};

/// Characters left unescaped in filter values.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Synchronous, stateless client for the hosted service.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    base_url: String,
    anon_key: String,
}

impl ServiceClient {
    pub fn new(base_url: &str, anon_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        }
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    // -----------------------------------------------------------------------
    // Auth
    // -----------------------------------------------------------------------

    pub fn build_sign_in(&self, credentials: &Credentials) -> Result<HttpRequest, ApiError> {
        self.json_request(
            HttpMethod::Post,
            format!("{}/auth/v1/token?grant_type=password", self.base_url),
            &self.anon_key,
            credentials,
        )
    }

    pub fn build_sign_up(&self, credentials: &Credentials) -> Result<HttpRequest, ApiError> {
        self.json_request(
            HttpMethod::Post,
            format!("{}/auth/v1/signup", self.base_url),
            &self.anon_key,
            credentials,
        )
    }

    pub fn build_refresh_session(&self, refresh_token: &str) -> Result<HttpRequest, ApiError> {
        self.json_request(
            HttpMethod::Post,
            format!("{}/auth/v1/token?grant_type=refresh_token", self.base_url),
            &self.anon_key,
            &serde_json::json!({ "refresh_token": refresh_token }),
        )
    }

    pub fn build_sign_out(&self, access_token: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Post,
            path: format!("{}/auth/v1/logout", self.base_url),
            headers: self.auth_headers(access_token),
            body: None,
        }
    }

    /// Parse a password or refresh-token grant response.
    pub fn parse_session(&self, response: HttpResponse, now: DateTime<Utc>) -> Result<Session, ApiError> {
        check_auth_status(&response, 200)?;
        let body: SessionBody = from_body(&response.body)?;
        Ok(body.into_session(now))
    }

    /// Parse a signup response, which is either a full session or, when the
    /// account still awaits confirmation, a bare user record.
    pub fn parse_sign_up(&self, response: HttpResponse, now: DateTime<Utc>) -> Result<AuthOutcome, ApiError> {
        check_auth_status(&response, 200)?;
        match from_body::<SignUpBody>(&response.body)? {
            SignUpBody::Session(body) => Ok(AuthOutcome::from_session(body.into_session(now))),
            SignUpBody::User(user) => Ok(AuthOutcome {
                user: Some(user),
                session: None,
            }),
        }
    }

    pub fn parse_sign_out(&self, response: HttpResponse) -> Result<(), ApiError> {
        check_auth_status(&response, 204)
    }

    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------

    pub fn build_select_todos(&self, access_token: &str, user_id: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Get,
            path: format!(
                "{}/rest/v1/todos?select=*&user_id=eq.{}&order=created_at.desc",
                self.base_url,
                encode(user_id)
            ),
            headers: self.auth_headers(access_token),
            body: None,
        }
    }

    pub fn build_insert_todo(&self, access_token: &str, row: &InsertTodo) -> Result<HttpRequest, ApiError> {
        let mut req = self.json_request(
            HttpMethod::Post,
            format!("{}/rest/v1/todos", self.base_url),
            access_token,
            &[row],
        )?;
        req.headers
            .push(("prefer".to_string(), "return=representation".to_string()));
        Ok(req)
    }

    pub fn build_update_todo(&self, access_token: &str, id: &str, patch: &UpdateTodo) -> Result<HttpRequest, ApiError> {
        self.json_request(
            HttpMethod::Patch,
            format!("{}/rest/v1/todos?id=eq.{}", self.base_url, encode(id)),
            access_token,
            patch,
        )
    }

    pub fn build_delete_todo(&self, access_token: &str, id: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Delete,
            path: format!("{}/rest/v1/todos?id=eq.{}", self.base_url, encode(id)),
            headers: self.auth_headers(access_token),
            body: None,
        }
    }

    pub fn parse_select_todos(&self, response: HttpResponse) -> Result<Vec<Todo>, ApiError> {
        check_rest_status(&response, 200)?;
        from_body(&response.body)
    }

    /// Parse an insert-returning response. Exactly one row must come back.
    pub fn parse_insert_todo(&self, response: HttpResponse) -> Result<Todo, ApiError> {
        check_rest_status(&response, 201)?;
        let mut rows: Vec<Todo> = from_body(&response.body)?;
        if rows.len() != 1 {
            return Err(ApiError::DeserializationError(format!(
                "expected exactly one row, got {}",
                rows.len()
            )));
        }
        Ok(rows.remove(0))
    }

    pub fn parse_update_todo(&self, response: HttpResponse) -> Result<(), ApiError> {
        check_rest_status(&response, 204)
    }

    pub fn parse_delete_todo(&self, response: HttpResponse) -> Result<(), ApiError> {
        check_rest_status(&response, 204)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn auth_headers(&self, bearer: &str) -> Vec<(String, String)> {
        vec![
            ("apikey".to_string(), self.anon_key.clone()),
            ("authorization".to_string(), format!("Bearer {bearer}")),
        ]
    }

    fn json_request<B: serde::Serialize + ?Sized>(
        &self,
        method: HttpMethod,
        path: String,
        bearer: &str,
        body: &B,
    ) -> Result<HttpRequest, ApiError> {
        let body = serde_json::to_string(body).map_err(|e| ApiError::SerializationError(e.to_string()))?;
        let mut headers = self.auth_headers(bearer);
        headers.push(("content-type".to_string(), "application/json".to_string()));
        Ok(HttpRequest {
            method,
            path,
            headers,
            body: Some(body),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpBody {
    Session(SessionBody),
    User(Identity),
}

/// Error body shapes used by the auth endpoints across service versions.
#[derive(Deserialize)]
struct AuthErrorBody {
    msg: Option<String>,
    error_description: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct RestErrorBody {
    code: Option<String>,
    message: String,
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

fn from_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::DeserializationError(e.to_string()))
}

/// Map a non-success auth response to `ApiError::Auth` with the service's
/// own message.
fn check_auth_status(response: &HttpResponse, expected: u16) -> Result<(), ApiError> {
    if response.status == expected {
        return Ok(());
    }
    let message = serde_json::from_str::<AuthErrorBody>(&response.body)
        .ok()
        .and_then(|b| b.msg.or(b.error_description).or(b.message).or(b.error))
        .unwrap_or_else(|| response.body.clone());
    Err(ApiError::Auth {
        status: response.status,
        message,
    })
}

/// Map a non-success data response to the appropriate `ApiError` variant.
fn check_rest_status(response: &HttpResponse, expected: u16) -> Result<(), ApiError> {
    if response.status == expected {
        return Ok(());
    }
    if response.status == 404 {
        return Err(ApiError::NotFound);
    }
    match serde_json::from_str::<RestErrorBody>(&response.body) {
        Ok(body) => Err(ApiError::Database {
            status: response.status,
            code: body.code.unwrap_or_default(),
            message: body.message,
        }),
        Err(_) => Err(ApiError::HttpError {
            status: response.status,
            body: response.body.clone(),
        }),
    }
}
