//! In-memory stand-in for the hosted auth + data service.
//!
//! Serves the subset of the auth (`/auth/v1`) and table (`/rest/v1/todos`)
//! API the client uses, with per-user row visibility enforced on every data
//! call. State lives for as long as the router.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub const ACCESS_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Todo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub completed: bool,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct NewRow {
    pub user_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct RowPatch {
    pub title: Option<String>,
    pub completed: Option<bool>,
}

struct Account {
    user: User,
    password: String,
}

struct AccessToken {
    user_id: Uuid,
    expires_at: i64,
}

#[derive(Default)]
pub struct Backend {
    accounts: HashMap<String, Account>,
    access_tokens: HashMap<String, AccessToken>,
    refresh_tokens: HashMap<String, Uuid>,
    todos: Vec<Todo>,
    last_created: Option<DateTime<Utc>>,
    token_ttl: i64,
}

impl Backend {
    fn new(token_ttl: i64) -> Self {
        Self {
            token_ttl,
            ..Default::default()
        }
    }

    fn issue_session(&mut self, user: &User) -> serde_json::Value {
        let access_token = Uuid::new_v4().simple().to_string();
        let refresh_token = Uuid::new_v4().simple().to_string();
        let expires_at = Utc::now().timestamp() + self.token_ttl;
        self.access_tokens.insert(
            access_token.clone(),
            AccessToken {
                user_id: user.id,
                expires_at,
            },
        );
        self.refresh_tokens.insert(refresh_token.clone(), user.id);
        json!({
            "access_token": access_token,
            "token_type": "bearer",
            "expires_in": self.token_ttl,
            "expires_at": expires_at,
            "refresh_token": refresh_token,
            "user": user,
        })
    }

    fn user_by_id(&self, id: Uuid) -> Option<&User> {
        self.accounts
            .values()
            .map(|account| &account.user)
            .find(|user| user.id == id)
    }

    // Strictly increasing so newest-first ordering is total.
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created_at = match self.last_created {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_created = Some(created_at);
        created_at
    }
}

pub type Db = Arc<RwLock<Backend>>;

/// Who a data request runs as.
enum Caller {
    Anon,
    User(Uuid),
}

pub fn app() -> Router {
    app_with_token_ttl(ACCESS_TOKEN_TTL_SECS)
}

/// Router whose access tokens expire after `ttl_secs` (may be zero or
/// negative to hand out already-expired tokens).
pub fn app_with_token_ttl(ttl_secs: i64) -> Router {
    let db: Db = Arc::new(RwLock::new(Backend::new(ttl_secs)));
    Router::new()
        .route("/auth/v1/signup", post(sign_up))
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/logout", post(logout))
        .route(
            "/rest/v1/todos",
            get(select_todos)
                .post(insert_todos)
                .patch(update_todos)
                .delete(delete_todos),
        )
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    serve(listener, app()).await
}

pub async fn serve(listener: TcpListener, router: Router) -> Result<(), std::io::Error> {
    axum::serve(listener, router).await
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn sign_up(State(db): State<Db>, headers: HeaderMap, Json(input): Json<Credentials>) -> Response {
    if let Err(resp) = require_api_key(&headers) {
        return resp;
    }
    if input.email.trim().is_empty() || input.password.len() < 6 {
        return auth_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "weak_password",
            "Password should be at least 6 characters.",
        );
    }

    let mut backend = db.write().await;
    if backend.accounts.contains_key(&input.email) {
        return auth_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "user_already_exists",
            "User already registered",
        );
    }
    let user = User {
        id: Uuid::new_v4(),
        email: input.email.clone(),
    };
    backend.accounts.insert(
        input.email,
        Account {
            user: user.clone(),
            password: input.password,
        },
    );
    info!(user_id = %user.id, "account created");
    Json(backend.issue_session(&user)).into_response()
}

#[derive(Deserialize)]
struct GrantQuery {
    grant_type: String,
}

#[derive(Deserialize)]
struct TokenBody {
    email: Option<String>,
    password: Option<String>,
    refresh_token: Option<String>,
}

async fn token(
    State(db): State<Db>,
    Query(query): Query<GrantQuery>,
    headers: HeaderMap,
    Json(body): Json<TokenBody>,
) -> Response {
    if let Err(resp) = require_api_key(&headers) {
        return resp;
    }
    let mut backend = db.write().await;
    match query.grant_type.as_str() {
        "password" => {
            let user = match (body.email, body.password) {
                (Some(email), Some(password)) => backend
                    .accounts
                    .get(&email)
                    .filter(|account| account.password == password)
                    .map(|account| account.user.clone()),
                _ => None,
            };
            match user {
                Some(user) => {
                    debug!(user_id = %user.id, "password grant");
                    Json(backend.issue_session(&user)).into_response()
                }
                None => auth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_credentials",
                    "Invalid login credentials",
                ),
            }
        }
        "refresh_token" => {
            let user = body
                .refresh_token
                .and_then(|token| backend.refresh_tokens.remove(&token))
                .and_then(|user_id| backend.user_by_id(user_id).cloned());
            match user {
                Some(user) => Json(backend.issue_session(&user)).into_response(),
                None => auth_error(
                    StatusCode::BAD_REQUEST,
                    "refresh_token_not_found",
                    "Invalid Refresh Token: Refresh Token Not Found",
                ),
            }
        }
        other => auth_error(
            StatusCode::BAD_REQUEST,
            "validation_failed",
            &format!("unsupported grant_type: {other}"),
        ),
    }
}

async fn logout(State(db): State<Db>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_api_key(&headers) {
        return resp;
    }
    let mut backend = db.write().await;
    let Some(token) = bearer(&headers) else {
        return auth_error(StatusCode::UNAUTHORIZED, "no_authorization", "This endpoint requires a Bearer token");
    };
    match backend.access_tokens.remove(token) {
        Some(revoked) => {
            backend
                .refresh_tokens
                .retain(|_, user_id| *user_id != revoked.user_id);
            StatusCode::NO_CONTENT.into_response()
        }
        None => auth_error(StatusCode::UNAUTHORIZED, "bad_jwt", "invalid JWT"),
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

async fn select_todos(
    State(db): State<Db>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let backend = db.read().await;
    let caller = match caller(&backend, &headers) {
        Ok(caller) => caller,
        Err(resp) => return resp,
    };
    let (id, user_id) = match (uuid_filter(&params, "id"), uuid_filter(&params, "user_id")) {
        (Ok(id), Ok(user_id)) => (id, user_id),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let mut rows: Vec<Todo> = backend
        .todos
        .iter()
        .filter(|row| visible(&caller, row))
        .filter(|row| id.map_or(true, |id| row.id == id))
        .filter(|row| user_id.map_or(true, |user_id| row.user_id == user_id))
        .cloned()
        .collect();
    match params.get("order").map(String::as_str) {
        Some("created_at.desc") => rows.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        Some("created_at.asc") | Some("created_at") => rows.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        Some(other) => {
            return rest_error(
                StatusCode::BAD_REQUEST,
                "PGRST100",
                &format!("unsupported order: {other}"),
            )
        }
        None => {}
    }
    Json(rows).into_response()
}

async fn insert_todos(State(db): State<Db>, headers: HeaderMap, Json(input): Json<Vec<NewRow>>) -> Response {
    let mut backend = db.write().await;
    let user_id = match caller(&backend, &headers) {
        Ok(Caller::User(user_id)) => user_id,
        Ok(Caller::Anon) => return rls_violation(),
        Err(resp) => return resp,
    };
    if input.iter().any(|row| row.user_id != user_id) {
        return rls_violation();
    }
    if input.iter().any(|row| row.title.trim().is_empty()) {
        return rest_error(
            StatusCode::BAD_REQUEST,
            "23514",
            "new row for relation \"todos\" violates check constraint \"todos_title_check\"",
        );
    }

    let mut created = Vec::with_capacity(input.len());
    for row in input {
        let todo = Todo {
            id: Uuid::new_v4(),
            user_id,
            title: row.title,
            completed: row.completed,
            due_date: row.due_date,
            created_at: backend.next_created_at(),
        };
        backend.todos.push(todo.clone());
        created.push(todo);
    }
    debug!(%user_id, count = created.len(), "rows inserted");

    let wants_rows = headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("return=representation"));
    if wants_rows {
        (StatusCode::CREATED, Json(created)).into_response()
    } else {
        StatusCode::CREATED.into_response()
    }
}

async fn update_todos(
    State(db): State<Db>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(patch): Json<RowPatch>,
) -> Response {
    let mut backend = db.write().await;
    let caller = match caller(&backend, &headers) {
        Ok(caller) => caller,
        Err(resp) => return resp,
    };
    let id = match uuid_filter(&params, "id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return rest_error(
            StatusCode::BAD_REQUEST,
            "23514",
            "new row for relation \"todos\" violates check constraint \"todos_title_check\"",
        );
    }

    for row in backend
        .todos
        .iter_mut()
        .filter(|row| visible(&caller, row))
        .filter(|row| id.map_or(true, |id| row.id == id))
    {
        if let Some(title) = &patch.title {
            row.title = title.clone();
        }
        if let Some(completed) = patch.completed {
            row.completed = completed;
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_todos(
    State(db): State<Db>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let mut backend = db.write().await;
    let caller = match caller(&backend, &headers) {
        Ok(caller) => caller,
        Err(resp) => return resp,
    };
    let id = match uuid_filter(&params, "id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    backend
        .todos
        .retain(|row| !(visible(&caller, row) && id.map_or(true, |id| row.id == id)));
    StatusCode::NO_CONTENT.into_response()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn visible(caller: &Caller, row: &Todo) -> bool {
    matches!(caller, Caller::User(user_id) if *user_id == row.user_id)
}

fn require_api_key(headers: &HeaderMap) -> Result<&str, Response> {
    headers
        .get("apikey")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"message": "No API key found in request"})),
            )
                .into_response()
        })
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn caller(backend: &Backend, headers: &HeaderMap) -> Result<Caller, Response> {
    let api_key = require_api_key(headers)?;
    let token = match bearer(headers) {
        None => return Ok(Caller::Anon),
        Some(token) if token == api_key => return Ok(Caller::Anon),
        Some(token) => token,
    };
    match backend.access_tokens.get(token) {
        Some(access) if access.expires_at > Utc::now().timestamp() => Ok(Caller::User(access.user_id)),
        Some(_) => Err(rest_error(StatusCode::UNAUTHORIZED, "PGRST301", "JWT expired")),
        None => Err(rest_error(StatusCode::UNAUTHORIZED, "PGRST301", "JWT invalid")),
    }
}

/// Parse a `column=eq.<uuid>` filter.
fn uuid_filter(params: &HashMap<String, String>, column: &str) -> Result<Option<Uuid>, Response> {
    let Some(raw) = params.get(column) else {
        return Ok(None);
    };
    let Some(value) = raw.strip_prefix("eq.") else {
        return Err(rest_error(
            StatusCode::BAD_REQUEST,
            "PGRST100",
            &format!("failed to parse filter ({column}={raw})"),
        ));
    };
    Uuid::parse_str(value).map(Some).map_err(|_| {
        rest_error(
            StatusCode::BAD_REQUEST,
            "22P02",
            &format!("invalid input syntax for type uuid: \"{value}\""),
        )
    })
}

fn auth_error(status: StatusCode, error_code: &str, msg: &str) -> Response {
    (
        status,
        Json(json!({"code": status.as_u16(), "error_code": error_code, "msg": msg})),
    )
        .into_response()
}

fn rest_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"code": code, "message": message, "details": null, "hint": null})),
    )
        .into_response()
}

fn rls_violation() -> Response {
    rest_error(
        StatusCode::FORBIDDEN,
        "42501",
        "new row violates row-level security policy for table \"todos\"",
    )
}
