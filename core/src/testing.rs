//! In-memory `RemoteService` for container tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::error::ApiError;
use crate::http::{HttpRequest, HttpResponse};
use crate::remote::RemoteService;
use crate::session::{ListenerId, SessionEvent, SessionListener, SessionListeners};
use crate::transport::Transport;
use crate::types::{AuthOutcome, Credentials, Identity, InsertTodo, Session, Todo, UpdateTodo};

#[derive(Default)]
struct State {
    users: HashMap<String, (String, Identity)>,
    session: Option<Session>,
    rows: Vec<Todo>,
    next_id: u64,
}

/// Records every call by name and can be told to fail the next one.
#[derive(Default)]
pub(crate) struct FakeService {
    state: Mutex<State>,
    listeners: SessionListeners,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<ApiError>>,
}

impl FakeService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_user(self: Arc<Self>, email: &str, password: &str) -> Arc<Self> {
        self.register(email, password);
        self
    }

    fn register(&self, email: &str, password: &str) -> Identity {
        let mut state = self.state.lock().unwrap();
        let identity = Identity {
            id: format!("user-{}", state.users.len() + 1),
            email: email.to_string(),
        };
        state
            .users
            .insert(email.to_string(), (password.to_string(), identity.clone()));
        identity
    }

    pub(crate) fn fail_next(&self, err: ApiError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn rows(&self) -> Vec<Todo> {
        self.state.lock().unwrap().rows.clone()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Simulate a change pushed by the service, such as session expiry.
    pub(crate) fn push_session(&self, event: SessionEvent, session: Option<Session>) {
        self.state.lock().unwrap().session = session.clone();
        self.listeners.emit(event, session.as_ref());
    }

    pub(crate) fn session_for(identity: &Identity) -> Session {
        Session {
            access_token: format!("token-{}", identity.id),
            refresh_token: None,
            expires_at: None,
            user: identity.clone(),
        }
    }

    pub(crate) fn seed_row(&self, user_id: &str, title: &str, created_at: DateTime<Utc>) -> Todo {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let row = Todo {
            id: format!("todo-{}", state.next_id),
            user_id: user_id.to_string(),
            title: title.to_string(),
            completed: false,
            due_date: None,
            created_at,
        };
        state.rows.push(row.clone());
        row
    }

    fn begin(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        match self.failure.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn start_session(&self, identity: Identity) -> AuthOutcome {
        let session = Self::session_for(&identity);
        self.push_session(SessionEvent::SignedIn, Some(session.clone()));
        AuthOutcome::from_session(session)
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

impl RemoteService for FakeService {
    fn sign_in_with_password(&self, credentials: &Credentials) -> Result<AuthOutcome, ApiError> {
        self.begin(format!("sign_in {}", credentials.email))?;
        let identity = {
            let state = self.state.lock().unwrap();
            match state.users.get(&credentials.email) {
                Some((password, identity)) if *password == credentials.password => identity.clone(),
                _ => {
                    return Err(ApiError::Auth {
                        status: 400,
                        message: "Invalid login credentials".to_string(),
                    })
                }
            }
        };
        Ok(self.start_session(identity))
    }

    fn sign_up(&self, credentials: &Credentials) -> Result<AuthOutcome, ApiError> {
        self.begin(format!("sign_up {}", credentials.email))?;
        if self.state.lock().unwrap().users.contains_key(&credentials.email) {
            return Err(ApiError::Auth {
                status: 422,
                message: "User already registered".to_string(),
            });
        }
        let identity = self.register(&credentials.email, &credentials.password);
        Ok(self.start_session(identity))
    }

    fn sign_out(&self) -> Result<(), ApiError> {
        self.begin("sign_out".to_string())?;
        self.push_session(SessionEvent::SignedOut, None);
        Ok(())
    }

    fn current_session(&self) -> Option<Session> {
        self.state.lock().unwrap().session.clone()
    }

    fn on_session_change(&self, listener: SessionListener) -> ListenerId {
        let id = self.listeners.subscribe(Arc::clone(&listener));
        let current = self.current_session();
        listener(SessionEvent::InitialSession, current.as_ref());
        id
    }

    fn remove_session_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn select_todos(&self, user_id: &str) -> Result<Vec<Todo>, ApiError> {
        self.begin(format!("select {user_id}"))?;
        let mut rows: Vec<Todo> = self
            .state
            .lock()
            .unwrap()
            .rows
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    fn insert_todo(&self, row: &InsertTodo) -> Result<Todo, ApiError> {
        self.begin(format!("insert {}", row.title))?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let todo = Todo {
            id: format!("todo-{}", state.next_id),
            user_id: row.user_id.clone(),
            title: row.title.clone(),
            completed: row.completed,
            due_date: row.due_date,
            created_at: epoch() + Duration::seconds(state.next_id as i64),
        };
        state.rows.push(todo.clone());
        Ok(todo)
    }

    fn update_todo(&self, id: &str, patch: &UpdateTodo) -> Result<(), ApiError> {
        self.begin(format!("update {id}"))?;
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.rows.iter_mut().find(|row| row.id == id) {
            if let Some(completed) = patch.completed {
                row.completed = completed;
            }
        }
        Ok(())
    }

    fn delete_todo(&self, id: &str) -> Result<(), ApiError> {
        self.begin(format!("delete {id}"))?;
        self.state.lock().unwrap().rows.retain(|row| row.id != id);
        Ok(())
    }
}

/// Replays canned responses and records every request.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn reply(self, status: u16, body: &str) -> Self {
        self.responses.lock().unwrap().push_back(HttpResponse {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        });
        self
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ApiError::Transport("no scripted response".to_string()))
    }
}
