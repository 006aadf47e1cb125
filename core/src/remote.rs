//! Gateway to the hosted auth + data service.
//!
//! # Design
//! `RemoteService` is the seam the state containers depend on. It exposes
//! plain request/response operations that block until the service answers,
//! plus a push channel for session changes. `HostedService` implements it
//! over `ServiceClient` and a `Transport`:
//!
//! - it owns the current session and attaches its access token to data calls
//!   (the anon key when signed out);
//! - an expired session is refreshed before the next data call, and a session
//!   the service rejects is dropped and announced as `SignedOut`;
//! - with a `KeyValueStore` attached, the session survives restarts and is
//!   handed to new listeners as `InitialSession`.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, warn};

use crate::client::ServiceClient;
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::http::{HttpRequest, HttpResponse};
use crate::session::{ListenerId, SessionEvent, SessionListener, SessionListeners};
use crate::storage::KeyValueStore;
use crate::transport::{Transport, UreqTransport};
use crate::types::{AuthOutcome, Credentials, InsertTodo, Session, Todo, UpdateTodo};

/// Storage key for the persisted session.
pub const SESSION_STORAGE_KEY: &str = "taskflow-auth-token";

pub trait RemoteService: Send + Sync {
    fn sign_in_with_password(&self, credentials: &Credentials) -> Result<AuthOutcome, ApiError>;

    fn sign_up(&self, credentials: &Credentials) -> Result<AuthOutcome, ApiError>;

    fn sign_out(&self) -> Result<(), ApiError>;

    fn current_session(&self) -> Option<Session>;

    /// Register `listener` for session changes. The listener is immediately
    /// called once with `SessionEvent::InitialSession`; no change is delivered
    /// to it before that call.
    fn on_session_change(&self, listener: SessionListener) -> ListenerId;

    fn remove_session_listener(&self, id: ListenerId) -> bool;

    /// All rows owned by `user_id`, newest first.
    fn select_todos(&self, user_id: &str) -> Result<Vec<Todo>, ApiError>;

    /// Insert one row and return it as stored.
    fn insert_todo(&self, row: &InsertTodo) -> Result<Todo, ApiError>;

    fn update_todo(&self, id: &str, patch: &UpdateTodo) -> Result<(), ApiError>;

    fn delete_todo(&self, id: &str) -> Result<(), ApiError>;
}

pub struct HostedService<T: Transport = UreqTransport> {
    client: ServiceClient,
    transport: T,
    session: RwLock<Option<Session>>,
    listeners: SessionListeners,
    // Held while a session change is applied and delivered, and while a new
    // listener receives its initial session. Listeners must not call back
    // into the service that notifies them.
    notify: Mutex<()>,
    storage: Option<Arc<dyn KeyValueStore>>,
}

impl HostedService<UreqTransport> {
    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(
            ServiceClient::new(&config.base_url, &config.anon_key),
            UreqTransport::new(config.timeout),
        )
    }
}

impl<T: Transport> HostedService<T> {
    pub fn new(client: ServiceClient, transport: T) -> Self {
        Self {
            client,
            transport,
            session: RwLock::new(None),
            listeners: SessionListeners::new(),
            notify: Mutex::new(()),
            storage: None,
        }
    }

    /// Persist the session in `storage` and restore any session saved there.
    ///
    /// An unreadable saved session is discarded with a warning; a failing
    /// store is returned as an error.
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStore>) -> Result<Self, ApiError> {
        if let Some(raw) = storage.get(SESSION_STORAGE_KEY)? {
            match serde_json::from_str::<Session>(&raw) {
                Ok(session) => {
                    debug!(user_id = %session.user.id, "restored persisted session");
                    *self.session.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(session);
                }
                Err(e) => {
                    warn!(error = %e, "discarding unreadable persisted session");
                    storage.remove(SESSION_STORAGE_KEY)?;
                }
            }
        }
        self.storage = Some(storage);
        Ok(self)
    }

    fn replace_session(&self, event: SessionEvent, session: Option<Session>) {
        let _notify = self.notify.lock().unwrap_or_else(PoisonError::into_inner);
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session.clone();
        self.persist(session.as_ref());
        debug!(?event, signed_in = session.is_some(), "session changed");
        self.listeners.emit(event, session.as_ref());
    }

    // The remote transition already happened, so a failing store is logged
    // rather than turned into an error for the operation.
    fn persist(&self, session: Option<&Session>) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = match session {
            Some(session) => serde_json::to_string(session)
                .map_err(|e| ApiError::SerializationError(e.to_string()))
                .and_then(|raw| storage.set(SESSION_STORAGE_KEY, &raw)),
            None => storage.remove(SESSION_STORAGE_KEY),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist session");
        }
    }

    /// Bearer token for the next data call, refreshing an expired session.
    fn access_token(&self) -> Result<String, ApiError> {
        match self.current_session() {
            None => Ok(self.client.anon_key().to_string()),
            Some(session) if !session.is_expired(Utc::now()) => Ok(session.access_token),
            Some(session) => self.refresh(session),
        }
    }

    fn refresh(&self, expired: Session) -> Result<String, ApiError> {
        let Some(refresh_token) = expired.refresh_token.as_deref() else {
            warn!(user_id = %expired.user.id, "session expired without refresh token");
            self.replace_session(SessionEvent::SignedOut, None);
            return Err(ApiError::Auth {
                status: 401,
                message: "session expired".to_string(),
            });
        };

        let request = self.client.build_refresh_session(refresh_token)?;
        let response = self.transport.execute(request)?;
        match self.client.parse_session(response, Utc::now()) {
            Ok(session) => {
                let token = session.access_token.clone();
                self.replace_session(SessionEvent::TokenRefreshed, Some(session));
                Ok(token)
            }
            Err(e) => {
                warn!(user_id = %expired.user.id, error = %e, "session refresh rejected");
                self.replace_session(SessionEvent::SignedOut, None);
                Err(e)
            }
        }
    }

    fn data_call<R>(
        &self,
        build: impl FnOnce(&str) -> Result<HttpRequest, ApiError>,
        parse: impl FnOnce(HttpResponse) -> Result<R, ApiError>,
    ) -> Result<R, ApiError> {
        let token = self.access_token()?;
        let response = self.transport.execute(build(&token)?)?;
        let result = parse(response);
        if let Err(e) = &result {
            if e.is_unauthorized() && self.current_session().is_some() {
                warn!(error = %e, "service rejected the session");
                self.replace_session(SessionEvent::SignedOut, None);
            }
        }
        result
    }
}

impl<T: Transport> RemoteService for HostedService<T> {
    fn sign_in_with_password(&self, credentials: &Credentials) -> Result<AuthOutcome, ApiError> {
        let request = self.client.build_sign_in(credentials)?;
        let response = self.transport.execute(request)?;
        let session = self.client.parse_session(response, Utc::now())?;
        self.replace_session(SessionEvent::SignedIn, Some(session.clone()));
        Ok(AuthOutcome::from_session(session))
    }

    fn sign_up(&self, credentials: &Credentials) -> Result<AuthOutcome, ApiError> {
        let request = self.client.build_sign_up(credentials)?;
        let response = self.transport.execute(request)?;
        let outcome = self.client.parse_sign_up(response, Utc::now())?;
        if let Some(session) = &outcome.session {
            self.replace_session(SessionEvent::SignedIn, Some(session.clone()));
        }
        Ok(outcome)
    }

    /// End the session remotely, then locally. An expired session is
    /// refreshed first. A session the service no longer recognizes (401, 403
    /// or 404) is dropped locally as if the sign-out had succeeded; transport
    /// and server errors leave it in place.
    fn sign_out(&self) -> Result<(), ApiError> {
        if self.current_session().is_none() {
            self.replace_session(SessionEvent::SignedOut, None);
            return Ok(());
        }
        let token = match self.access_token() {
            Ok(token) => token,
            // A rejected refresh has already cleared the session.
            Err(e) if self.current_session().is_none() => {
                debug!(error = %e, "session ended while refreshing for sign-out");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let response = self.transport.execute(self.client.build_sign_out(&token))?;
        match self.client.parse_sign_out(response) {
            Ok(()) => {}
            Err(e) if matches!(e.status(), Some(401 | 403 | 404)) => {
                warn!(error = %e, "service no longer holds the session, signing out locally");
            }
            Err(e) => return Err(e),
        }
        self.replace_session(SessionEvent::SignedOut, None);
        Ok(())
    }

    fn current_session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_session_change(&self, listener: SessionListener) -> ListenerId {
        let _notify = self.notify.lock().unwrap_or_else(PoisonError::into_inner);
        let id = self.listeners.subscribe(Arc::clone(&listener));
        let current = self.current_session();
        listener(SessionEvent::InitialSession, current.as_ref());
        id
    }

    fn remove_session_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn select_todos(&self, user_id: &str) -> Result<Vec<Todo>, ApiError> {
        self.data_call(
            |token| Ok(self.client.build_select_todos(token, user_id)),
            |response| self.client.parse_select_todos(response),
        )
    }

    fn insert_todo(&self, row: &InsertTodo) -> Result<Todo, ApiError> {
        self.data_call(
            |token| self.client.build_insert_todo(token, row),
            |response| self.client.parse_insert_todo(response),
        )
    }

    fn update_todo(&self, id: &str, patch: &UpdateTodo) -> Result<(), ApiError> {
        self.data_call(
            |token| self.client.build_update_todo(token, id, patch),
            |response| self.client.parse_update_todo(response),
        )
    }

    fn delete_todo(&self, id: &str) -> Result<(), ApiError> {
        self.data_call(
            |token| Ok(self.client.build_delete_todo(token, id)),
            |response| self.client.parse_delete_todo(response),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::HttpMethod;
    use crate::storage::MemoryStore;
    use crate::testing::ScriptedTransport;
    use crate::types::Identity;

    const SESSION_BODY: &str = r#"{"access_token":"tok-1","refresh_token":"ref-1","expires_in":3600,
        "user":{"id":"u1","email":"a@example.com"}}"#;

    fn service(transport: ScriptedTransport) -> HostedService<ScriptedTransport> {
        HostedService::new(ServiceClient::new("http://svc", "anon"), transport)
    }

    fn recorder(service: &HostedService<ScriptedTransport>) -> Arc<Mutex<Vec<(SessionEvent, bool)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        service.on_session_change(Arc::new(move |event, session| {
            sink.lock().unwrap().push((event, session.is_some()));
        }));
        events
    }

    fn expired_session(refresh_token: Option<&str>) -> Session {
        Session {
            access_token: "old".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Some(0),
            user: Identity {
                id: "u1".to_string(),
                email: "a@example.com".to_string(),
            },
        }
    }

    #[test]
    fn sign_in_stores_session_and_notifies() {
        let svc = service(ScriptedTransport::default().reply(200, SESSION_BODY).reply(200, "[]"));
        let events = recorder(&svc);

        let outcome = svc
            .sign_in_with_password(&Credentials::new("a@example.com", "pw"))
            .unwrap();
        assert_eq!(outcome.user.unwrap().id, "u1");
        assert_eq!(
            *events.lock().unwrap(),
            vec![(SessionEvent::InitialSession, false), (SessionEvent::SignedIn, true)]
        );

        svc.select_todos("u1").unwrap();
        let requests = svc.transport.requests();
        assert_eq!(requests[1].header("authorization"), Some("Bearer tok-1"));
    }

    #[test]
    fn failed_sign_in_leaves_session_alone() {
        let svc = service(ScriptedTransport::default().reply(
            400,
            r#"{"error_description":"Invalid login credentials"}"#,
        ));
        let events = recorder(&svc);

        let err = svc
            .sign_in_with_password(&Credentials::new("a@example.com", "bad"))
            .unwrap_err();
        assert!(matches!(err, ApiError::Auth { status: 400, .. }));
        assert!(svc.current_session().is_none());
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn data_calls_without_session_use_anon_key() {
        let svc = service(ScriptedTransport::default().reply(204, ""));
        svc.delete_todo("t1").unwrap();
        let requests = svc.transport.requests();
        assert_eq!(requests[0].method, HttpMethod::Delete);
        assert_eq!(requests[0].header("authorization"), Some("Bearer anon"));
    }

    #[test]
    fn expired_session_is_refreshed_before_data_call() {
        let svc = service(ScriptedTransport::default().reply(200, SESSION_BODY).reply(204, ""));
        *svc.session.write().unwrap() = Some(expired_session(Some("ref-0")));
        let events = recorder(&svc);

        svc.delete_todo("t1").unwrap();

        let requests = svc.transport.requests();
        assert!(requests[0].path.ends_with("grant_type=refresh_token"));
        assert_eq!(requests[1].header("authorization"), Some("Bearer tok-1"));
        assert_eq!(events.lock().unwrap()[1], (SessionEvent::TokenRefreshed, true));
    }

    #[test]
    fn rejected_refresh_signs_out() {
        let svc = service(ScriptedTransport::default().reply(
            400,
            r#"{"error_description":"Invalid Refresh Token"}"#,
        ));
        *svc.session.write().unwrap() = Some(expired_session(Some("ref-0")));
        let events = recorder(&svc);

        let err = svc.select_todos("u1").unwrap_err();
        assert!(matches!(err, ApiError::Auth { status: 400, .. }));
        assert!(svc.current_session().is_none());
        assert_eq!(events.lock().unwrap()[1], (SessionEvent::SignedOut, false));
    }

    #[test]
    fn unauthorized_data_response_signs_out() {
        let svc = service(
            ScriptedTransport::default()
                .reply(200, SESSION_BODY)
                .reply(401, r#"{"code":"PGRST301","message":"JWT expired"}"#),
        );
        svc.sign_in_with_password(&Credentials::new("a@example.com", "pw"))
            .unwrap();
        let events = recorder(&svc);

        let err = svc.select_todos("u1").unwrap_err();
        assert!(err.is_unauthorized());
        assert!(svc.current_session().is_none());
        assert_eq!(events.lock().unwrap()[1], (SessionEvent::SignedOut, false));
    }

    #[test]
    fn sign_out_failure_keeps_session() {
        let svc = service(
            ScriptedTransport::default()
                .reply(200, SESSION_BODY)
                .reply(500, "boom"),
        );
        svc.sign_in_with_password(&Credentials::new("a@example.com", "pw"))
            .unwrap();
        assert!(svc.sign_out().is_err());
        assert!(svc.current_session().is_some());
    }

    #[test]
    fn sign_out_refreshes_expired_session_first() {
        let svc = service(ScriptedTransport::default().reply(200, SESSION_BODY).reply(204, ""));
        *svc.session.write().unwrap() = Some(expired_session(Some("ref-0")));
        let events = recorder(&svc);

        svc.sign_out().unwrap();

        let requests = svc.transport.requests();
        assert!(requests[0].path.ends_with("grant_type=refresh_token"));
        assert!(requests[1].path.ends_with("/auth/v1/logout"));
        assert_eq!(requests[1].header("authorization"), Some("Bearer tok-1"));
        assert!(svc.current_session().is_none());
        assert_eq!(events.lock().unwrap().last(), Some(&(SessionEvent::SignedOut, false)));
    }

    #[test]
    fn sign_out_of_revoked_session_clears_it() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let svc = service(
            ScriptedTransport::default()
                .reply(200, SESSION_BODY)
                .reply(401, r#"{"code":401,"error_code":"bad_jwt","msg":"invalid JWT: token is expired"}"#),
        )
        .with_storage(Arc::clone(&store))
        .unwrap();
        svc.sign_in_with_password(&Credentials::new("a@example.com", "pw"))
            .unwrap();
        let events = recorder(&svc);

        svc.sign_out().unwrap();

        assert!(svc.current_session().is_none());
        assert_eq!(store.get(SESSION_STORAGE_KEY).unwrap(), None);
        assert_eq!(events.lock().unwrap().last(), Some(&(SessionEvent::SignedOut, false)));
    }

    #[test]
    fn sign_out_after_rejected_refresh_succeeds() {
        let svc = service(ScriptedTransport::default().reply(
            400,
            r#"{"error_description":"Invalid Refresh Token"}"#,
        ));
        *svc.session.write().unwrap() = Some(expired_session(Some("ref-0")));

        svc.sign_out().unwrap();

        assert!(svc.current_session().is_none());
        assert_eq!(svc.transport.requests().len(), 1);
    }

    #[test]
    fn sign_out_transport_failure_keeps_session() {
        let svc = service(ScriptedTransport::default().reply(200, SESSION_BODY));
        svc.sign_in_with_password(&Credentials::new("a@example.com", "pw"))
            .unwrap();

        assert!(matches!(svc.sign_out(), Err(ApiError::Transport(_))));
        assert!(svc.current_session().is_some());
    }

    #[test]
    fn new_listener_ends_on_latest_session() {
        let mut transport = ScriptedTransport::default();
        for _ in 0..100 {
            transport = transport.reply(200, SESSION_BODY).reply(204, "");
        }
        let svc = Arc::new(service(transport));
        let worker = {
            let svc = Arc::clone(&svc);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    svc.sign_in_with_password(&Credentials::new("a@example.com", "pw"))
                        .unwrap();
                    svc.sign_out().unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        for _ in 0..100 {
            let last = Arc::new(Mutex::new(None));
            let sink = Arc::clone(&last);
            svc.on_session_change(Arc::new(move |_, session| {
                *sink.lock().unwrap() = Some(session.is_some());
            }));
            seen.push(last);
        }
        worker.join().unwrap();

        assert!(svc.current_session().is_none());
        for last in seen {
            assert_eq!(*last.lock().unwrap(), Some(false));
        }
    }

    #[test]
    fn session_persists_across_instances() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let first = service(ScriptedTransport::default().reply(200, SESSION_BODY))
            .with_storage(Arc::clone(&store))
            .unwrap();
        first
            .sign_in_with_password(&Credentials::new("a@example.com", "pw"))
            .unwrap();

        let second = service(ScriptedTransport::default())
            .with_storage(Arc::clone(&store))
            .unwrap();
        let events = recorder(&second);
        assert_eq!(second.current_session().unwrap().user.id, "u1");
        assert_eq!(events.lock().unwrap()[0], (SessionEvent::InitialSession, true));
    }

    #[test]
    fn unreadable_persisted_session_is_discarded() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set(SESSION_STORAGE_KEY, "garbage").unwrap();
        let svc = service(ScriptedTransport::default())
            .with_storage(Arc::clone(&store))
            .unwrap();
        assert!(svc.current_session().is_none());
        assert_eq!(store.get(SESSION_STORAGE_KEY).unwrap(), None);
    }
}
