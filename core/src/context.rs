//! Application context: one remote service and the three state containers
//! built around it.
//!
//! Construction wires the containers explicitly; dropping the context tears
//! them down (the auth listener unsubscribes). Independent contexts never
//! share state, so tests build as many as they need.

use std::path::Path;
use std::sync::Arc;

use crate::auth::AuthStore;
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::remote::{HostedService, RemoteService};
use crate::storage::{FileStore, KeyValueStore};
use crate::theme::{SystemPreference, ThemeStore};
use crate::todos::TodoStore;

pub struct AppContext {
    service: Arc<dyn RemoteService>,
    auth: AuthStore,
    todos: TodoStore,
    theme: ThemeStore,
}

impl AppContext {
    pub fn new(
        service: Arc<dyn RemoteService>,
        storage: Arc<dyn KeyValueStore>,
        system: Arc<dyn SystemPreference>,
    ) -> Result<Self, ApiError> {
        let auth = AuthStore::new(Arc::clone(&service));
        let todos = TodoStore::new(Arc::clone(&service), auth.handle());
        let theme = ThemeStore::load(system, storage)?;
        Ok(Self {
            service,
            auth,
            todos,
            theme,
        })
    }

    /// Connect to the hosted service described by `config`, keeping the
    /// session and theme in the JSON file at `state_file`.
    pub fn connect(
        config: &ClientConfig,
        state_file: &Path,
        system: Arc<dyn SystemPreference>,
    ) -> Result<Self, ApiError> {
        let storage: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(state_file));
        let service = HostedService::connect(config).with_storage(Arc::clone(&storage))?;
        Self::new(Arc::new(service), storage, system)
    }

    pub fn service(&self) -> &Arc<dyn RemoteService> {
        &self.service
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    pub fn todos(&self) -> &TodoStore {
        &self.todos
    }

    pub fn theme(&self) -> &ThemeStore {
        &self.theme
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::FakeService;
    use crate::theme::SharedPreference;
    use crate::types::NewTodo;

    fn context(service: Arc<FakeService>) -> AppContext {
        AppContext::new(
            service,
            Arc::new(MemoryStore::new()),
            Arc::new(SharedPreference::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn todos_follow_auth_identity() {
        let service = FakeService::new().with_user("ada@example.com", "pw");
        let ctx = context(service.clone());

        assert!(matches!(ctx.todos().fetch_todos(), Err(ApiError::NotAuthenticated)));
        ctx.auth().sign_in("ada@example.com", "pw").unwrap();
        ctx.todos().add_todo(NewTodo::new("Buy milk")).unwrap();
        assert_eq!(ctx.todos().todos().len(), 1);

        ctx.auth().sign_out().unwrap();
        assert!(matches!(
            ctx.todos().add_todo(NewTodo::new("again")),
            Err(ApiError::NotAuthenticated)
        ));
    }

    #[test]
    fn contexts_are_isolated() {
        let service = FakeService::new().with_user("ada@example.com", "pw");
        let first = context(service.clone());
        let second = context(FakeService::new());

        first.auth().sign_in("ada@example.com", "pw").unwrap();
        assert!(second.auth().current_user().is_none());
        first.theme().toggle_theme().unwrap();
        assert!(second.theme().is_system_theme());
    }

    #[test]
    fn drop_releases_listener() {
        let service = FakeService::new();
        let ctx = context(service.clone());
        assert_eq!(service.listener_count(), 1);
        drop(ctx);
        assert_eq!(service.listener_count(), 0);
    }
}
