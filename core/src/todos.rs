//! Todo state container.
//!
//! # Design
//! `TodoStore` keeps the signed-in user's task records in memory, newest
//! first. Every operation is fire-and-confirm: the remote call completes
//! before local state is touched, and a failed call leaves it unchanged.
//! The lock is never held across a remote call, so two overlapping calls
//! are not serialized and the later response wins.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::debug;

use crate::auth::AuthHandle;
use crate::error::ApiError;
use crate::remote::RemoteService;
use crate::types::{InsertTodo, NewTodo, Todo, UpdateTodo};

pub struct TodoStore {
    service: Arc<dyn RemoteService>,
    auth: AuthHandle,
    todos: RwLock<Vec<Todo>>,
}

impl TodoStore {
    pub fn new(service: Arc<dyn RemoteService>, auth: AuthHandle) -> Self {
        Self {
            service,
            auth,
            todos: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the local sequence.
    pub fn todos(&self) -> Vec<Todo> {
        self.todos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Todo> {
        self.todos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn set_todos(&self, todos: Vec<Todo>) {
        *self.todos.write().unwrap_or_else(PoisonError::into_inner) = todos;
    }

    pub fn clear(&self) {
        self.set_todos(Vec::new());
    }

    /// Replace the local sequence with the user's rows, newest first.
    pub fn fetch_todos(&self) -> Result<(), ApiError> {
        let user = self.auth.require_user()?;
        let todos = self.service.select_todos(&user.id)?;
        debug!(user_id = %user.id, count = todos.len(), "fetched todos");
        self.set_todos(todos);
        Ok(())
    }

    /// Insert a task for the current user and append the stored row.
    ///
    /// The row goes to the END of the local sequence even though fetches
    /// order newest first; a later `fetch_todos` moves it to the front.
    pub fn add_todo(&self, todo: NewTodo) -> Result<Todo, ApiError> {
        let user = self.auth.require_user()?;
        todo.validate(Utc::now())?;
        let created = self.service.insert_todo(&InsertTodo::new(&user.id, todo))?;
        debug!(id = %created.id, "added todo");
        self.todos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(created.clone());
        Ok(created)
    }

    /// Flip the completion flag of a local task. Unknown ids are a no-op and
    /// make no remote call.
    pub fn toggle_todo(&self, id: &str) -> Result<(), ApiError> {
        let Some(todo) = self.get(id) else {
            return Ok(());
        };
        let patch = UpdateTodo {
            completed: Some(!todo.completed),
        };
        self.service.update_todo(id, &patch)?;
        if let Some(local) = self
            .todos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .find(|t| t.id == id)
        {
            local.completed = !local.completed;
        }
        debug!(id, "toggled todo");
        Ok(())
    }

    /// Delete a task remotely, then drop it locally. The remote call is made
    /// even when the id is not held locally.
    pub fn delete_todo(&self, id: &str) -> Result<(), ApiError> {
        self.service.delete_todo(id)?;
        self.todos
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|t| t.id != id);
        debug!(id, "deleted todo");
        Ok(())
    }
}
