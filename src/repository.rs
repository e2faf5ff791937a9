//! Playbook Repository
//!
//! The trigger resolves playbooks by ID through [`PlaybookRepository`].
//! [`MemoryRepository`] keeps them in process for the CLI and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::playbook::Playbook;

/// Errors from a playbook repository.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("playbook '{0}' not found")]
    NotFound(String),

    #[error("playbook '{0}' already exists")]
    AlreadyExists(String),

    #[error("playbook repository unavailable: {0}")]
    Unavailable(String),
}

/// Read access to stored playbooks.
#[async_trait]
pub trait PlaybookRepository: Send + Sync {
    async fn read(&self, id: &str) -> Result<Playbook, RepositoryError>;
}

/// An in-memory playbook store keyed by playbook ID.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    playbooks: RwLock<HashMap<String, Playbook>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new playbook. Fails if the ID is taken.
    pub async fn create(&self, playbook: Playbook) -> Result<(), RepositoryError> {
        let mut playbooks = self.playbooks.write().await;
        if playbooks.contains_key(&playbook.id) {
            return Err(RepositoryError::AlreadyExists(playbook.id));
        }
        debug!("Stored playbook '{}'", playbook.id);
        playbooks.insert(playbook.id.clone(), playbook);
        Ok(())
    }

    /// Replaces a stored playbook.
    pub async fn update(&self, playbook: Playbook) -> Result<(), RepositoryError> {
        let mut playbooks = self.playbooks.write().await;
        match playbooks.get_mut(&playbook.id) {
            Some(existing) => {
                *existing = playbook;
                Ok(())
            }
            None => Err(RepositoryError::NotFound(playbook.id)),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<Playbook, RepositoryError> {
        self.playbooks
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    /// Sorted IDs of all stored playbooks.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.playbooks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl PlaybookRepository for MemoryRepository {
    async fn read(&self, id: &str) -> Result<Playbook, RepositoryError> {
        self.playbooks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}
