//! Directory provider backed by a JSON user map on local disk.
//!
//! The file maps user id → identity record. `run_update` re-reads the file
//! and replaces the in-memory snapshot; lookups serve the snapshot so a
//! deleted or momentarily unreadable file never fails requests.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;

use super::{Directory, DirectoryError, Identity};

pub struct LocalFileDirectory {
    path: String,
    snapshot: RwLock<HashMap<String, Identity>>,
}

impl LocalFileDirectory {
    pub fn new(path: String) -> Self {
        Self {
            path,
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    async fn read_file(&self) -> Result<HashMap<String, Identity>, DirectoryError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let mut users: HashMap<String, Identity> = serde_json::from_str(&contents)?;
        // The map key is authoritative for the id field.
        for (id, user) in users.iter_mut() {
            if user.id.is_empty() {
                user.id = id.clone();
            }
        }
        Ok(users)
    }

    async fn refresh(&self) -> Result<(), DirectoryError> {
        let users = self.read_file().await?;
        *self.snapshot.write().expect("snapshot lock poisoned") = users;
        Ok(())
    }
}

#[async_trait]
impl Directory for LocalFileDirectory {
    async fn run_update(&self) -> Result<(), DirectoryError> {
        self.refresh().await
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<Identity>, DirectoryError> {
        {
            let snapshot = self.snapshot.read().expect("snapshot lock poisoned");
            if !snapshot.is_empty() {
                return Ok(snapshot.get(user_id).cloned());
            }
        }
        // Cold start: nothing loaded yet.
        self.refresh().await?;
        let snapshot = self.snapshot.read().expect("snapshot lock poisoned");
        Ok(snapshot.get(user_id).cloned())
    }

    async fn get_all_users(&self) -> Result<Vec<Identity>, DirectoryError> {
        {
            let snapshot = self.snapshot.read().expect("snapshot lock poisoned");
            if !snapshot.is_empty() {
                return Ok(snapshot.values().cloned().collect());
            }
        }
        self.refresh().await?;
        let snapshot = self.snapshot.read().expect("snapshot lock poisoned");
        Ok(snapshot.values().cloned().collect())
    }
}
