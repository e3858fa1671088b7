use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Credlist;

#[derive(Error, Debug)]
pub enum CredsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no credential store attached")]
    NoStore,
    #[error("unknown credlist {0}")]
    UnknownCredlist(String),
    #[error("credlist {0} has no rows")]
    EmptyCredlist(String),
    #[error("usernames and passwords must pair up")]
    MismatchedPairs,
}

/// Per-team credential files, shared between authenticating probes (readers)
/// and the password-change-request API (writer). All access to one team's
/// files goes through that team's mutex; there is no global lock.
pub struct CredentialStore {
    root: PathBuf,
    credlists: Vec<Credlist>,
    locks: Mutex<HashMap<i32, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>, credlists: Vec<Credlist>) -> Self {
        Self {
            root: root.into(),
            credlists,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn credlists(&self) -> &[Credlist] {
        &self.credlists
    }

    fn source_path(&self, list: &Credlist) -> PathBuf {
        self.root.join("config/credlists").join(&list.path)
    }

    fn team_dir(&self, team_id: i32) -> PathBuf {
        self.root.join("submissions/pcrs").join(team_id.to_string())
    }

    fn team_file(&self, team_id: i32, list: &Credlist) -> PathBuf {
        self.team_dir(team_id).join(&list.path)
    }

    fn lock_for(&self, team_id: i32) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(team_id).or_default().clone()
    }

    fn find_list(&self, name_or_path: &str) -> Result<&Credlist, CredsError> {
        self.credlists
            .iter()
            .find(|c| c.name == name_or_path || c.path == name_or_path)
            .ok_or_else(|| CredsError::UnknownCredlist(name_or_path.to_string()))
    }

    /// Boot-time seeding: copy every configured credlist to every team's
    /// directory unless the team already has its own copy.
    pub async fn load_credentials(&self, team_ids: &[i32]) -> Result<(), CredsError> {
        for &team_id in team_ids {
            let dir = self.team_dir(team_id);
            tokio::fs::create_dir_all(&dir).await?;

            let guard = self.lock_for(team_id);
            let _held = guard.lock().await;

            for list in &self.credlists {
                let dst = self.team_file(team_id, list);
                if tokio::fs::try_exists(&dst).await? {
                    continue;
                }
                tokio::fs::copy(self.source_path(list), &dst).await?;
                debug!(team = team_id, credlist = %list.path, "seeded credlist");
            }
        }
        info!(teams = team_ids.len(), credlists = self.credlists.len(), "credentials loaded");
        Ok(())
    }

    /// Random `(username, password)` from a random credlist among `lists`,
    /// read under the team's mutex.
    pub async fn get_creds(
        &self,
        team_id: i32,
        lists: &[String],
    ) -> Result<(String, String), CredsError> {
        let candidates: Vec<&Credlist> = self
            .credlists
            .iter()
            .filter(|c| lists.iter().any(|l| *l == c.name || *l == c.path))
            .collect();
        if candidates.is_empty() {
            return Err(CredsError::UnknownCredlist(lists.join(",")));
        }

        let guard = self.lock_for(team_id);
        let _held = guard.lock().await;

        let list = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        let content = tokio::fs::read_to_string(self.team_file(team_id, list)).await?;

        let rows: Vec<&str> = content
            .lines()
            .skip(1) // header
            .filter(|l| !l.trim().is_empty())
            .collect();
        if rows.is_empty() {
            return Err(CredsError::EmptyCredlist(list.path.clone()));
        }

        let row = rows[rand::thread_rng().gen_range(0..rows.len())];
        let (username, password) = row.split_once(',').unwrap_or((row, ""));
        Ok((username.to_string(), password.to_string()))
    }

    /// Apply a password change request: existing usernames get their password
    /// replaced, new usernames are appended. Returns the number of rows
    /// changed. The file is rewritten atomically (write then rename) under
    /// the team's mutex; the header and row order are preserved.
    pub async fn update_credentials(
        &self,
        team_id: i32,
        credlist: &str,
        usernames: &[String],
        passwords: &[String],
    ) -> Result<usize, CredsError> {
        if usernames.len() != passwords.len() {
            return Err(CredsError::MismatchedPairs);
        }
        let list = self.find_list(credlist)?;
        let path = self.team_file(team_id, list);

        let guard = self.lock_for(team_id);
        let _held = guard.lock().await;

        let content = tokio::fs::read_to_string(&path).await?;
        let mut lines = content.lines();
        let header = lines.next().unwrap_or(&list.explain_text).to_string();
        let mut rows: Vec<(String, String)> = lines
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                let (u, p) = l.split_once(',').unwrap_or((l, ""));
                (u.to_string(), p.to_string())
            })
            .collect();

        let mut changed = 0;
        for (username, password) in usernames.iter().zip(passwords) {
            match rows.iter_mut().find(|(u, _)| u == username) {
                Some(row) => {
                    if row.1 != *password {
                        row.1 = password.clone();
                        changed += 1;
                    }
                }
                None => {
                    rows.push((username.clone(), password.clone()));
                    changed += 1;
                }
            }
        }

        let mut out = String::with_capacity(content.len());
        out.push_str(&header);
        out.push('\n');
        for (u, p) in &rows {
            out.push_str(u);
            out.push(',');
            out.push_str(p);
            out.push('\n');
        }

        let tmp = path.with_extension("csv.tmp");
        tokio::fs::write(&tmp, out).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(team = team_id, credlist = %list.path, changed, "credentials updated");
        Ok(changed)
    }

    /// Per-team credlist files with their last-modified times, for the admin
    /// PCR listing.
    pub async fn team_files(
        &self,
        team_id: i32,
    ) -> Result<Vec<(String, DateTime<Utc>)>, CredsError> {
        let mut out = Vec::new();
        for list in &self.credlists {
            let path = self.team_file(team_id, list);
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let modified = meta.modified()?;
            out.push((list.path.clone(), DateTime::<Utc>::from(modified)));
        }
        Ok(out)
    }
}
