//! Persisted onboarding state.
//!
//! A single durable flag records whether the browser handoff has already
//! completed once for this installation. It is read once at startup to
//! short-circuit the whole flow, and written exactly once on the first
//! successful handoff. The write must be durable before it is acknowledged:
//! if the process crashes mid-write, the next startup reads the flag as
//! unset and repeats the flow, which is safe.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::OnboardError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct OnboardingRecord {
    #[serde(default)]
    wifi_connected_once: bool,
}

/// Durable key-value state recording onboarding completion.
///
/// Single-writer discipline: only the handoff controller calls
/// `mark_completed`, and only behind its single-fire latch.
pub trait OnboardingStateStore: Send + Sync {
    fn has_completed_once(&self) -> bool;

    /// Idempotent; must not return until the record is durable.
    fn mark_completed(&self) -> Result<(), OnboardError>;
}

/// JSON file store scoped to the application installation.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        FileStore { path }
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;
        Ok(config_dir.join("wifi-onboard").join("state.json"))
    }

    fn load(&self) -> OnboardingRecord {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return OnboardingRecord::default();
        };
        match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                // Corrupt state reads as incomplete; repeating the flow is safe
                tracing::warn!(err = %e, path = %self.path.display(), "discarding unreadable onboarding record");
                OnboardingRecord::default()
            }
        }
    }

    /// Forget a completed onboarding so the next start runs the full flow.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl OnboardingStateStore for FileStore {
    fn has_completed_once(&self) -> bool {
        self.load().wifi_connected_once
    }

    fn mark_completed(&self) -> Result<(), OnboardError> {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }

            let record = OnboardingRecord { wifi_connected_once: true };
            let content = serde_json::to_string_pretty(&record)
                .map_err(std::io::Error::other)?;

            // Write-then-rename so the record is never observable half-written,
            // and fsync before the rename so it survives a crash
            let tmp = self.path.with_extension("json.tmp");
            {
                use std::io::Write;
                let mut file = fs::File::create(&tmp)?;
                file.write_all(content.as_bytes())?;
                file.sync_all()?;
            }
            fs::rename(&tmp, &self.path)?;

            Ok(())
        };

        write().map_err(|e| OnboardError::StoreWriteFailed(e.to_string()))
    }
}

/// In-memory store; stands in for the file store in tests and embedders
/// that manage their own persistence.
#[derive(Default)]
pub struct MemoryStore {
    completed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl OnboardingStateStore for MemoryStore {
    fn has_completed_once(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn mark_completed(&self) -> Result<(), OnboardError> {
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
