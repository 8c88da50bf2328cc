use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

pub const LOADING_PAGE: &str = "loading.html";
pub const HEARTBEAT_SCRIPT: &str = "heartbeat.js";
pub const NAVIGATION_SCRIPT: &str = "navigation.js";

/// Write-once, read-many cache over the `static/` directory shipped next to
/// the binary (with `./static/` as the dev fallback).
#[derive(Debug, Default)]
pub struct StaticAssets {
    files: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

fn candidate_paths(filename: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        paths.push(dir.join("static").join(filename));
    }
    paths.push(PathBuf::from("static").join(filename));
    paths
}

impl StaticAssets {
    /// Load the well-known assets up front so the first proxied request does
    /// not pay for disk reads.
    pub fn preloaded() -> Self {
        let assets = Self::default();
        for filename in [LOADING_PAGE, HEARTBEAT_SCRIPT, NAVIGATION_SCRIPT] {
            if assets.get(filename).is_none() {
                tracing::warn!(filename, "failed to preload static asset");
            }
        }
        assets
    }

    pub fn get(&self, filename: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(content) = self.files.read().expect("static cache poisoned").get(filename) {
            return Some(content.clone());
        }

        for path in candidate_paths(filename) {
            if let Ok(content) = std::fs::read(&path) {
                let content = Arc::new(content);
                self.files
                    .write()
                    .expect("static cache poisoned")
                    .insert(filename.to_string(), content.clone());
                return Some(content);
            }
        }
        None
    }
}
