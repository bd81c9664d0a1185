use crate::models::{Coordinates, PlaceKey};
use common::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    #[serde(flatten)]
    place: PlaceKey,
    coordinates: Option<Coordinates>,
}

/// Geocoding answers keyed by (name, country, city), optionally backed by a JSON file.
///
/// Both matches and confirmed misses are stored. Failed lookups never reach the cache, so
/// they are retried on the next run.
pub struct GeocodeCache {
    path: Option<PathBuf>,
    entries: DashMap<PlaceKey, Option<Coordinates>>,
}

impl GeocodeCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: DashMap::new(),
        }
    }

    /// Opens the cache file at `path`. A missing file starts an empty cache; an unreadable one
    /// is logged and ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let cache = Self {
            path: Some(path.to_path_buf()),
            entries: DashMap::new(),
        };

        if !path.exists() {
            info!(path = %path.display(), "No geocode cache yet, starting empty");
            return Ok(cache);
        }

        let content = fs::read(path)?;
        match serde_json::from_slice::<Vec<CacheEntry>>(&content) {
            Ok(entries) => {
                for entry in entries {
                    cache.entries.insert(entry.place, entry.coordinates);
                }
                info!(path = %path.display(), entries = cache.len(), "Loaded geocode cache");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable geocode cache");
            }
        }

        Ok(cache)
    }

    /// `Some(answer)` on a hit, where the answer itself may be a cached miss.
    pub fn get(&self, key: &PlaceKey) -> Option<Option<Coordinates>> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    pub fn insert(&self, key: PlaceKey, coordinates: Option<Coordinates>) {
        self.entries.insert(key, coordinates);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the cache next to its target and renames it into place. No-op for in-memory caches.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut entries: Vec<CacheEntry> = self
            .entries
            .iter()
            .map(|entry| CacheEntry {
                place: entry.key().clone(),
                coordinates: *entry.value(),
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.place.name, &a.place.country, &a.place.city).cmp(&(
                &b.place.name,
                &b.place.country,
                &b.place.city,
            ))
        });

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&tmp_path, path)?;

        info!(path = %path.display(), entries = entries.len(), "Persisted geocode cache");
        Ok(())
    }
}
