use core::fmt;
use std::{collections::HashMap, io, path::PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::trace;

use crate::sample::TelemetrySample;

const EXTENSION: &str = "jsonl";

// A named collection of samples inside a named database
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionId {
    pub database: String,
    pub name: String,
}

impl CollectionId {
    pub fn new(database: &str, name: &str) -> Self {
        Self {
            database: database.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on collection {collection}")]
    Io {
        collection: String,
        #[source]
        source: io::Error,
    },
    #[error("Malformed sample in collection {collection} at line {line}")]
    Malformed {
        collection: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode a sample of collection {collection}")]
    Encode {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
}

// Persistence of telemetry samples. Samples are only ever appended or
// annotated, collections are never deleted
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn append(
        &self,
        collection: &CollectionId,
        sample: &TelemetrySample,
    ) -> Result<(), StoreError>;

    // Return the samples in insertion order, an unknown collection is empty
    async fn load(
        &self,
        collection: &CollectionId,
    ) -> Result<Vec<TelemetrySample>, StoreError>;

    // Overwrite the content of a collection
    async fn replace(
        &self,
        collection: &CollectionId,
        samples: &[TelemetrySample],
    ) -> Result<(), StoreError>;

    async fn contains(&self, collection: &CollectionId) -> Result<bool, StoreError>;

    // Names of the collections of a database
    async fn list(&self, database: &str) -> Result<Vec<String>, StoreError>;
}

// Store each collection as a JSON lines file under <root>/<database>/
pub struct JsonlStore {
    root: PathBuf,
}

impl JsonlStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn database_dir(&self, database: &str) -> PathBuf {
        self.root.join(escape(database))
    }

    fn collection_path(&self, collection: &CollectionId) -> PathBuf {
        self.database_dir(&collection.database)
            .join(format!("{}.{EXTENSION}", escape(&collection.name)))
    }

    fn io_error(collection: &CollectionId) -> impl FnOnce(io::Error) -> StoreError {
        let collection = collection.to_string();
        move |source| StoreError::Io { collection, source }
    }

    fn encode(
        collection: &CollectionId,
        samples: &[TelemetrySample],
    ) -> Result<String, StoreError> {
        let mut out = String::new();

        for sample in samples {
            let line = serde_json::to_string(sample).map_err(|source| {
                StoreError::Encode {
                    collection: collection.to_string(),
                    source,
                }
            })?;

            out.push_str(&line);
            out.push('\n');
        }

        Ok(out)
    }
}

#[async_trait]
impl SampleStore for JsonlStore {
    async fn append(
        &self,
        collection: &CollectionId,
        sample: &TelemetrySample,
    ) -> Result<(), StoreError> {
        let path = self.collection_path(collection);
        let data = Self::encode(collection, std::slice::from_ref(sample))?;

        fs::create_dir_all(self.database_dir(&collection.database))
            .await
            .map_err(Self::io_error(collection))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(Self::io_error(collection))?;

        file.write_all(data.as_bytes())
            .await
            .map_err(Self::io_error(collection))?;
        file.flush().await.map_err(Self::io_error(collection))?;

        trace!("Appended sample {} to {:?}", sample.date, path);

        Ok(())
    }

    async fn load(
        &self,
        collection: &CollectionId,
    ) -> Result<Vec<TelemetrySample>, StoreError> {
        let text = match fs::read_to_string(self.collection_path(collection)).await
        {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(Self::io_error(collection)(err)),
        };

        let mut samples = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let sample = serde_json::from_str(line).map_err(|source| {
                StoreError::Malformed {
                    collection: collection.to_string(),
                    line: i + 1,
                    source,
                }
            })?;

            samples.push(sample);
        }

        Ok(samples)
    }

    async fn replace(
        &self,
        collection: &CollectionId,
        samples: &[TelemetrySample],
    ) -> Result<(), StoreError> {
        let path = self.collection_path(collection);
        let data = Self::encode(collection, samples)?;

        fs::create_dir_all(self.database_dir(&collection.database))
            .await
            .map_err(Self::io_error(collection))?;

        // Write aside then rename so a crash never leaves half a collection
        let tmp_path = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&tmp_path, data)
            .await
            .map_err(Self::io_error(collection))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(Self::io_error(collection))?;

        Ok(())
    }

    async fn contains(&self, collection: &CollectionId) -> Result<bool, StoreError> {
        fs::try_exists(self.collection_path(collection))
            .await
            .map_err(Self::io_error(collection))
    }

    async fn list(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.database_dir(database);
        let to_error = |source: io::Error| StoreError::Io {
            collection: database.to_string(),
            source,
        };

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(to_error(err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(to_error)? {
            let path = entry.path();

            if path.extension().is_none_or(|ext| ext != EXTENSION) {
                continue;
            }

            // Files not written by the store are skipped
            match path.file_stem().and_then(|stem| unescape(&stem.to_string_lossy())) {
                Some(name) => names.push(name),
                None => trace!("Skipping foreign file {:?}", path),
            }
        }
        names.sort();

        Ok(names)
    }
}

// Collection and database names as file names usable on every platform.
// Bytes other than ASCII letters, digits, '-' and '_' become %XX so that
// distinct names never share a file
fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());

    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }

    out
}

fn unescape(file_name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(file_name.len());
    let mut input = file_name.bytes();

    while let Some(byte) = input.next() {
        if byte == b'%' {
            let high = char::from(input.next()?).to_digit(16)?;
            let low = char::from(input.next()?).to_digit(16)?;
            bytes.push((high * 16 + low) as u8);
        } else {
            bytes.push(byte);
        }
    }

    String::from_utf8(bytes).ok()
}

// Store keeping everything in memory
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<CollectionId, Vec<TelemetrySample>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn append(
        &self,
        collection: &CollectionId,
        sample: &TelemetrySample,
    ) -> Result<(), StoreError> {
        self.collections
            .lock()
            .await
            .entry(collection.clone())
            .or_default()
            .push(sample.clone());

        Ok(())
    }

    async fn load(
        &self,
        collection: &CollectionId,
    ) -> Result<Vec<TelemetrySample>, StoreError> {
        let collections = self.collections.lock().await;

        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    async fn replace(
        &self,
        collection: &CollectionId,
        samples: &[TelemetrySample],
    ) -> Result<(), StoreError> {
        self.collections
            .lock()
            .await
            .insert(collection.clone(), samples.to_vec());

        Ok(())
    }

    async fn contains(&self, collection: &CollectionId) -> Result<bool, StoreError> {
        Ok(self.collections.lock().await.contains_key(collection))
    }

    async fn list(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let collections = self.collections.lock().await;

        let mut names: Vec<String> = collections
            .keys()
            .filter(|id| id.database == database)
            .map(|id| id.name.clone())
            .collect();
        names.sort();

        Ok(names)
    }
}
