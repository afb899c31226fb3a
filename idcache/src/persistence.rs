//! Persisting the current cache document
//!
//! The cache itself never touches storage. Hosts persist it through
//! notifications; [`PersistentCacheNotification`] does this for any
//! [`AsyncCachePersistence`].

use std::{
    error, fmt,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;

use crate::notification::{NotificationError, TokenCacheNotification, TokenCacheNotificationArgs};

#[cfg(feature = "file")]
pub use file::FileCachePersistence;

/// Loads and stores the current cache document
#[async_trait]
pub trait AsyncCachePersistence: fmt::Debug + Send + Sync {
    /// Loads the stored document; an empty vector means nothing is stored
    async fn load(&self) -> Result<Vec<u8>, Box<dyn error::Error + Send + Sync + 'static>>;

    /// Replaces the stored document
    async fn store(&self, data: &[u8]) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>>;
}

#[async_trait]
impl<P: AsyncCachePersistence + ?Sized> AsyncCachePersistence for Arc<P> {
    async fn load(&self) -> Result<Vec<u8>, Box<dyn error::Error + Send + Sync + 'static>> {
        (**self).load().await
    }

    async fn store(&self, data: &[u8]) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        (**self).store(data).await
    }
}

/// Keeps the current cache document in memory
#[derive(Debug, Default)]
pub struct InMemoryCachePersistence {
    data: Mutex<Vec<u8>>,
}

impl InMemoryCachePersistence {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the stored document
    pub fn contents(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AsyncCachePersistence for InMemoryCachePersistence {
    async fn load(&self) -> Result<Vec<u8>, Box<dyn error::Error + Send + Sync + 'static>> {
        Ok(self.contents())
    }

    async fn store(&self, data: &[u8]) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        let mut stored = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        stored.clear();
        stored.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(feature = "file")]
mod file {
    use std::{error, io, path::PathBuf};

    use async_trait::async_trait;
    use tokio::fs::OpenOptions;

    use super::AsyncCachePersistence;

    /// Persists the current cache document to a local file
    ///
    /// A missing file reads as an empty cache. On unix, the file is created
    /// readable only by its owner.
    #[derive(Debug)]
    pub struct FileCachePersistence {
        path: PathBuf,
    }

    impl FileCachePersistence {
        /// Constructs a new file persistence
        pub fn new(path: PathBuf) -> Self {
            Self { path }
        }

        async fn read_cache(&self) -> Result<Vec<u8>, io::Error> {
            use tokio::io::AsyncReadExt;

            let mut file = match OpenOptions::new().read(true).open(&self.path).await {
                Ok(file) => file,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %self.path.display(), "no persisted cache");
                    return Ok(Vec::new());
                }
                Err(error) => return Err(error),
            };

            let mut data = Vec::new();
            file.read_to_end(&mut data).await?;
            Ok(data)
        }

        async fn write_cache(&self, data: &[u8]) -> Result<(), io::Error> {
            use tokio::io::AsyncWriteExt;

            let mut file_opts = OpenOptions::new();

            file_opts.create(true).truncate(true).write(true);

            #[cfg(unix)]
            file_opts.mode(0o600);

            let mut file = file_opts.open(&self.path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl AsyncCachePersistence for FileCachePersistence {
        async fn load(&self) -> Result<Vec<u8>, Box<dyn error::Error + Send + Sync + 'static>> {
            Ok(self.read_cache().await?)
        }

        async fn store(
            &self,
            data: &[u8],
        ) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
            Ok(self.write_cache(data).await?)
        }
    }
}

/// Reloads the cache from persistence before each access and persists it
/// after any access that changed state
#[derive(Debug)]
pub struct PersistentCacheNotification<P> {
    persistence: P,
}

impl<P> PersistentCacheNotification<P> {
    /// Constructs a notification backed by `persistence`
    pub fn new(persistence: P) -> Self {
        Self { persistence }
    }

    /// The underlying persistence
    pub fn persistence(&self) -> &P {
        &self.persistence
    }
}

#[async_trait]
impl<P: AsyncCachePersistence> TokenCacheNotification for PersistentCacheNotification<P> {
    async fn before_access(
        &self,
        args: &TokenCacheNotificationArgs<'_>,
    ) -> Result<(), NotificationError> {
        let data = self.persistence.load().await.map_err(NotificationError::new)?;
        let kinds = args.serializer().deserialize(&data)?;
        tracing::trace!(bytes = data.len(), ?kinds, "reloaded persisted cache");
        Ok(())
    }

    async fn after_access(
        &self,
        args: &TokenCacheNotificationArgs<'_>,
    ) -> Result<(), NotificationError> {
        if !args.has_state_changed() {
            return Ok(());
        }

        let data = args.serializer().serialize()?;
        self.persistence
            .store(&data)
            .await
            .map_err(NotificationError::new)?;
        tracing::trace!(bytes = data.len(), "persisted cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_replaces_content() -> color_eyre::Result<()> {
        let persistence = InMemoryCachePersistence::new();
        assert!(persistence.load().await.map_err(|e| color_eyre::eyre::eyre!(e))?.is_empty());

        persistence
            .store(b"{}")
            .await
            .map_err(|e| color_eyre::eyre::eyre!(e))?;
        assert_eq!(persistence.contents(), b"{}".to_vec());
        Ok(())
    }

    #[cfg(feature = "file")]
    #[tokio::test]
    async fn file_round_trip_and_missing_file() -> color_eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.json");
        let persistence = FileCachePersistence::new(path.clone());

        let loaded = persistence.load().await.map_err(|e| color_eyre::eyre::eyre!(e))?;
        assert!(loaded.is_empty());

        persistence
            .store(br#"{"access_tokens":{}}"#)
            .await
            .map_err(|e| color_eyre::eyre::eyre!(e))?;
        persistence
            .store(b"{}")
            .await
            .map_err(|e| color_eyre::eyre::eyre!(e))?;

        let loaded = persistence.load().await.map_err(|e| color_eyre::eyre::eyre!(e))?;
        assert_eq!(loaded, b"{}".to_vec());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }
}
