//! Topic registry.
//!
//! Maps topic names to their partitions. Each partition is a
//! [`PartitionLog`] replicated by its own single-node [`LocalReplicator`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shoal_core::{PartitionId, TopicId};
use shoal_partition::{LocalReplicator, PartitionLog, PartitionLogConfig, Replicator};
use shoal_segment::Storage;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::limits::{PARTITIONS_PER_TOPIC_MAX, TOPIC_NAME_LENGTH_MAX};

/// A partition and its replication layer.
#[derive(Debug, Clone)]
pub struct TopicPartition {
    /// The partition log.
    pub log: Arc<PartitionLog>,
    /// Its replicator.
    pub replicator: Arc<LocalReplicator>,
}

#[derive(Debug)]
struct TopicEntry {
    topic_id: TopicId,
    partitions: Vec<TopicPartition>,
}

/// Topics hosted by this node.
pub struct TopicRegistry {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    topics: RwLock<HashMap<String, TopicEntry>>,
    next_topic_id: AtomicU64,
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("node_id", &self.config.node_id)
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

impl TopicRegistry {
    /// Creates an empty registry storing partitions under `config.data_dir`.
    #[must_use]
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            topics: RwLock::new(HashMap::new()),
            next_topic_id: AtomicU64::new(1),
        }
    }

    /// Server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Creates a topic with `partition_count` partitions led by this node.
    ///
    /// # Errors
    /// Returns an error if the name is invalid or taken, the count is out of
    /// range, or a partition cannot be opened. Partitions opened before the
    /// failure are destroyed.
    pub async fn create_topic(&self, name: &str, partition_count: u32) -> ServerResult<TopicId> {
        validate_topic_name(name)?;
        if partition_count == 0 || partition_count > PARTITIONS_PER_TOPIC_MAX {
            return Err(ServerError::InvalidPartitionCount {
                count: partition_count,
                max: PARTITIONS_PER_TOPIC_MAX,
            });
        }

        let mut topics = self.topics.write().await;
        if topics.contains_key(name) {
            return Err(ServerError::TopicExists {
                topic: name.to_string(),
            });
        }

        let topic_id = TopicId::new(self.next_topic_id.fetch_add(1, Ordering::Relaxed));

        let mut partitions = Vec::with_capacity(partition_count as usize);
        for index in 0..partition_count {
            #[allow(clippy::cast_possible_wrap)] // Bounded by PARTITIONS_PER_TOPIC_MAX.
            let partition_index = index as i32;
            let partition_id = PartitionId::new(u64::from(index));
            let dir = self.config.data_dir.join(name).join(index.to_string());
            let config = PartitionLogConfig::new(topic_id, partition_id, dir)
                .with_segment(self.config.segment)
                .with_eviction(self.config.eviction)
                .with_replication_timeout(self.config.request_timeout);

            let (replicator, commits) = LocalReplicator::new(self.config.node_id);
            let opened = PartitionLog::open(
                config,
                Arc::clone(&self.storage),
                Arc::clone(&replicator) as Arc<dyn Replicator>,
                commits,
            )
            .await;
            match opened {
                Ok(log) => partitions.push(TopicPartition {
                    log: Arc::new(log),
                    replicator,
                }),
                Err(source) => {
                    warn!(
                        topic = name,
                        partition = partition_index,
                        error = %source,
                        "Failed to open partition, abandoning topic"
                    );
                    // Cleanup failures are logged per partition.
                    let _ = destroy_partitions(name, partitions).await;
                    return Err(ServerError::Partition {
                        topic: name.to_string(),
                        partition: partition_index,
                        source,
                    });
                }
            }
        }

        topics.insert(
            name.to_string(),
            TopicEntry {
                topic_id,
                partitions,
            },
        );
        info!(topic = name, topic_id = %topic_id, partition_count, "Created topic");
        Ok(topic_id)
    }

    /// Looks up a partition.
    ///
    /// # Errors
    /// Returns `TopicNotFound` or `PartitionNotFound`.
    pub async fn partition(&self, topic: &str, partition: i32) -> ServerResult<TopicPartition> {
        let topics = self.topics.read().await;
        let entry = topics.get(topic).ok_or_else(|| ServerError::TopicNotFound {
            topic: topic.to_string(),
        })?;
        usize::try_from(partition)
            .ok()
            .and_then(|index| entry.partitions.get(index))
            .cloned()
            .ok_or_else(|| ServerError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })
    }

    /// ID of a topic.
    pub async fn topic_id(&self, topic: &str) -> Option<TopicId> {
        self.topics.read().await.get(topic).map(|e| e.topic_id)
    }

    /// Number of partitions of a topic.
    pub async fn partition_count(&self, topic: &str) -> Option<usize> {
        self.topics.read().await.get(topic).map(|e| e.partitions.len())
    }

    /// Names of every topic, sorted.
    pub async fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deletes a topic and every file of its partitions.
    ///
    /// # Errors
    /// Returns `TopicNotFound`, or the first partition that failed to be
    /// destroyed; the remaining partitions are destroyed regardless.
    pub async fn delete_topic(&self, topic: &str) -> ServerResult<()> {
        let entry = self
            .topics
            .write()
            .await
            .remove(topic)
            .ok_or_else(|| ServerError::TopicNotFound {
                topic: topic.to_string(),
            })?;

        let result = destroy_partitions(topic, entry.partitions).await;
        info!(topic, "Deleted topic");
        result
    }

    /// Stops every partition. Files are kept.
    pub async fn shutdown(&self) {
        let topics = self.topics.read().await;
        for entry in topics.values() {
            for partition in &entry.partitions {
                partition.log.shutdown().await;
            }
        }
        info!(topics = topics.len(), "Topic registry shut down");
    }
}

/// Shuts down and destroys every partition, returning the first failure.
async fn destroy_partitions(topic: &str, partitions: Vec<TopicPartition>) -> ServerResult<()> {
    let mut first_error = None;
    for (index, partition) in partitions.into_iter().enumerate() {
        partition.replicator.shutdown();
        if let Err(source) = partition.log.destroy().await {
            warn!(topic, partition = index, error = %source, "Failed to destroy partition");
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let partition = index as i32;
            first_error.get_or_insert(ServerError::Partition {
                topic: topic.to_string(),
                partition,
                source,
            });
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn validate_topic_name(name: &str) -> ServerResult<()> {
    let valid = !name.is_empty()
        && name.len() <= TOPIC_NAME_LENGTH_MAX
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ServerError::InvalidTopicName {
            topic: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{LogIndex, Record};
    use shoal_segment::{SegmentConfig, SegmentStore, SimulatedStorage};
    use std::path::Path;

    fn registry() -> TopicRegistry {
        TopicRegistry::new(
            ServerConfig::for_testing("/data"),
            Arc::new(SimulatedStorage::new()),
        )
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = registry();
        let topic_id = registry.create_topic("orders", 3).await.unwrap();
        assert_eq!(registry.topic_id("orders").await, Some(topic_id));
        assert_eq!(registry.partition_count("orders").await, Some(3));

        let partition = registry.partition("orders", 2).await.unwrap();
        assert_eq!(partition.log.partition_id(), PartitionId::new(2));
        assert_eq!(partition.log.topic_id(), topic_id);

        assert!(matches!(
            registry.partition("orders", 3).await,
            Err(ServerError::PartitionNotFound { partition: 3, .. })
        ));
        assert!(matches!(
            registry.partition("orders", -1).await,
            Err(ServerError::PartitionNotFound { .. })
        ));
        assert!(matches!(
            registry.partition("missing", 0).await,
            Err(ServerError::TopicNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let registry = registry();
        registry.create_topic("orders", 1).await.unwrap();
        assert!(matches!(
            registry.create_topic("orders", 1).await,
            Err(ServerError::TopicExists { .. })
        ));
        assert!(matches!(
            registry.create_topic("../escape", 1).await,
            Err(ServerError::InvalidTopicName { .. })
        ));
        assert!(matches!(
            registry.create_topic("empty", 0).await,
            Err(ServerError::InvalidPartitionCount { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_topic_destroys_partitions() {
        let storage = SimulatedStorage::new();
        let registry = TopicRegistry::new(
            ServerConfig::for_testing("/data"),
            Arc::new(storage.clone()),
        );
        registry.create_topic("orders", 2).await.unwrap();
        let partition = registry.partition("orders", 0).await.unwrap();
        partition.log.append(vec![Record::new("a")]).await.unwrap();

        registry.delete_topic("orders").await.unwrap();
        assert!(storage.files_in(Path::new("/data/orders/0"), "log").is_empty());
        assert!(registry.topic_names().await.is_empty());
        assert!(matches!(
            registry.delete_topic("orders").await,
            Err(ServerError::TopicNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_files() {
        let storage = SimulatedStorage::new();
        // Partition 1 already holds data no command log accounts for.
        let mut stale = SegmentStore::open(
            Arc::new(storage.clone()),
            "/data/orders/1",
            SegmentConfig::for_testing(),
        )
        .await
        .unwrap();
        stale.append(LogIndex::new(1), vec![Record::new("x")]).await.unwrap();
        drop(stale);

        let registry = TopicRegistry::new(
            ServerConfig::for_testing("/data"),
            Arc::new(storage.clone()),
        );
        assert!(matches!(
            registry.create_topic("orders", 3).await,
            Err(ServerError::Partition { partition: 1, .. })
        ));
        assert!(storage.files_in(Path::new("/data/orders/0"), "log").is_empty());
        assert!(!storage.contains(Path::new("/data/orders/0/MANIFEST")));
        assert!(registry.topic_names().await.is_empty());
    }
}
