use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("consume failed: {0}")]
    ConsumeFailed(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("partition {partition} out of range for topic {topic} ({count} partitions)")]
    InvalidPartition {
        topic: String,
        partition: u32,
        count: u32,
    },
    #[error("topic {topic} exists with {existing} partitions, {requested} requested")]
    PartitionMismatch {
        topic: String,
        existing: u32,
        requested: u32,
    },
}
