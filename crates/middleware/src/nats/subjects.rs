use std::sync::Arc;

/// Subject layout for one topic mapped onto a JetStream stream.
///
/// Each partition is its own subject `{topic}.{partition}`, so a consumer
/// filtered to one subject sees that partition in append order.
pub struct PartitionSubjects {
    topic: Arc<str>,
    /// Pre-computed stream name (uppercase)
    stream_name: Arc<str>,
    /// Pre-computed wildcard subject
    wildcard: Arc<str>,
    /// Partition index -> subject
    subjects: Vec<Arc<str>>,
}

impl PartitionSubjects {
    pub fn new(topic: &str, partitions: u32) -> Self {
        let token = sanitize_subject_token(topic);
        let stream_name: Arc<str> = token.to_uppercase().replace(['.', '-'], "_").into();
        let wildcard: Arc<str> = format!("{}.*", token).into();
        let subjects = (0..partitions)
            .map(|p| Arc::from(format!("{}.{}", token, p)))
            .collect();

        Self {
            topic: topic.into(),
            stream_name,
            wildcard,
            subjects,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[inline]
    pub fn partitions(&self) -> u32 {
        self.subjects.len() as u32
    }

    /// Subject for one partition, `None` when out of range
    #[inline]
    pub fn partition(&self, partition: u32) -> Option<Arc<str>> {
        self.subjects.get(partition as usize).cloned()
    }

    /// Subject matching every partition: `{topic}.*`
    #[inline]
    pub fn all(&self) -> &str {
        &self.wildcard
    }

    #[inline]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Recover the partition index from a received subject
    pub fn parse_partition(subject: &str) -> Option<u32> {
        subject.rsplit('.').next()?.parse().ok()
    }
}

/// Replace characters that are not valid inside a single NATS subject token
pub fn sanitize_subject_token(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' | '\t' | '\r' | '\n' => '_',
            other => other,
        })
        .collect()
}
