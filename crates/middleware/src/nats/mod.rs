pub mod subjects;
mod transport;

pub use subjects::{sanitize_subject_token, PartitionSubjects};
pub use transport::NatsTransport;
