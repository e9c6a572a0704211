//! Topic validation and subscription pattern matching, shared by the client
//! dispatcher and the in-process router.

pub mod pattern;

pub use pattern::{MAX_TOPIC_LEN, TopicPattern, validate_publish_topic};
