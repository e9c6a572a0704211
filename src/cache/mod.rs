//! Cache requests: asking the router for the recent history of a topic while
//! live traffic keeps flowing.

pub mod coordinator;

pub use coordinator::{
    CacheOutcome, CacheRequest, CacheRequestCoordinator, CacheStatus, IncompleteReason,
    LiveDataAction,
};

#[cfg(test)]
mod tests;
