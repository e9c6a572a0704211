//! Transacted sessions group sends and acknowledgements into atomic units.
//!
//! Nothing staged in a [`TransactedSession`] reaches the router before
//! `commit`; the router then applies every staged send and acknowledgement,
//! or none of them.

pub mod transacted_session;

pub(crate) use transacted_session::TxInner;
pub use transacted_session::{TransactedSession, TransactionState};
