//! Bayou client-side functionality modules.

mod apistub;
mod session;

pub use apistub::ClientApiStub;
pub use session::{BayouClient, Room};

/// Client ID type. Clients pick their own IDs; the server keys its reply
/// channels by them, so they must be unique among a replica's clients.
pub type ClientId = u64;
