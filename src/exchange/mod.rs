//! Backpack exchange client: signing, transport, retry, typed operations

pub mod client;
pub mod error;
pub mod retry;
pub mod signer;
pub mod transport;

pub use client::BackpackClient;
pub use error::ExchangeError;
pub use signer::RequestSigner;
