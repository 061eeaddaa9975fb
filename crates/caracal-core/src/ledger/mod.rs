//! The Authority Ledger: an append-only record of every issuance,
//! validation, denial, and revocation, plus periodic Merkle batching for
//! tamper evidence.

mod merkle;
mod query;
mod writer;

pub use merkle::{inclusion_proof, InclusionProof, MerkleBatcher};
pub use query::{EventFilter, LedgerQuery};
pub use writer::LedgerWriter;
