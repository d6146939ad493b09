//! Signature verification and aggregation for operator attestations.
//!
//! Two schemes are supported and never mixed within one consensus session:
//! - ECDSA (secp256k1, Ethereum-style recoverable signatures). The aggregate
//!   is a canonical evidentiary bundle sorted by signer.
//! - BLS12-381 (min-pk). The aggregate is a true point sum verified with a
//!   single pairing check.

pub mod aggregator;
pub mod bls;
pub mod ecdsa;
pub mod error;
pub mod signature;

pub use aggregator::SignatureAggregator;
pub use bls::{BlsAggregator, BlsOperatorKey};
pub use ecdsa::{EcdsaAggregator, EcdsaOperatorKey};
pub use error::{AggregationError, CryptoError};
pub use signature::{
    AggregateVerification, AggregatedSignature, BlsAggregate, BlsSignature, EcdsaAggregate,
    EcdsaSignature, Signature,
};
