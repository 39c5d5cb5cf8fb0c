//! Wire-level request/response protocol
//!
//! The envelope types here are the public contract shared by every transport.
//! Field names are camelCase on the wire; the top-level request envelope
//! rejects unknown fields while nested user payloads stay lenient.

mod envelope;

pub use envelope::{
    api_error, api_success, codes, AlgorithmContext, AlgorithmRequest, AlgorithmResponse,
};
