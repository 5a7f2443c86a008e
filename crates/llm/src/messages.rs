//! Wire-format and intermediate message types.
//!
//! `anthropic` holds the Anthropic Messages API shapes as they appear on the
//! wire, both for the inbound client request and for the SSE events written
//! back. `neutral` holds the provider-independent representation every
//! backend driver consumes.

pub mod anthropic;
pub mod neutral;
