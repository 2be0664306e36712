//! # Design Parameters
//! This module contains design constraints arbitrarily imposed on the library.

/// The number of recently processed inbound packet identifiers remembered for duplicate
/// suppression.
pub const MAX_PROCESSED_IDENTIFIERS: usize = 128;

/// The receive maximum assumed when the peer does not announce one.
pub const DEFAULT_RECEIVE_MAXIMUM: u16 = u16::MAX;

/// The number of bytes requested from a transport per read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// The depth of the channel between a connection's receive loop and its engine loop.
pub const INBOUND_CHANNEL_DEPTH: usize = 32;

/// The number of topic aliases the broker accepts from each MQTT v5 client.
pub const TOPIC_ALIAS_MAXIMUM: u16 = 64;
