//! Wire protocol: JSON envelopes exchanged over WebSocket text frames.
//!
//! Every frame is one [`Envelope`] with a `type` that selects how `data` is
//! decoded into a [`Message`]. Data-bearing bodies (`dataUpdate`,
//! `dataResponse`) stay encoded as [`EncodedPayload`] until the receiver has
//! decompressed and validated them with a [`PayloadCodec`].

pub mod compression;
mod envelope;
mod payload;

pub use envelope::{Envelope, ErrorMessage, Message, MessageType, TimerForceStop, WireEnvelope};
pub use payload::{DataPayload, DataRequest, EncodedPayload, PayloadCodec};
