//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! # Relaymux Service Protocol
//!
//! Messages exchanged between an application server and a relay service over a
//! multiplexed service connection, and the codec that frames them on a byte
//! stream.
//!
//! ## Overview
//!
//! A single physical service connection carries:
//!
//! - **Control messages**: handshake, ping, acknowledgements and service errors
//! - **Connection lifecycle**: open and close of tunneled client connections
//! - **Data**: per-connection payloads and hub-level broadcast, group and user
//!   payloads keyed by hub protocol name
//!
//! ## Core Components
//!
//! ### [`ServiceMessage`]
//!
//! The message taxonomy. [`ServiceMessage::partition_key`] exposes the ordering
//! key a sender should pin messages on.
//!
//! ### [`ServiceProtocol`]
//!
//! The serializer interface (`write_message`, `try_parse_message`,
//! `message_bytes`). [`BinaryServiceProtocol`] is the length-prefixed binary
//! implementation.
//!
//! ### [`ServiceCodec`]
//!
//! Adapts any protocol to `tokio_util::codec` so it can drive `Framed`,
//! `FramedRead` and `FramedWrite`.
//!
//! ## Usage Example
//!
//! ```rust
//! use relaymux_protocol::{ServiceCodec, ServiceMessage};
//! use tokio_util::codec::{Decoder, Encoder};
//! use bytes::BytesMut;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut codec = ServiceCodec::new();
//! let mut buffer = BytesMut::new();
//! codec.encode(ServiceMessage::connection_data("conn-1", &b"hi"[..]), &mut buffer)?;
//!
//! while let Some(message) = codec.decode(&mut buffer)? {
//!     println!("{:?}", message.kind());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! Protocols are `Send + Sync` and shared behind an `Arc`; each codec clone
//! keeps no per-stream state beyond the buffer it is handed.

#![warn(
    clippy::cargo,
    missing_docs,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms
)]
#![allow(
    clippy::option_if_let_else,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation
)]

mod codec;
pub mod consts;
mod message;
mod protocol;
mod result;

pub use self::codec::ServiceCodec;
pub use self::message::{
    AckStatus, Headers, Payloads, ServiceConnectionType, ServiceMessage, ServiceMessageKind,
};
pub use self::protocol::{BinaryServiceProtocol, ServiceProtocol};
pub use self::result::{CodecError, CodecResult};
