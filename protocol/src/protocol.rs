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

//! Service protocol serializer interface and the binary implementation

use crate::consts::{self, tag};
use crate::{AckStatus, CodecError, CodecResult, Headers, Payloads, ServiceConnectionType, ServiceMessage};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Serializer for service messages.
///
/// Implementations own the full wire representation of a message, including
/// any framing needed to find message boundaries in a byte stream.
pub trait ServiceProtocol: Send + Sync + 'static {
    /// Protocol version announced in the handshake
    fn version(&self) -> u32 {
        consts::PROTOCOL_VERSION
    }

    /// Append the framed representation of `message` to `dst`.
    fn write_message(&self, message: &ServiceMessage, dst: &mut BytesMut) -> CodecResult<()>;

    /// Try to parse one message from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when a complete frame is
    /// not yet available. On success the frame is consumed from `src`.
    fn try_parse_message(&self, src: &mut BytesMut) -> CodecResult<Option<ServiceMessage>>;

    /// Serialize a message into an owned buffer
    fn message_bytes(&self, message: &ServiceMessage) -> CodecResult<Bytes> {
        let mut buffer = BytesMut::new();
        self.write_message(message, &mut buffer)?;
        Ok(buffer.freeze())
    }
}

/// Length-prefixed binary service protocol.
///
/// Every frame is a big-endian `u32` body length followed by a one byte
/// message tag and the message fields. Strings and byte blobs are prefixed
/// with a `u32` length, optional values with a presence byte.
#[derive(Debug, Clone)]
pub struct BinaryServiceProtocol {
    max_frame_size: usize,
}

impl Default for BinaryServiceProtocol {
    fn default() -> Self {
        Self {
            max_frame_size: consts::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl BinaryServiceProtocol {
    /// Creates a protocol with the default frame limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum accepted frame body size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Maximum accepted frame body size
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn encode_body(message: &ServiceMessage, dst: &mut BytesMut) {
        match message {
            ServiceMessage::HandshakeRequest {
                version,
                connection_type,
                target,
                migration_level,
            } => {
                dst.put_u8(tag::HANDSHAKE_REQUEST);
                dst.put_u32(*version);
                dst.put_u8(*connection_type as u8);
                put_opt_string(dst, target.as_deref());
                dst.put_u8(*migration_level);
            }
            ServiceMessage::HandshakeResponse { error_message } => {
                dst.put_u8(tag::HANDSHAKE_RESPONSE);
                put_opt_string(dst, error_message.as_deref());
            }
            ServiceMessage::Ping { messages } => {
                dst.put_u8(tag::PING);
                put_pairs(dst, messages);
            }
            ServiceMessage::OpenConnection {
                connection_id,
                claims,
                headers,
                query_string,
            } => {
                dst.put_u8(tag::OPEN_CONNECTION);
                put_string(dst, connection_id);
                put_pairs(dst, claims);
                put_headers(dst, headers);
                put_opt_string(dst, query_string.as_deref());
            }
            ServiceMessage::CloseConnection {
                connection_id,
                error_message,
                headers,
            } => {
                dst.put_u8(tag::CLOSE_CONNECTION);
                put_string(dst, connection_id);
                put_opt_string(dst, error_message.as_deref());
                put_headers(dst, headers);
            }
            ServiceMessage::ConnectionData {
                connection_id,
                payload,
            } => {
                dst.put_u8(tag::CONNECTION_DATA);
                put_string(dst, connection_id);
                put_bytes(dst, payload);
            }
            ServiceMessage::MultiConnectionData {
                connection_ids,
                payloads,
            } => {
                dst.put_u8(tag::MULTI_CONNECTION_DATA);
                put_string_list(dst, connection_ids);
                put_payloads(dst, payloads);
            }
            ServiceMessage::BroadcastData { excluded, payloads } => {
                dst.put_u8(tag::BROADCAST_DATA);
                put_string_list(dst, excluded);
                put_payloads(dst, payloads);
            }
            ServiceMessage::GroupBroadcastData {
                group,
                excluded,
                payloads,
            } => {
                dst.put_u8(tag::GROUP_BROADCAST_DATA);
                put_string(dst, group);
                put_string_list(dst, excluded);
                put_payloads(dst, payloads);
            }
            ServiceMessage::MultiGroupBroadcastData { groups, payloads } => {
                dst.put_u8(tag::MULTI_GROUP_BROADCAST_DATA);
                put_string_list(dst, groups);
                put_payloads(dst, payloads);
            }
            ServiceMessage::UserData { user_id, payloads } => {
                dst.put_u8(tag::USER_DATA);
                put_string(dst, user_id);
                put_payloads(dst, payloads);
            }
            ServiceMessage::MultiUserData { user_ids, payloads } => {
                dst.put_u8(tag::MULTI_USER_DATA);
                put_string_list(dst, user_ids);
                put_payloads(dst, payloads);
            }
            ServiceMessage::JoinGroupWithAck {
                connection_id,
                group,
                ack_id,
            } => {
                dst.put_u8(tag::JOIN_GROUP_WITH_ACK);
                put_string(dst, connection_id);
                put_string(dst, group);
                dst.put_u64(*ack_id);
            }
            ServiceMessage::LeaveGroupWithAck {
                connection_id,
                group,
                ack_id,
            } => {
                dst.put_u8(tag::LEAVE_GROUP_WITH_ACK);
                put_string(dst, connection_id);
                put_string(dst, group);
                dst.put_u64(*ack_id);
            }
            ServiceMessage::Ack {
                ack_id,
                status,
                message,
            } => {
                dst.put_u8(tag::ACK);
                dst.put_u64(*ack_id);
                dst.put_u8(*status as u8);
                put_opt_string(dst, message.as_deref());
            }
            ServiceMessage::ServiceError { error_message } => {
                dst.put_u8(tag::SERVICE_ERROR);
                put_string(dst, error_message);
            }
        }
    }

    fn decode_body(body: Bytes) -> CodecResult<ServiceMessage> {
        let mut reader = Reader { buf: body };
        let message = match reader.u8("tag")? {
            tag::HANDSHAKE_REQUEST => {
                let version = reader.u32("version")?;
                let raw_type = reader.u8("connection_type")?;
                let connection_type =
                    ServiceConnectionType::from_u8(raw_type).ok_or(CodecError::InvalidValue {
                        field: "connection_type",
                        value: u32::from(raw_type),
                    })?;
                ServiceMessage::HandshakeRequest {
                    version,
                    connection_type,
                    target: reader.opt_string("target")?,
                    migration_level: reader.u8("migration_level")?,
                }
            }
            tag::HANDSHAKE_RESPONSE => ServiceMessage::HandshakeResponse {
                error_message: reader.opt_string("error_message")?,
            },
            tag::PING => ServiceMessage::Ping {
                messages: reader.pairs("messages")?,
            },
            tag::OPEN_CONNECTION => ServiceMessage::OpenConnection {
                connection_id: reader.string("connection_id")?,
                claims: reader.pairs("claims")?,
                headers: reader.headers()?,
                query_string: reader.opt_string("query_string")?,
            },
            tag::CLOSE_CONNECTION => ServiceMessage::CloseConnection {
                connection_id: reader.string("connection_id")?,
                error_message: reader.opt_string("error_message")?,
                headers: reader.headers()?,
            },
            tag::CONNECTION_DATA => ServiceMessage::ConnectionData {
                connection_id: reader.string("connection_id")?,
                payload: reader.bytes("payload")?,
            },
            tag::MULTI_CONNECTION_DATA => ServiceMessage::MultiConnectionData {
                connection_ids: reader.string_list("connection_ids")?,
                payloads: reader.payloads()?,
            },
            tag::BROADCAST_DATA => ServiceMessage::BroadcastData {
                excluded: reader.string_list("excluded")?,
                payloads: reader.payloads()?,
            },
            tag::GROUP_BROADCAST_DATA => ServiceMessage::GroupBroadcastData {
                group: reader.string("group")?,
                excluded: reader.string_list("excluded")?,
                payloads: reader.payloads()?,
            },
            tag::MULTI_GROUP_BROADCAST_DATA => ServiceMessage::MultiGroupBroadcastData {
                groups: reader.string_list("groups")?,
                payloads: reader.payloads()?,
            },
            tag::USER_DATA => ServiceMessage::UserData {
                user_id: reader.string("user_id")?,
                payloads: reader.payloads()?,
            },
            tag::MULTI_USER_DATA => ServiceMessage::MultiUserData {
                user_ids: reader.string_list("user_ids")?,
                payloads: reader.payloads()?,
            },
            tag::JOIN_GROUP_WITH_ACK => ServiceMessage::JoinGroupWithAck {
                connection_id: reader.string("connection_id")?,
                group: reader.string("group")?,
                ack_id: reader.u64("ack_id")?,
            },
            tag::LEAVE_GROUP_WITH_ACK => ServiceMessage::LeaveGroupWithAck {
                connection_id: reader.string("connection_id")?,
                group: reader.string("group")?,
                ack_id: reader.u64("ack_id")?,
            },
            tag::ACK => {
                let ack_id = reader.u64("ack_id")?;
                let raw_status = reader.u8("status")?;
                let status = AckStatus::from_u8(raw_status).ok_or(CodecError::InvalidValue {
                    field: "status",
                    value: u32::from(raw_status),
                })?;
                ServiceMessage::Ack {
                    ack_id,
                    status,
                    message: reader.opt_string("message")?,
                }
            }
            tag::SERVICE_ERROR => ServiceMessage::ServiceError {
                error_message: reader.string("error_message")?,
            },
            other => return Err(CodecError::UnknownMessageType(other)),
        };

        if reader.buf.has_remaining() {
            return Err(CodecError::TrailingBytes(reader.buf.remaining()));
        }
        Ok(message)
    }
}

impl ServiceProtocol for BinaryServiceProtocol {
    fn write_message(&self, message: &ServiceMessage, dst: &mut BytesMut) -> CodecResult<()> {
        let start = dst.len();
        dst.put_u32(0);
        Self::encode_body(message, dst);

        let size = dst.len() - start - consts::LENGTH_PREFIX_SIZE;
        if size > self.max_frame_size {
            dst.truncate(start);
            return Err(CodecError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        BigEndian::write_u32(
            &mut dst[start..start + consts::LENGTH_PREFIX_SIZE],
            size as u32,
        );
        Ok(())
    }

    fn try_parse_message(&self, src: &mut BytesMut) -> CodecResult<Option<ServiceMessage>> {
        if src.len() < consts::LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let size = BigEndian::read_u32(&src[..consts::LENGTH_PREFIX_SIZE]) as usize;
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        if src.len() < consts::LENGTH_PREFIX_SIZE + size {
            src.reserve(consts::LENGTH_PREFIX_SIZE + size - src.len());
            return Ok(None);
        }

        src.advance(consts::LENGTH_PREFIX_SIZE);
        let body = src.split_to(size).freeze();
        Self::decode_body(body).map(Some)
    }
}

fn put_string(dst: &mut BytesMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}

fn put_opt_string(dst: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            dst.put_u8(1);
            put_string(dst, value);
        }
        None => dst.put_u8(0),
    }
}

fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

fn put_string_list(dst: &mut BytesMut, values: &[String]) {
    dst.put_u32(values.len() as u32);
    for value in values {
        put_string(dst, value);
    }
}

fn put_pairs(dst: &mut BytesMut, pairs: &[(String, String)]) {
    dst.put_u32(pairs.len() as u32);
    for (key, value) in pairs {
        put_string(dst, key);
        put_string(dst, value);
    }
}

fn put_headers(dst: &mut BytesMut, headers: &Headers) {
    dst.put_u32(headers.len() as u32);
    for (key, value) in headers {
        put_string(dst, key);
        put_string(dst, value);
    }
}

fn put_payloads(dst: &mut BytesMut, payloads: &Payloads) {
    dst.put_u32(payloads.len() as u32);
    for (protocol, payload) in payloads {
        put_string(dst, protocol);
        put_bytes(dst, payload);
    }
}

/// Bounds-checked cursor over a frame body
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn ensure(&self, field: &'static str, required: usize) -> CodecResult<()> {
        if self.buf.remaining() < required {
            return Err(CodecError::Truncated {
                field,
                required,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> CodecResult<u8> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, field: &'static str) -> CodecResult<u32> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &'static str) -> CodecResult<u64> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, field: &'static str) -> CodecResult<Bytes> {
        let len = self.u32(field)? as usize;
        self.ensure(field, len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, field: &'static str) -> CodecResult<String> {
        let raw = self.bytes(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
    }

    fn opt_string(&mut self, field: &'static str) -> CodecResult<Option<String>> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => self.string(field).map(Some),
            other => Err(CodecError::InvalidValue {
                field,
                value: u32::from(other),
            }),
        }
    }

    fn string_list(&mut self, field: &'static str) -> CodecResult<Vec<String>> {
        let count = self.u32(field)? as usize;
        // Every entry needs at least its length prefix.
        self.ensure(field, count.saturating_mul(4))?;
        (0..count).map(|_| self.string(field)).collect()
    }

    fn pairs(&mut self, field: &'static str) -> CodecResult<Vec<(String, String)>> {
        let count = self.u32(field)? as usize;
        self.ensure(field, count.saturating_mul(8))?;
        (0..count)
            .map(|_| Ok((self.string(field)?, self.string(field)?)))
            .collect()
    }

    fn headers(&mut self) -> CodecResult<Headers> {
        Ok(self.pairs("headers")?.into_iter().collect())
    }

    fn payloads(&mut self) -> CodecResult<Payloads> {
        let count = self.u32("payloads")? as usize;
        self.ensure("payloads", count.saturating_mul(8))?;
        let mut payloads = Payloads::new();
        for _ in 0..count {
            let protocol = self.string("payloads")?;
            let payload = self.bytes("payloads")?;
            payloads.insert(protocol, payload);
        }
        Ok(payloads)
    }
}
