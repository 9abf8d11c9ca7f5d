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

use crate::{BinaryServiceProtocol, CodecError, ServiceMessage, ServiceProtocol};
use bytes::BytesMut;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// A codec adapting a [`ServiceProtocol`] to `tokio_util::codec` framing.
///
/// `ServiceCodec` is cheap to clone; clones share the underlying protocol so
/// the read and write halves of a transport can each own one.
pub struct ServiceCodec<P: ServiceProtocol + ?Sized = BinaryServiceProtocol> {
    protocol: Arc<P>,
}

impl ServiceCodec<BinaryServiceProtocol> {
    /// Creates a codec for the default binary protocol.
    ///
    /// # Example
    /// ```
    /// use relaymux_protocol::ServiceCodec;
    ///
    /// let codec = ServiceCodec::new();
    /// ```
    pub fn new() -> Self {
        Self {
            protocol: Arc::new(BinaryServiceProtocol::default()),
        }
    }
}

impl Default for ServiceCodec<BinaryServiceProtocol> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ServiceProtocol + ?Sized> ServiceCodec<P> {
    /// Creates a codec backed by a shared protocol instance.
    pub fn with_protocol(protocol: Arc<P>) -> Self {
        Self { protocol }
    }

    /// Get the underlying protocol
    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }
}

impl<P: ServiceProtocol + ?Sized> Clone for ServiceCodec<P> {
    fn clone(&self) -> Self {
        Self {
            protocol: Arc::clone(&self.protocol),
        }
    }
}

impl<P: ServiceProtocol + ?Sized> Decoder for ServiceCodec<P> {
    type Item = ServiceMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServiceMessage>, Self::Error> {
        let message = self.protocol.try_parse_message(src)?;
        if let Some(ref message) = message {
            trace!(kind = %message.kind(), "decoded service message");
        }
        Ok(message)
    }
}

impl<P: ServiceProtocol + ?Sized> Encoder<ServiceMessage> for ServiceCodec<P> {
    type Error = CodecError;

    fn encode(&mut self, item: ServiceMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.protocol.write_message(&item, dst)
    }
}

impl<P: ServiceProtocol + ?Sized> Encoder<&ServiceMessage> for ServiceCodec<P> {
    type Error = CodecError;

    fn encode(&mut self, item: &ServiceMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.protocol.write_message(item, dst)
    }
}
