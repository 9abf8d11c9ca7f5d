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

/// Result Type for Codec Operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Represents possible errors that can occur while framing service messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error occurred while reading from or writing to the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame announced a body larger than the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Announced or encoded frame size
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// The frame body ended before a field was complete.
    #[error("truncated frame reading {field} (required: {required}, available: {available})")]
    Truncated {
        /// Field being read
        field: &'static str,
        /// Number of bytes required
        required: usize,
        /// Number of bytes available
        available: usize,
    },

    /// An unknown message type tag was encountered.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A field held a value outside of its domain.
    #[error("invalid value for {field}: {value}")]
    InvalidValue {
        /// Field being read
        field: &'static str,
        /// Offending raw value
        value: u32,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// The frame body had bytes left over after the message was decoded.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
