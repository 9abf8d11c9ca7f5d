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

//! Wire constants for the service protocol

/// Service protocol version spoken by this crate
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the big-endian length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum size of a single frame body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Record separator terminating hub protocol handshake records
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Header present on an open when the client was migrated from another server
pub const HEADER_MIGRATED_FROM: &str = "Asrs-Migrated-From";

/// Header present on a close when the client is migrating to another server
pub const HEADER_MIGRATED_TO: &str = "Asrs-Migrated-To";

/// Ping key carrying the server's client connection count
pub const PING_CONNECTION_COUNT: &str = "cc";

/// Ping key announcing the server is going offline
pub const PING_OFFLINE: &str = "offline";

/// Ping value for an offline announcement where clients are closed
pub const PING_OFFLINE_FIN: &str = "fin:0";

/// Ping value for an offline announcement where clients are migrated
pub const PING_OFFLINE_MIGRATE: &str = "fin:2";

/// Message type tags
pub(crate) mod tag {
    pub const HANDSHAKE_REQUEST: u8 = 1;
    pub const HANDSHAKE_RESPONSE: u8 = 2;
    pub const PING: u8 = 3;
    pub const OPEN_CONNECTION: u8 = 4;
    pub const CLOSE_CONNECTION: u8 = 5;
    pub const CONNECTION_DATA: u8 = 6;
    pub const MULTI_CONNECTION_DATA: u8 = 7;
    pub const BROADCAST_DATA: u8 = 8;
    pub const GROUP_BROADCAST_DATA: u8 = 9;
    pub const MULTI_GROUP_BROADCAST_DATA: u8 = 10;
    pub const USER_DATA: u8 = 11;
    pub const MULTI_USER_DATA: u8 = 12;
    pub const JOIN_GROUP_WITH_ACK: u8 = 13;
    pub const LEAVE_GROUP_WITH_ACK: u8 = 14;
    pub const ACK: u8 = 15;
    pub const SERVICE_ERROR: u8 = 16;
}
