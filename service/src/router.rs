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

//! Endpoint selection for hubs served by several relay endpoints

use crate::endpoint::HubServiceEndpoint;
use std::sync::Arc;

/// Chooses which endpoints a message is sent to.
///
/// Every method receives all endpoints of the hub and returns the subset to
/// fan the message out to. The defaults send to every online endpoint.
pub trait EndpointRouter: Send + Sync + 'static {
    /// Endpoints for a hub-wide broadcast
    fn endpoints_for_broadcast(
        &self,
        endpoints: &[Arc<HubServiceEndpoint>],
    ) -> Vec<Arc<HubServiceEndpoint>> {
        online(endpoints)
    }

    /// Endpoints for a message addressed to one client connection
    fn endpoints_for_connection(
        &self,
        _connection_id: &str,
        endpoints: &[Arc<HubServiceEndpoint>],
    ) -> Vec<Arc<HubServiceEndpoint>> {
        online(endpoints)
    }

    /// Endpoints for a message addressed to a group
    fn endpoints_for_group(
        &self,
        _group: &str,
        endpoints: &[Arc<HubServiceEndpoint>],
    ) -> Vec<Arc<HubServiceEndpoint>> {
        online(endpoints)
    }

    /// Endpoints for a message addressed to a user
    fn endpoints_for_user(
        &self,
        _user_id: &str,
        endpoints: &[Arc<HubServiceEndpoint>],
    ) -> Vec<Arc<HubServiceEndpoint>> {
        online(endpoints)
    }
}

/// Routes every message to every online endpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEndpointRouter;

impl EndpointRouter for DefaultEndpointRouter {}

/// The online subset of `endpoints`
pub fn online(endpoints: &[Arc<HubServiceEndpoint>]) -> Vec<Arc<HubServiceEndpoint>> {
    endpoints
        .iter()
        .filter(|endpoint| endpoint.is_online())
        .cloned()
        .collect()
}
