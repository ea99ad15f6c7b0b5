// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A user as seen by one connection.

use std::sync::RwLock;

use crate::identifiers::UserId;

/// A user handle, cached per connection and never dropped during the
/// connection's lifetime.
#[derive(Debug)]
pub struct User {
    id: UserId,
    profile: RwLock<Profile>,
}

#[derive(Clone, Debug, Default)]
struct Profile {
    display_name: Option<String>,
    avatar_url: Option<String>,
}

impl User {
    pub(crate) fn new(id: UserId) -> User {
        User { id, profile: RwLock::new(Profile::default()) }
    }

    /// The fully-qualified Matrix identifier of this user.
    pub fn id(&self) -> &UserId {
        &self.id
    }

    /// The user's global display name, if known.
    pub fn display_name(&self) -> Option<String> {
        self.profile.read().unwrap().display_name.clone()
    }

    /// The display name when known, the identifier otherwise.
    pub fn name(&self) -> String {
        self.display_name().unwrap_or_else(|| self.id.clone())
    }

    /// The `mxc://` URL of the user's global avatar, if known.
    pub fn avatar_url(&self) -> Option<String> {
        self.profile.read().unwrap().avatar_url.clone()
    }

    pub(crate) fn update_profile(
        &self,
        display_name: Option<String>,
        avatar_url: Option<String>,
    ) {
        let mut profile = self.profile.write().unwrap();
        profile.display_name = display_name;
        profile.avatar_url = avatar_url;
    }
}
