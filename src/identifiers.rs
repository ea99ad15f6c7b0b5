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

//! Identifier types and helpers.
//!
//! Matrix identifiers are strings with a well-known shape
//! (`@user:server.org`, `!opaque:server.org`, `#alias:server.org`); this
//! module keeps them as plain strings and provides validation and parsing
//! helpers where the shape matters.

use std::fmt;

/// A Matrix user identifier (`@local:server`).
pub type UserId = String;
/// A Matrix room identifier (`!opaque:server`).
pub type RoomId = String;
/// A device identifier, unique per user.
pub type DeviceId = String;

/// Returns the server part of a Matrix identifier, or the whole input when
/// it doesn't carry one (a plain hostname, e.g.).
pub fn server_part(id: &str) -> &str {
    match id.find(':') {
        Some(idx) => &id[idx + 1..],
        None => id,
    }
}

/// Checks that a user identifier is fully qualified (`@local:server`).
pub fn is_valid_user_id(id: &str) -> bool {
    id.starts_with('@') && id[1..].contains(':') && !server_part(id).is_empty()
}

/// The current join state of a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinState {
    /// The room is in Join state.
    Join,
    /// The room is in Invite state.
    Invite,
    /// The room is in Leave state.
    Leave,
    /// The room is in Knock state.
    Knock,
}

impl JoinState {
    fn bit(self) -> u8 {
        match self {
            JoinState::Join => 0b0001,
            JoinState::Invite => 0b0010,
            JoinState::Leave => 0b0100,
            JoinState::Knock => 0b1000,
        }
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinState::Join => "join",
            JoinState::Invite => "invite",
            JoinState::Leave => "leave",
            JoinState::Knock => "knock",
        })
    }
}

/// A set of acceptable join states, used for room lookups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JoinStates(u8);

impl JoinStates {
    /// The set containing every join state.
    pub const ALL: JoinStates = JoinStates(0b1111);

    /// Whether the given state is in this set.
    pub fn contains(self, state: JoinState) -> bool {
        self.0 & state.bit() != 0
    }
}

impl From<JoinState> for JoinStates {
    fn from(state: JoinState) -> Self {
        JoinStates(state.bit())
    }
}

impl std::ops::BitOr for JoinState {
    type Output = JoinStates;

    fn bitor(self, rhs: JoinState) -> JoinStates {
        JoinStates(self.bit() | rhs.bit())
    }
}

impl std::ops::BitOr<JoinState> for JoinStates {
    type Output = JoinStates;

    fn bitor(self, rhs: JoinState) -> JoinStates {
        JoinStates(self.0 | rhs.bit())
    }
}

/// An `mxc://` content URI, an opaque reference to media stored on
/// a homeserver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MxcUri {
    /// The homeserver hosting the media.
    pub server_name: String,
    /// The server-local media identifier.
    pub media_id: String,
}

impl MxcUri {
    /// Parses an `mxc://<server>/<media-id>` string.
    pub fn parse(uri: &str) -> Option<MxcUri> {
        let rest = uri.strip_prefix("mxc://")?;
        let (server_name, media_id) = rest.split_once('/')?;
        if server_name.is_empty() || media_id.is_empty() {
            return None;
        }
        Some(MxcUri { server_name: server_name.to_owned(), media_id: media_id.to_owned() })
    }
}

impl fmt::Display for MxcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mxc://{}/{}", self.server_name, self.media_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_validation() {
        assert!(is_valid_user_id("@alice:example.org"));
        assert!(!is_valid_user_id("alice:example.org"));
        assert!(!is_valid_user_id("@alice"));
        assert_eq!(server_part("@alice:example.org"), "example.org");
        assert_eq!(server_part("example.org"), "example.org");
    }

    #[test]
    fn join_state_masks() {
        let states = JoinState::Join | JoinState::Invite;
        assert!(states.contains(JoinState::Join));
        assert!(states.contains(JoinState::Invite));
        assert!(!states.contains(JoinState::Leave));
        assert!(JoinStates::ALL.contains(JoinState::Knock));
    }

    #[test]
    fn mxc_uri_round_trip() {
        let uri = MxcUri::parse("mxc://example.org/FHyPlCeYUSFFxlgbQYZmoEoe").unwrap();
        assert_eq!(uri.server_name, "example.org");
        assert_eq!(uri.media_id, "FHyPlCeYUSFFxlgbQYZmoEoe");
        assert_eq!(uri.to_string(), "mxc://example.org/FHyPlCeYUSFFxlgbQYZmoEoe");
        assert!(MxcUri::parse("https://example.org/x").is_none());
        assert!(MxcUri::parse("mxc://example.org").is_none());
    }
}
