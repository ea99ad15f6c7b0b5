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

//! Typed wrappers around the client-server API endpoints the connection
//! core uses. Each type implements [`MatrixRequest`] with its verb, path,
//! query and body; the response types are plain serde structs.
//!
//! [`MatrixRequest`]: crate::http_client::MatrixRequest

pub mod account;
pub mod keys;
pub mod media;
pub mod rooms;
pub mod session;
pub mod sync;

/// Percent-encodes a path segment. Room ids, user ids and event types
/// are mostly path-legal (`!`, `:`, `@` are valid in a segment); only
/// characters that would change the URL structure are escaped.
pub(crate) fn encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'/' | b'%' | b'?' | b'#' | b'&' | b'+' => out.push_str(&format!("%{byte:02X}")),
            b if b.is_ascii_graphic() => out.push(b as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::encode;

    #[test]
    fn structural_characters_are_percent_encoded() {
        assert_eq!(encode("!room:example.org"), "!room:example.org");
        assert_eq!(encode("@alice:example.org"), "@alice:example.org");
        assert_eq!(encode("#alias/with/slashes"), "%23alias%2Fwith%2Fslashes");
        assert_eq!(encode("50%"), "50%25");
    }
}
