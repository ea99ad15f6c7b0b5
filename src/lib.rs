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

//! This crate implements the connection core of a
//! [Matrix](https://matrix.org/) client library: a long-lived,
//! authenticated connection to a homeserver exposing a reactive object
//! model of rooms, users, events and end-to-end-encrypted sessions.
//!
//! The entry point is [`Connection`]: configure one through
//! [`Connection::builder`], resolve the server or set it directly, log
//! in, then drive [`Connection::sync_loop`]. Everything the sync stream
//! delivers lands in the room and user registries and is reported through
//! the [`ConnectionEvents`] observer.
//!
//! ## Crate feature flags
//!
//! * `encryption`: Enables end-to-end encryption support in the library.
//! * `native-tls`/`rustls-tls`/`socks`: The transport stacks passed
//!   through to the HTTP client.
pub use crate::{
    connection::{
        Connection, ConnectionBuilder, ConnectionState, RoomFactory, RoomVisibility, UserFactory,
    },
    error::{Error, HttpError, MatrixError, Result},
    event_emitter::{ConnectionEvents, DirectChatsMap},
    http_client::{ClientConfig, HttpSend, JobHandle, MatrixRequest, RequestConfig, RunningPolicy},
    identifiers::{DeviceId, JoinState, JoinStates, MxcUri, RoomId, UserId},
    room::{EncryptionSettings, Membership, Room},
    sync::{SyncResponse, SyncSettings},
    user::User,
};

pub mod api;
mod connection;
pub mod error;
mod event_emitter;
pub mod events;
mod http_client;
pub mod identifiers;
mod room;
pub mod store;
pub mod sync;
mod user;

#[cfg(feature = "encryption")]
pub mod crypto;

#[cfg(feature = "encryption")]
pub use crate::crypto::{
    Device, KeyVerificationSession, OlmMachine, SasState, VerificationState,
};

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");
