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

//! The top-level state machine of one account's connection to its
//! homeserver: discovery, login, the sync loop, the room and user
//! registries, account data and everything user-initiated.

mod direct_chats;

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
    },
    time::Duration,
};

use serde_json::{json, Map, Value};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    api::{
        account::{GetProfileRequest, SetAccountDataRequest},
        media::{GetContentRequest, GetThumbnailRequest, UploadContentRequest},
        rooms::{
            CreateRoomRequest, ForgetRoomRequest, Invite3pid, InitialStateEvent,
            InviteUserRequest, JoinRoomRequest, LeaveRoomRequest, SendMessageRequest,
            SendToDeviceRequest,
        },
        session::{
            Capabilities, GetCapabilitiesRequest, GetLoginFlowsRequest, GetWellKnownRequest,
            LoginFlow, LoginRequest, LogoutRequest, RoomVersionsCapability, WhoamiRequest,
        },
        sync::{Filter, SyncRequest},
    },
    error::{Error, HttpError, Result},
    event_emitter::{ConnectionEvents, NullEvents},
    events::{
        load_event, AnyEvent, DirectChatEvent, Event, IgnoredUsersEvent, FAVOURITE_TAG,
        LOW_PRIORITY_TAG,
    },
    http_client::{client_with_config, ClientConfig, HttpClient, HttpSend, JobHandle},
    identifiers::{
        is_valid_user_id, server_part, JoinState, JoinStates, MxcUri, RoomId, UserId,
    },
    room::Room,
    store::{
        settings::account_group, CacheFormat, Keychain, KeychainError, MemoryKeychain,
        MemorySettings, SettingsStore, StateStore, CACHE_VERSION,
    },
    sync::{InvitedRoomUpdate, JoinedRoomUpdate, SyncResponse},
    user::User,
};

#[cfg(feature = "encryption")]
use crate::crypto::{CryptoStore, KeyVerificationSession, MemoryCryptoStore, OlmMachine};

pub use crate::api::rooms::RoomVisibility;

/// The lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    New,
    ServerResolved,
    LoginFlowsKnown,
    LoggedIn,
    Syncing,
    LoggedOut,
}

/// Creates the room objects the registry hands out; the embedder can
/// substitute its own subtype-carrying rooms.
pub trait RoomFactory: Send + Sync {
    fn create_room(&self, room_id: &RoomId, join_state: JoinState) -> Arc<Room>;
}

/// Creates the user objects the registry hands out.
pub trait UserFactory: Send + Sync {
    fn create_user(&self, user_id: &UserId) -> Arc<User>;
}

struct DefaultRoomFactory;

impl RoomFactory for DefaultRoomFactory {
    fn create_room(&self, room_id: &RoomId, join_state: JoinState) -> Arc<Room> {
        Arc::new(Room::new(room_id.clone(), join_state))
    }
}

struct DefaultUserFactory;

impl UserFactory for DefaultUserFactory {
    fn create_user(&self, user_id: &UserId) -> Arc<User> {
        Arc::new(User::new(user_id.clone()))
    }
}

/// Builder for a [`Connection`].
pub struct ConnectionBuilder {
    homeserver: Option<Url>,
    client_config: ClientConfig,
    http_send: Option<Arc<dyn HttpSend>>,
    keychain: Arc<dyn Keychain>,
    settings: Arc<dyn SettingsStore>,
    room_factory: Box<dyn RoomFactory>,
    user_factory: Box<dyn UserFactory>,
    events: Arc<dyn ConnectionEvents>,
    cache_dir: Option<PathBuf>,
    encryption: bool,
    lazy_loading: bool,
    #[cfg(feature = "encryption")]
    crypto_store: Option<Arc<dyn CryptoStore>>,
}

impl ConnectionBuilder {
    /// Preset homeserver base URL; without one, `resolve_server` (or a
    /// fully-qualified login user id) establishes it.
    pub fn homeserver(mut self, url: Url) -> Self {
        self.homeserver = Some(url);
        self
    }

    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    /// Substitute the HTTP transport; used heavily by tests.
    pub fn http_send(mut self, transport: Arc<dyn HttpSend>) -> Self {
        self.http_send = Some(transport);
        self
    }

    pub fn keychain(mut self, keychain: Arc<dyn Keychain>) -> Self {
        self.keychain = keychain;
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = settings;
        self
    }

    pub fn room_factory(mut self, factory: Box<dyn RoomFactory>) -> Self {
        self.room_factory = factory;
        self
    }

    pub fn user_factory(mut self, factory: Box<dyn UserFactory>) -> Self {
        self.user_factory = factory;
        self
    }

    pub fn events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.events = events;
        self
    }

    /// Enables the state cache, rooted at the given directory.
    pub fn cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    /// Whether end-to-end encryption is set up at login.
    pub fn encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    /// Ask the server for lazy-loaded room members.
    pub fn lazy_loading(mut self, enabled: bool) -> Self {
        self.lazy_loading = enabled;
        self
    }

    #[cfg(feature = "encryption")]
    pub fn crypto_store(mut self, store: Arc<dyn CryptoStore>) -> Self {
        self.crypto_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Arc<Connection>> {
        // The persisted proxy settings apply unless the embedder already
        // configured one explicitly.
        let mut client_config = self.client_config;
        if client_config.proxy.is_none() {
            if let (Some(host), Some(port)) = (
                self.settings.get("Network/proxyHostName"),
                self.settings.get("Network/proxyPort"),
            ) {
                let scheme = match self.settings.get("Network/proxyType").as_deref() {
                    Some("socks5") => "socks5",
                    _ => "http",
                };
                match client_config.clone().proxy(&format!("{scheme}://{host}:{port}")) {
                    Ok(with_proxy) => client_config = with_proxy,
                    Err(e) => warn!("ignoring the configured proxy: {e}"),
                }
            }
        }

        let transport: Arc<dyn HttpSend> = match self.http_send {
            Some(transport) => transport,
            None => Arc::new(client_with_config(&client_config)?),
        };
        let http =
            HttpClient::new(transport, self.homeserver.clone(), client_config.request_config);

        let txn_base = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let state = if self.homeserver.is_some() {
            ConnectionState::ServerResolved
        } else {
            ConnectionState::New
        };

        let connection = Arc::new(Connection {
            http,
            state: StdRwLock::new(state),
            data: StdRwLock::new(SessionData::default()),
            login_flows: StdRwLock::new(Vec::new()),
            capabilities: StdRwLock::new(Capabilities::default()),
            rooms: StdRwLock::new(HashMap::new()),
            room_aliases: StdRwLock::new(HashMap::new()),
            users: StdRwLock::new(HashMap::new()),
            account_data: StdRwLock::new(HashMap::new()),
            direct_chats: StdRwLock::new(direct_chats::DirectChats::default()),
            rooms_to_forget: StdMutex::new(Vec::new()),
            pending_state_rooms: StdMutex::new(Vec::new()),
            sync_state: StdMutex::new(SyncControl::default()),
            logout_pending: AtomicBool::new(false),
            events: StdRwLock::new(self.events),
            keychain: self.keychain,
            settings: self.settings,
            cache_dir: self.cache_dir,
            cache: StdRwLock::new(None),
            cache_enabled: AtomicBool::new(true),
            room_factory: self.room_factory,
            user_factory: self.user_factory,
            txn_base,
            txn_counter: AtomicU64::new(0),
            lazy_loading: AtomicBool::new(self.lazy_loading),
            use_encryption: AtomicBool::new(self.encryption),
            #[cfg(feature = "encryption")]
            crypto_store: self.crypto_store.unwrap_or_else(|| Arc::new(MemoryCryptoStore::new())),
            #[cfg(feature = "encryption")]
            olm: tokio::sync::RwLock::new(None),
            jobs: StdMutex::new(Vec::new()),
        });

        {
            let weak = Arc::downgrade(&connection);
            connection.http.set_retry_callback(Arc::new(move |retries, delay, message| {
                if let Some(connection) = weak.upgrade() {
                    let events = connection.events();
                    tokio::spawn(async move {
                        events.on_network_error(&message, retries, delay).await;
                    });
                }
            }));
        }

        Ok(connection)
    }
}

#[derive(Default)]
struct SessionData {
    user_id: Option<UserId>,
    device_id: Option<String>,
    sync_token: Option<String>,
}

#[derive(Default)]
struct SyncControl {
    in_flight: Option<AbortHandle>,
    /// Bumped whenever an in-flight request is installed, so a finished
    /// sync never clears a newer request's handle.
    generation: u64,
    loop_task: Option<JoinHandle<()>>,
    timeout: Option<Duration>,
}

/// One account's connection to its homeserver.
///
/// # Room transitions
///
/// Rooms in Invite state are stored separately from Join/Leave rooms, so
/// one room id can have two objects at once. `provide_room` implements
/// this transition table (`r` a Join/Leave object, `i` an Invite object):
///
/// 1. none → Invite: `on_new_room(i)`, `on_invited_room(i, None)`
/// 2. none → Join: `on_new_room(r)`, `on_joined_room(r, None)`
/// 3. none → Leave: `on_new_room(r)`, `on_left_room(r, None)`
/// 4. Invite → Join: `on_new_room(r)`, `on_joined_room(r, i)`,
///    `on_about_to_delete_room(i)`
/// 4a. Invite+Leave → Join: `on_joined_room(r, i)`,
///    `on_about_to_delete_room(i)`
/// 5. Invite → Leave: `on_new_room(r)`, `on_left_room(r, i)`,
///    `on_about_to_delete_room(i)`
/// 5a. Invite+Leave → Leave: `on_left_room(r, i)`,
///    `on_about_to_delete_room(i)`
/// 6. Join → Leave: `on_left_room(r, None)`
/// 7. Leave → Invite: `on_new_room(i)`, `on_invited_room(i, r)`
/// 8. Leave → Join: `on_joined_room(r, None)`
/// 9. any → none (via `forget_room`): as above, then
///    `on_about_to_delete_room(r)`
pub struct Connection {
    http: HttpClient,
    state: StdRwLock<ConnectionState>,
    data: StdRwLock<SessionData>,
    login_flows: StdRwLock<Vec<LoginFlow>>,
    capabilities: StdRwLock<Capabilities>,
    rooms: StdRwLock<HashMap<(RoomId, bool), Arc<Room>>>,
    room_aliases: StdRwLock<HashMap<String, RoomId>>,
    users: StdRwLock<HashMap<UserId, Arc<User>>>,
    account_data: StdRwLock<HashMap<String, Event>>,
    direct_chats: StdRwLock<direct_chats::DirectChats>,
    /// Rooms whose forgetting is underway; their sync payloads are
    /// ignored until the server stops mentioning them.
    rooms_to_forget: StdMutex<Vec<RoomId>>,
    /// Rooms whose next state is locally forced (e.g. a rejected invite
    /// the server never confirms).
    pending_state_rooms: StdMutex<Vec<RoomId>>,
    sync_state: StdMutex<SyncControl>,
    logout_pending: AtomicBool,
    events: StdRwLock<Arc<dyn ConnectionEvents>>,
    keychain: Arc<dyn Keychain>,
    settings: Arc<dyn SettingsStore>,
    cache_dir: Option<PathBuf>,
    cache: StdRwLock<Option<StateStore>>,
    cache_enabled: AtomicBool,
    room_factory: Box<dyn RoomFactory>,
    user_factory: Box<dyn UserFactory>,
    txn_base: u64,
    txn_counter: AtomicU64,
    lazy_loading: AtomicBool,
    use_encryption: AtomicBool,
    #[cfg(feature = "encryption")]
    crypto_store: Arc<dyn CryptoStore>,
    #[cfg(feature = "encryption")]
    olm: tokio::sync::RwLock<Option<Arc<OlmMachine>>>,
    /// Every job spawned on behalf of this connection; aborted on drop.
    jobs: StdMutex<Vec<AbortHandle>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop_sync();
        for job in self.jobs.lock().unwrap().drain(..) {
            job.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("homeserver", &self.http.homeserver())
            .field("user_id", &self.user_id())
            .field("state", &self.state())
            .finish()
    }
}

enum RoomEmission {
    New(Arc<Room>),
    Invited(Arc<Room>, Option<Arc<Room>>),
    Joined(Arc<Room>, Option<Arc<Room>>),
    Left(Arc<Room>, Option<Arc<Room>>),
    AboutToDelete(Arc<Room>),
}

impl Connection {
    /// A builder with in-memory stores and default factories.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder {
            homeserver: None,
            client_config: ClientConfig::default(),
            http_send: None,
            keychain: Arc::new(MemoryKeychain::new()),
            settings: Arc::new(MemorySettings::new()),
            room_factory: Box::new(DefaultRoomFactory),
            user_factory: Box::new(DefaultUserFactory),
            events: Arc::new(NullEvents),
            cache_dir: None,
            encryption: false,
            lazy_loading: true,
            #[cfg(feature = "encryption")]
            crypto_store: None,
        }
    }

    /// A logged-in connection without any server interaction, for tests
    /// and tooling.
    pub async fn make_mock_connection(mx_id: &str, encryption: bool) -> Result<Arc<Connection>> {
        let connection = Connection::builder()
            .homeserver(Url::parse("https://localhost:1").expect("static URL"))
            .encryption(encryption)
            .build()?;
        connection.data.write().unwrap().device_id = Some("MOCKDEV".to_owned());
        connection.http.set_access_token(Some("mock-token".to_owned()));
        connection.complete_setup(mx_id, true).await?;
        Ok(connection)
    }

    /// Installs the observer the connection reports through.
    pub fn set_events(&self, events: Arc<dyn ConnectionEvents>) {
        *self.events.write().unwrap() = events;
    }

    fn events(&self) -> Arc<dyn ConnectionEvents> {
        self.events.read().unwrap().clone()
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// The homeserver base URL, if known.
    pub fn homeserver(&self) -> Option<Url> {
        self.http.homeserver()
    }

    /// The logged-in user's Matrix identifier.
    pub fn user_id(&self) -> Option<UserId> {
        self.data.read().unwrap().user_id.clone()
    }

    /// The server part of the logged-in user id.
    pub fn domain(&self) -> Option<String> {
        self.user_id().map(|id| server_part(&id).to_owned())
    }

    /// The device id obtained at login.
    pub fn device_id(&self) -> Option<String> {
        self.data.read().unwrap().device_id.clone()
    }

    /// The access token. `None` while a logout is pending — the token is
    /// still used internally to finish the logout but no longer handed
    /// out.
    pub fn access_token(&self) -> Option<String> {
        if self.logout_pending.load(Ordering::SeqCst) {
            None
        } else {
            self.http.access_token()
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.access_token().is_some()
    }

    /// Whether login flows are known, i.e. the homeserver answered us.
    pub fn is_usable(&self) -> bool {
        !self.login_flows.read().unwrap().is_empty()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    /// The sync token to resume from.
    pub fn next_batch_token(&self) -> Option<String> {
        self.data.read().unwrap().sync_token.clone()
    }

    pub fn login_flows(&self) -> Vec<LoginFlow> {
        self.login_flows.read().unwrap().clone()
    }

    pub fn supports_password_auth(&self) -> bool {
        self.supports_flow(LoginFlow::PASSWORD)
    }

    pub fn supports_sso(&self) -> bool {
        self.supports_flow(LoginFlow::SSO)
    }

    fn supports_flow(&self, flow: &str) -> bool {
        self.login_flows.read().unwrap().iter().any(|f| f.flow_type == flow)
    }

    /// Whether the server allows password changes; assumed true until
    /// capabilities say otherwise.
    pub fn can_change_password(&self) -> bool {
        self.capabilities
            .read()
            .unwrap()
            .change_password
            .as_ref()
            .map(|c| c.enabled)
            .unwrap_or(true)
    }

    /// Whether the capability snapshot hasn't been loaded yet. Room
    /// versions cannot be absent from a loaded snapshot.
    pub fn loading_capabilities(&self) -> bool {
        self.capabilities.read().unwrap().room_versions.is_none()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    async fn emit_state_changed(&self) {
        let state = self.state();
        self.events().on_state_changed(state).await;
    }

    /// Whether end-to-end encryption is active for this connection.
    pub fn encryption_enabled(&self) -> bool {
        self.use_encryption.load(Ordering::SeqCst)
    }

    /// Switches end-to-end encryption on or off. Only possible before
    /// login; afterwards the setting is frozen.
    pub fn enable_encryption(&self, enable: bool) {
        if enable == self.encryption_enabled() {
            return;
        }
        if self.is_logged_in() {
            warn!(
                "it's only possible to enable or disable E2EE before logging in; \
                 the E2EE state stays {}",
                self.encryption_enabled()
            );
            return;
        }
        self.use_encryption.store(enable, Ordering::SeqCst);
    }

    /// Monotonically unique within this connection's lifetime; embedded
    /// in every send job so that retries are idempotent.
    pub fn generate_txn_id(&self) -> String {
        let counter = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.txn_base, counter)
    }

    fn run_job<T, F>(&self, future: F) -> JobHandle<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = JobHandle::spawn(future);
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|j| !j.is_finished());
        jobs.push(handle.abort_handle());
        handle
    }

    // ── Server discovery and login ──────────────────────────────────────

    /// Resolves the homeserver from a Matrix id (or plain hostname) via
    /// `.well-known` discovery, then fetches the login flows.
    pub async fn resolve_server(&self, mxid_or_domain: &str) -> Result<()> {
        let host = if mxid_or_domain.starts_with('@') {
            server_part(mxid_or_domain)
        } else {
            mxid_or_domain
        };
        // Hosts default to https; an explicit scheme (mostly useful for
        // testing against local servers) is left alone.
        let maybe_base_url = if host.contains("://") {
            Url::parse(host)
        } else {
            Url::parse(&format!("https://{host}"))
        }
        .map_err(|_| Error::Resolve(format!("{host} is not a valid homeserver address")));
        let maybe_base_url = match maybe_base_url {
            Ok(url) if url.host_str().is_some() => url,
            _ => {
                let message = format!("{host} is not a valid homeserver address");
                self.events().on_resolve_error(&message).await;
                return Err(Error::Resolve(message));
            }
        };

        debug!(host, "finding the server");
        let result = {
            // The base URL is only borrowed for this one request and
            // restored on every exit path.
            let _guard = self.http.override_homeserver(maybe_base_url.clone());
            self.http.send(GetWellKnownRequest, None).await
        };

        match result.map_err(Error::from) {
            Ok(discovery) => {
                let base_url = Url::parse(&discovery.homeserver.base_url).map_err(|_| {
                    Error::Resolve("the homeserver base URL is invalid".to_owned())
                });
                match base_url {
                    Ok(url) => {
                        info!(host, base_url = %url, "well-known resolved");
                        self.set_homeserver(url).await
                    }
                    Err(e) => {
                        self.events().on_resolve_error(&e.to_string()).await;
                        Err(e)
                    }
                }
            }
            Err(Error::NotFound) => {
                info!(host, "no .well-known file, using the host as the base URL");
                self.set_homeserver(maybe_base_url).await
            }
            Err(_) => {
                let message = "failed resolving the homeserver".to_owned();
                warn!(host, "fetching the .well-known file failed");
                self.events().on_resolve_error(&message).await;
                Err(Error::Resolve(message))
            }
        }
    }

    /// Sets the homeserver base URL and refreshes the advertised login
    /// flows.
    pub async fn set_homeserver(&self, url: Url) -> Result<()> {
        if self.http.homeserver().as_ref() != Some(&url) {
            self.http.set_homeserver(Some(url.clone()));
            self.events().on_homeserver_changed(&url).await;
        }
        if self.state() < ConnectionState::ServerResolved {
            self.set_state(ConnectionState::ServerResolved);
        }

        let flows = self.http.send(GetLoginFlowsRequest, None).await;
        match flows {
            Ok(response) => {
                *self.login_flows.write().unwrap() = response.flows;
                if self.state() < ConnectionState::LoginFlowsKnown {
                    self.set_state(ConnectionState::LoginFlowsKnown);
                }
                self.events().on_login_flows_changed().await;
                Ok(())
            }
            Err(e) => {
                self.login_flows.write().unwrap().clear();
                self.events().on_login_flows_changed().await;
                Err(e.into())
            }
        }
    }

    /// Guarantees a valid homeserver URL (resolving through the user id
    /// when needed) and, when requested, that the required login flow is
    /// advertised.
    async fn check_and_connect(&self, user_id: &str, required_flow: Option<&str>) -> Result<()> {
        if self.http.homeserver().is_some()
            && required_flow.is_none_or(|flow| self.supports_flow(flow))
        {
            return Ok(());
        }

        if !is_valid_user_id(user_id) {
            let message = format!(
                "please provide the fully-qualified user id (such as @user:example.org) so \
                 that the homeserver could be resolved; the current homeserver URL ({:?}) is \
                 not good",
                self.http.homeserver().map(|u| u.to_string()).unwrap_or_default()
            );
            self.events().on_resolve_error(&message).await;
            return Err(Error::Resolve(message));
        }

        self.resolve_server(user_id).await?;
        if let Some(flow) = required_flow {
            if !self.supports_flow(flow) {
                let message = format!(
                    "the homeserver does not support the login flow '{flow}'"
                );
                self.events().on_login_error("Unsupported login flow", &message).await;
                return Err(Error::Login(message));
            }
        }
        Ok(())
    }

    async fn login(&self, request: LoginRequest) -> Result<()> {
        match self.http.send(request, None).await {
            Ok(response) => {
                self.http.set_access_token(Some(response.access_token.clone()));
                self.data.write().unwrap().device_id = Some(response.device_id.clone());
                self.complete_setup(&response.user_id, false).await?;
                self.save_access_token_to_keychain(&response.user_id, &response.access_token);
                Ok(())
            }
            Err(e) => {
                let error = Error::from(e);
                self.events()
                    .on_login_error(&error.to_string(), &error.raw_data_sample())
                    .await;
                Err(error)
            }
        }
    }

    /// Logs in with the `m.login.password` flow, resolving the server
    /// from the user id first when needed.
    pub async fn login_with_password(
        &self,
        user_id: &str,
        password: &str,
        initial_device_name: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<()> {
        self.check_and_connect(user_id, Some(LoginFlow::PASSWORD)).await?;
        self.login(LoginRequest {
            login_type: LoginFlow::PASSWORD.to_owned(),
            identifier: Some(LoginRequest::user_identifier(user_id)),
            password: Some(password.to_owned()),
            token: None,
            device_id: device_id.map(ToOwned::to_owned),
            initial_device_display_name: initial_device_name.map(ToOwned::to_owned),
        })
        .await
    }

    /// Logs in with a token obtained externally (e.g. through an SSO
    /// session). The homeserver must already be known and advertise the
    /// `m.login.token` flow.
    pub async fn login_with_token(
        &self,
        login_token: &str,
        initial_device_name: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<()> {
        if self.http.homeserver().is_none() {
            return Err(Error::Resolve("no homeserver URL is set".to_owned()));
        }
        if !self.supports_flow(LoginFlow::TOKEN) {
            let message = "the homeserver does not support the login flow 'm.login.token'";
            self.events().on_login_error("Unsupported login flow", message).await;
            return Err(Error::Login(message.to_owned()));
        }
        self.login(LoginRequest {
            login_type: LoginFlow::TOKEN.to_owned(),
            identifier: None,
            password: None,
            token: Some(login_token.to_owned()),
            device_id: device_id.map(ToOwned::to_owned),
            initial_device_display_name: initial_device_name.map(ToOwned::to_owned),
        })
        .await
    }

    /// The URL an external SSO flow starts at; completing it yields a
    /// login token for [`login_with_token`](Self::login_with_token).
    pub fn sso_login_url(&self, redirect_url: &str) -> Result<Url> {
        let base = self.http.homeserver().ok_or(Error::Http(HttpError::NoHomeserver))?;
        let mut url = base
            .join("/_matrix/client/v3/login/sso/redirect")
            .map_err(|_| Error::Http(HttpError::NoHomeserver))?;
        url.query_pairs_mut().append_pair("redirectUrl", redirect_url);
        Ok(url)
    }

    /// Adopts an existing access token: validates it via `whoami`, then
    /// completes setup as if freshly logged in.
    pub async fn assume_identity(&self, mx_id: &str, access_token: &str) -> Result<()> {
        self.check_and_connect(mx_id, None).await?;
        self.http.set_access_token(Some(access_token.to_owned()));

        match self.http.send(WhoamiRequest, None).await {
            Ok(response) => {
                if response.user_id != mx_id {
                    warn!(
                        token_owner = %response.user_id, passed = %mx_id,
                        "the access token owner differs from the passed Matrix id"
                    );
                }
                if let Some(device_id) = response.device_id {
                    self.data.write().unwrap().device_id = Some(device_id);
                }
                self.complete_setup(&response.user_id, false).await
            }
            Err(e) => {
                self.http.set_access_token(None);
                let error = Error::from(e);
                self.events()
                    .on_login_error(&error.to_string(), &error.raw_data_sample())
                    .await;
                Err(error)
            }
        }
    }

    /// After a successful login or token validation: persists the
    /// identity, opens the state cache, initialises E2EE and probes
    /// capabilities.
    async fn complete_setup(&self, mx_id: &str, mock: bool) -> Result<()> {
        self.data.write().unwrap().user_id = Some(mx_id.to_owned());
        info!(
            homeserver = ?self.http.homeserver().map(|u| u.to_string()),
            user_id = mx_id,
            device_id = ?self.device_id(),
            "connection is set up"
        );

        let group = account_group(mx_id);
        self.settings.set(&format!("{group}/keep_logged_in"), "true");
        if let Some(url) = self.http.homeserver() {
            self.settings.set(&format!("{group}/homeserver"), url.as_str());
        }
        if let Some(device_id) = self.device_id() {
            self.settings.set(&format!("{group}/DeviceId"), &device_id);
        }

        if let Some(cache_dir) = &self.cache_dir {
            let format = CacheFormat::from_setting(
                &self.settings.get("cache_type").unwrap_or_else(|| "json".to_owned()),
            );
            match StateStore::open(cache_dir, mx_id, format) {
                Ok(store) => *self.cache.write().unwrap() = Some(store),
                Err(e) => {
                    warn!("couldn't open the state cache, caching disabled: {e}");
                    self.cache_enabled.store(false, Ordering::SeqCst);
                }
            }
        }

        #[cfg(feature = "encryption")]
        if self.encryption_enabled() {
            let device_id = self.device_id().unwrap_or_default();
            let (machine, is_new) = OlmMachine::new(
                mx_id.to_owned(),
                device_id,
                self.keychain.as_ref(),
                self.crypto_store.clone(),
                self.http.clone(),
            )
            .await
            .map_err(Error::from)?;
            let machine = Arc::new(machine);
            *self.olm.write().await = Some(machine.clone());
            if is_new && !mock {
                machine.upload_keys(true).await?;
            }
        } else {
            info!("end-to-end encryption support is off for {mx_id}");
        }

        self.set_state(ConnectionState::LoggedIn);
        self.emit_state_changed().await;
        self.events().on_connected().await;

        if !mock {
            // The local user's profile is loaded best-effort.
            if let Ok(profile) =
                self.http.send(GetProfileRequest { user_id: mx_id.to_owned() }, None).await
            {
                if let Some(user) = self.user(mx_id) {
                    user.update_profile(profile.displayname, profile.avatar_url);
                }
            }
            self.reload_capabilities().await.ok();
        }
        Ok(())
    }

    fn save_access_token_to_keychain(&self, user_id: &str, token: &str) {
        debug!(user_id, "saving the access token to the keychain");
        if let Err(e) = self.keychain.write(user_id, token.as_bytes()) {
            warn!("could not save the access token to the keychain: {e}");
        }
    }

    /// Reloads the server's capability snapshot; on success every room
    /// re-evaluates its upgrade recommendation.
    pub async fn reload_capabilities(&self) -> Result<()> {
        let response = self
            .http
            .send(GetCapabilitiesRequest, Some(self.http.request_config.background()))
            .await;
        match response.map_err(Error::from) {
            Ok(response) => {
                *self.capabilities.write().unwrap() = response.capabilities;
                let capabilities = self.capabilities.read().unwrap().clone();
                if capabilities.room_versions.is_some() {
                    debug!(
                        default = ?self.default_room_version(),
                        "room versions loaded"
                    );
                    self.events().on_capabilities_loaded().await;
                    for room in self.all_rooms() {
                        room.check_version(&capabilities);
                    }
                } else {
                    warn!(
                        "the server returned an empty set of supported versions; disabling \
                         version upgrade recommendations to reduce noise"
                    );
                }
                Ok(())
            }
            Err(Error::IncorrectRequest(_)) | Err(Error::NotFound) => {
                debug!(
                    "the server doesn't support /capabilities; version upgrade \
                     recommendations won't be issued"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The server's default room version for new rooms, once known.
    pub fn default_room_version(&self) -> Option<String> {
        self.capabilities
            .read()
            .unwrap()
            .room_versions
            .as_ref()
            .map(|v| v.default.clone())
    }

    /// The room versions the server marks stable.
    pub fn stable_room_versions(&self) -> Vec<String> {
        match &self.capabilities.read().unwrap().room_versions {
            Some(versions) => versions
                .available
                .iter()
                .filter(|(_, stability)| *stability == "stable")
                .map(|(version, _)| version.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All room versions the server knows: stable versions first, each
    /// group sorted numerically where both versions parse as numbers,
    /// lexicographically otherwise.
    pub fn available_room_versions(&self) -> Vec<(String, bool)> {
        let Some(RoomVersionsCapability { available, .. }) =
            self.capabilities.read().unwrap().room_versions.clone()
        else {
            return Vec::new();
        };

        let version_less = |a: &String, b: &String| match (a.parse::<f32>(), b.parse::<f32>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            _ => a.cmp(b),
        };

        let mut stable = Vec::new();
        let mut unstable = Vec::new();
        for (version, stability) in &available {
            if stability == "stable" {
                stable.push(version.clone());
            } else {
                unstable.push(version.clone());
            }
        }
        stable.sort_by(version_less);
        unstable.sort_by(version_less);

        stable
            .into_iter()
            .map(|v| (v, true))
            .chain(unstable.into_iter().map(|v| (v, false)))
            .collect()
    }

    // ── Logout ──────────────────────────────────────────────────────────

    /// Revokes the access token and tears the connection down. On
    /// failure the prior state is restored, including the sync loop.
    pub async fn logout(self: &Arc<Self>) -> Result<()> {
        let was_looping = {
            let mut control = self.sync_state.lock().unwrap();
            let was_looping = control.loop_task.take().map(|t| t.abort()).is_some();
            if let Some(in_flight) = control.in_flight.take() {
                in_flight.abort();
            }
            was_looping
        };

        self.logout_pending.store(true, Ordering::SeqCst);
        self.emit_state_changed().await;

        let result = self.http.send(LogoutRequest, None).await.map_err(Error::from);
        match result {
            Ok(_) | Err(Error::Unauthorised) | Err(Error::ContentAccess) => {
                if let Some(user_id) = self.user_id() {
                    self.settings.remove_group(&account_group(&user_id));
                    self.drop_access_token(&user_id);
                }
                self.http.set_access_token(None);
                self.logout_pending.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::LoggedOut);
                self.emit_state_changed().await;
                self.events().on_logged_out().await;
                Ok(())
            }
            Err(e) => {
                // Logout somehow didn't proceed - restore the session
                // state.
                self.logout_pending.store(false, Ordering::SeqCst);
                self.emit_state_changed().await;
                if was_looping {
                    let timeout = self.sync_state.lock().unwrap().timeout;
                    self.sync_loop(timeout.unwrap_or(Duration::from_secs(30)));
                }
                Err(e)
            }
        }
    }

    // Each keychain entry watches its own deletion outcome; "not found"
    // is fine.
    fn drop_access_token(&self, user_id: &str) {
        debug!(user_id, "removing the access token from the keychain");
        match self.keychain.delete(user_id) {
            Ok(()) | Err(KeychainError::NotFound) => {}
            Err(e) => warn!("could not delete the access token from the keychain: {e}"),
        }
        match self.keychain.delete(&crate::store::keychain::pickle_key_entry(user_id)) {
            Ok(()) | Err(KeychainError::NotFound) => {}
            Err(e) => warn!("could not delete the account pickle from the keychain: {e}"),
        }
    }

    // ── Sync ────────────────────────────────────────────────────────────

    pub fn lazy_loading(&self) -> bool {
        self.lazy_loading.load(Ordering::SeqCst)
    }

    pub fn set_lazy_loading(&self, enabled: bool) {
        self.lazy_loading.store(enabled, Ordering::SeqCst);
    }

    /// Runs a single sync iteration. A no-op returning `Ok(false)` if a
    /// sync is already in flight or the connection is logged out.
    pub async fn sync(&self, timeout: Duration) -> Result<bool> {
        if !self.is_logged_in() {
            warn!("not logged in, not going to sync");
            return Ok(false);
        }

        let request = SyncRequest {
            since: self.next_batch_token(),
            filter: Filter { timeline_limit: 100, lazy_load_members: self.lazy_loading() },
            timeout,
        };
        // The long poll needs headroom on top of the server-side timeout.
        let config = self.http.request_config.timeout(timeout + Duration::from_secs(30));

        let (handle, generation) = {
            let mut control = self.sync_state.lock().unwrap();
            if control.in_flight.is_some() {
                info!("a sync is already running");
                return Ok(false);
            }
            let http = self.http.clone();
            let handle = tokio::spawn(async move { http.send(request, Some(config)).await });
            control.in_flight = Some(handle.abort_handle());
            control.generation += 1;
            (handle, control.generation)
        };

        let result = handle.await;
        {
            let mut control = self.sync_state.lock().unwrap();
            if control.generation == generation {
                control.in_flight = None;
            }
        }

        match result {
            Err(join_error) => {
                debug!("sync request was abandoned: {join_error}");
                Ok(false)
            }
            Ok(Ok(response)) => {
                self.on_sync_success(response, false).await;
                self.events().on_sync_done().await;
                if self.state() == ConnectionState::LoggedIn {
                    self.set_state(ConnectionState::Syncing);
                }
                Ok(true)
            }
            Ok(Err(http_error)) => {
                // The request layer already retried transient failures;
                // whatever arrives here stops the loop.
                let error = Error::from(http_error);
                self.stop_sync();
                match &error {
                    Error::Unauthorised => {
                        warn!("sync failed with Unauthorised - login expired?");
                        self.events()
                            .on_login_error(&error.to_string(), &error.raw_data_sample())
                            .await;
                    }
                    other => {
                        self.events().on_sync_error(&other.to_string()).await;
                    }
                }
                Err(error)
            }
        }
    }

    /// Starts the sync loop: each iteration re-arms on the completion of
    /// the previous one. Calling it again only updates the timeout for
    /// subsequent iterations.
    pub fn sync_loop(self: &Arc<Self>, timeout: Duration) {
        let mut control = self.sync_state.lock().unwrap();
        let previous = control.timeout.replace(timeout);
        if let Some(task) = &control.loop_task {
            if !task.is_finished() {
                info!(
                    ?previous,
                    next = ?timeout,
                    "sync loop already running; the timeout applies from the next iteration"
                );
                return;
            }
        }

        let weak = Arc::downgrade(self);
        control.loop_task = Some(tokio::spawn(async move {
            loop {
                let Some(connection) = weak.upgrade() else { break };
                if !connection.is_logged_in() {
                    info!("logged out, the sync loop will stop now");
                    break;
                }
                let timeout = connection
                    .sync_state
                    .lock()
                    .unwrap()
                    .timeout
                    .unwrap_or(Duration::from_secs(30));
                match connection.sync(timeout).await {
                    Ok(true) => {}
                    // Skipped iteration (a user-initiated sync is racing
                    // the loop); don't spin on it.
                    Ok(false) => tokio::time::sleep(Duration::from_millis(250)).await,
                    Err(_) => break,
                }
            }
        }));
    }

    /// Breaks the sync loop and abandons the in-flight request, if any.
    pub fn stop_sync(&self) {
        let mut control = self.sync_state.lock().unwrap();
        if let Some(task) = control.loop_task.take() {
            task.abort();
        }
        if let Some(in_flight) = control.in_flight.take() {
            in_flight.abort();
        }
    }

    /// Whether a sync request is currently in flight.
    pub fn is_syncing(&self) -> bool {
        self.sync_state.lock().unwrap().in_flight.is_some()
    }

    /// Demultiplexes one sync response. Consumers run in a fixed order:
    /// encryption first, then to-device, rooms, account data, presence,
    /// and the encryption follow-up last.
    async fn on_sync_success(&self, response: SyncResponse, from_cache: bool) {
        #[cfg(feature = "encryption")]
        let olm = self.olm.read().await.clone();

        #[cfg(feature = "encryption")]
        if let Some(olm) = &olm {
            olm.on_sync_response(&response).await;
            let outcome = olm.consume_to_device_events(&response.to_device.events).await;
            for session in outcome.new_verification_sessions {
                self.events().on_new_key_verification_session(session).await;
            }
            for (room_id, event) in outcome.decrypted_events {
                if let Some(room) = self.room(&room_id, JoinStates::ALL) {
                    room.add_timeline_event(event.full_json().clone());
                }
            }
        }

        self.data.write().unwrap().sync_token = Some(response.next_batch.clone());
        self.consume_room_data(&response, from_cache).await;
        self.consume_account_data(&response.account_data.events).await;
        for presence in &response.presence.events {
            // Presence is passed through without per-user bookkeeping.
            self.events().on_presence_event(&Event::from_json(presence.clone())).await;
        }

        #[cfg(feature = "encryption")]
        if let Some(olm) = &olm {
            if !from_cache {
                if olm.should_upload_one_time_keys().await {
                    olm.upload_keys(false).await.ok();
                }
                if olm.has_outdated_users() {
                    olm.load_outdated_user_devices().await.ok();
                }
            }
        }
    }

    async fn consume_room_data(&self, response: &SyncResponse, _from_cache: bool) {
        for (room_id, update) in &response.rooms.join {
            if self.check_forgotten(room_id, JoinState::Join) {
                continue;
            }
            if let Ok(room) = self.provide_room(room_id, Some(JoinState::Join)).await {
                self.pending_state_rooms.lock().unwrap().retain(|id| id != room_id);
                self.apply_joined_update(&room, update).await;
            }
        }
        for (room_id, update) in &response.rooms.invite {
            if self.check_forgotten(room_id, JoinState::Invite) {
                continue;
            }
            if let Ok(room) = self.provide_room(room_id, Some(JoinState::Invite)).await {
                room.update_invited(update);
            }
        }
        for (room_id, update) in &response.rooms.leave {
            if self.check_forgotten(room_id, JoinState::Leave) {
                continue;
            }
            if let Ok(room) = self.provide_room(room_id, Some(JoinState::Leave)).await {
                self.pending_state_rooms.lock().unwrap().retain(|id| id != room_id);
                self.apply_joined_update(&room, update).await;
            }
        }
        for (room_id, update) in &response.rooms.knock {
            if let Ok(room) = self.provide_room(room_id, Some(JoinState::Knock)).await {
                room.update_invited(update);
            }
        }
    }

    /// Rooms being forgotten have their sync payloads dropped. Returns
    /// true when the update must be skipped.
    fn check_forgotten(&self, room_id: &RoomId, join_state: JoinState) -> bool {
        let mut to_forget = self.rooms_to_forget.lock().unwrap();
        let Some(index) = to_forget.iter().position(|id| id == room_id) else { return false };
        to_forget.remove(index);
        if join_state == JoinState::Leave {
            debug!(room_id, "room has been forgotten, ignoring its sync payload");
            return true;
        }
        warn!(
            room_id, %join_state,
            "room has just been forgotten but sync returned it - suspiciously fast turnaround"
        );
        false
    }

    async fn apply_joined_update(&self, room: &Arc<Room>, update: &JoinedRoomUpdate) {
        let (previous_aliases, current_aliases) = room.update_joined(update);
        self.update_room_aliases(room.id(), &previous_aliases, &current_aliases);

        #[cfg(feature = "encryption")]
        {
            let olm = self.olm.read().await.clone();
            if let Some(olm) = olm {
                for raw in &update.timeline.events {
                    if raw.get("type").and_then(Value::as_str) == Some("m.room.encrypted") {
                        match olm.decrypt_room_event(room.id(), raw).await {
                            Ok(decrypted) => {
                                room.add_timeline_event(decrypted.full_json().clone())
                            }
                            Err(e) => debug!(room_id = %room.id(), "decryption deferred: {e}"),
                        }
                    }
                }
                if room.uses_encryption() {
                    let members = room.joined_member_ids();
                    olm.update_tracked_users(members.iter()).await;
                }
            }
        }
    }

    async fn consume_account_data(&self, events: &[Value]) {
        for raw in events {
            let event = load_event(raw.clone());
            if let AnyEvent::DirectChat(dce) = &event {
                self.reconcile_direct_chats(&dce.users_to_direct_chats()).await;
                continue;
            }

            if let AnyEvent::IgnoredUsers(iu) = &event {
                debug!(ignored = iu.ignored_users().len(), "ignored-users list updated");
            }
            let event_type = event.matrix_type().to_owned();
            let changed = {
                let mut account_data = self.account_data.write().unwrap();
                let current = account_data.get(&event_type);
                let changed = current
                    .map(|c| c.content_json() != event.event().content_json())
                    .unwrap_or(true);
                if changed {
                    account_data.insert(event_type.clone(), event.event().clone());
                }
                changed
            };
            if changed {
                debug!(event_type, "updated account data");
                self.events().on_account_data_changed(&event_type).await;
            }
        }

        self.flush_direct_chat_updates().await;
    }

    // ── Room registry ───────────────────────────────────────────────────

    /// Pure lookup against the registry with a mask of acceptable join
    /// states.
    pub fn room(&self, room_id: &str, states: JoinStates) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().unwrap();
        let room = rooms.get(&(room_id.to_owned(), false)).cloned();
        if let Some(room) = &room {
            if states.contains(JoinState::Join) && room.join_state() == JoinState::Join {
                return Some(room.clone());
            }
        }
        if states.contains(JoinState::Invite) {
            if let Some(invite) = rooms.get(&(room_id.to_owned(), true)) {
                return Some(invite.clone());
            }
        }
        if let Some(room) = &room {
            if states.contains(room.join_state()) {
                return Some(room.clone());
            }
        }
        None
    }

    /// The Invite-state room object for the given id, if any.
    pub fn invitation(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().unwrap().get(&(room_id.to_owned(), true)).cloned()
    }

    /// Room lookup through the alias map.
    pub fn room_by_alias(&self, alias: &str, states: JoinStates) -> Option<Arc<Room>> {
        let room_id = self.room_aliases.read().unwrap().get(alias).cloned();
        match room_id {
            Some(id) => self.room(&id, states),
            None => {
                warn!(alias, "no room found for the alias");
                None
            }
        }
    }

    /// Every room object in the registry, in no particular order.
    pub fn all_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().unwrap().values().cloned().collect()
    }

    /// The rooms whose join state is in the given set.
    pub fn rooms(&self, states: JoinStates) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .unwrap()
            .values()
            .filter(|r| states.contains(r.join_state()))
            .cloned()
            .collect()
    }

    pub fn rooms_count(&self, states: JoinStates) -> usize {
        self.rooms
            .read()
            .unwrap()
            .values()
            .filter(|r| states.contains(r.join_state()))
            .count()
    }

    /// Registry upsert keyed on `(room id, is invite)`, implementing the
    /// transition table documented on [`Connection`].
    pub async fn provide_room(
        &self,
        room_id: &str,
        join_state: Option<JoinState>,
    ) -> Result<Arc<Room>> {
        if room_id.is_empty() {
            return Err(Error::IncorrectRequest("empty room id".to_owned()));
        }

        let mut emissions: Vec<RoomEmission> = Vec::new();
        let mut join_state = join_state;
        let invite_key = join_state == Some(JoinState::Invite);

        let room = {
            let mut rooms = self.rooms.write().unwrap();
            let existing = rooms.get(&(room_id.to_owned(), invite_key)).cloned();

            let room = if let Some(room) = existing {
                // Leave is special: the join state may already match but an
                // Invite object may still need collapsing.
                if join_state == Some(room.join_state()) && join_state != Some(JoinState::Leave)
                {
                    return Ok(room);
                }
                room
            } else {
                if join_state.is_none() {
                    if let Some(invite) = rooms.get(&(room_id.to_owned(), true)) {
                        return Ok(invite.clone());
                    }
                    // No room in any state: set up a new one in Join state.
                    join_state = Some(JoinState::Join);
                }
                let room = self
                    .room_factory
                    .create_room(&room_id.to_owned(), join_state.expect("state was just set"));
                rooms.insert((room_id.to_owned(), invite_key), room.clone());
                emissions.push(RoomEmission::New(room.clone()));
                room
            };

            if let Some(join_state) = join_state {
                if join_state == JoinState::Invite {
                    let previous = rooms.get(&(room_id.to_owned(), false)).cloned();
                    emissions.push(RoomEmission::Invited(room.clone(), previous));
                } else {
                    room.set_join_state(join_state);
                    // A Join/Leave update preempts the Invite object for
                    // the same room id.
                    let previous_invite = rooms.remove(&(room_id.to_owned(), true));
                    match join_state {
                        JoinState::Join => emissions
                            .push(RoomEmission::Joined(room.clone(), previous_invite.clone())),
                        JoinState::Leave => emissions
                            .push(RoomEmission::Left(room.clone(), previous_invite.clone())),
                        _ => {}
                    }
                    if let Some(invite) = previous_invite {
                        debug!(room_id, "deleting the Invite state object");
                        emissions.push(RoomEmission::AboutToDelete(invite));
                    }
                }
            }
            room
        };

        self.fire_room_emissions(emissions).await;
        Ok(room)
    }

    async fn fire_room_emissions(&self, emissions: Vec<RoomEmission>) {
        let events = self.events();
        for emission in emissions {
            match emission {
                RoomEmission::New(room) => events.on_new_room(room).await,
                RoomEmission::Invited(room, prev) => events.on_invited_room(room, prev).await,
                RoomEmission::Joined(room, prev) => events.on_joined_room(room, prev).await,
                RoomEmission::Left(room, prev) => events.on_left_room(room, prev).await,
                RoomEmission::AboutToDelete(room) => {
                    events.on_about_to_delete_room(room).await
                }
            }
        }
    }

    /// Removes the room (both state objects, if present) from the
    /// registry.
    async fn remove_room(&self, room_id: &str) {
        let removed: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.write().unwrap();
            [false, true]
                .iter()
                .filter_map(|invite| rooms.remove(&(room_id.to_owned(), *invite)))
                .collect()
        };
        for room in removed {
            debug!(room_id, state = %room.join_state(), "room will be deleted");
            self.events().on_about_to_delete_room(room).await;
        }
    }

    /// Keeps the alias map current across a room's alias changes,
    /// preferring successors over predecessors on conflicts.
    fn update_room_aliases(&self, room_id: &str, previous: &[String], current: &[String]) {
        let mut aliases = self.room_aliases.write().unwrap();
        for alias in previous {
            if current.contains(alias) {
                continue;
            }
            if aliases.remove(alias).is_none() {
                debug!(alias, "alias is not found (already deleted?)");
            }
        }
        for alias in current {
            if let Some(mapped) = aliases.get(alias) {
                if mapped == room_id {
                    continue;
                }
                if self.room_succeeds(room_id, mapped) {
                    debug!(alias, mapped, "not remapping the alias to a predecessor");
                    continue;
                }
                if !self.room_succeeds(mapped, room_id) {
                    warn!(alias, from = %mapped, to = room_id, "force-remapping the alias");
                }
            }
            aliases.insert(alias.clone(), room_id.to_owned());
        }
    }

    /// Whether a chain of room upgrades connects the two rooms, walked
    /// from either end.
    pub fn room_succeeds(&self, predecessor_id: &str, successor_id: &str) -> bool {
        let mut current = self.room(predecessor_id, JoinStates::ALL);
        while let Some(room) = current {
            let Some(succ) = room.successor_id() else { break };
            if succ == successor_id {
                return true;
            }
            current = self.room(&succ, JoinStates::ALL);
        }
        let mut current = self.room(successor_id, JoinStates::ALL);
        while let Some(room) = current {
            let Some(pred) = room.predecessor_id() else { break };
            if pred == predecessor_id {
                return true;
            }
            current = self.room(&pred, JoinStates::ALL);
        }
        false
    }

    // ── Users ───────────────────────────────────────────────────────────

    /// The user object for an id, created through the user factory on
    /// first use. `None` for malformed ids.
    pub fn user(&self, user_id: &str) -> Option<Arc<User>> {
        if user_id.is_empty() {
            return None;
        }
        if let Some(user) = self.users.read().unwrap().get(user_id) {
            return Some(user.clone());
        }
        if !is_valid_user_id(user_id) {
            warn!(user_id, "malformed user id");
            return None;
        }
        let user = self.user_factory.create_user(&user_id.to_owned());
        self.users.write().unwrap().insert(user_id.to_owned(), user.clone());
        let events = self.events();
        let for_event = user.clone();
        tokio::spawn(async move { events.on_new_user(for_event).await });
        Some(user)
    }

    /// The local user's object, once logged in.
    pub fn own_user(&self) -> Option<Arc<User>> {
        self.user(&self.user_id()?)
    }

    /// Every user object created so far.
    pub fn users(&self) -> Vec<Arc<User>> {
        self.users.read().unwrap().values().cloned().collect()
    }

    // ── Account data ────────────────────────────────────────────────────

    pub fn has_account_data(&self, event_type: &str) -> bool {
        self.account_data.read().unwrap().contains_key(event_type)
    }

    /// The latest account-data event of the given type.
    pub fn account_data(&self, event_type: &str) -> Option<Event> {
        self.account_data.read().unwrap().get(event_type).cloned()
    }

    /// The content of the latest account-data event of the given type.
    pub fn account_data_json(&self, event_type: &str) -> Value {
        self.account_data(event_type)
            .map(|e| e.content_json())
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// The types of all account-data events seen so far.
    pub fn account_data_event_types(&self) -> Vec<String> {
        self.account_data.read().unwrap().keys().cloned().collect()
    }

    /// Publishes an account-data event: sends it to the server, then
    /// mirrors it into the local map.
    pub async fn set_account_data(&self, event: Event) -> Result<()> {
        let user_id = self.user_id().ok_or(Error::NotLoggedIn)?;
        let event_type = event.matrix_type().to_owned();
        self.http
            .send(
                SetAccountDataRequest {
                    user_id,
                    event_type: event_type.clone(),
                    content: event.content_json(),
                },
                None,
            )
            .await?;
        self.account_data.write().unwrap().insert(event_type.clone(), event);
        self.events().on_account_data_changed(&event_type).await;
        Ok(())
    }

    /// Publishes account data from a type and a content object.
    pub async fn set_account_data_of_type(&self, event_type: &str, content: Value) -> Result<()> {
        self.set_account_data(Event::new(event_type, content)).await
    }

    // ── Ignored users ───────────────────────────────────────────────────

    /// The users this account ignores.
    pub fn ignored_users(&self) -> std::collections::BTreeSet<UserId> {
        self.account_data(IgnoredUsersEvent::TYPE_ID)
            .map(|event| {
                let AnyEvent::IgnoredUsers(iu) = load_event(event.full_json().clone()) else {
                    return Default::default();
                };
                iu.ignored_users()
            })
            .unwrap_or_default()
    }

    pub fn is_ignored(&self, user_id: &str) -> bool {
        self.ignored_users().contains(user_id)
    }

    pub async fn add_to_ignored_users(&self, user_id: &str) -> Result<()> {
        let mut ignored = self.ignored_users();
        if ignored.insert(user_id.to_owned()) {
            self.set_account_data(IgnoredUsersEvent::from_set(&ignored)).await?;
            let added = std::collections::BTreeSet::from([user_id.to_owned()]);
            self.events().on_ignored_users_changed(&added, &Default::default()).await;
        }
        Ok(())
    }

    pub async fn remove_from_ignored_users(&self, user_id: &str) -> Result<()> {
        let mut ignored = self.ignored_users();
        if ignored.remove(user_id) {
            self.set_account_data(IgnoredUsersEvent::from_set(&ignored)).await?;
            let removed = std::collections::BTreeSet::from([user_id.to_owned()]);
            self.events().on_ignored_users_changed(&Default::default(), &removed).await;
        }
        Ok(())
    }

    // ── Room operations ─────────────────────────────────────────────────

    /// Joins a room by id or alias. The returned job resolves with the
    /// room object, which is ensured to exist in the registry even if
    /// sync hasn't delivered it yet.
    pub fn join_room(
        self: &Arc<Self>,
        room_id_or_alias: &str,
        via_servers: &[String],
    ) -> JobHandle<Arc<Room>> {
        let connection = self.clone();
        let request = JoinRoomRequest {
            room_id_or_alias: room_id_or_alias.to_owned(),
            via_servers: via_servers.to_vec(),
        };
        self.run_job(async move {
            let response = connection.http.send(request, None).await?;
            connection.provide_room(&response.room_id, Some(JoinState::Join)).await
        })
    }

    /// Leaves a room. Leaving from Invite state forces the room to Leave
    /// even when the server doesn't confirm the transition through sync
    /// (cancelled invites aren't always synced down).
    pub fn leave_room(self: &Arc<Self>, room: &Arc<Room>) -> JobHandle<()> {
        let connection = self.clone();
        let room_id = room.id().clone();
        let was_invite = room.join_state() == JoinState::Invite;
        if was_invite {
            connection.pending_state_rooms.lock().unwrap().push(room_id.clone());
        }
        self.run_job(async move {
            let result = connection
                .http
                .send(LeaveRoomRequest { room_id: room_id.clone() }, None)
                .await;
            match result {
                Ok(_) => {
                    if was_invite {
                        let still_pending = {
                            let mut pending = connection.pending_state_rooms.lock().unwrap();
                            let had = pending.iter().position(|id| id == &room_id);
                            if let Some(index) = had {
                                pending.remove(index);
                            }
                            had.is_some()
                        };
                        if still_pending {
                            debug!(room_id, "forcing the room to Leave status");
                            connection.provide_room(&room_id, Some(JoinState::Leave)).await?;
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Forgets a room: leaves it first when still joined or invited, then
    /// forgets, then removes the room from the registry. A leave that
    /// fails with NotFound counts as success.
    pub fn forget_room(self: &Arc<Self>, room_id: &str) -> JobHandle<()> {
        let connection = self.clone();
        let room_id = room_id.to_owned();
        self.run_job(async move {
            let room = {
                let rooms = connection.rooms.read().unwrap();
                rooms
                    .get(&(room_id.clone(), false))
                    .or_else(|| rooms.get(&(room_id.clone(), true)))
                    .cloned()
            };

            if let Some(room) = room {
                if room.join_state() != JoinState::Leave {
                    let result = connection
                        .http
                        .send(LeaveRoomRequest { room_id: room_id.clone() }, None)
                        .await
                        .map_err(Error::from);
                    match result {
                        Ok(_) | Err(Error::NotFound) => {
                            // If the matching sync response hasn't arrived
                            // yet, mark the room for explicit deletion.
                            if room.join_state() != JoinState::Leave {
                                connection
                                    .rooms_to_forget
                                    .lock()
                                    .unwrap()
                                    .push(room_id.clone());
                            }
                        }
                        Err(e) => {
                            warn!(room_id, "error leaving the room: {e}");
                            return Err(e);
                        }
                    }
                }
            }

            let result = connection
                .http
                .send(ForgetRoomRequest { room_id: room_id.clone() }, None)
                .await
                .map_err(Error::from);
            match result {
                Ok(_) | Err(Error::NotFound) => {
                    connection.remove_room(&room_id).await;
                    Ok(())
                }
                Err(e) => {
                    warn!(room_id, "error forgetting the room: {e}");
                    Err(e)
                }
            }
        })
    }

    /// Invites a user into a room.
    pub fn invite_user(self: &Arc<Self>, room_id: &str, user_id: &str) -> JobHandle<()> {
        let connection = self.clone();
        let request =
            InviteUserRequest { room_id: room_id.to_owned(), user_id: user_id.to_owned() };
        self.run_job(async move {
            connection.http.send(request, None).await?;
            Ok(())
        })
    }

    /// Creates a room. The invoker is dropped from the invite list (the
    /// creator is a member by definition); with `is_direct`, every
    /// invitee is marked as a direct-chat partner on success.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_room(
        self: &Arc<Self>,
        visibility: RoomVisibility,
        alias: Option<&str>,
        name: Option<&str>,
        topic: Option<&str>,
        invites: &[UserId],
        preset: Option<&str>,
        room_version: Option<&str>,
        is_direct: bool,
        initial_state: Vec<InitialStateEvent>,
        invite_3pids: Vec<Invite3pid>,
        creation_content: Option<Value>,
    ) -> Result<Arc<Room>> {
        // The creator is by definition in the room.
        let own_id = self.user_id();
        let invites: Vec<UserId> = invites
            .iter()
            .filter(|id| own_id.as_deref() != Some(id.as_str()))
            .cloned()
            .collect();

        let response = self
            .http
            .send(
                CreateRoomRequest {
                    visibility,
                    alias: alias.map(ToOwned::to_owned),
                    name: name.map(ToOwned::to_owned),
                    topic: topic.map(ToOwned::to_owned),
                    invites: invites.clone(),
                    invite_3pids,
                    room_version: room_version.map(ToOwned::to_owned),
                    creation_content,
                    initial_state,
                    preset: preset.map(ToOwned::to_owned),
                    is_direct,
                },
                None,
            )
            .await?;

        let room = self.provide_room(&response.room_id, Some(JoinState::Join)).await?;
        self.events().on_created_room(room.clone()).await;
        if is_direct {
            for invitee in &invites {
                self.add_to_direct_chats(room.id(), invitee).await;
            }
        }
        Ok(room)
    }

    /// Sends a message event into a room, encrypting it first when the
    /// room requires it. With encryption enabled, no plaintext ever
    /// leaves for an encrypted room.
    pub fn send_message(
        self: &Arc<Self>,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> JobHandle<String> {
        let connection = self.clone();
        let room_id = room_id.to_owned();
        let event_type = event_type.to_owned();
        let txn_id = self.generate_txn_id();
        self.run_job(async move {
            #[cfg(feature = "encryption")]
            {
                let olm = connection.olm.read().await.clone();
                let room = connection.room(&room_id, JoinStates::ALL);
                if let (Some(olm), Some(room)) = (olm, room) {
                    if room.uses_encryption() {
                        let encrypted =
                            olm.encrypt_room_event(&room, &event_type, &content).await?;
                        let response = connection
                            .http
                            .send(
                                SendMessageRequest {
                                    room_id,
                                    event_type: "m.room.encrypted".to_owned(),
                                    txn_id,
                                    content: encrypted,
                                },
                                None,
                            )
                            .await?;
                        return Ok(response.event_id);
                    }
                }
            }

            let response = connection
                .http
                .send(SendMessageRequest { room_id, event_type, txn_id, content }, None)
                .await?;
            Ok(response.event_id)
        })
    }

    /// Sends an event as a to-device message, optionally through the olm
    /// channel.
    pub async fn send_to_device(
        &self,
        target_user_id: &str,
        target_device_id: &str,
        event: Event,
        encrypted: bool,
    ) -> Result<()> {
        #[cfg(not(feature = "encryption"))]
        if encrypted {
            warn!("E2EE support is not compiled in; no encrypted to-device message will be sent");
            return Ok(());
        }

        let (event_type, content) = if encrypted {
            #[cfg(feature = "encryption")]
            {
                let olm = self.olm.read().await.clone();
                let Some(olm) = olm else {
                    warn!("E2EE is off; no encrypted to-device message will be sent");
                    return Ok(());
                };
                let content = olm
                    .assemble_encrypted_content(&event, target_user_id, target_device_id)
                    .await
                    .map_err(Error::from)?;
                ("m.room.encrypted".to_owned(), content)
            }
            #[cfg(not(feature = "encryption"))]
            unreachable!()
        } else {
            (event.matrix_type().to_owned(), event.content_json())
        };

        self.http
            .send(
                SendToDeviceRequest {
                    event_type,
                    txn_id: self.generate_txn_id(),
                    messages: json!({ target_user_id: { target_device_id: content } }),
                },
                None,
            )
            .await?;
        Ok(())
    }

    // ── Tags ────────────────────────────────────────────────────────────

    /// All Invited/Joined rooms grouped by tag, ordered within each tag by
    /// the user-specified order.
    pub fn tags_to_rooms(&self) -> BTreeMap<String, Vec<Arc<Room>>> {
        let mut result: BTreeMap<String, Vec<Arc<Room>>> = BTreeMap::new();
        for room in self.rooms(JoinState::Join | JoinState::Invite) {
            for tag in room.tag_names() {
                result.entry(tag).or_default().push(room.clone());
            }
        }
        for (tag, rooms) in result.iter_mut() {
            rooms.sort_by(|a, b| {
                let oa = a.tag_order(tag).flatten();
                let ob = b.tag_order(tag).flatten();
                oa.partial_cmp(&ob).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        result
    }

    /// The tag names in use, with the favourite tag pinned first and the
    /// low-priority tag last.
    pub fn tag_names(&self) -> Vec<String> {
        let mut tags = vec![FAVOURITE_TAG.to_owned()];
        for room in self.all_rooms() {
            for tag in room.tag_names() {
                if tag != LOW_PRIORITY_TAG && !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        tags.push(LOW_PRIORITY_TAG.to_owned());
        tags
    }

    pub fn rooms_with_tag(&self, tag: &str) -> Vec<Arc<Room>> {
        self.all_rooms().into_iter().filter(|r| r.tag_names().contains(tag)).collect()
    }

    // ── Media ───────────────────────────────────────────────────────────

    /// Maps an `mxc://` URI to the HTTP download URL, annotated with the
    /// current user id.
    pub fn make_media_url(&self, mxc: &MxcUri) -> Result<Url> {
        let base = self.http.homeserver().ok_or(Error::Http(HttpError::NoHomeserver))?;
        let mut url = base
            .join(&format!(
                "/_matrix/media/v3/download/{}/{}",
                mxc.server_name, mxc.media_id
            ))
            .map_err(|_| Error::Http(HttpError::NoHomeserver))?;
        if let Some(user_id) = self.user_id() {
            url.query_pairs_mut().append_pair("user_id", &user_id);
        }
        Ok(url)
    }

    /// Uploads content to the media repository; resolves with the
    /// `mxc://` URI.
    pub fn upload_content(
        self: &Arc<Self>,
        data: Vec<u8>,
        filename: Option<&str>,
        content_type: &str,
    ) -> JobHandle<String> {
        let connection = self.clone();
        let request = UploadContentRequest {
            data,
            filename: filename.map(ToOwned::to_owned),
            content_type: content_type.to_owned(),
        };
        self.run_job(async move {
            let response = connection.http.send(request, None).await?;
            Ok(response.content_uri)
        })
    }

    /// Downloads a media file; resolves with the raw bytes.
    pub fn download_file(self: &Arc<Self>, mxc: &MxcUri) -> JobHandle<Vec<u8>> {
        let connection = self.clone();
        let request = GetContentRequest {
            server_name: mxc.server_name.clone(),
            media_id: mxc.media_id.clone(),
        };
        self.run_job(async move {
            Ok(connection.http.send_raw(&request, None).await?)
        })
    }

    /// Downloads a thumbnail of a media file.
    pub fn get_thumbnail(
        self: &Arc<Self>,
        mxc: &MxcUri,
        width: u32,
        height: u32,
    ) -> JobHandle<Vec<u8>> {
        let connection = self.clone();
        let request = GetThumbnailRequest {
            server_name: mxc.server_name.clone(),
            media_id: mxc.media_id.clone(),
            width,
            height,
        };
        self.run_job(async move {
            Ok(connection.http.send_raw(&request, None).await?)
        })
    }

    // ── State cache ─────────────────────────────────────────────────────

    /// Whether the state cache is in use.
    pub fn cache_state(&self) -> bool {
        self.cache_enabled.load(Ordering::SeqCst) && self.cache.read().unwrap().is_some()
    }

    pub fn set_cache_state(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Writes the state cache: the sync token, a shallow room roster and
    /// the account data, plus one file per Join/Invite room.
    pub async fn save_state(&self) -> Result<()> {
        if !self.cache_state() {
            return Ok(());
        }

        #[cfg(feature = "encryption")]
        let one_time_key_counts = match self.olm.read().await.as_ref() {
            Some(olm) => Some(olm.one_time_key_counts()),
            None => None,
        };

        let cache = self.cache.read().unwrap();
        let Some(store) = cache.as_ref() else { return Ok(()) };

        let mut join_rooms = Map::new();
        let mut invite_rooms = Map::new();
        for room in self.all_rooms() {
            match room.join_state() {
                JoinState::Leave => continue,
                JoinState::Invite => {
                    invite_rooms.insert(room.id().clone(), Value::Null);
                }
                _ => {
                    join_rooms.insert(room.id().clone(), Value::Null);
                }
            }
            store.save_room(room.id(), &room.to_cache_json())?;
        }

        let mut rooms = Map::new();
        if !join_rooms.is_empty() {
            rooms.insert("join".to_owned(), Value::Object(join_rooms));
        }
        if !invite_rooms.is_empty() {
            rooms.insert("invite".to_owned(), Value::Object(invite_rooms));
        }

        let mut account_data_events = vec![Event::basic_json(
            DirectChatEvent::TYPE_ID,
            Value::Object(
                self.direct_chats()
                    .iter()
                    .map(|(user, rooms)| {
                        (user.clone(), Value::Array(rooms.iter().map(|r| json!(r)).collect()))
                    })
                    .collect(),
            ),
        )];
        for (event_type, event) in self.account_data.read().unwrap().iter() {
            account_data_events.push(Event::basic_json(event_type, event.content_json()));
        }

        let mut root = json!({
            "cache_version": { "major": CACHE_VERSION.0, "minor": CACHE_VERSION.1 },
            "next_batch": self.next_batch_token().unwrap_or_default(),
            "rooms": rooms,
            "account_data": { "events": account_data_events },
        });

        #[cfg(feature = "encryption")]
        if let Some(counts) = one_time_key_counts {
            root["device_one_time_keys_count"] = json!(counts);
        }

        store.save(&root)?;
        info!(user_id = ?self.user_id(), "state cache saved");
        Ok(())
    }

    /// Writes one room's cache file.
    pub fn save_room_state(&self, room: &Arc<Room>) -> Result<()> {
        if !self.cache_state() {
            return Ok(());
        }
        let cache = self.cache.read().unwrap();
        if let Some(store) = cache.as_ref() {
            store.save_room(room.id(), &room.to_cache_json())?;
        }
        Ok(())
    }

    /// Loads the state cache, replaying it through the sync consumer
    /// path. A missing sync token invalidates the cache. Returns whether
    /// a cache was loaded.
    pub async fn load_state(&self) -> Result<bool> {
        if !self.cache_state() {
            return Ok(false);
        }

        let (root, room_payloads) = {
            let cache = self.cache.read().unwrap();
            let Some(store) = cache.as_ref() else { return Ok(false) };
            let Some(root) = store.load()? else { return Ok(false) };

            let mut payloads: Vec<(RoomId, bool, Value)> = Vec::new();
            if let Some(rooms) = root.get("rooms") {
                for (section, invite) in [("join", false), ("invite", true)] {
                    if let Some(ids) = rooms.get(section).and_then(Value::as_object) {
                        for room_id in ids.keys() {
                            if let Some(payload) = store.load_room(room_id)? {
                                payloads.push((room_id.clone(), invite, payload));
                            } else {
                                warn!(room_id, "state cache incomplete, discarding");
                                return Ok(false);
                            }
                        }
                    }
                }
            }
            (root, payloads)
        };

        let next_batch =
            root.get("next_batch").and_then(Value::as_str).unwrap_or("").to_owned();
        if next_batch.is_empty() {
            // No token means no cache by definition.
            return Ok(false);
        }

        let mut response = SyncResponse::empty(next_batch);
        for (room_id, invite, payload) in room_payloads {
            if invite {
                match serde_json::from_value::<InvitedRoomUpdate>(payload) {
                    Ok(update) => {
                        response.rooms.invite.insert(room_id, update);
                    }
                    Err(e) => warn!(room_id, "unreadable room cache: {e}"),
                }
            } else {
                match serde_json::from_value::<JoinedRoomUpdate>(payload) {
                    Ok(update) => {
                        response.rooms.join.insert(room_id, update);
                    }
                    Err(e) => warn!(room_id, "unreadable room cache: {e}"),
                }
            }
        }
        if let Some(events) = root
            .get("account_data")
            .and_then(|a| a.get("events"))
            .and_then(Value::as_array)
        {
            response.account_data.events = events.clone();
        }

        self.on_sync_success(response, true).await;
        info!(user_id = ?self.user_id(), "cached state loaded");
        Ok(true)
    }

    // ── Key verification ────────────────────────────────────────────────

    /// Starts a key verification session with a remote device.
    #[cfg(feature = "encryption")]
    pub async fn start_key_verification_session(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Arc<KeyVerificationSession>> {
        let olm = self.olm.read().await.clone();
        let Some(olm) = olm else {
            warn!("E2EE is switched off - you can't start a verification session");
            return Err(Error::NotLoggedIn);
        };
        olm.start_verification(user_id, device_id).await
    }

    /// Accepts an incoming verification request.
    #[cfg(feature = "encryption")]
    pub async fn accept_verification(&self, session: &KeyVerificationSession) -> Result<()> {
        let messages: Vec<_> = session.accept().into_iter().collect();
        self.dispatch_verification(session, messages).await
    }

    /// Starts the SAS stage of a ready verification.
    #[cfg(feature = "encryption")]
    pub async fn start_sas(&self, session: &KeyVerificationSession) -> Result<()> {
        let messages: Vec<_> = session.start_sas().into_iter().collect();
        self.dispatch_verification(session, messages).await
    }

    /// Confirms that the short auth strings matched.
    #[cfg(feature = "encryption")]
    pub async fn confirm_verification(&self, session: &KeyVerificationSession) -> Result<()> {
        let messages = session.confirm();
        self.dispatch_verification(session, messages).await
    }

    /// Cancels a verification.
    #[cfg(feature = "encryption")]
    pub async fn cancel_verification(&self, session: &KeyVerificationSession) -> Result<()> {
        let message = session.cancel();
        self.dispatch_verification(session, vec![message]).await
    }

    #[cfg(feature = "encryption")]
    async fn dispatch_verification(
        &self,
        session: &KeyVerificationSession,
        messages: Vec<crate::crypto::verification::OutgoingVerificationMessage>,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let olm = self.olm.read().await.clone();
        let Some(olm) = olm else { return Err(Error::NotLoggedIn) };
        olm.send_verification_messages(session, messages).await
    }

    /// The olm machine, for introspection; `None` when encryption is off
    /// or before login.
    #[cfg(feature = "encryption")]
    pub async fn olm_machine(&self) -> Option<Arc<OlmMachine>> {
        self.olm.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn mock_connection() -> Arc<Connection> {
        Connection::make_mock_connection("@alice:example.org", false).await.unwrap()
    }

    fn joined_update(events: Value) -> JoinedRoomUpdate {
        serde_json::from_value(json!({ "state": { "events": events } })).unwrap()
    }

    #[tokio::test]
    async fn room_succession_walks_the_upgrade_chain() {
        let connection = mock_connection().await;

        let a = connection.provide_room("!a:ex", Some(JoinState::Leave)).await.unwrap();
        a.update_joined(&joined_update(json!([
            { "type": "m.room.tombstone", "state_key": "",
              "content": { "body": "upgraded", "replacement_room": "!b:ex" } }
        ])));
        let b = connection.provide_room("!b:ex", Some(JoinState::Leave)).await.unwrap();
        b.update_joined(&joined_update(json!([
            { "type": "m.room.create", "state_key": "",
              "content": { "room_version": "10", "predecessor": { "room_id": "!a:ex" } } },
            { "type": "m.room.tombstone", "state_key": "",
              "content": { "body": "upgraded", "replacement_room": "!c:ex" } }
        ])));
        let c = connection.provide_room("!c:ex", Some(JoinState::Join)).await.unwrap();
        c.update_joined(&joined_update(json!([
            { "type": "m.room.create", "state_key": "",
              "content": { "room_version": "10", "predecessor": { "room_id": "!b:ex" } } }
        ])));

        assert!(connection.room_succeeds("!a:ex", "!b:ex"));
        assert!(connection.room_succeeds("!b:ex", "!c:ex"));
        // The chain is transitive from either end.
        assert!(connection.room_succeeds("!a:ex", "!c:ex"));
        assert!(!connection.room_succeeds("!c:ex", "!a:ex"));
        assert!(!connection.room_succeeds("!b:ex", "!a:ex"));
    }

    #[tokio::test]
    async fn aliases_prefer_the_successor_room() {
        let connection = mock_connection().await;

        let old = connection.provide_room("!old:ex", Some(JoinState::Join)).await.unwrap();
        let (prev, current) = old.update_joined(&joined_update(json!([
            { "type": "m.room.canonical_alias", "state_key": "",
              "content": { "alias": "#chat:ex" } },
            { "type": "m.room.tombstone", "state_key": "",
              "content": { "body": "upgraded", "replacement_room": "!new:ex" } }
        ])));
        connection.update_room_aliases("!old:ex", &prev, &current);
        assert_eq!(
            connection.room_by_alias("#chat:ex", JoinStates::ALL).unwrap().id(),
            "!old:ex"
        );

        let new = connection.provide_room("!new:ex", Some(JoinState::Join)).await.unwrap();
        let (prev, current) = new.update_joined(&joined_update(json!([
            { "type": "m.room.create", "state_key": "",
              "content": { "room_version": "10", "predecessor": { "room_id": "!old:ex" } } },
            { "type": "m.room.canonical_alias", "state_key": "",
              "content": { "alias": "#chat:ex" } }
        ])));
        connection.update_room_aliases("!new:ex", &prev, &current);
        // The successor takes the alias over.
        assert_eq!(
            connection.room_by_alias("#chat:ex", JoinStates::ALL).unwrap().id(),
            "!new:ex"
        );

        // The predecessor never steals it back.
        connection.update_room_aliases("!old:ex", &[], &["#chat:ex".to_owned()]);
        assert_eq!(
            connection.room_by_alias("#chat:ex", JoinStates::ALL).unwrap().id(),
            "!new:ex"
        );
    }

    #[tokio::test]
    async fn account_data_updates_only_on_content_change() {
        let connection = mock_connection().await;

        connection
            .consume_account_data(&[json!({
                "type": "org.example.pref", "content": { "colour": "teal" }
            })])
            .await;
        assert!(connection.has_account_data("org.example.pref"));
        assert_eq!(connection.account_data_json("org.example.pref")["colour"], "teal");

        // The same content again doesn't dirty the map.
        connection
            .consume_account_data(&[json!({
                "type": "org.example.pref", "content": { "colour": "teal" }
            })])
            .await;
        connection
            .consume_account_data(&[json!({
                "type": "org.example.pref", "content": { "colour": "plum" }
            })])
            .await;
        assert_eq!(connection.account_data_json("org.example.pref")["colour"], "plum");
    }

    #[tokio::test]
    async fn encryption_cannot_be_toggled_after_login() {
        let connection = mock_connection().await;
        assert!(!connection.encryption_enabled());
        connection.enable_encryption(true);
        assert!(!connection.encryption_enabled());
    }
}
