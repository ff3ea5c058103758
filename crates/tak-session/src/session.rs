// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session handle: owns the trust state machine and every service built on
// the device identity.
//
// All transitions run under one mutex. Services that can work concurrently
// (secure storage, crypto, TLS I/O, the monitor) are reached by cloning
// their `Arc` under the lock and releasing it before the call. Backend calls
// run on a blocking task of the session's own tokio runtime, bounded by the
// configured network timeout, with the session lock released; the result is
// applied after relocking only if the session is still the one that asked.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Runtime;
use tracing::{debug, info, instrument, warn};

use tak_bridge::{
    BackendClient, CryptoProvider, HostEnvironment, KeyVault, RegistrationRequest,
    RevalidationRequest, RevalidationStatus, UnavailableBackend, platform_host,
};
use tak_core::error::{Result, TakError};
use tak_core::{
    Completion, DeviceId, EncryptionAlgorithm, EncryptionOutput, HashAlgorithm, KeyAlgorithm,
    KeyInfo, License, LicenseStatus, Padding, RootStatus, RuntimeCrashReason, SessionState,
    SignatureAlgorithm, StatusCode, TakConfig, WrappedKey, alias,
};
use tak_security::tls::pem_encode;
use tak_security::{
    ClientIdentity, Connected, FileProtector, PersistedIdentity, PinnedChannels,
    PreCrashCallback, RuntimeMonitor, SecureStorage, SessionJournal, SoftwareKeystore, Terminator,
    TransitionEntry, ViolationSink, fingerprint_hash,
};

use crate::state::{Event, IntegrityVerdict, StateMachine};

/// Lowest monitor interval accepted, whatever the configuration says.
const MONITOR_FLOOR_SECS: u64 = 45;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Identity {
    device_id: DeviceId,
    fingerprint_hash: String,
}

/// Everything that exists between `initialize` and `release`.
struct Live {
    working_path: PathBuf,
    config: TakConfig,
    license: License,
    vault: Arc<dyn KeyVault>,
    crypto: Arc<dyn CryptoProvider>,
    journal: Arc<SessionJournal>,
    storage: Arc<SecureStorage>,
    protector: Arc<FileProtector>,
    monitor: Arc<RuntimeMonitor>,
    identity: Option<Identity>,
}

impl Live {
    /// Persist the current identity under `state`.
    fn persist(&self, state: SessionState) -> Result<()> {
        match &self.identity {
            Some(identity) => self.journal.save_identity(&PersistedIdentity {
                state,
                device_id: identity.device_id,
                fingerprint_hash: identity.fingerprint_hash.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Delete every store, every key, and the persisted identity, then put
    /// the license-derived default keys back.
    fn erase_device(&mut self) -> Result<()> {
        self.storage.wipe_all()?;
        self.vault.wipe()?;
        provision_defaults(self.vault.as_ref(), &self.license)?;
        self.journal.clear_identity()?;
        self.identity = None;
        info!("device data erased");
        Ok(())
    }
}

struct Inner {
    machine: StateMachine,
    live: Option<Live>,
}

impl Inner {
    fn live(&self) -> Result<&Live> {
        self.live.as_ref().ok_or(TakError::NotInitialized)
    }

    fn live_mut(&mut self) -> Result<&mut Live> {
        self.live.as_mut().ok_or(TakError::NotInitialized)
    }

    /// Apply `event` and journal the transition.
    fn transition(&mut self, event: Event, details: Option<&str>) -> Result<SessionState> {
        let (from, to) = self.machine.apply(event)?;
        if let Some(live) = &self.live {
            if let Err(e) = live.journal.record(from, to, event.name(), details) {
                warn!("failed to journal transition: {e}");
            }
        }
        info!(%from, %to, event = event.name(), "session transition");
        Ok(to)
    }

    fn on_violation(&mut self, reason: RuntimeCrashReason) -> Result<()> {
        let to = self.transition(Event::ViolationDetected, Some(reason.as_str()))?;
        if to == SessionState::Locked {
            self.live()?.persist(SessionState::Locked)?;
        }
        Ok(())
    }
}

/// Sink that locks the session when the monitor trips. Holds the session
/// weakly so a dropped session is not kept alive by its own monitor.
fn violation_sink(shared: Weak<Mutex<Inner>>) -> ViolationSink {
    Arc::new(move |reason| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let result = shared
            .lock()
            .map_err(TakError::from)
            .and_then(|mut inner| inner.on_violation(reason));
        if let Err(e) = result {
            warn!(%reason, "could not lock session after violation: {e}");
        }
    })
}

fn provision_defaults(vault: &dyn KeyVault, license: &License) -> Result<()> {
    vault.import_key(
        alias::DEFAULT_CLIENT_ENCRYPTION,
        KeyAlgorithm::Aes256,
        &license.file_protector_key()?,
    )?;
    match license.default_signing_key()? {
        Some(pkcs8) => {
            vault.import_key(alias::DEFAULT_CLIENT_PRIVATE, KeyAlgorithm::EcSecp256r1, &pkcs8)?
        }
        None if !vault.contains(alias::DEFAULT_CLIENT_PRIVATE)? => {
            vault.generate_key(alias::DEFAULT_CLIENT_PRIVATE, KeyAlgorithm::EcSecp256r1)?
        }
        None => {}
    }
    Ok(())
}

fn discard_individual_keys(vault: &dyn KeyVault) {
    for key in [
        alias::INDIVIDUAL_CLIENT_PRIVATE,
        alias::INDIVIDUAL_CLIENT_ENCRYPTION,
    ] {
        if let Err(e) = vault.delete(key) {
            warn!(alias = key, "failed to delete key: {e}");
        }
    }
}

/// Captured under the session lock for a registration round trip.
struct Enrollment {
    vault: Arc<dyn KeyVault>,
    journal: Arc<SessionJournal>,
    timeout: Duration,
    request: RegistrationRequest,
}

/// Individual keys certified by the backend, still under staging aliases.
struct Staged {
    vault: Arc<dyn KeyVault>,
    journal: Arc<SessionJournal>,
    device_id: DeviceId,
}

impl Staged {
    fn private_alias() -> String {
        alias::staging(alias::INDIVIDUAL_CLIENT_PRIVATE)
    }

    fn encryption_alias() -> String {
        alias::staging(alias::INDIVIDUAL_CLIENT_ENCRYPTION)
    }

    /// Move the staged keys onto the individual aliases.
    fn promote(&self) -> Result<()> {
        self.vault
            .rename(&Self::private_alias(), alias::INDIVIDUAL_CLIENT_PRIVATE)?;
        self.vault
            .rename(&Self::encryption_alias(), alias::INDIVIDUAL_CLIENT_ENCRYPTION)
    }

    fn discard(&self) {
        discard_staged_keys(self.vault.as_ref());
    }
}

fn discard_staged_keys(vault: &dyn KeyVault) {
    for staged in [Staged::private_alias(), Staged::encryption_alias()] {
        if let Err(e) = vault.delete(&staged) {
            warn!(alias = %staged, "failed to discard staged key: {e}");
        }
    }
}

/// Backend verdict, applied once the session lock is retaken.
enum Answer {
    Valid(Option<String>),
    Renewed(Staged),
    CertificateExpired,
    Locked,
    Wiped,
}

/// The live state a backend round trip started from must still be there.
fn ensure_same_session(inner: &Inner, journal: &Arc<SessionJournal>) -> Result<()> {
    if Arc::ptr_eq(&inner.live()?.journal, journal) {
        Ok(())
    } else {
        Err(TakError::Concurrency(
            "session was re-initialized during the backend call".into(),
        ))
    }
}

fn adopt_registration(
    inner: &mut Inner,
    staged: &Staged,
    fingerprint_hash: String,
) -> Result<DeviceId> {
    ensure_same_session(inner, &staged.journal)?;
    StateMachine::next(inner.machine.state(), Event::Registered)?;

    let live = inner.live_mut()?;
    match live.storage.verify_device(&fingerprint_hash) {
        Ok(()) => {}
        Err(TakError::StorageDeviceMismatch) => {
            warn!("secure storage belonged to another device and was cleared")
        }
        Err(e) => return Err(e),
    }

    let device_id = staged.device_id;
    if let Err(e) = staged.promote() {
        discard_individual_keys(live.vault.as_ref());
        return Err(e);
    }
    live.identity = Some(Identity {
        device_id,
        fingerprint_hash,
    });
    if let Err(e) = live.persist(SessionState::Registered) {
        live.identity = None;
        discard_individual_keys(live.vault.as_ref());
        return Err(e);
    }

    let details = device_id.to_string();
    inner.transition(Event::Registered, Some(&details))?;
    Ok(device_id)
}

fn apply_answer(
    inner: &mut Inner,
    journal: &Arc<SessionJournal>,
    answer: &Answer,
    identity: &Identity,
    license_status: LicenseStatus,
) -> Result<Completion> {
    ensure_same_session(inner, journal)?;
    inner.machine.require_identity()?;
    let live = inner.live_mut()?;
    let unchanged = live
        .identity
        .as_ref()
        .is_some_and(|current| current.device_id == identity.device_id);
    if !unchanged {
        return Err(TakError::Concurrency(
            "identity changed during revalidation".into(),
        ));
    }

    let (verdict, outcome) = match answer {
        Answer::Valid(certificate_pem) => {
            if let Some(pem) = certificate_pem
                .as_deref()
                .filter(|pem| !pem.trim().is_empty())
            {
                live.vault.store_certificate(alias::INDIVIDUAL_CLIENT_PRIVATE, pem)?;
                info!("individual certificate replaced");
            }
            live.persist(SessionState::Registered)?;
            let completion = match license_status {
                LicenseStatus::AboutToExpire { days_left } => {
                    warn!(days_left, "license is about to expire");
                    Completion::LicenseAboutToExpire
                }
                _ => Completion::Completed,
            };
            (IntegrityVerdict::Valid, Ok(completion))
        }
        Answer::Renewed(staged) => {
            staged.promote()?;
            live.identity = Some(Identity {
                device_id: staged.device_id,
                fingerprint_hash: identity.fingerprint_hash.clone(),
            });
            live.persist(SessionState::Registered)?;
            info!(
                previous = %identity.device_id,
                device_id = %staged.device_id,
                "identity renewed"
            );
            (IntegrityVerdict::Renewed, Ok(Completion::ReRegistered))
        }
        Answer::CertificateExpired => {
            discard_individual_keys(live.vault.as_ref());
            live.identity = None;
            live.journal.clear_identity()?;
            (
                IntegrityVerdict::CertificateExpired,
                Err(TakError::ClientCertificateExpired),
            )
        }
        Answer::Locked => {
            live.persist(SessionState::Locked)?;
            (IntegrityVerdict::Locked, Ok(Completion::Locked))
        }
        Answer::Wiped => {
            live.erase_device()?;
            (IntegrityVerdict::Wiped, Err(TakError::InstanceWiped))
        }
    };

    inner.transition(Event::Verdict(verdict), None)?;
    outcome
}

/// Default aliases are usable from `Initialized`; everything else needs a
/// registered device.
fn gate_alias(machine: &StateMachine, key_alias: &str) -> Result<()> {
    machine.require_unlocked()?;
    if key_alias.is_empty() {
        return Err(TakError::invalid("key alias must not be empty"));
    }
    if key_alias == alias::DEFAULT_CLIENT_PRIVATE || key_alias == alias::DEFAULT_CLIENT_ENCRYPTION {
        return Ok(());
    }
    if key_alias.starts_with(alias::INTERNAL_PREFIX) {
        return Err(TakError::invalid(format!("alias '{key_alias}' is reserved")));
    }
    machine.require_registered()
}

fn validate_user_hash(user_hash: &str) -> Result<()> {
    match hex::decode(user_hash) {
        Ok(bytes) if !bytes.is_empty() => Ok(()),
        _ => Err(TakError::invalid("user hash must be a non-empty hex string")),
    }
}

/// Pinned material is stored as PEM; bare DER is accepted too.
fn pinned_pem(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) if text.contains("-----BEGIN") => text,
        Ok(text) => pem_encode(text.as_bytes()),
        Err(e) => pem_encode(e.as_bytes()),
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collaborators for a [`Session`]. Anything not supplied falls back to the
/// platform host, the software keystore, and a backend that reports
/// `NotAvailable`.
#[derive(Default)]
pub struct SessionBuilder {
    host: Option<Arc<dyn HostEnvironment>>,
    backend: Option<Arc<dyn BackendClient>>,
    keys: Option<(Arc<dyn KeyVault>, Arc<dyn CryptoProvider>)>,
    terminator: Option<Terminator>,
}

impl SessionBuilder {
    pub fn host(mut self, host: Arc<dyn HostEnvironment>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn BackendClient>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a platform key store instead of the software keystore.
    pub fn key_vault(mut self, vault: Arc<dyn KeyVault>, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.keys = Some((vault, crypto));
        self
    }

    /// Replace process abort as the monitor's last step.
    pub fn terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn build(self) -> Result<Session> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tak-network")
            .enable_time()
            .build()?;

        Ok(Session {
            shared: Arc::new(Mutex::new(Inner {
                machine: StateMachine::new(),
                live: None,
            })),
            host: self.host.unwrap_or_else(platform_host),
            backend: self.backend.unwrap_or_else(|| Arc::new(UnavailableBackend)),
            keys: self.keys,
            terminator: self.terminator,
            backend_turn: Mutex::new(()),
            channels: PinnedChannels::new(),
            runtime: Some(runtime),
        })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One device-trust session. Create it once and share it; every method
/// takes `&self`.
///
/// Methods block. Do not call them from inside an async runtime.
pub struct Session {
    shared: Arc<Mutex<Inner>>,
    host: Arc<dyn HostEnvironment>,
    backend: Arc<dyn BackendClient>,
    keys: Option<(Arc<dyn KeyVault>, Arc<dyn CryptoProvider>)>,
    terminator: Option<Terminator>,
    /// Held for a whole backend round trip, so registration and
    /// revalidation never overlap. The session lock is not.
    backend_turn: Mutex<()>,
    channels: PinnedChannels,
    runtime: Option<Runtime>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Session with the platform host and no backend.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn version() -> &'static str {
        crate::VERSION
    }

    /// Version plus the build identifier stamped by CI (`TAK_BUILD_ID`).
    pub fn build_version() -> String {
        format!("{}+{}", crate::VERSION, option_env!("TAK_BUILD_ID").unwrap_or("local"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        Ok(self.shared.lock()?)
    }

    fn device_fingerprint_hash(&self) -> Result<String> {
        match self.host.device_fingerprint()? {
            Some(fp) if !fp.trim().is_empty() => Ok(fingerprint_hash(&fp)),
            _ => Err(TakError::DeviceNoFingerprint),
        }
    }

    /// Run a backend call on the network runtime. A zero timeout waits
    /// indefinitely.
    fn call_backend<T, F>(&self, timeout: Duration, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BackendClient) -> Result<T> + Send + 'static,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| TakError::General("network runtime has shut down".into()))?;
        let backend = Arc::clone(&self.backend);
        let task = runtime.spawn_blocking(move || call(backend.as_ref()));

        runtime.block_on(async move {
            let joined = if timeout.is_zero() {
                task.await
            } else {
                tokio::time::timeout(timeout, task)
                    .await
                    .map_err(|_| TakError::NetworkTimeout)?
            };
            joined.map_err(|e| TakError::Network(format!("backend task failed: {e}")))?
        })
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Bring the session up against `working_path`. `license_path` is
    /// resolved against the working path first, then the bundled assets.
    #[instrument(skip(self, working_path), fields(path = %working_path.as_ref().display()))]
    pub fn initialize(
        &self,
        working_path: impl AsRef<Path>,
        license_path: &str,
    ) -> Result<Completion> {
        let working_path = working_path.as_ref();
        let mut inner = self.lock()?;
        if inner.machine.state().is_live() {
            return Err(TakError::AlreadyInitialized);
        }
        if !working_path.is_dir() {
            return Err(TakError::invalid(format!(
                "working path '{}' is not a directory",
                working_path.display()
            )));
        }
        if license_path.is_empty() {
            return Err(TakError::invalid("license path must not be empty"));
        }

        self.host.attach()?;
        let (live, license_status) = match self.open_live(working_path, license_path) {
            Ok(opened) => opened,
            Err(e) => {
                self.host.detach();
                return Err(e);
            }
        };

        let restored = live.journal.load_identity();
        inner.live = Some(live);
        inner.transition(Event::Initialized, None)?;

        match restored {
            Ok(Some(persisted)) => self.restore(&mut inner, persisted)?,
            Ok(None) => {}
            Err(e) => warn!("persisted identity unreadable, starting unregistered: {e}"),
        }

        let completion = if inner.machine.state() == SessionState::Locked {
            Completion::Locked
        } else if let LicenseStatus::AboutToExpire { days_left } = license_status {
            warn!(days_left, "license is about to expire");
            Completion::LicenseAboutToExpire
        } else {
            Completion::Completed
        };
        info!(
            platform = self.host.platform_name(),
            state = %inner.machine.state(),
            "session initialized"
        );
        Ok(completion)
    }

    fn restore(&self, inner: &mut Inner, persisted: PersistedIdentity) -> Result<()> {
        let live = inner.live_mut()?;
        if !live.vault.contains(alias::INDIVIDUAL_CLIENT_PRIVATE)? {
            warn!(
                device_id = %persisted.device_id,
                "identity key missing; discarding persisted identity"
            );
            return live.journal.clear_identity();
        }
        live.identity = Some(Identity {
            device_id: persisted.device_id,
            fingerprint_hash: persisted.fingerprint_hash,
        });
        let details = persisted.device_id.to_string();
        inner.transition(Event::Restored(persisted.state), Some(&details))?;
        Ok(())
    }

    fn open_live(&self, working_path: &Path, license_path: &str) -> Result<(Live, LicenseStatus)> {
        let config = TakConfig::load(working_path)?;
        let license = self.load_license(working_path, license_path)?;
        let license_status = license.evaluate(Utc::now(), config.license_grace_days);
        if license_status == LicenseStatus::Expired {
            warn!(customer_id = %license.customer_id, "license has expired");
            return Err(TakError::LicenseExpired);
        }

        let (vault, crypto): (Arc<dyn KeyVault>, Arc<dyn CryptoProvider>) = match &self.keys {
            Some((vault, crypto)) => (Arc::clone(vault), Arc::clone(crypto)),
            None => {
                let keystore = Arc::new(SoftwareKeystore::new(config.keystore_db.clone()));
                let vault: Arc<dyn KeyVault> = keystore.clone();
                let crypto: Arc<dyn CryptoProvider> = keystore;
                (vault, crypto)
            }
        };
        vault.open(working_path)?;

        match self.open_services(working_path, config, license, &vault, &crypto) {
            Ok(live) => Ok((live, license_status)),
            Err(e) => {
                vault.close();
                Err(e)
            }
        }
    }

    fn open_services(
        &self,
        working_path: &Path,
        config: TakConfig,
        license: License,
        vault: &Arc<dyn KeyVault>,
        crypto: &Arc<dyn CryptoProvider>,
    ) -> Result<Live> {
        provision_defaults(vault.as_ref(), &license)?;

        let journal = SessionJournal::open(working_path.join(&config.journal_db))?;
        let storage = SecureStorage::open(
            working_path.join(&config.storage_db),
            Arc::clone(vault),
            Arc::clone(crypto),
        )?;

        let min_interval =
            Duration::from_secs(config.monitor_min_interval_secs.max(MONITOR_FLOOR_SECS));
        let host = Arc::clone(&self.host);
        let monitor = match &self.terminator {
            Some(terminator) => {
                RuntimeMonitor::with_terminator(host, min_interval, Arc::clone(terminator))
            }
            None => RuntimeMonitor::new(host, min_interval),
        };
        monitor.set_violation_sink(Some(violation_sink(Arc::downgrade(&self.shared))))?;

        Ok(Live {
            working_path: working_path.to_path_buf(),
            config,
            license,
            vault: Arc::clone(vault),
            crypto: Arc::clone(crypto),
            journal: Arc::new(journal),
            storage: Arc::new(storage),
            protector: Arc::new(FileProtector::new(Arc::clone(crypto))),
            monitor: Arc::new(monitor),
            identity: None,
        })
    }

    fn load_license(&self, working_path: &Path, license_path: &str) -> Result<License> {
        let candidate = Path::new(license_path);
        let on_disk = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            working_path.join(candidate)
        };
        let bytes = match std::fs::read(&on_disk) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self
                .host
                .open_asset(license_path)?
                .ok_or_else(|| TakError::invalid(format!("license '{license_path}' not found")))?,
            Err(e) => return Err(e.into()),
        };
        License::from_json(&bytes)
    }

    /// Stop the monitor, close every channel, close the vault, and detach
    /// the host context. A later `initialize` is allowed.
    #[instrument(skip(self))]
    pub fn release(&self) -> Result<()> {
        let monitor = {
            let inner = self.lock()?;
            Arc::clone(&inner.live()?.monitor)
        };
        monitor.stop()?;
        self.channels.close_all()?;

        let live = {
            let mut inner = self.lock()?;
            inner.transition(Event::Released, None)?;
            inner.live.take()
        };
        if let Some(live) = live {
            live.vault.close();
            debug!(path = %live.working_path.display(), "session resources released");
        }
        self.host.detach();
        info!("session released");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock()
            .map(|inner| inner.machine.state().is_live())
            .unwrap_or(false)
    }

    pub fn state(&self) -> Result<SessionState> {
        Ok(self.lock()?.machine.state())
    }

    /// Journaled transitions, newest first.
    pub fn transition_history(&self, limit: usize) -> Result<Vec<TransitionEntry>> {
        let journal = Arc::clone(&self.lock()?.live()?.journal);
        journal.history(limit)
    }

    // -- Registration ----------------------------------------------------------

    /// Register the device with the backend. All-or-nothing: individual keys
    /// are staged and promoted only once the backend has answered.
    ///
    /// The session lock is not held during the backend call; the state is
    /// checked again before the keys are promoted.
    #[instrument(skip_all, fields(user_hash = user_hash.is_some()))]
    pub fn register(&self, user_hash: Option<&str>) -> Result<DeviceId> {
        let _turn = self.backend_turn.lock()?;
        let (enrollment, fingerprint_hash) = {
            let inner = self.lock()?;
            StateMachine::next(inner.machine.state(), Event::Registered)?;
            if let Some(user_hash) = user_hash {
                validate_user_hash(user_hash)?;
            }
            let fingerprint_hash = self.device_fingerprint_hash()?;
            let enrollment = self.enrollment(inner.live()?, &fingerprint_hash, user_hash, None);
            (enrollment, fingerprint_hash)
        };

        let staged = self.enroll(enrollment)?;

        let mut inner = self.lock()?;
        let adopted = adopt_registration(&mut inner, &staged, fingerprint_hash);
        if adopted.is_err() {
            staged.discard();
        }
        let device_id = adopted?;
        info!(%device_id, "device registered");
        Ok(device_id)
    }

    fn enrollment(
        &self,
        live: &Live,
        fingerprint_hash: &str,
        user_hash: Option<&str>,
        previous: Option<DeviceId>,
    ) -> Enrollment {
        Enrollment {
            vault: Arc::clone(&live.vault),
            journal: Arc::clone(&live.journal),
            timeout: live.config.network_timeout(),
            request: RegistrationRequest {
                customer_id: live.license.customer_id.clone(),
                fingerprint_hash: fingerprint_hash.to_string(),
                user_hash: user_hash.map(str::to_string),
                public_key: Vec::new(),
                platform: self.host.platform_name().to_string(),
                previous_device_id: previous,
                backend_url: live.license.backend_url.clone(),
            },
        }
    }

    /// Generate keys under the staging aliases and have the backend certify
    /// them. Staged keys are removed on any failure.
    fn enroll(&self, enrollment: Enrollment) -> Result<Staged> {
        let Enrollment {
            vault,
            journal,
            timeout,
            request,
        } = enrollment;
        match self.enroll_staged(&vault, timeout, request) {
            Ok(device_id) => Ok(Staged {
                vault,
                journal,
                device_id,
            }),
            Err(e) => {
                discard_staged_keys(vault.as_ref());
                Err(e)
            }
        }
    }

    fn enroll_staged(
        &self,
        vault: &Arc<dyn KeyVault>,
        timeout: Duration,
        mut request: RegistrationRequest,
    ) -> Result<DeviceId> {
        vault.generate_key(&Staged::private_alias(), KeyAlgorithm::EcSecp256r1)?;
        vault.generate_key(&Staged::encryption_alias(), KeyAlgorithm::Aes256)?;
        request.public_key = vault.public_key(&Staged::private_alias())?;

        let registration = self.call_backend(timeout, move |backend| backend.register(&request))?;
        let device_id = DeviceId::parse_v4(&registration.device_id)?;
        if registration.certificate_pem.trim().is_empty() {
            return Err(TakError::InvalidServerResponse(
                "registration carried no certificate".into(),
            ));
        }
        vault.store_certificate(&Staged::private_alias(), &registration.certificate_pem)?;
        Ok(device_id)
    }

    /// Never fails. The status code is diagnostic only.
    pub fn is_registered(&self) -> (bool, StatusCode) {
        let state = match self.lock() {
            Ok(inner) => inner.machine.state(),
            Err(e) => return (false, e.status()),
        };
        match state {
            SessionState::Registered => (true, StatusCode::Success),
            SessionState::Locked => (true, StatusCode::InstanceLocked),
            SessionState::Initialized => (false, StatusCode::Success),
            SessionState::Uninitialized => (false, StatusCode::NotInitialized),
            SessionState::CertificateExpired => (false, StatusCode::ClientCertificateExpired),
            SessionState::Wiped => (false, StatusCode::InstanceWiped),
        }
    }

    /// The registered device's identifier.
    pub fn device_id(&self) -> Result<DeviceId> {
        let inner = self.lock()?;
        inner.machine.require_registered()?;
        inner
            .live()?
            .identity
            .as_ref()
            .map(|identity| identity.device_id)
            .ok_or(TakError::NotRegistered)
    }

    /// Revalidate the identity with the backend and apply its verdict. This
    /// is the only way lock, unlock, wipe, expiry, and renewal reach the
    /// client, so the application polls it.
    ///
    /// The session lock is released for the backend round trips and the
    /// verdict is applied only if the same identity is still in place.
    #[instrument(skip_all, fields(attestation = attestation.is_some()))]
    pub fn check_integrity(&self, attestation: Option<&str>) -> Result<Completion> {
        let _turn = self.backend_turn.lock()?;
        let (request, renewal, license_status, identity) = {
            let mut inner = self.lock()?;
            inner.machine.require_identity()?;
            let live = inner.live_mut()?;

            let license_status =
                live.license.evaluate(Utc::now(), live.config.license_grace_days);
            if license_status == LicenseStatus::Expired {
                warn!("license has expired");
                return Err(TakError::LicenseExpired);
            }
            let identity = live.identity.clone().ok_or(TakError::NotRegistered)?;

            let current = self.device_fingerprint_hash()?;
            if current != identity.fingerprint_hash {
                warn!(
                    device_id = %identity.device_id,
                    "device fingerprint changed since registration"
                );
                live.erase_device()?;
                inner.transition(
                    Event::Verdict(IntegrityVerdict::DeviceMismatch),
                    Some("fingerprint changed"),
                )?;
                return Err(TakError::StorageDeviceMismatch);
            }

            let request = RevalidationRequest {
                customer_id: live.license.customer_id.clone(),
                device_id: identity.device_id,
                fingerprint_hash: current.clone(),
                attestation: attestation.map(str::to_string),
                backend_url: live.license.backend_url.clone(),
            };
            let renewal = self.enrollment(live, &current, None, Some(identity.device_id));
            (request, renewal, license_status, identity)
        };

        let journal = Arc::clone(&renewal.journal);
        let revalidation = self.call_backend(renewal.timeout, move |backend| {
            backend.revalidate(&request)
        })?;
        debug!(status = ?revalidation.status, "revalidation verdict");
        let answer = match revalidation.status {
            RevalidationStatus::Valid => Answer::Valid(revalidation.certificate_pem),
            RevalidationStatus::RenewalRequired => Answer::Renewed(self.enroll(renewal)?),
            RevalidationStatus::CertificateExpired => Answer::CertificateExpired,
            RevalidationStatus::Locked => Answer::Locked,
            RevalidationStatus::Wiped => Answer::Wiped,
        };

        let mut inner = self.lock()?;
        let applied = apply_answer(&mut inner, &journal, &answer, &identity, license_status);
        if let (Err(_), Answer::Renewed(staged)) = (&applied, &answer) {
            staged.discard();
        }
        applied
    }

    /// Delete all device-bound data and keys and return to `Initialized`.
    /// Refused while locked.
    #[instrument(skip(self))]
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.lock()?;
        StateMachine::next(inner.machine.state(), Event::Reset)?;
        inner.live_mut()?.erase_device()?;
        inner.transition(Event::Reset, None)?;
        Ok(())
    }

    // -- Keys and crypto -------------------------------------------------------

    fn keys_for(&self, key_alias: &str) -> Result<(Arc<dyn KeyVault>, Arc<dyn CryptoProvider>)> {
        let inner = self.lock()?;
        gate_alias(&inner.machine, key_alias)?;
        let live = inner.live()?;
        Ok((Arc::clone(&live.vault), Arc::clone(&live.crypto)))
    }

    fn registered_keys(&self) -> Result<(Arc<dyn KeyVault>, Arc<dyn CryptoProvider>)> {
        let inner = self.lock()?;
        inner.machine.require_registered()?;
        let live = inner.live()?;
        Ok((Arc::clone(&live.vault), Arc::clone(&live.crypto)))
    }

    /// PEM certificate attached to the key at `key_alias`.
    pub fn certificate_pem(&self, key_alias: &str) -> Result<String> {
        let (vault, _) = self.keys_for(key_alias)?;
        vault
            .certificate(key_alias)?
            .ok_or_else(|| TakError::invalid(format!("no certificate stored for '{key_alias}'")))
    }

    pub fn key_info(&self, key_alias: &str) -> Result<KeyInfo> {
        let (vault, _) = self.keys_for(key_alias)?;
        vault.key_info(key_alias)
    }

    pub fn public_key(&self, key_alias: &str) -> Result<Vec<u8>> {
        let (vault, _) = self.keys_for(key_alias)?;
        vault.public_key(key_alias)
    }

    /// Hash `data` with `hash` and sign it with the key at `key_alias`.
    pub fn sign(
        &self,
        key_alias: &str,
        signature: SignatureAlgorithm,
        hash: HashAlgorithm,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(TakError::invalid("nothing to sign"));
        }
        let (_, crypto) = self.keys_for(key_alias)?;
        crypto.sign(key_alias, signature, hash, data)
    }

    pub fn encrypt(
        &self,
        key_alias: &str,
        algorithm: EncryptionAlgorithm,
        padding: Padding,
        cleartext: &[u8],
        iv: Option<&[u8]>,
    ) -> Result<EncryptionOutput> {
        let (_, crypto) = self.keys_for(key_alias)?;
        crypto.encrypt(key_alias, algorithm, padding, cleartext, iv)
    }

    pub fn decrypt(
        &self,
        key_alias: &str,
        algorithm: EncryptionAlgorithm,
        padding: Padding,
        output: &EncryptionOutput,
    ) -> Result<Vec<u8>> {
        let (_, crypto) = self.keys_for(key_alias)?;
        crypto.decrypt(key_alias, algorithm, padding, output)
    }

    pub fn generate_random(&self, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Err(TakError::invalid("random length must be positive"));
        }
        let (_, crypto) = self.registered_keys()?;
        crypto.random_bytes(len)
    }

    /// Generate a key under a caller-chosen alias.
    pub fn generate_key(&self, key_alias: &str, algorithm: KeyAlgorithm) -> Result<()> {
        alias::validate_user(key_alias)?;
        let (vault, _) = self.registered_keys()?;
        vault.generate_key(key_alias, algorithm)
    }

    /// Unwrap `wrapped` into the vault under a caller-chosen alias.
    pub fn load_wrapped_key(&self, wrapped: &WrappedKey, key_alias: &str) -> Result<()> {
        alias::validate_user(key_alias)?;
        let (vault, _) = self.registered_keys()?;
        vault.load_wrapped_key(wrapped, key_alias)
    }

    // -- Secure storage --------------------------------------------------------

    /// The storage service, after checking that it still belongs to this
    /// device.
    fn storage(&self) -> Result<Arc<SecureStorage>> {
        let storage = {
            let inner = self.lock()?;
            inner.machine.require_registered()?;
            Arc::clone(&inner.live()?.storage)
        };
        storage.verify_device(&self.device_fingerprint_hash()?)?;
        Ok(storage)
    }

    pub fn storage_create(&self, name: &str) -> Result<()> {
        self.storage()?.create(name)
    }

    pub fn storage_write(&self, name: &str, key: &str, value: &[u8]) -> Result<()> {
        self.storage()?.write(name, key, value)
    }

    pub fn storage_read(&self, name: &str, key: &str) -> Result<Vec<u8>> {
        self.storage()?.read(name, key)
    }

    /// Absent keys are not an error.
    pub fn storage_delete_entry(&self, name: &str, key: &str) -> Result<()> {
        self.storage()?.delete_entry(name, key)
    }

    pub fn storage_delete(&self, name: &str) -> Result<()> {
        self.storage()?.delete(name)
    }

    // -- File protector --------------------------------------------------------

    fn protector(&self, allow_locked: bool) -> Result<Arc<FileProtector>> {
        let inner = self.lock()?;
        if allow_locked {
            inner.machine.require_initialized()?;
        } else {
            inner.machine.require_unlocked()?;
        }
        Ok(Arc::clone(&inner.live()?.protector))
    }

    pub fn file_protector_encrypt(&self, cleartext: &[u8]) -> Result<Vec<u8>> {
        self.protector(false)?.encrypt(cleartext)
    }

    pub fn file_protector_decrypt(&self, protected: &[u8]) -> Result<Vec<u8>> {
        self.protector(true)?.decrypt(protected)
    }

    /// Decrypt the bundled asset `<name>.<extension>`.
    pub fn file_protector_decrypt_from_file(&self, name: &str, extension: &str) -> Result<Vec<u8>> {
        self.protector(true)?
            .decrypt_asset(self.host.as_ref(), name, extension)
    }

    // -- Pinned TLS ------------------------------------------------------------

    /// Connect to `fqdn:port`, trusting only the certificate shipped as the
    /// protected asset `<fqdn>.<pinned_cert_extension>`. A registered device
    /// authenticates with its individual certificate.
    #[instrument(skip(self))]
    pub fn tls_connect_pinned(&self, fqdn: &str, port: u16, timeout_ms: u64) -> Result<Connected> {
        let (protector, extension, identity) = {
            let inner = self.lock()?;
            inner.machine.require_unlocked()?;
            let live = inner.live()?;
            let identity = if inner.machine.state() == SessionState::Registered {
                Self::client_identity(live)?
            } else {
                None
            };
            (
                Arc::clone(&live.protector),
                live.config.pinned_cert_extension.clone(),
                identity,
            )
        };

        let pinned = protector.decrypt_asset(self.host.as_ref(), fqdn, &extension)?;
        self.channels.connect(
            fqdn,
            port,
            Duration::from_millis(timeout_ms),
            &pinned_pem(pinned),
            identity,
        )
    }

    /// Connect trusting the caller-supplied PEM certificates.
    #[instrument(skip(self, trusted_pem))]
    pub fn tls_connect(
        &self,
        fqdn: &str,
        port: u16,
        trusted_pem: &str,
        timeout_ms: u64,
    ) -> Result<Connected> {
        let identity = {
            let inner = self.lock()?;
            inner.machine.require_unlocked()?;
            if inner.machine.state() == SessionState::Registered {
                Self::client_identity(inner.live()?)?
            } else {
                None
            }
        };
        self.channels.connect(
            fqdn,
            port,
            Duration::from_millis(timeout_ms),
            trusted_pem,
            identity,
        )
    }

    fn client_identity(live: &Live) -> Result<Option<ClientIdentity>> {
        let certificate = match live.vault.certificate(alias::INDIVIDUAL_CLIENT_PRIVATE) {
            Ok(certificate) => certificate,
            Err(TakError::KeyNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(certificate.map(|certificate_pem| ClientIdentity {
            certificate_pem,
            key_alias: alias::INDIVIDUAL_CLIENT_PRIVATE.to_string(),
            crypto: Arc::clone(&live.crypto),
        }))
    }

    fn require_unlocked(&self) -> Result<()> {
        self.lock()?.machine.require_unlocked()
    }

    /// Read up to `max` bytes; `max == 0` reads until the peer closes or the
    /// timeout expires.
    pub fn tls_read(&self, descriptor: i32, max: usize) -> Result<Vec<u8>> {
        self.require_unlocked()?;
        self.channels.read(descriptor, max)
    }

    pub fn tls_write(&self, descriptor: i32, data: &[u8]) -> Result<()> {
        self.require_unlocked()?;
        self.channels.write(descriptor, data)
    }

    /// Idempotent.
    pub fn tls_close(&self, descriptor: i32) -> Result<()> {
        self.channels.close(descriptor)
    }

    /// True for closed, peer-closed, and never-issued descriptors.
    pub fn tls_is_closed(&self, descriptor: i32) -> bool {
        self.channels.is_closed(descriptor)
    }

    pub fn tls_cipher_suite(&self, descriptor: i32) -> Result<String> {
        self.channels.cipher_suite(descriptor)
    }

    pub fn tls_protocol_version(&self, descriptor: i32) -> Result<String> {
        self.channels.protocol_version(descriptor)
    }

    pub fn tls_supported_cipher_suites(&self) -> Vec<String> {
        self.channels.supported_cipher_suites()
    }

    // -- Runtime monitor -------------------------------------------------------

    fn monitor(&self) -> Result<Arc<RuntimeMonitor>> {
        Ok(Arc::clone(&self.lock()?.live()?.monitor))
    }

    pub fn monitor_start(&self, interval_secs: u64) -> Result<()> {
        self.monitor()?.start(interval_secs)
    }

    pub fn monitor_stop(&self) -> Result<()> {
        self.monitor()?.stop()
    }

    /// False when the session is not initialized.
    pub fn monitor_is_active(&self, relaunch: bool) -> Result<bool> {
        match self.monitor() {
            Ok(monitor) => monitor.is_active(relaunch),
            Err(TakError::NotInitialized) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn set_pre_crash_callback(&self, callback: Option<PreCrashCallback>) -> Result<()> {
        self.monitor()?.set_pre_crash_callback(callback)
    }

    // -- Root detection --------------------------------------------------------

    fn root_level(&self) -> Result<RootStatus> {
        let state = self.lock()?.machine.state();
        match state {
            SessionState::Uninitialized => Err(TakError::NotInitialized),
            SessionState::Locked => Ok(RootStatus::NotRooted),
            _ => Ok(self.host.root_status()),
        }
    }

    /// Whether the host reports the device as rooted. Always false while
    /// locked.
    pub fn root_status(&self) -> Result<bool> {
        Ok(self.root_level()? == RootStatus::Rooted)
    }

    /// Graded root detection. Always `NotRooted` while locked.
    pub fn advanced_root_status(&self) -> Result<RootStatus> {
        self.root_level()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_initialized() {
            if let Err(e) = self.release() {
                warn!("release on drop failed: {e}");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
