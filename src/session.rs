// =============================================================================
// Session Registry — login/logout/config/detect/list operations, bounded
// mailboxes, idle-timeout eviction (§4.F).
// =============================================================================
//
// Grounded on `original_source/Src/userscore.cpp`/`.h`: a single reader-writer
// lock over the session map replaces the original's module-scope mutex, and
// each session's mailbox carries its own lock (here folded into the same
// per-session `Mutex` since mailbox and config always change together).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::persistence::UserStore;
use crate::types::{DetectEvent, User, UserConfig};

pub type SessionId = i64;

/// Mailbox capacity (§3/§4.F).
pub const MAILBOX_CAP: usize = 5;
/// Idle-timeout before a session is evicted by the sweeper (§4.F).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct SessionInner {
    user_name: String,
    password: String,
    config: UserConfig,
    last_activity: Instant,
    mailbox: Vec<DetectEvent>,
    overflow_flag: bool,
}

/// Registry of online sessions. `login`/`logout`/`update_config`/
/// `poll_detect`/`list_venues`/`list_kline_ids` are all atomic with respect
/// to the session map; mailbox mutation is serialized per session.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Mutex<SessionInner>>>,
    users: Box<dyn UserStore>,
    /// Dev builds (or tests) may prefer a deterministic id sequence over the
    /// spec's 31-bit random allocator.
    deterministic_ids: bool,
    next_id: std::sync::atomic::AtomicI64,
}

impl SessionRegistry {
    pub fn new(users: Box<dyn UserStore>, deterministic_ids: bool) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            users,
            deterministic_ids,
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> SessionId {
        if self.deterministic_ids {
            self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        } else {
            // 31-bit positive random, matching the original's
            // `QRandomGenerator64::global()->bounded(1, INT32_MAX)`.
            rand::thread_rng().gen_range(1..i32::MAX as i64)
        }
    }

    pub async fn login(&self, user_name: &str, password: &str) -> Result<(SessionId, UserConfig), ApiError> {
        let now = chrono::Utc::now();
        let user = match self.users.find(user_name).await.map_err(|e| {
            warn!(error = %e, "persistence error during login");
            ApiError::Unauthorized
        })? {
            Some(u) => {
                // Plaintext compare — carried forward from the original,
                // documented as a known gap in DESIGN.md.
                if u.password != password {
                    warn!(user = user_name, "login rejected: bad password");
                    return Err(ApiError::Unauthorized);
                }
                u
            }
            None => {
                let created = self
                    .users
                    .create(user_name, password, &UserConfig::default(), now)
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "persistence error creating provisional user");
                        ApiError::Unauthorized
                    })?;
                created
            }
        };

        let session_id = self.allocate_id();
        let inner = SessionInner {
            user_name: user_name.to_string(),
            password: user.password.clone(),
            config: user.config.clone(),
            last_activity: Instant::now(),
            mailbox: Vec::new(),
            overflow_flag: false,
        };
        self.sessions.write().insert(session_id, Mutex::new(inner));
        info!(session_id, user = user_name, "session logged in");
        Ok((session_id, user.config))
    }

    pub fn logout(&self, session_id: SessionId) -> Result<(), ApiError> {
        let removed = self.sessions.write().remove(&session_id);
        if removed.is_none() {
            return Err(ApiError::Unauthorized);
        }
        info!(session_id, "session logged out");
        Ok(())
    }

    /// Replaces the UserConfig and clears the mailbox (prior events were
    /// evaluated under the old filters — spec's explicit resolution of the
    /// updateConfig/clear-mailbox open question).
    pub fn update_config(&self, session_id: SessionId, config: UserConfig) -> Result<(), ApiError> {
        let sessions = self.sessions.read();
        let Some(slot) = sessions.get(&session_id) else {
            return Err(ApiError::Unauthorized);
        };
        let mut inner = slot.lock();
        inner.config = config;
        inner.last_activity = Instant::now();
        inner.mailbox.clear();
        inner.overflow_flag = false;
        Ok(())
    }

    /// Drain the mailbox, returning its contents and whether overflow was
    /// flagged since the previous drain.
    pub fn poll_detect(&self, session_id: SessionId) -> Result<(Vec<DetectEvent>, bool), ApiError> {
        let sessions = self.sessions.read();
        let Some(slot) = sessions.get(&session_id) else {
            return Err(ApiError::Unauthorized);
        };
        let mut inner = slot.lock();
        inner.last_activity = Instant::now();
        let events = std::mem::take(&mut inner.mailbox);
        let was_full = inner.overflow_flag;
        inner.overflow_flag = false;
        Ok((events, was_full))
    }

    pub fn touch(&self, session_id: SessionId) -> Result<(), ApiError> {
        let sessions = self.sessions.read();
        let Some(slot) = sessions.get(&session_id) else {
            return Err(ApiError::Unauthorized);
        };
        slot.lock().last_activity = Instant::now();
        Ok(())
    }

    /// `true` if `session_id` is online; used by the detector to avoid
    /// evaluating filters for sessions that vanished mid-sweep.
    pub fn is_online(&self, session_id: SessionId) -> bool {
        self.sessions.read().contains_key(&session_id)
    }

    /// Snapshot of `(sessionId, UserConfig)` for every session subscribed
    /// to `venue_id` — used by the Detector (§4.E step 2). The config is
    /// cloned so later `updateConfig` calls never retroactively affect an
    /// in-flight evaluation (§8 invariant 6).
    pub fn snapshot_subscribed(&self, venue_id: &str) -> Vec<(SessionId, UserConfig)> {
        self.sessions
            .read()
            .iter()
            .filter_map(|(id, slot)| {
                let inner = slot.lock();
                if inner.config.subscribed_venues.contains(venue_id) {
                    Some((*id, inner.config.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Enqueue a detect event into a session's mailbox. Caps at
    /// `MAILBOX_CAP`; on the event that would be the 6th, sets
    /// `overflow_flag` and drops it instead of enqueuing.
    pub fn enqueue(&self, session_id: SessionId, event: DetectEvent) {
        let sessions = self.sessions.read();
        let Some(slot) = sessions.get(&session_id) else {
            return;
        };
        let mut inner = slot.lock();
        if inner.mailbox.len() >= MAILBOX_CAP {
            inner.overflow_flag = true;
            return;
        }
        inner.mailbox.push(event);
    }

    pub fn users_online(&self) -> Vec<String> {
        self.sessions.read().values().map(|s| s.lock().user_name.clone()).collect()
    }

    /// Snapshot every online session's current config as a `User` record,
    /// for the periodic persistence flush (§3 "flushed every 60s").
    pub fn dirty_snapshot(&self) -> Vec<User> {
        let now = chrono::Utc::now();
        self.sessions
            .read()
            .values()
            .map(|slot| {
                let inner = slot.lock();
                User {
                    name: inner.user_name.clone(),
                    password: inner.password.clone(),
                    config: inner.config.clone(),
                    last_login: now,
                }
            })
            .collect()
    }

    /// The underlying persistence collaborator, for callers (the flush loop)
    /// that need it outside the registry's own API.
    pub fn users_store(&self) -> &dyn UserStore {
        self.users.as_ref()
    }

    /// Evict every session idle for longer than `IDLE_TIMEOUT`. Intended to
    /// run every 60s from a background task (§4.F/§5).
    pub fn sweep_idle(&self) {
        let mut sessions = self.sessions.write();
        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, slot)| slot.lock().last_activity.elapsed() > IDLE_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            sessions.remove(&id);
            info!(session_id = id, "session evicted by idle sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryUserStore;
    use crate::types::{Filter, KLine, KLineId, KLineInterval};

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Box::new(InMemoryUserStore::new()), true)
    }

    fn sample_event(id: &KLineId) -> DetectEvent {
        let k = KLine::new(id.clone(), 60_000, 100.0, 103.0, 100.0, 101.0, 10.0, 1000.0).unwrap();
        DetectEvent {
            kline_id: id.clone(),
            triggering_candle: k,
            history_tail: Vec::new(),
            review_tail: Vec::new(),
            filter_activated: Filter::Delta {
                min: 0.0,
                max: 1.0,
                interval: KLineInterval::Min1,
                include: None,
                exclude: None,
            },
        }
    }

    #[tokio::test]
    async fn login_creates_provisional_user_and_session() {
        let reg = registry();
        let (sid, cfg) = reg.login("alice", "pw").await.unwrap();
        assert!(sid > 0);
        assert_eq!(cfg, UserConfig::default());
        assert!(reg.is_online(sid));
    }

    #[tokio::test]
    async fn login_rejects_bad_password_for_known_user() {
        let reg = registry();
        let (_, _) = reg.login("alice", "pw").await.unwrap();
        reg.logout(reg.sessions.read().keys().next().copied().unwrap()).unwrap();
        let result = reg.login("alice", "wrong").await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn update_config_clears_mailbox() {
        let reg = registry();
        let (sid, _) = reg.login("alice", "pw").await.unwrap();
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        reg.enqueue(sid, sample_event(&id));
        reg.update_config(sid, UserConfig::default()).unwrap();
        let (events, overflow) = reg.poll_detect(sid).unwrap();
        assert!(events.is_empty());
        assert!(!overflow);
    }

    #[tokio::test]
    async fn mailbox_caps_at_five_and_flags_overflow() {
        let reg = registry();
        let (sid, _) = reg.login("alice", "pw").await.unwrap();
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        for _ in 0..7 {
            reg.enqueue(sid, sample_event(&id));
        }
        let (events, overflow) = reg.poll_detect(sid).unwrap();
        assert_eq!(events.len(), MAILBOX_CAP);
        assert!(overflow);
        let (events2, overflow2) = reg.poll_detect(sid).unwrap();
        assert_eq!(events2.len(), 0);
        assert!(!overflow2);
    }

    #[tokio::test]
    async fn idle_sweep_evicts_after_timeout() {
        let reg = registry();
        let (sid, _) = reg.login("alice", "pw").await.unwrap();
        {
            let sessions = reg.sessions.read();
            let mut inner = sessions.get(&sid).unwrap().lock();
            inner.last_activity = Instant::now() - Duration::from_secs(61);
        }
        reg.sweep_idle();
        assert!(!reg.is_online(sid));
    }
}
