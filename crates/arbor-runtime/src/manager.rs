//! Session lifecycle and supervision.
//!
//! Each session runs under its own supervisor task. A panic inside the
//! session actor is caught, the crashed incarnation's capabilities are
//! revoked and its workers cancelled, and a fresh incarnation is started from
//! persisted state. The mailbox outlives incarnations, so messages sent
//! during a restart are handled by the new one. Crashing more than
//! `max_restarts` times within `window_ms` marks the session `error`.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use arbor_protocol::{
    AgentId, AgentState, EventKind, ProtocolError, ResourceUri, SessionId, SessionOptions,
    SessionStatus, validate_id,
};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::error::SessionError;
use crate::session::{Session, SessionCommand, SessionHandle, SessionSeed, reject_pending};
use crate::{RuntimeServices, panic_message};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    pub max_restarts: u32,
    pub window_ms: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window_ms: 5_000,
        }
    }
}

impl SupervisionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

struct ManagedSession {
    handle: SessionHandle,
    supervisor: JoinHandle<()>,
}

/// Owns every live session handle.
pub struct SessionManager {
    services: Arc<RuntimeServices>,
    sessions: RwLock<HashMap<SessionId, ManagedSession>>,
}

impl SessionManager {
    pub fn new(services: Arc<RuntimeServices>) -> Self {
        Self {
            services,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.services
    }

    /// Start a supervised session and wait until it is up. A session id that
    /// ended in `error` may be started again; a live one may not.
    #[instrument(skip(self, options), fields(%session_id, owner = %options.owner))]
    pub async fn start_session(
        &self,
        session_id: SessionId,
        options: SessionOptions,
    ) -> Result<SessionHandle, SessionError> {
        validate_id(session_id.as_str())?;
        if session_id == SessionId::system() {
            return Err(ProtocolError::InvalidId(format!("`{session_id}` is reserved")).into());
        }
        for grant in &options.grants {
            ResourceUri::parse(grant)?;
        }

        let handle = {
            let mut sessions = self.sessions.write();
            if sessions
                .get(&session_id)
                .is_some_and(|existing| !existing.handle.status().is_terminal())
            {
                return Err(SessionError::AlreadyExists(session_id));
            }

            // A stopped session closed its topic; the new one publishes there again.
            self.services.bus.reopen_topic(&session_id.topic());
            let (mailbox_tx, mailbox_rx) =
                mpsc::channel(self.services.session.mailbox_capacity.max(1));
            let (status_tx, status_rx) = watch::channel(SessionStatus::Starting);
            let failure = Arc::new(Mutex::new(None));
            let agent_id = AgentId::from_string(session_id.as_str());
            let handle = SessionHandle::new(
                session_id.clone(),
                agent_id.clone(),
                mailbox_tx.clone(),
                status_rx,
                failure.clone(),
            );
            let seed = Arc::new(SessionSeed {
                services: self.services.clone(),
                session_id: session_id.clone(),
                agent_id,
                options,
                mailbox: mailbox_tx.downgrade(),
                status: status_tx,
            });
            let supervisor = tokio::spawn(supervise(seed, mailbox_rx, failure));
            sessions.insert(
                session_id.clone(),
                ManagedSession {
                    handle: handle.clone(),
                    supervisor,
                },
            );
            handle
        };

        match handle
            .wait_for_status(|status| status != SessionStatus::Starting, STARTUP_TIMEOUT)
            .await
        {
            Some(SessionStatus::Error) | Some(SessionStatus::Terminated) => {
                Err(SessionError::Failed {
                    session_id,
                    reason: handle
                        .failure_reason()
                        .unwrap_or_else(|| "session did not start".to_owned()),
                })
            }
            Some(_) => {
                info!("session started");
                Ok(handle)
            }
            None => Err(SessionError::Failed {
                session_id,
                reason: format!("session did not start within {STARTUP_TIMEOUT:?}"),
            }),
        }
    }

    /// Stop a session: cancel its workers, persist its final state, revoke its
    /// capabilities, and forget it.
    #[instrument(skip(self), fields(%session_id))]
    pub async fn stop_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let handle = self.lookup(session_id)?;
        let result = if handle.status().is_terminal() {
            Ok(())
        } else {
            handle.stop("stopped on request").await
        };
        let managed = self.sessions.write().remove(session_id);
        if let Some(managed) = managed {
            let _ = managed.supervisor.await;
        }
        self.services.bus.close_topic(&session_id.topic());
        result
    }

    pub fn lookup(&self, session_id: &SessionId) -> Result<SessionHandle, SessionError> {
        self.sessions
            .read()
            .get(session_id)
            .map(|managed| managed.handle.clone())
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    pub fn list(&self) -> Vec<(SessionId, SessionStatus)> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .iter()
            .map(|(session_id, managed)| (session_id.clone(), managed.handle.status()))
            .collect();
        sessions.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        sessions
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        let session_ids: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        for session_id in session_ids {
            if let Err(error) = self.stop_session(&session_id).await {
                warn!(%session_id, %error, "session did not stop cleanly");
            }
        }
    }
}

async fn supervise(
    seed: Arc<SessionSeed>,
    mut mailbox: mpsc::Receiver<SessionCommand>,
    failure: Arc<Mutex<Option<String>>>,
) {
    let session_id = seed.session_id.clone();
    let window = seed.services.supervision.window();
    let max_restarts = seed.services.supervision.max_restarts;
    let mut crashes: VecDeque<Instant> = VecDeque::new();
    let mut attempt = 0_u32;

    loop {
        let session = match Session::start(seed.clone(), attempt > 0).await {
            Ok(session) => session,
            Err(error) => {
                fail(&seed, &failure, format!("start failed: {error}"));
                break;
            }
        };
        let incarnation = session.cancel_token();
        let outcome = AssertUnwindSafe(session.run(&mut mailbox))
            .catch_unwind()
            .await;
        incarnation.cancel();
        let Err(panic) = outcome else {
            break;
        };

        let reason = panic_message(panic);
        error!(%session_id, %reason, "session crashed");
        seed.services
            .registry
            .terminate(&seed.agent_id, AgentState::Error);
        if seed.status() == SessionStatus::Stopping {
            fail(&seed, &failure, format!("crashed while stopping: {reason}"));
            break;
        }

        let now = Instant::now();
        while crashes
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            crashes.pop_front();
        }
        if crashes.len() >= max_restarts as usize {
            fail(
                &seed,
                &failure,
                format!("restart limit of {max_restarts} within {window:?} reached; last crash: {reason}"),
            );
            break;
        }
        crashes.push_back(now);
        attempt += 1;
        seed.set_status(SessionStatus::Starting);
        seed.publish(EventKind::SessionRestarted {
            session_id: session_id.clone(),
            attempt,
            reason,
        });
        warn!(%session_id, attempt, "restarting session");
    }

    let status = seed.status();
    let failed = failure.lock().clone();
    reject_pending(&mut mailbox, || match &failed {
        Some(reason) => SessionError::Failed {
            session_id: session_id.clone(),
            reason: reason.clone(),
        },
        None => SessionError::NotAccepting {
            session_id: session_id.clone(),
            status,
        },
    });
}

fn fail(seed: &SessionSeed, failure: &Mutex<Option<String>>, reason: String) {
    error!(session_id = %seed.session_id, %reason, "session failed");
    *failure.lock() = Some(reason.clone());
    seed.services
        .registry
        .terminate(&seed.agent_id, AgentState::Error);
    seed.set_status(SessionStatus::Error);
    seed.publish(EventKind::SessionFailed {
        session_id: seed.session_id.clone(),
        reason,
    });
}
