//! Client-side registry of publications and the term cleaning duty cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{PublicationConfig, RegistrationId};
use crate::descriptor::TermStatus;
use crate::error::TermResult;
use crate::flow_control::PositionIndicator;
use crate::fs::TermLayout;
use crate::idle::{IdleStrategy, SleepingIdleStrategy};
use crate::publication::{Publication, PublicationKey, PublicationRegistry};
use crate::term_buffer::TermBuffers;

struct RegisteredPublication {
    registration_id: RegistrationId,
    publication: Weak<Publication>,
}

struct ConductorState {
    lifecycle: Mutex<()>,
    // One cleaning pass at a time; a term is only zeroed while it still needs cleaning.
    duty_cycle: Mutex<()>,
    publications: Mutex<HashMap<PublicationKey, RegisteredPublication>>,
}

impl ConductorState {
    fn live_publications(&self) -> Vec<Arc<Publication>> {
        let mut publications = self.publications.lock();
        publications.retain(|_, entry| entry.publication.strong_count() > 0);
        publications
            .values()
            .filter_map(|entry| entry.publication.upgrade())
            .collect()
    }

    fn do_work(&self) -> usize {
        let _duty_cycle = self.duty_cycle.lock();
        let mut cleaned = 0;
        for publication in self.live_publications() {
            let Some(terms) = publication.term_buffers() else {
                continue;
            };
            for (index, term) in terms.iter().enumerate() {
                if term.status() == TermStatus::NeedsCleaning {
                    term.clean();
                    cleaned += 1;
                    debug!(
                        registration_id = %publication.registration_id(),
                        term_index = index,
                        "cleaned term"
                    );
                }
            }
        }
        cleaned
    }
}

impl PublicationRegistry for ConductorState {
    fn lifecycle_lock(&self) -> &Mutex<()> {
        &self.lifecycle
    }

    fn release_publication(&self, registration_id: RegistrationId) {
        let mut publications = self.publications.lock();
        let before = publications.len();
        publications.retain(|_, entry| entry.registration_id != registration_id);
        if publications.len() == before {
            warn!(%registration_id, "release of unknown publication");
        }
    }
}

/// Hands out publications and keeps their terms cleaned.
///
/// Publications are keyed by channel, stream and session. Adding a publication
/// that is still live returns the existing handle with one more reference; each
/// reference is given back with [`Publication::close`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use bop_term::{AtomicPosition, ClientConductor, PublicationConfig};
///
/// let conductor = ClientConductor::new(PublicationConfig {
///     term_buffer_length: 64 * 1024,
///     mtu_length: 1408,
///     ..PublicationConfig::default()
/// })
/// .expect("conductor");
/// let limit = Arc::new(AtomicPosition::new(1 << 20));
/// let publication = conductor
///     .add_publication("ipc", 10, 1, limit)
///     .expect("publication");
/// publication.offer(b"hello").expect("offer");
/// publication.close();
/// ```
pub struct ClientConductor {
    config: PublicationConfig,
    layout: Option<TermLayout>,
    state: Arc<ConductorState>,
    next_registration_id: AtomicI64,
}

impl ClientConductor {
    pub fn new(config: PublicationConfig) -> TermResult<Self> {
        config.validate()?;
        let layout = config.root_dir.clone().map(TermLayout::new);
        info!(%config, "client conductor started");
        Ok(Self {
            config,
            layout,
            state: Arc::new(ConductorState {
                lifecycle: Mutex::new(()),
                duty_cycle: Mutex::new(()),
                publications: Mutex::new(HashMap::new()),
            }),
            next_registration_id: AtomicI64::new(1),
        })
    }

    pub fn config(&self) -> &PublicationConfig {
        &self.config
    }

    /// Returns the live publication for this channel, stream and session, or
    /// creates one reading `limit` as its flow-control limit.
    ///
    /// A reused publication keeps the limit it was created with.
    pub fn add_publication(
        &self,
        channel: &str,
        stream_id: i32,
        session_id: i32,
        limit: Arc<dyn PositionIndicator>,
    ) -> TermResult<Arc<Publication>> {
        let lifecycle = self.state.lifecycle.lock();
        let key = PublicationKey {
            channel: channel.to_string(),
            stream_id,
            session_id,
        };

        let existing = self
            .state
            .publications
            .lock()
            .get(&key)
            .and_then(|entry| entry.publication.upgrade());
        if let Some(publication) = existing {
            if publication.inc_ref_locked(&lifecycle).is_ok() {
                info!(
                    registration_id = %publication.registration_id(),
                    channel,
                    stream_id,
                    session_id,
                    ref_count = publication.ref_count(),
                    "reused publication"
                );
                return Ok(publication);
            }
        }

        let registration_id =
            RegistrationId::new(self.next_registration_id.fetch_add(1, Ordering::Relaxed));
        let initial_term_id = self
            .config
            .initial_term_id
            .unwrap_or_else(rand::random::<i32>);
        let capacity = self.config.term_buffer_length;
        let terms = match &self.layout {
            Some(layout) => TermBuffers::create_files(
                layout,
                channel,
                stream_id,
                session_id,
                registration_id,
                capacity,
                self.config.unlink_on_release,
            )?,
            None => TermBuffers::anonymous(capacity)?,
        };

        let registry: Arc<dyn PublicationRegistry> = self.state.clone();
        let publication = Arc::new(Publication::new(
            registry,
            channel,
            stream_id,
            session_id,
            registration_id,
            initial_term_id,
            self.config.mtu_length,
            terms,
            limit,
        )?);
        self.state.publications.lock().insert(
            key,
            RegisteredPublication {
                registration_id,
                publication: Arc::downgrade(&publication),
            },
        );
        info!(
            %registration_id,
            channel,
            stream_id,
            session_id,
            initial_term_id,
            term_buffer_length = capacity,
            "added publication"
        );
        Ok(publication)
    }

    /// Number of registered publications still alive.
    pub fn publication_count(&self) -> usize {
        self.state.live_publications().len()
    }

    /// One cleaning pass: zeroes every term waiting to be cleaned. Returns the
    /// number of terms cleaned.
    pub fn do_work(&self) -> usize {
        self.state.do_work()
    }

    /// Runs [`do_work`] on a background thread until the handle is stopped or dropped.
    ///
    /// [`do_work`]: ClientConductor::do_work
    pub fn spawn_cleaner<I>(&self, mut idle: I) -> TermResult<CleanerHandle>
    where
        I: IdleStrategy + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::clone(&self.state);
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("bop-term-cleaner".to_string())
            .spawn(move || {
                debug!("term cleaner started");
                while flag.load(Ordering::Acquire) {
                    let work = state.do_work();
                    idle.idle(work);
                }
                debug!("term cleaner stopped");
            })?;
        Ok(CleanerHandle {
            running,
            thread: Some(thread),
        })
    }

    /// Cleaner thread idling for `cleaner_idle_ms` between passes that found nothing.
    pub fn spawn_default_cleaner(&self) -> TermResult<CleanerHandle> {
        self.spawn_cleaner(SleepingIdleStrategy::new(Duration::from_millis(
            self.config.cleaner_idle_ms,
        )))
    }
}

impl std::fmt::Debug for ClientConductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConductor")
            .field("config", &self.config)
            .field("publications", &self.state.publications.lock().len())
            .finish()
    }
}

/// Background cleaner; stops and joins on drop.
#[derive(Debug)]
pub struct CleanerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CleanerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("term cleaner thread panicked");
            }
        }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
