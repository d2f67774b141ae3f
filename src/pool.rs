//! Bounded pool of headless browser instances.
//!
//! Browser processes are scarce, reusable, mutable resources. The pool
//! hands them out through RAII leases so release runs on every exit path,
//! keeps at most `max_browsers` alive, and sweeps idle instances once a
//! minute. One `std::sync::Mutex` guards the slot list; browser OS work
//! (launch, close) always happens outside the lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ctx::TrackContext;
use crate::error::TrackError;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct BrowserPoolOptions {
    /// Hard cap on live browser processes.
    pub max_browsers: usize,
    /// Idle instances beyond this are destroyed by the sweeper.
    pub max_idle: usize,
    /// Idle instances older than this are destroyed by the sweeper.
    pub idle_timeout: Duration,
    /// Per-operation budget; composed with the caller's deadline as a min.
    pub operation_timeout: Duration,
    /// Custom Chrome executable (overrides the CHROME_PATH env var).
    pub chrome_path: Option<std::path::PathBuf>,
}

impl Default for BrowserPoolOptions {
    fn default() -> Self {
        Self {
            max_browsers: 3,
            max_idle: 1,
            idle_timeout: Duration::from_secs(300),
            operation_timeout: Duration::from_secs(90),
            chrome_path: None,
        }
    }
}

/// A launched browser process plus its CDP event-handler task.
pub struct BrowserHandle {
    id: u64,
    browser: Mutex<Browser>,
    handler_task: JoinHandle<()>,
}

impl BrowserHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn new_page(&self, url: &str) -> Result<Page, TrackError> {
        let browser = self.browser.lock().await;
        browser
            .new_page(url)
            .await
            .map_err(|e| TrackError::Browser(format!("failed to open page: {}", e)))
    }

    async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            tracing::warn!(browser = self.id, "failed to close browser: {}", e);
        }
        self.handler_task.abort();
    }
}

struct Slot {
    handle: Arc<BrowserHandle>,
    last_used: Instant,
    in_use: bool,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    /// Launches in flight, counted against `max_browsers` so concurrent
    /// `get` calls cannot overshoot the cap.
    launching: usize,
}

struct PoolShared {
    options: BrowserPoolOptions,
    state: StdMutex<PoolState>,
    closed: AtomicBool,
    next_id: AtomicU64,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

/// Pool statistics snapshot, taken without any OS work under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub in_use: usize,
    pub idle: usize,
    pub max_browsers: usize,
}

/// Scoped checkout of one pooled browser. Dropping the lease returns the
/// instance (or destroys it, when the pool has closed underneath it).
pub struct BrowserLease {
    shared: Arc<PoolShared>,
    handle: Arc<BrowserHandle>,
}

impl BrowserLease {
    pub fn handle(&self) -> Arc<BrowserHandle> {
        Arc::clone(&self.handle)
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        let id = self.handle.id;
        let destroy = {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            if self.shared.closed.load(Ordering::SeqCst) {
                state.slots.retain(|slot| slot.handle.id != id);
                true
            } else {
                match state.slots.iter_mut().find(|slot| slot.handle.id == id) {
                    Some(slot) => {
                        slot.in_use = false;
                        slot.last_used = Instant::now();
                        false
                    }
                    None => true,
                }
            }
        };
        if destroy {
            let handle = Arc::clone(&self.handle);
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { handle.shutdown().await });
            }
        }
    }
}

#[derive(Clone)]
pub struct BrowserPool {
    shared: Arc<PoolShared>,
}

impl BrowserPool {
    pub fn new(options: BrowserPoolOptions) -> Self {
        let shared = Arc::new(PoolShared {
            options,
            state: StdMutex::new(PoolState::default()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            sweeper: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                let victims = collect_idle_victims(&shared);
                for victim in victims {
                    tracing::debug!(browser = victim.id, "sweeping idle browser");
                    victim.shutdown().await;
                }
            }
        });
        *shared.sweeper.lock().expect("pool lock poisoned") = Some(sweeper);

        Self { shared }
    }

    /// Check out a browser. Fails fast with `PoolExhausted` when all
    /// instances are busy and the pool is at capacity; never blocks waiting
    /// for a peer to release.
    pub async fn get(&self, ctx: &TrackContext) -> Result<BrowserLease, TrackError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TrackError::PoolClosed);
        }
        ctx.checkpoint()?;

        {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            if let Some(slot) = state.slots.iter_mut().find(|slot| !slot.in_use) {
                slot.in_use = true;
                slot.last_used = Instant::now();
                return Ok(BrowserLease {
                    shared: Arc::clone(&self.shared),
                    handle: Arc::clone(&slot.handle),
                });
            }
            if state.slots.len() + state.launching >= self.shared.options.max_browsers {
                return Err(TrackError::PoolExhausted);
            }
            state.launching += 1;
        }

        let launched = self.launch_instance(ctx).await;

        {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            state.launching -= 1;
        }
        let handle = launched?;

        if self.shared.closed.load(Ordering::SeqCst) {
            handle.shutdown().await;
            return Err(TrackError::PoolClosed);
        }

        {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            state.slots.push(Slot {
                handle: Arc::clone(&handle),
                last_used: Instant::now(),
                in_use: true,
            });
        }
        Ok(BrowserLease {
            shared: Arc::clone(&self.shared),
            handle,
        })
    }

    /// Return a checked-out browser. Equivalent to dropping the lease.
    pub fn put(&self, lease: BrowserLease) {
        drop(lease);
    }

    /// Acquire, run, release — release guaranteed on every exit path,
    /// including cancellation and panics, via the lease guard. The
    /// operation runs under `min(ctx deadline, operation_timeout)`.
    pub async fn execute<F, Fut, T>(&self, ctx: &TrackContext, f: F) -> Result<T, TrackError>
    where
        F: FnOnce(Arc<BrowserHandle>) -> Fut,
        Fut: std::future::Future<Output = Result<T, TrackError>>,
    {
        let op_ctx = ctx.bounded(self.shared.options.operation_timeout);
        let lease = self.get(&op_ctx).await?;
        let handle = lease.handle();
        // The lease drops (and releases) whether the operation resolves,
        // times out, or unwinds.
        op_ctx.run(f(handle)).await
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().expect("pool lock poisoned");
        let in_use = state.slots.iter().filter(|slot| slot.in_use).count();
        PoolStats {
            live: state.slots.len() + state.launching,
            in_use,
            idle: state.slots.len() - in_use,
            max_browsers: self.shared.options.max_browsers,
        }
    }

    /// Shut the pool down. Idempotent; after closing, `get` fails with
    /// `PoolClosed` and outstanding leases destroy their instances on drop.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.shared.sweeper.lock().expect("pool lock poisoned").take() {
            task.abort();
        }
        let victims: Vec<Arc<BrowserHandle>> = {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            state
                .slots
                .drain(..)
                .filter(|slot| !slot.in_use)
                .map(|slot| slot.handle)
                .collect()
        };
        for victim in victims {
            victim.shutdown().await;
        }
        tracing::debug!("browser pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn launch_instance(&self, ctx: &TrackContext) -> Result<Arc<BrowserHandle>, TrackError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let config = build_browser_config(&self.shared.options)?;

        tracing::debug!(browser = id, "launching browser instance");
        let (browser, mut handler) = ctx
            .run(async {
                Browser::launch(config)
                    .await
                    .map_err(|e| TrackError::Browser(format!("failed to launch browser: {}", e)))
            })
            .await?;

        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(Arc::new(BrowserHandle {
            id,
            browser: Mutex::new(browser),
            handler_task,
        }))
    }
}

fn collect_idle_victims(shared: &Arc<PoolShared>) -> Vec<Arc<BrowserHandle>> {
    let mut state = shared.state.lock().expect("pool lock poisoned");
    let now = Instant::now();
    let idle_timeout = shared.options.idle_timeout;

    let mut victims = Vec::new();
    let mut keep = Vec::with_capacity(state.slots.len());
    for slot in state.slots.drain(..) {
        if !slot.in_use && now.duration_since(slot.last_used) > idle_timeout {
            victims.push(slot.handle);
        } else {
            keep.push(slot);
        }
    }

    // Oldest idle instances beyond the idle cap go too.
    let mut idle: Vec<usize> = keep
        .iter()
        .enumerate()
        .filter(|(_, slot)| !slot.in_use)
        .map(|(i, _)| i)
        .collect();
    idle.sort_by_key(|&i| keep[i].last_used);
    let excess = idle.len().saturating_sub(shared.options.max_idle);
    let mut evict: Vec<usize> = idle.into_iter().take(excess).collect();
    evict.sort_unstable_by(|a, b| b.cmp(a));
    for i in evict {
        victims.push(keep.remove(i).handle);
    }

    state.slots = keep;
    victims
}

fn build_browser_config(options: &BrowserPoolOptions) -> Result<BrowserConfig, TrackError> {
    let mut builder = BrowserConfig::builder()
        .arg("--disable-gpu")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--metrics-recording-only")
        .arg("--no-first-run")
        .arg("--mute-audio")
        .arg("--window-size=1920,1080");

    // Chrome path: options take precedence over the env var.
    if let Some(ref chrome_path) = options.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    } else if let Ok(chrome_path) = std::env::var("CHROME_PATH") {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(|e| TrackError::Browser(format!("failed to build browser config: {}", e)))
}

/// Startup probe: spin a short-lived instance and load `about:blank` under
/// a 10 second deadline. Any failure means the headless path is not
/// available on this host.
pub async fn validate_browser_available() -> Result<(), TrackError> {
    let ctx = TrackContext::with_timeout(VALIDATE_TIMEOUT);
    let config = build_browser_config(&BrowserPoolOptions::default())?;

    let (mut browser, mut handler) = ctx
        .run(async {
            Browser::launch(config)
                .await
                .map_err(|e| TrackError::Browser(format!("browser not available: {}", e)))
        })
        .await?;
    let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

    let probe = ctx
        .run(async {
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| TrackError::Browser(format!("browser not available: {}", e)))
        })
        .await;

    if let Err(e) = browser.close().await {
        tracing::warn!("failed to close validation browser: {}", e);
    }
    handler_task.abort();

    probe.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = BrowserPoolOptions::default();
        assert_eq!(options.max_browsers, 3);
        assert!(options.max_idle <= options.max_browsers);
        assert!(options.idle_timeout > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_stats_on_empty_pool() {
        let pool = BrowserPool::new(BrowserPoolOptions::default());
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_get() {
        let pool = BrowserPool::new(BrowserPoolOptions::default());
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());

        let ctx = TrackContext::new();
        let result = pool.get(&ctx).await;
        assert!(matches!(result, Err(TrackError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_get_honours_cancellation() {
        let pool = BrowserPool::new(BrowserPoolOptions::default());
        let ctx = TrackContext::new();
        ctx.cancel();
        let result = pool.get(&ctx).await;
        assert!(matches!(result, Err(TrackError::Cancelled)));
        pool.close().await;
    }
}
