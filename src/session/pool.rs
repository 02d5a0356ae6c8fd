//! Fixed-capacity pool of computer handles.
//!
//! Handles are lease-exclusive: at most one session owns a handle at a time.
//! The pool's map is guarded by a mutex held only across map mutations,
//! never across provisioner I/O.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

use crate::computer::{Computer, ComputerSpec, Provisioner};
use crate::error::AgentError;

struct PoolInner {
    idle: Vec<Arc<dyn Computer>>,
    in_use: usize,
}

pub struct ComputerPool {
    provisioner: Arc<dyn Provisioner>,
    inner: Mutex<PoolInner>,
    returned: Notify,
    max_size: usize,
    acquire_timeout: Duration,
}

impl ComputerPool {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        max_size: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            provisioner,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                in_use: 0,
            }),
            returned: Notify::new(),
            max_size,
            acquire_timeout,
        }
    }

    /// Lease a handle matching `spec`: an idle match if one exists, a fresh
    /// one if there is capacity, otherwise wait until the timeout and fail
    /// with `PoolExhausted`.
    pub async fn acquire(&self, spec: &ComputerSpec) -> Result<Arc<dyn Computer>, AgentError> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            enum Plan {
                Reuse(Arc<dyn Computer>),
                Open,
                Wait,
            }

            let plan = {
                let mut inner = self.inner.lock().await;
                if let Some(pos) = inner.idle.iter().position(|h| spec.matches(h.as_ref())) {
                    let handle = inner.idle.remove(pos);
                    inner.in_use += 1;
                    Plan::Reuse(handle)
                } else if inner.idle.len() + inner.in_use < self.max_size {
                    // Reserve the slot before the (slow) open so concurrent
                    // acquires cannot oversubscribe.
                    inner.in_use += 1;
                    Plan::Open
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Reuse(handle) => {
                    tracing::debug!(name = %handle.name(), "reusing pooled computer");
                    return Ok(handle);
                }
                Plan::Open => match self.provisioner.open(spec).await {
                    Ok(handle) => return Ok(handle),
                    Err(e) => {
                        self.inner.lock().await.in_use -= 1;
                        self.returned.notify_waiters();
                        return Err(e.into());
                    }
                },
                Plan::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(AgentError::PoolExhausted);
                    }
                    if tokio::time::timeout(remaining, self.returned.notified())
                        .await
                        .is_err()
                    {
                        return Err(AgentError::PoolExhausted);
                    }
                }
            }
        }
    }

    /// Return a leased handle; it becomes reusable for matching specs.
    pub async fn release(&self, handle: Arc<dyn Computer>) {
        {
            let mut inner = self.inner.lock().await;
            inner.in_use = inner.in_use.saturating_sub(1);
            inner.idle.push(handle);
        }
        self.returned.notify_waiters();
    }

    /// Whether an acquire would succeed right now without waiting. Drives
    /// the health probe.
    pub async fn can_acquire(&self) -> bool {
        let inner = self.inner.lock().await;
        !inner.idle.is_empty() || inner.idle.len() + inner.in_use < self.max_size
    }

    /// Close every idle handle. Safe to call repeatedly; each handle is
    /// closed at most once because draining removes it from the pool.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<dyn Computer>> = {
            let mut inner = self.inner.lock().await;
            inner.idle.drain(..).collect()
        };
        let mut seen = HashSet::new();
        for handle in drained {
            if !seen.insert(handle.name().to_string()) {
                continue;
            }
            if let Err(e) = self.provisioner.close(handle).await {
                tracing::warn!(error = %e, "error closing pooled computer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computer::{ComputerError, OsType};
    use crate::schema::{MouseButton, Point};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubComputer {
        name: String,
    }

    #[async_trait]
    impl Computer for StubComputer {
        async fn screenshot(&self) -> Result<Vec<u8>, ComputerError> {
            Ok(vec![])
        }
        async fn dimensions(&self) -> Result<(u32, u32), ComputerError> {
            Ok((1024, 768))
        }
        async fn left_click(&self, _x: i64, _y: i64) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn right_click(&self, _x: i64, _y: i64) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn double_click(&self, _x: i64, _y: i64) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn move_cursor(&self, _x: i64, _y: i64) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn mouse_down(
            &self,
            _x: i64,
            _y: i64,
            _button: MouseButton,
        ) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn mouse_up(
            &self,
            _x: i64,
            _y: i64,
            _button: MouseButton,
        ) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn drag(
            &self,
            _path: &[Point],
            _button: MouseButton,
            _duration_ms: u64,
        ) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn scroll(
            &self,
            _x: i64,
            _y: i64,
            _sx: i64,
            _sy: i64,
        ) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn type_text(&self, _text: &str) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn press_keys(&self, _keys: &[String]) -> Result<(), ComputerError> {
            Ok(())
        }
        async fn wait(&self, _ms: u64) -> Result<(), ComputerError> {
            Ok(())
        }
        fn os_type(&self) -> OsType {
            OsType::Linux
        }
        fn provider_type(&self) -> &str {
            "cloud"
        }
        fn name(&self) -> &str {
            &self.name
        }
    }

    struct CountingProvisioner {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl Provisioner for CountingProvisioner {
        async fn open(&self, _spec: &ComputerSpec) -> Result<Arc<dyn Computer>, ComputerError> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubComputer {
                name: format!("vm-{n}"),
            }))
        }

        async fn close(&self, _handle: Arc<dyn Computer>) -> Result<(), ComputerError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool_of(size: usize, timeout: Duration) -> (Arc<ComputerPool>, Arc<CountingProvisioner>) {
        let provisioner = Arc::new(CountingProvisioner {
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        (
            Arc::new(ComputerPool::new(
                Arc::clone(&provisioner) as Arc<dyn Provisioner>,
                size,
                timeout,
            )),
            provisioner,
        )
    }

    #[tokio::test]
    async fn reuses_released_handles() {
        let (pool, provisioner) = pool_of(2, Duration::from_millis(50));
        let spec = ComputerSpec::default();

        let first = pool.acquire(&spec).await.unwrap();
        let name = first.name().to_string();
        pool.release(first).await;

        let second = pool.acquire(&spec).await.unwrap();
        assert_eq!(second.name(), name);
        assert_eq!(provisioner.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_times_out_with_pool_exhausted() {
        let (pool, _) = pool_of(1, Duration::from_millis(30));
        let spec = ComputerSpec::default();

        let _held = pool.acquire(&spec).await.unwrap();
        let err = pool.acquire(&spec).await.err().unwrap();
        assert!(matches!(err, AgentError::PoolExhausted));
    }

    #[tokio::test]
    async fn waiting_acquire_wakes_on_release() {
        let (pool, _) = pool_of(1, Duration::from_secs(5));
        let spec = ComputerSpec::default();

        let held = pool.acquire(&spec).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            let spec = spec.clone();
            tokio::spawn(async move { pool.acquire(&spec).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.release(held).await;

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.name(), "vm-0");
    }

    #[tokio::test]
    async fn named_spec_does_not_reuse_other_names() {
        let (pool, provisioner) = pool_of(2, Duration::from_millis(50));
        let anon = ComputerSpec::default();

        let first = pool.acquire(&anon).await.unwrap();
        pool.release(first).await;

        let named = ComputerSpec {
            name: Some("vm-77".to_string()),
            ..Default::default()
        };
        let second = pool.acquire(&named).await.unwrap();
        assert_eq!(second.name(), "vm-1");
        assert_eq!(provisioner.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_once() {
        let (pool, provisioner) = pool_of(2, Duration::from_millis(50));
        let spec = ComputerSpec::default();
        let handle = pool.acquire(&spec).await.unwrap();
        pool.release(handle).await;

        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(provisioner.closed.load(Ordering::SeqCst), 1);
    }
}
