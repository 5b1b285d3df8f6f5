//! Network readiness wait using rtnetlink.
//!
//! The boot framework brings interfaces up asynchronously (`ip=dhcp`), so the
//! NBD connection would otherwise race against address and route
//! assignment. Each poll is a fresh netlink dump; nothing is cached.
//!
//! Timing out is advisory: some environments reach the server without a
//! default route (directly attached or link-local networks), so the
//! connection attempt is allowed to decide.

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use netlink_packet_route::address::AddressScope;
use nbdroot_shared::errors::{NbdrootError, NbdrootResult};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::outcome::{Stage, StageOutcome};
use crate::report::Diagnostics;

/// One observation of the network stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkState {
    /// Any address with universe scope
    pub has_global_address: bool,
    /// Any route with a zero-length destination prefix in the main table
    pub has_default_route: bool,
}

impl NetworkState {
    pub fn is_ready(&self) -> bool {
        self.has_global_address && self.has_default_route
    }
}

/// Source of network state samples.
#[async_trait]
pub trait NetworkObserver: Send + Sync {
    async fn sample(&self) -> NbdrootResult<NetworkState>;
}

/// Samples addresses and routes over a fresh netlink connection.
pub struct NetlinkObserver;

const RT_TABLE_MAIN: u8 = 254;

/// Link and host scoped addresses do not make the server reachable.
fn is_global(scope: AddressScope) -> bool {
    scope == AddressScope::Universe
}

#[async_trait]
impl NetworkObserver for NetlinkObserver {
    async fn sample(&self) -> NbdrootResult<NetworkState> {
        use rtnetlink::{new_connection, IpVersion};

        let (connection, handle, _) = new_connection().map_err(|e| {
            NbdrootError::Internal(format!("Failed to create netlink connection: {}", e))
        })?;

        // Ends once `handle` is dropped at the end of this sample
        tokio::spawn(connection);

        let mut state = NetworkState::default();

        let mut addrs = handle.address().get().execute();
        while let Some(addr) = addrs
            .try_next()
            .await
            .map_err(|e| NbdrootError::Internal(format!("Failed to get addresses: {}", e)))?
        {
            if is_global(addr.header.scope) {
                state.has_global_address = true;
                break;
            }
        }

        for version in [IpVersion::V4, IpVersion::V6] {
            let mut routes = handle.route().get(version).execute();
            while let Some(route) = routes
                .try_next()
                .await
                .map_err(|e| NbdrootError::Internal(format!("Failed to get routes: {}", e)))?
            {
                if route.header.destination_prefix_length == 0
                    && route.header.table == RT_TABLE_MAIN
                {
                    state.has_default_route = true;
                    break;
                }
            }
            if state.has_default_route {
                break;
            }
        }

        Ok(state)
    }
}

/// Polls until the network is ready or the deadline passes.
pub struct NetworkReadinessWaiter<'a> {
    observer: &'a dyn NetworkObserver,
    timeout: Duration,
    interval: Duration,
}

impl<'a> NetworkReadinessWaiter<'a> {
    pub fn new(observer: &'a dyn NetworkObserver, timeout: Duration, interval: Duration) -> Self {
        Self {
            observer,
            timeout,
            interval,
        }
    }

    /// Returns the last observed state; `Advisory` on timeout.
    pub async fn wait(&self, diag: &mut Diagnostics) -> StageOutcome<NetworkState> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut last = NetworkState::default();
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.observer.sample().await {
                Ok(state) => {
                    if state != last {
                        tracing::debug!(
                            global_address = state.has_global_address,
                            default_route = state.has_default_route,
                            "network state changed"
                        );
                    }
                    last = state;
                    if state.is_ready() {
                        diag.info(
                            Stage::Network,
                            format!(
                                "ready after {}ms ({} poll{})",
                                started.elapsed().as_millis(),
                                polls,
                                if polls == 1 { "" } else { "s" }
                            ),
                        );
                        return StageOutcome::Ok(state);
                    }
                }
                Err(e) => tracing::debug!("network sample failed: {}", e),
            }

            let now = Instant::now();
            if now >= deadline {
                diag.info(
                    Stage::Network,
                    format!(
                        "last state: global address={}, default route={}",
                        last.has_global_address, last.has_default_route
                    ),
                );
                return StageOutcome::Advisory(last, NbdrootError::NetworkTimedOut(self.timeout));
            }

            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Becomes ready on the `ready_at`-th sample (1-based); never if `None`.
    struct Scripted {
        ready_at: Option<usize>,
        samples: AtomicUsize,
    }

    #[async_trait]
    impl NetworkObserver for Scripted {
        async fn sample(&self) -> NbdrootResult<NetworkState> {
            let n = self.samples.fetch_add(1, Ordering::SeqCst) + 1;
            let ready = self.ready_at.is_some_and(|at| n >= at);
            Ok(NetworkState {
                has_global_address: n > 1 || ready,
                has_default_route: ready,
            })
        }
    }

    #[test]
    fn test_only_universe_scope_counts_as_global() {
        assert!(is_global(AddressScope::Universe));
        assert!(!is_global(AddressScope::Link));
        assert!(!is_global(AddressScope::Host));
        assert!(!is_global(AddressScope::Site));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_later_poll() {
        let observer = Scripted {
            ready_at: Some(4),
            samples: AtomicUsize::new(0),
        };
        let waiter = NetworkReadinessWaiter::new(
            &observer,
            Duration::from_secs(30),
            Duration::from_millis(500),
        );
        let mut diag = Diagnostics::default();

        let started = Instant::now();
        let outcome = waiter.wait(&mut diag).await;

        assert!(matches!(outcome, StageOutcome::Ok(s) if s.is_ready()));
        assert_eq!(observer.samples.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_advisory_and_bounded() {
        let observer = Scripted {
            ready_at: None,
            samples: AtomicUsize::new(0),
        };
        let waiter = NetworkReadinessWaiter::new(
            &observer,
            Duration::from_secs(30),
            Duration::from_millis(500),
        );
        let mut diag = Diagnostics::default();

        let started = Instant::now();
        let outcome = waiter.wait(&mut diag).await;

        match outcome {
            StageOutcome::Advisory(state, NbdrootError::NetworkTimedOut(d)) => {
                assert!(state.has_global_address);
                assert!(!state.has_default_route);
                assert_eq!(d, Duration::from_secs(30));
            }
            other => panic!("expected advisory timeout, got {:?}", other),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        // One sample at t=0, then every 500ms up to and including the deadline
        assert_eq!(observer.samples.load(Ordering::SeqCst), 61);
    }
}
