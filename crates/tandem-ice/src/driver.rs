//! Async drivers for an [`IceAgent`]
//!
//! These run on the factory's runtime. They never hold the owner's lock across
//! an `.await`: every interaction with the agent is a short
//! [`AgentHost::with_agent`] call.

use futures::future::join_all;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use tandem_core::{IceCandidate, IceGatheringState};

use crate::agent::AgentHost;
use crate::config::IceConfig;
use crate::pair::CandidatePair;
use crate::traits::{CheckRequest, IceTransport};

/// Enumerate local candidates on `interfaces`, then mark gathering complete.
///
/// The caller must already have moved the agent to `gathering`. Interfaces
/// that fail to bind are skipped. A server-reflexive query that errors or
/// times out only loses that one candidate.
pub async fn gather<H: AgentHost>(
    host: Arc<H>,
    transport: Arc<dyn IceTransport>,
    interfaces: Arc<[IpAddr]>,
) {
    let Some((stun, config)) = host.with_agent(|a| (a.stun_server().clone(), a.config().clone()))
    else {
        return;
    };

    let tasks = interfaces.iter().enumerate().map(|(index, &ip)| {
        let host = host.clone();
        let transport = transport.clone();
        let stun = stun.clone();
        let gather_timeout = config.gather_timeout();
        let local_preference = u16::MAX.saturating_sub(index as u16);

        async move {
            let base = match transport.bind(ip).await {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Skipping interface {}: {}", ip, e);
                    return;
                }
            };
            let host_candidate = IceCandidate::host(base, local_preference);
            if host
                .with_agent(|a| a.add_local_candidate(host_candidate))
                .is_none()
            {
                return;
            }

            match timeout(gather_timeout, transport.server_reflexive(&stun, base)).await {
                Ok(Ok(Some(mapped))) if mapped != base => {
                    let srflx = IceCandidate::server_reflexive(mapped, base, local_preference);
                    host.with_agent(|a| a.add_local_candidate(srflx));
                }
                Ok(Ok(_)) => debug!("No distinct reflexive mapping for {}", base),
                Ok(Err(e)) => debug!("Reflexive query via {} failed for {}: {}", stun, base, e),
                Err(_) => debug!("Reflexive query via {} timed out for {}", stun, base),
            }
        }
    });
    join_all(tasks).await;

    host.with_agent(|a| {
        if a.finish_gathering() {
            info!(
                "ICE gathering complete: {} local candidates",
                a.local_candidates().len()
            );
        }
    });
}

/// Run connectivity checks, then watch consent on the selected pair.
///
/// The caller must already have moved the agent to `checking`. Checks start
/// once local gathering has completed. Once a pair is selected, consent is
/// watched while the remaining lower-priority pairs are still being checked.
pub async fn run_checks<H: AgentHost>(host: Arc<H>, transport: Arc<dyn IceTransport>) {
    let Some(mut gathering) = host.with_agent(|a| a.subscribe_gathering()) else {
        return;
    };
    while *gathering.borrow_and_update() != IceGatheringState::Complete {
        if gathering.changed().await.is_err() {
            return;
        }
    }

    let Some((pairs, local_credentials, remote_credentials, role, config)) =
        host.with_agent(|a| {
            (
                a.candidate_pairs(),
                a.local_credentials().clone(),
                a.remote_credentials().cloned(),
                a.role(),
                a.config().clone(),
            )
        })
    else {
        return;
    };

    debug!("Checking {} candidate pairs", pairs.len());
    let request_for = |pair: CandidatePair| CheckRequest {
        pair,
        local_credentials: local_credentials.clone(),
        remote_credentials: remote_credentials.clone(),
        role,
    };

    let mut pairs = pairs.into_iter();
    let mut selected = None;
    for pair in pairs.by_ref() {
        let request = request_for(pair);
        if let Some(rtt) = check_once(transport.as_ref(), &request, &config).await {
            if host
                .with_agent(|a| a.check_succeeded(request.pair.clone(), rtt))
                .is_none()
            {
                return;
            }
            selected = Some(request);
            break;
        }
    }
    let Some(selected) = selected else {
        host.with_agent(|a| a.checks_exhausted());
        return;
    };

    // Set under the agent lock, so recovery and exhaustion never miss each other
    let exhausted = AtomicBool::new(false);
    let remaining = async {
        for pair in pairs {
            let request = request_for(pair);
            if let Some(rtt) = check_once(transport.as_ref(), &request, &config).await {
                debug!("Check {} succeeded (rtt {:?})", request.pair, rtt);
            }
        }
        host.with_agent(|a| {
            exhausted.store(true, Ordering::SeqCst);
            a.checks_exhausted();
        });
    };
    let consent = watch_consent(
        host.as_ref(),
        transport.as_ref(),
        &selected,
        &config,
        &exhausted,
    );
    tokio::pin!(remaining, consent);

    tokio::select! {
        _ = &mut remaining => consent.await,
        // Failed or closed: the remaining checks no longer matter
        _ = &mut consent => {}
    }
}

async fn check_once(
    transport: &dyn IceTransport,
    request: &CheckRequest,
    config: &IceConfig,
) -> Option<Duration> {
    match timeout(config.check_timeout(), transport.check(request)).await {
        Ok(Ok(rtt)) => Some(rtt),
        Ok(Err(e)) => {
            debug!("Check {} failed: {}", request.pair, e);
            None
        }
        Err(_) => {
            debug!("Check {} timed out", request.pair);
            None
        }
    }
}

/// Follow consent on the selected pair until the connection fails or the
/// agent is shut down.
async fn watch_consent<H: AgentHost>(
    host: &H,
    transport: &dyn IceTransport,
    selected: &CheckRequest,
    config: &IceConfig,
    exhausted: &AtomicBool,
) {
    loop {
        transport.consent_lost(&selected.pair).await;
        match host.with_agent(|a| a.consent_lost()) {
            Some(true) => {}
            _ => return,
        }

        let deadline = Instant::now() + config.disconnected_timeout();
        let mut recovered = false;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(config.recovery_interval().min(remaining)).await;
            if let Some(rtt) = check_once(transport, selected, config).await {
                let alive = host.with_agent(|a| {
                    a.check_succeeded(selected.pair.clone(), rtt);
                    if exhausted.load(Ordering::SeqCst) {
                        a.checks_exhausted();
                    }
                });
                if alive.is_none() {
                    return;
                }
                recovered = true;
                break;
            }
        }

        if !recovered {
            host.with_agent(|a| a.recovery_expired());
            return;
        }
    }
}
