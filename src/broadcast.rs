//! Fan-out of agent commands across the fleet.
//!
//! [`AgentBroadcaster::sync_dns`] sends one sync_dns request to every
//! instance, waits for replies until all have answered or the broadcast
//! timeout elapses, then cancels whatever is still outstanding.  Every
//! instance ends up counted exactly once as successful, failed or
//! unresponsive.
//!
//! Replies are awaited as a set of futures drained by a single loop.
//! That loop is the only owner of the pending set and the counters, so a
//! reply racing the timeout cannot be counted twice.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use tokio::time::{sleep_until, Instant};

use crate::agent::{AgentChannel, AgentClient, PendingRequest};
use crate::error::AgentError;
use crate::inventory::InstanceSource;
use crate::store::DnsVersionStore;
use crate::types::{AgentResponse, Instance, RequestId};

pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(10);

/// The only `value` an agent returns after applying the records blob.
pub const VALID_SYNC_DNS_RESPONSE: &str = "synced";

/// Outcome of one sync_dns broadcast round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncDnsSummary {
    pub successful: usize,
    pub failed: usize,
    pub unresponsive: usize,
    pub elapsed: Duration,
}

impl SyncDnsSummary {
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.successful, self.failed, self.unresponsive)
    }

    pub fn total(&self) -> usize {
        self.successful + self.failed + self.unresponsive
    }
}

struct Issued {
    client: Arc<dyn AgentClient>,
    request_id: RequestId,
}

/// Pending requests and counters of a single round, keyed by the
/// instance's position in the input.  A pending entry has no request id
/// until its issue call has returned.
#[derive(Default)]
struct Round {
    pending: BTreeMap<usize, Option<Issued>>,
    successful: usize,
    failed: usize,
    unresponsive: usize,
}

impl Round {
    fn issued(&mut self, index: usize, issued: Issued) {
        if let Some(slot) = self.pending.get_mut(&index) {
            *slot = Some(issued);
        }
    }

    /// Classifies a reply.  Returns false, leaving the counters alone, when
    /// the instance is no longer pending.
    fn record(&mut self, index: usize, synced: bool) -> bool {
        if self.pending.remove(&index).is_none() {
            return false;
        }
        if synced {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        true
    }

    /// Moves everything still pending into the unresponsive bucket.
    fn expire(&mut self) -> Vec<(usize, Option<Issued>)> {
        let expired: Vec<_> = std::mem::take(&mut self.pending).into_iter().collect();
        self.unresponsive += expired.len();
        expired
    }
}

/// Milliseconds, rounded up.
fn ceil_millis(elapsed: Duration) -> u128 {
    elapsed.as_nanos().div_ceil(1_000_000)
}

pub struct AgentBroadcaster {
    channel: Arc<dyn AgentChannel>,
    dns_versions: Arc<dyn DnsVersionStore>,
    instances: Arc<dyn InstanceSource>,
    broadcast_timeout: Duration,
}

impl AgentBroadcaster {
    pub fn new(
        channel: Arc<dyn AgentChannel>,
        dns_versions: Arc<dyn DnsVersionStore>,
        instances: Arc<dyn InstanceSource>,
    ) -> Self {
        Self {
            channel,
            dns_versions,
            instances,
            broadcast_timeout: DEFAULT_BROADCAST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, broadcast_timeout: Duration) -> Self {
        self.broadcast_timeout = broadcast_timeout;
        self
    }

    pub fn broadcast_timeout(&self) -> Duration {
        self.broadcast_timeout
    }

    /// Sends the ARP cleanup to every live instance except the one running
    /// `excluded_vm_cid`, one agent at a time.  The first agent error stops
    /// the iteration and is returned.
    pub async fn delete_arp_entries(
        &self,
        excluded_vm_cid: &str,
        ips: &[String],
    ) -> Result<(), AgentError> {
        info!("deleting arp entries for the following ip addresses: {:?}", ips);
        for instance in self.instances.instances_excluding_vm(excluded_vm_cid) {
            self.channel
                .client(instance.credentials.as_ref(), &instance.agent_id)
                .delete_arp_entries(ips)
                .await?;
        }
        Ok(())
    }

    /// Broadcasts sync_dns and returns once every agent has answered or
    /// the broadcast timeout, counted from the start of the call, elapses.
    /// Requests are issued concurrently, so a slow transport cannot stretch
    /// the round past the timeout.
    pub async fn sync_dns(
        &self,
        instances: &[Instance],
        blobstore_id: &str,
        sha1: &str,
        version: u64,
    ) -> SyncDnsSummary {
        let agent_ids: Vec<&str> = instances.iter().map(|i| i.agent_id.as_str()).collect();
        info!(
            "agent_broadcaster: sync_dns: sending to {} agents {:?}",
            instances.len(),
            agent_ids
        );

        let start = Instant::now();
        let deadline = start + self.broadcast_timeout;
        let mut round = Round::default();
        let mut issuing = FuturesUnordered::new();
        let mut replies = FuturesUnordered::new();

        for (index, instance) in instances.iter().enumerate() {
            let client = self
                .channel
                .client(instance.credentials.as_ref(), &instance.agent_id);
            round.pending.insert(index, None);
            issuing.push(async move {
                let issued = client.sync_dns(blobstore_id, sha1, version).await;
                (index, client, issued)
            });
        }

        while !round.pending.is_empty() {
            tokio::select! {
                Some((index, client, issued)) = issuing.next(), if !issuing.is_empty() => match issued {
                    Ok(PendingRequest { request_id, response }) => {
                        round.issued(index, Issued { client, request_id });
                        replies.push(async move { (index, response.await) });
                    }
                    Err(e) => {
                        round.record(index, false);
                        error!(
                            "agent_broadcaster: sync_dns[{}]: failed to send request: {}",
                            instances[index].agent_id, e
                        );
                    }
                },
                Some((index, reply)) = replies.next(), if !replies.is_empty() => match reply {
                    Ok(response) => {
                        self.on_reply(&mut round, &instances[index], index, response, version)
                            .await
                    }
                    // The agent will never answer; it stays pending until the deadline.
                    Err(_) => debug!(
                        "agent_broadcaster: sync_dns[{}]: reply channel closed",
                        instances[index].agent_id
                    ),
                },
                _ = sleep_until(deadline) => break,
            }
        }
        drop(issuing);
        drop(replies);

        let expired = round.expire();
        join_all(expired.iter().map(|(index, issued)| async move {
            let agent_id = &instances[*index].agent_id;
            if let Some(issued) = issued {
                if let Err(e) = issued.client.cancel_sync_dns(&issued.request_id).await {
                    debug!(
                        "agent_broadcaster: sync_dns[{}]: cancel failed: {}",
                        agent_id, e
                    );
                }
            }
            warn!(
                "agent_broadcaster: sync_dns[{}]: no response received",
                agent_id
            );
        }))
        .await;

        let summary = SyncDnsSummary {
            successful: round.successful,
            failed: round.failed,
            unresponsive: round.unresponsive,
            elapsed: start.elapsed(),
        };
        info!(
            "agent_broadcaster: sync_dns: attempted {} agents in {}ms ({} successful, {} failed, {} unresponsive)",
            instances.len(),
            ceil_millis(summary.elapsed),
            summary.successful,
            summary.failed,
            summary.unresponsive
        );
        summary
    }

    async fn on_reply(
        &self,
        round: &mut Round,
        instance: &Instance,
        index: usize,
        response: AgentResponse,
        version: u64,
    ) {
        let synced = response.value.as_str() == Some(VALID_SYNC_DNS_RESPONSE);
        if !round.record(index, synced) {
            return;
        }
        if synced {
            if let Err(e) = self.dns_versions.upsert(&instance.agent_id, version).await {
                error!(
                    "agent_broadcaster: sync_dns[{}]: failed to record dns version {}: {}",
                    instance.agent_id, version, e
                );
            }
        } else {
            error!(
                "agent_broadcaster: sync_dns[{}]: received unexpected response {}",
                instance.agent_id, response
            );
        }
    }
}
