//! Joining the network through a known node.

use std::time::Instant;

use tracing::{debug, info};

use crate::common::{Contact, Kuid, Message, PurgeMode};
use crate::core::results::{BootstrapResult, BootstrapResultType, FindNodeResult, PingResult};
use crate::DhtError;

use super::handler::{Callback, HandlerContext, Progress, SentRequest, Task};
use super::lookup::FindNode;
use super::ping::{Ping, PingTarget};

#[derive(Debug)]
enum Phase {
    /// Reaching the bootstrap node.
    Ping(Ping),
    /// Looking up our own id to fill the nearest buckets.
    FindNearest(FindNode),
    /// Pinging contacts found with our own id.
    CheckCollisions(Ping),
    /// Looking up a random id in every other bucket, furthest last.
    Refresh(FindNode),
    Done,
}

#[derive(Debug)]
pub(crate) struct Bootstrap {
    phase: Phase,
    node: Option<Contact>,
    refresh_ids: Vec<Kuid>,
    /// Route table contacts that failed during the refresh lookups.
    failures: usize,
    retried: bool,
    started: Instant,
}

impl Bootstrap {
    /// Bootstraps from the first of `targets` that answers a ping.
    pub fn new(targets: Vec<PingTarget>) -> Self {
        Bootstrap {
            phase: Phase::Ping(Ping::all(targets)),
            node: None,
            refresh_ids: Vec::new(),
            failures: 0,
            retried: false,
            started: Instant::now(),
        }
    }

    fn handle(&mut self, context: &mut HandlerContext<'_>, callback: Callback<'_>) -> Progress<BootstrapResult> {
        match &mut self.phase {
            Phase::Ping(ping) => {
                let progress = callback.apply(ping, context);
                self.pinged(context, progress)
            }
            Phase::FindNearest(lookup) => {
                let progress = callback.apply(lookup, context);
                self.found_nearest(context, progress)
            }
            Phase::CheckCollisions(ping) => {
                let progress = callback.apply(ping, context);
                self.checked_collisions(context, progress)
            }
            Phase::Refresh(lookup) => {
                let progress = callback.apply(lookup, context);
                self.refreshed(context, progress)
            }
            Phase::Done => Progress::Pending,
        }
    }

    fn pinged(&mut self, context: &mut HandlerContext<'_>, progress: Progress<PingResult>) -> Progress<BootstrapResult> {
        match progress {
            Progress::Pending => Progress::Pending,
            Progress::Done(Err(error)) => {
                debug!(%error, "Bootstrap node didn't answer");
                self.phase = Phase::Done;
                Progress::Done(Err(error))
            }
            Progress::Done(Ok(result)) => {
                debug!(node = ?result.contact(), "Bootstrapping from node");
                self.node = Some(result.contact().clone());
                self.find_nearest(context)
            }
        }
    }

    fn find_nearest(&mut self, context: &mut HandlerContext<'_>) -> Progress<BootstrapResult> {
        let forced = self.node.iter().cloned().collect();
        let mut lookup = FindNode::new(*context.routing_table.local_id(), context.config).with_forced(forced);

        let progress = lookup.start(context);
        self.phase = Phase::FindNearest(lookup);
        self.found_nearest(context, progress)
    }

    fn found_nearest(
        &mut self,
        context: &mut HandlerContext<'_>,
        progress: Progress<FindNodeResult>,
    ) -> Progress<BootstrapResult> {
        match progress {
            Progress::Pending => Progress::Pending,
            Progress::Done(Err(error)) => {
                debug!(%error, "Nearest contacts lookup failed");
                self.finish(context, BootstrapResultType::Failed)
            }
            Progress::Done(Ok(result)) => {
                if !result.collisions().is_empty() {
                    let mut ping = Ping::collisions(context.local(), result.collisions().to_vec());
                    let progress = ping.start(context);
                    self.phase = Phase::CheckCollisions(ping);
                    return self.checked_collisions(context, progress);
                }

                let local_id = *context.routing_table.local_id();
                if result.path().iter().all(|c| c.id() == &local_id) {
                    debug!("Found no contacts near our id");
                    return self.finish(context, BootstrapResultType::Failed);
                }

                self.refresh_ids = context.routing_table.refresh_ids(true);
                self.next_refresh(context)
            }
        }
    }

    fn checked_collisions(
        &mut self,
        context: &mut HandlerContext<'_>,
        progress: Progress<PingResult>,
    ) -> Progress<BootstrapResult> {
        match progress {
            Progress::Pending => Progress::Pending,
            Progress::Done(Ok(result)) => {
                let mut local = context.local().clone();
                local.set_id(Kuid::random());

                info!(
                    collision = ?result.contact(),
                    new_id = ?local.id(),
                    "Another node uses our id, changing it"
                );

                context.routing_table.rebuild(local);
                self.find_nearest(context)
            }
            Progress::Done(Err(_)) => {
                self.refresh_ids = context.routing_table.refresh_ids(true);
                self.next_refresh(context)
            }
        }
    }

    fn next_refresh(&mut self, context: &mut HandlerContext<'_>) -> Progress<BootstrapResult> {
        let Some(id) = self.refresh_ids.pop() else {
            return self.determine(context);
        };

        let mut lookup = FindNode::new(id, context.config);
        let progress = lookup.start(context);
        self.phase = Phase::Refresh(lookup);
        self.refreshed(context, progress)
    }

    fn refreshed(
        &mut self,
        context: &mut HandlerContext<'_>,
        progress: Progress<FindNodeResult>,
    ) -> Progress<BootstrapResult> {
        let failures = match progress {
            Progress::Pending => return Progress::Pending,
            Progress::Done(Ok(result)) => result.route_table_failure_count(),
            Progress::Done(Err(DhtError::AllContactsFailed { attempted, .. })) => attempted,
            Progress::Done(Err(error)) => {
                debug!(%error, "Refresh lookup failed");
                0
            }
        };

        self.failures += failures;

        if self.failures < context.config.max_bootstrap_failures {
            return self.next_refresh(context);
        }

        if self.retried {
            return self.determine(context);
        }

        debug!(failures = self.failures, "Route table looks stale, bootstrapping again");

        self.retried = true;
        self.failures = 0;
        self.refresh_ids.clear();

        context.routing_table.purge(PurgeMode::DropDead);
        context.routing_table.purge(PurgeMode::MergeBuckets);
        context.routing_table.purge(PurgeMode::StateToUnknown);

        self.find_nearest(context)
    }

    fn determine(&mut self, context: &mut HandlerContext<'_>) -> Progress<BootstrapResult> {
        context.routing_table.purge(PurgeMode::DropDead);
        context.routing_table.purge(PurgeMode::MergeBuckets);

        let ratio = context.routing_table.alive_ratio();

        if ratio >= context.config.is_bootstrapped_ratio {
            *context.bootstrapped = true;
            self.finish(context, BootstrapResultType::Succeeded)
        } else {
            debug!(ratio, "Too few alive contacts");
            self.finish(context, BootstrapResultType::Failed)
        }
    }

    fn finish(&mut self, context: &mut HandlerContext<'_>, result_type: BootstrapResultType) -> Progress<BootstrapResult> {
        self.phase = Phase::Done;

        let node = self.node.clone().unwrap_or_else(|| context.local().clone());
        let result = BootstrapResult::new(node, self.started.elapsed(), result_type);

        info!(
            size = context.routing_table.size(),
            elapsed = ?result.elapsed(),
            ?result_type,
            "Bootstrap done"
        );

        Progress::Done(Ok(result))
    }
}

impl Task for Bootstrap {
    type Output = BootstrapResult;

    fn start(&mut self, context: &mut HandlerContext<'_>) -> Progress<BootstrapResult> {
        self.started = Instant::now();

        match &mut self.phase {
            Phase::Ping(ping) => {
                let progress = ping.start(context);
                self.pinged(context, progress)
            }
            _ => Progress::Pending,
        }
    }

    fn handle_response(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    ) -> Progress<BootstrapResult> {
        self.handle(context, Callback::Response(request, response))
    }

    fn handle_timeout(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
    ) -> Progress<BootstrapResult> {
        self.handle(context, Callback::Timeout(request))
    }

    fn handle_error(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        error: DhtError,
    ) -> Progress<BootstrapResult> {
        self.handle(context, Callback::Error(request, error))
    }

    fn handle_tick(&mut self, context: &mut HandlerContext<'_>) -> Progress<BootstrapResult> {
        self.handle(context, Callback::Tick)
    }
}
