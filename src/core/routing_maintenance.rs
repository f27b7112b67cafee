//! Routing table maintenance logic.

use std::time::{Duration, Instant};

use crate::common::{Kuid, RouteTable};

/// Routing table maintenance state
#[derive(Debug)]
pub struct RoutingMaintenance {
    interval: Duration,
    last_maintenance: Instant,
}

/// Decisions about routing table maintenance
#[derive(Debug, Default)]
pub struct MaintenanceDecisions {
    /// Random ids of stale buckets to run lookups for.
    pub refresh_ids: Vec<Kuid>,

    /// Contacts that stayed dead for longer than a refresh period.
    pub nodes_to_purge: Vec<Kuid>,

    /// Whether token secrets should be checked for rotation.
    pub rotate_tokens: bool,
}

impl RoutingMaintenance {
    /// Create new routing maintenance tracker running every `interval`.
    pub fn new(interval: Duration) -> Self {
        RoutingMaintenance {
            interval,
            last_maintenance: Instant::now(),
        }
    }

    /// Determine what maintenance operations should be performed, if any is due.
    pub fn periodic_maintenance_decisions(
        &mut self,
        routing_table: &mut RouteTable,
        bootstrapped: bool,
    ) -> Option<MaintenanceDecisions> {
        self.periodic_maintenance_decisions_at(Instant::now(), routing_table, bootstrapped)
    }

    pub(crate) fn periodic_maintenance_decisions_at(
        &mut self,
        now: Instant,
        routing_table: &mut RouteTable,
        bootstrapped: bool,
    ) -> Option<MaintenanceDecisions> {
        if now.saturating_duration_since(self.last_maintenance) < self.interval {
            return None;
        }
        self.last_maintenance = now;

        // Refreshing before bootstrapping would only query an empty table.
        let refresh_ids = if bootstrapped && !routing_table.is_empty() {
            routing_table.refresh_ids_at(now, false)
        } else {
            Vec::new()
        };

        let retention = routing_table.settings().bucket_refresh_period;
        let nodes_to_purge = routing_table
            .contacts()
            .filter(|c| c.is_dead())
            .filter(|c| {
                c.last_failed()
                    .map(|t| now.saturating_duration_since(t) >= retention)
                    .unwrap_or(true)
            })
            .map(|c| *c.id())
            .collect();

        Some(MaintenanceDecisions {
            refresh_ids,
            nodes_to_purge,
            rotate_tokens: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::common::{Contact, RouteTable, RoutingSettings};

    use super::RoutingMaintenance;

    const INTERVAL: Duration = Duration::from_secs(60);

    fn routing_table() -> RouteTable {
        let mut table = RouteTable::new(Contact::random(), RoutingSettings::default());
        for _ in 0..10 {
            table.add(Contact::random());
        }
        table
    }

    #[test]
    fn nothing_before_interval() {
        let mut maintenance = RoutingMaintenance::new(INTERVAL);
        let mut table = routing_table();

        assert!(maintenance
            .periodic_maintenance_decisions(&mut table, true)
            .is_none());
    }

    #[test]
    fn stale_buckets_are_refreshed() {
        let mut maintenance = RoutingMaintenance::new(INTERVAL);
        let mut table = routing_table();

        // Add to Instant::now() instead of subtracting, Instant may be close to its epoch.
        let future = Instant::now() + table.settings().bucket_refresh_period;

        let decisions = maintenance
            .periodic_maintenance_decisions_at(future, &mut table, true)
            .unwrap_or_default();

        assert_eq!(decisions.refresh_ids.len(), table.buckets().len());
        assert!(decisions.rotate_tokens);

        // Not again within the interval.
        assert!(maintenance
            .periodic_maintenance_decisions_at(future + INTERVAL / 2, &mut table, true)
            .is_none());
    }

    #[test]
    fn no_refresh_before_bootstrap() {
        let mut maintenance = RoutingMaintenance::new(INTERVAL);
        let mut table = routing_table();
        let future = Instant::now() + table.settings().bucket_refresh_period;

        let decisions = maintenance
            .periodic_maintenance_decisions_at(future, &mut table, false)
            .unwrap_or_default();

        assert!(decisions.refresh_ids.is_empty());
    }

    #[test]
    fn long_dead_contacts_are_purged() {
        let mut maintenance = RoutingMaintenance::new(INTERVAL);
        let mut table = routing_table();

        let dead = Contact::random();
        table.add(dead.clone());
        for _ in 0..table.settings().max_alive_node_failures {
            table.handle_failure(dead.id(), dead.address());
        }

        let soon = Instant::now() + INTERVAL;
        let decisions = maintenance
            .periodic_maintenance_decisions_at(soon, &mut table, true)
            .unwrap_or_default();
        assert!(decisions.nodes_to_purge.is_empty());

        let later = Instant::now() + table.settings().bucket_refresh_period + INTERVAL;
        let decisions = maintenance
            .periodic_maintenance_decisions_at(later, &mut table, true)
            .unwrap_or_default();
        assert_eq!(decisions.nodes_to_purge, vec![*dead.id()]);
    }
}
