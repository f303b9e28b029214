use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, RoutingConfig};
use crate::domain::order::OrderStatus;

// ============================================================================
// Status Registry - routing and legality for every status
// ============================================================================
//
// Both the transition validator and the notifier read from this table, so a
// status that can be reached is always a status that can be routed (or the
// gap surfaces as a configuration error before anything is written).
//
// ============================================================================

/// Logical queue (Redpanda topic) receiving notifications for one status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct StatusRoute {
    queue: Option<QueueId>,
    predecessors: HashSet<OrderStatus>,
    accepts_creation: bool,
}

#[derive(Debug, Clone)]
pub struct StatusRegistry {
    routes: HashMap<OrderStatus, StatusRoute>,
}

impl StatusRegistry {
    /// Build the registry from the `[routing.queues]` table.
    pub fn from_config(config: &RoutingConfig) -> Result<Self, ConfigError> {
        let mut queues = HashMap::new();

        for (name, queue) in &config.queues {
            let status = name
                .parse::<OrderStatus>()
                .map_err(|e| ConfigError::Invalid(format!("routing.queues: {}", e)))?;

            if queue.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "routing.queues.{} must name a queue",
                    name
                )));
            }

            queues.insert(status, QueueId::new(queue.trim()));
        }

        for status in OrderStatus::ALL {
            if !queues.contains_key(&status) {
                tracing::warn!(
                    status = %status,
                    "No queue configured for status; orders moving to it will be refused"
                );
            }
        }

        Ok(Self::with_queues(queues))
    }

    /// Legal edges are fixed; only the destinations vary.
    pub fn with_queues(mut queues: HashMap<OrderStatus, QueueId>) -> Self {
        use OrderStatus::*;

        let edges: [(OrderStatus, &[OrderStatus], bool); 4] = [
            (Received, &[], true),
            (InProcess, &[Received], false),
            (Completed, &[InProcess], false),
            (Canceled, &[Received, InProcess], false),
        ];

        let routes = edges
            .into_iter()
            .map(|(status, predecessors, accepts_creation)| {
                let route = StatusRoute {
                    queue: queues.remove(&status),
                    predecessors: predecessors.iter().copied().collect(),
                    accepts_creation,
                };
                (status, route)
            })
            .collect();

        Self { routes }
    }

    pub fn queue_for(&self, status: OrderStatus) -> Option<&QueueId> {
        self.routes.get(&status).and_then(|route| route.queue.as_ref())
    }

    pub fn allowed_predecessors(&self, status: OrderStatus) -> HashSet<OrderStatus> {
        self.routes
            .get(&status)
            .map(|route| route.predecessors.clone())
            .unwrap_or_default()
    }

    /// Whether an order may be created directly in `status`.
    pub fn accepts_creation(&self, status: OrderStatus) -> bool {
        self.routes
            .get(&status)
            .map(|route| route.accepts_creation)
            .unwrap_or(false)
    }

    pub fn is_legal(&self, from: Option<OrderStatus>, to: OrderStatus) -> bool {
        match from {
            None => self.accepts_creation(to),
            Some(from) => self
                .routes
                .get(&to)
                .map(|route| route.predecessors.contains(&from))
                .unwrap_or(false),
        }
    }

    /// Every status that currently has a destination queue.
    pub fn routed_statuses(&self) -> Vec<(OrderStatus, QueueId)> {
        OrderStatus::ALL
            .iter()
            .filter_map(|status| self.queue_for(*status).map(|q| (*status, q.clone())))
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_registry() -> StatusRegistry {
    let queues = OrderStatus::ALL
        .iter()
        .map(|status| (*status, QueueId::new(format!("{}-queue", status))))
        .collect();
    StatusRegistry::with_queues(queues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    fn routing(pairs: &[(&str, &str)]) -> RoutingConfig {
        RoutingConfig {
            queues: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_queue_lookup_from_config() {
        let registry = StatusRegistry::from_config(&routing(&[
            ("received", "orders.received"),
            ("InProcess", "orders.inprocess"),
        ]))
        .unwrap();

        assert_eq!(registry.queue_for(Received).unwrap().as_str(), "orders.received");
        assert_eq!(registry.queue_for(InProcess).unwrap().as_str(), "orders.inprocess");
        assert!(registry.queue_for(Completed).is_none());
        assert_eq!(registry.routed_statuses().len(), 2);
    }

    #[test]
    fn test_unknown_status_in_config_fails() {
        let err = StatusRegistry::from_config(&routing(&[("shipped", "orders.shipped")]))
            .unwrap_err();
        assert!(err.to_string().contains("shipped"));
    }

    #[test]
    fn test_blank_queue_in_config_fails() {
        assert!(StatusRegistry::from_config(&routing(&[("received", " ")])).is_err());
    }

    #[test]
    fn test_predecessors() {
        let registry = test_registry();

        assert!(registry.allowed_predecessors(Received).is_empty());
        assert_eq!(registry.allowed_predecessors(InProcess), HashSet::from([Received]));
        assert_eq!(registry.allowed_predecessors(Completed), HashSet::from([InProcess]));
        assert_eq!(
            registry.allowed_predecessors(Canceled),
            HashSet::from([Received, InProcess])
        );
    }

    #[test]
    fn test_legal_edges_exactly() {
        let registry = test_registry();
        let legal = [
            (None, Received),
            (Some(Received), InProcess),
            (Some(Received), Canceled),
            (Some(InProcess), Completed),
            (Some(InProcess), Canceled),
        ];

        let mut from_states = vec![None];
        from_states.extend(OrderStatus::ALL.iter().copied().map(Some));

        for from in from_states {
            for to in OrderStatus::ALL {
                assert_eq!(
                    registry.is_legal(from, to),
                    legal.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_legality_does_not_depend_on_routing() {
        let registry = StatusRegistry::with_queues(HashMap::new());
        assert!(registry.is_legal(Some(Received), InProcess));
        assert!(registry.queue_for(InProcess).is_none());
    }
}
