use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};

/// Liveness reporting for the process's long-running loops.
///
/// Each loop registers a component and must report healthy more often than
/// its deadline; a component that goes quiet is considered stalled and the
/// whole process reports unhealthy. The subscription runner, the cron
/// scheduler, and the HTTP server each hold a handle.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Healthy until the deadline passes without another report.
    HealthyUntil(DateTime<Utc>),
    Unhealthy,
}

#[derive(Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self.components);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

/// A handle held by one component to report into the registry.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline));
    }

    pub fn report_unhealthy(&self) {
        self.report_status(ComponentStatus::Unhealthy);
    }

    fn report_status(&self, status: ComponentStatus) {
        if let Ok(mut components) = self.components.write() {
            components.insert(self.component.clone(), status);
        }
    }
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        HealthRegistry {
            name: name.to_owned(),
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a component with a reporting deadline.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        if let Ok(mut components) = self.components.write() {
            components.insert(component.to_owned(), ComponentStatus::Starting);
        }
        HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        }
    }

    pub fn get_status(&self) -> HealthStatus {
        let now = Utc::now();
        let components = self
            .components
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        let healthy = !components.is_empty()
            && components.values().all(|status| match status {
                ComponentStatus::Starting => true,
                ComponentStatus::HealthyUntil(deadline) => *deadline >= now,
                ComponentStatus::Unhealthy => false,
            });
        HealthStatus {
            healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn starting_component_counts_as_healthy() {
        let registry = HealthRegistry::new("liveness");
        let _handle = registry.register("scheduler", Duration::seconds(30));
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn stalled_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("runner", Duration::seconds(-1));
        handle.report_healthy();
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn unhealthy_report_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let ok = registry.register("scheduler", Duration::seconds(30));
        let bad = registry.register("runner", Duration::seconds(30));
        ok.report_healthy();
        bad.report_unhealthy();
        assert!(!registry.get_status().healthy);
    }
}
