//! In-process store. Runs queries through the reference evaluator, which
//! makes it both the dev-mode backend and the oracle the SQL translation is
//! tested against.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use epcis_common::error::EpcisError;
use epcis_common::model::{Capture, Event, MasterData, NamedQuery, Subscription};
use epcis_query::engine::EventSource;
use epcis_query::eval::{compare_events, event_matches, MasterdataLookup};
use epcis_query::predicate::QueryPlan;

use crate::{CaptureSummary, Discovery, EventStore};

#[derive(Default)]
struct Inner {
    captures: Vec<Capture>,
    subscriptions: Vec<Subscription>,
    named_queries: Vec<NamedQuery>,
    next_capture_id: i64,
    next_event_id: i64,
    next_subscription_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

/// Descendant/attribute joins over the captured vocabularies of one tenant.
struct VocabularyIndex {
    children: HashMap<String, Vec<String>>,
    attributes: HashMap<String, HashMap<String, String>>,
}

impl VocabularyIndex {
    fn build<'a>(masterdata: impl Iterator<Item = &'a MasterData>) -> Self {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut attributes: HashMap<String, HashMap<String, String>> = HashMap::new();
        for md in masterdata {
            children
                .entry(md.id.clone())
                .or_default()
                .extend(md.children.iter().cloned());
            let entry = attributes.entry(md.id.clone()).or_default();
            for attr in &md.attributes {
                entry.insert(attr.name.clone(), attr.value.clone());
            }
        }
        VocabularyIndex {
            children,
            attributes,
        }
    }
}

impl MasterdataLookup for VocabularyIndex {
    fn is_descendant_or_self(&self, root: &str, candidate: &str) -> bool {
        if root == candidate {
            return true;
        }
        // Breadth-first over the children edges, guarding against cycles.
        let mut queue: Vec<&str> = vec![root];
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = queue.pop() {
            if let Some(kids) = self.children.get(current) {
                for kid in kids {
                    if kid == candidate {
                        return true;
                    }
                    if seen.insert(kid) {
                        queue.push(kid);
                    }
                }
            }
        }
        false
    }

    fn attribute(&self, id: &str, attribute: &str) -> Option<String> {
        self.attributes.get(id)?.get(attribute).cloned()
    }
}

#[async_trait]
impl EventSource for MemoryStore {
    async fn event_ids_matching(
        &self,
        plan: &QueryPlan,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<i64>, EpcisError> {
        if cancel.is_cancelled() {
            return Err(EpcisError::Canceled);
        }
        let inner = self.inner.read().map_err(poisoned)?;
        let vocabulary =
            VocabularyIndex::build(inner.captures.iter().flat_map(|c| c.masterdata.iter()));

        let mut matching: Vec<&Event> = Vec::new();
        for capture in &inner.captures {
            for event in &capture.events {
                if event_matches(&plan.predicates, event, &capture.tenant_id, &vocabulary) {
                    matching.push(event);
                }
            }
        }
        matching.sort_by(|a, b| compare_events(a, b, plan.order_key, plan.direction));
        Ok(matching.iter().take(limit).map(|e| e.id).collect())
    }

    async fn hydrate_events(
        &self,
        ids: &[i64],
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>, EpcisError> {
        if cancel.is_cancelled() {
            return Err(EpcisError::Canceled);
        }
        let wanted: HashSet<i64> = ids.iter().copied().collect();
        let inner = self.inner.read().map_err(poisoned)?;
        let mut out = Vec::with_capacity(ids.len());
        for capture in &inner.captures {
            for event in &capture.events {
                if wanted.contains(&event.id) {
                    out.push(event.clone());
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_capture(
        &self,
        capture: &mut Capture,
        cancel: &CancellationToken,
    ) -> Result<(), EpcisError> {
        if cancel.is_cancelled() {
            return Err(EpcisError::Canceled);
        }
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.next_capture_id += 1;
        capture.id = inner.next_capture_id;
        for event in &mut capture.events {
            inner.next_event_id += 1;
            event.id = inner.next_event_id;
            event.record_time = capture.record_time;
        }
        inner.captures.push(capture.clone());
        Ok(())
    }

    async fn get_capture(
        &self,
        tenant_id: &str,
        capture_id: Uuid,
    ) -> Result<Option<Capture>, EpcisError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .captures
            .iter()
            .find(|c| c.tenant_id == tenant_id && c.capture_id == capture_id)
            .cloned())
    }

    async fn list_captures(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CaptureSummary>, EpcisError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .captures
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .skip(offset)
            .take(limit)
            .map(|c| CaptureSummary {
                capture_id: c.capture_id,
                tenant_id: c.tenant_id.clone(),
                schema_version: c.schema_version,
                document_time: c.document_time,
                record_time: c.record_time,
                event_count: c.events.len(),
            })
            .collect())
    }

    async fn distinct_values(
        &self,
        tenant_id: &str,
        dimension: Discovery,
        limit: usize,
    ) -> Result<Vec<String>, EpcisError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut values: HashSet<String> = HashSet::new();
        for capture in inner.captures.iter().filter(|c| c.tenant_id == tenant_id) {
            for event in &capture.events {
                match dimension {
                    Discovery::EventTypes => {
                        values.insert(event.event_type.as_str().to_owned());
                    }
                    Discovery::Epcs => {
                        values.extend(event.epcs.iter().map(|e| e.id.clone()));
                    }
                    Discovery::BizSteps => values.extend(event.business_step.clone()),
                    Discovery::BizLocations => values.extend(event.business_location.clone()),
                    Discovery::ReadPoints => values.extend(event.read_point.clone()),
                    Discovery::Dispositions => values.extend(event.disposition.clone()),
                }
            }
        }
        let mut out: Vec<String> = values.into_iter().collect();
        out.sort();
        out.truncate(limit);
        Ok(out)
    }

    async fn insert_named_query(&self, query: &NamedQuery) -> Result<(), EpcisError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner
            .named_queries
            .iter()
            .any(|q| q.tenant_id == query.tenant_id && q.name == query.name)
        {
            return Err(EpcisError::DuplicateName(query.name.clone()));
        }
        inner.named_queries.push(query.clone());
        Ok(())
    }

    async fn get_named_query(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<NamedQuery>, EpcisError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .named_queries
            .iter()
            .find(|q| q.tenant_id == tenant_id && q.name == name)
            .cloned())
    }

    async fn list_named_queries(&self, tenant_id: &str) -> Result<Vec<NamedQuery>, EpcisError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .named_queries
            .iter()
            .filter(|q| q.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn delete_named_query(&self, tenant_id: &str, name: &str) -> Result<bool, EpcisError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let before = inner.named_queries.len();
        inner
            .named_queries
            .retain(|q| !(q.tenant_id == tenant_id && q.name == name));
        Ok(inner.named_queries.len() < before)
    }

    async fn insert_subscription(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), EpcisError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner
            .subscriptions
            .iter()
            .any(|s| s.tenant_id == subscription.tenant_id && s.name == subscription.name)
        {
            return Err(EpcisError::DuplicateName(subscription.name.clone()));
        }
        inner.next_subscription_id += 1;
        subscription.id = inner.next_subscription_id;
        inner.subscriptions.push(subscription.clone());
        Ok(())
    }

    async fn list_subscriptions(&self, tenant_id: &str) -> Result<Vec<Subscription>, EpcisError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .subscriptions
            .iter()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn all_active_subscriptions(&self) -> Result<Vec<Subscription>, EpcisError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .subscriptions
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn delete_subscription(&self, tenant_id: &str, name: &str) -> Result<bool, EpcisError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let before = inner.subscriptions.len();
        inner
            .subscriptions
            .retain(|s| !(s.tenant_id == tenant_id && s.name == name));
        Ok(inner.subscriptions.len() < before)
    }

    async fn advance_subscription_cursor(
        &self,
        subscription_id: i64,
        to: DateTime<Utc>,
    ) -> Result<(), EpcisError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if let Some(sub) = inner.subscriptions.iter_mut().find(|s| s.id == subscription_id) {
            if sub.last_executed_time.map(|t| t < to).unwrap_or(true) {
                sub.last_executed_time = Some(to);
            }
            sub.last_error = None;
        }
        Ok(())
    }

    async fn record_subscription_error(
        &self,
        subscription_id: i64,
        error: &str,
    ) -> Result<(), EpcisError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if let Some(sub) = inner.subscriptions.iter_mut().find(|s| s.id == subscription_id) {
            sub.last_error = Some(error.to_owned());
        }
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> EpcisError {
    EpcisError::storage(std::io::Error::new(
        std::io::ErrorKind::Other,
        "store lock poisoned",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use epcis_common::model::{
        Epc, EpcType, EventAction, EventType, MasterData, SchemaVersion, SubscriptionTrigger,
    };
    use epcis_query::engine::{QueryEngine, QueryIdentity};

    fn capture_with_event(tenant: &str, epc: &str, minute: u32) -> Capture {
        let mut capture = Capture::new(SchemaVersion::V2_0);
        capture.tenant_id = tenant.to_owned();
        capture.record_time = Some(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        let time = Utc.with_ymd_and_hms(2025, 1, 15, 10, minute, 0).unwrap();
        let mut event = Event::new(EventType::Object, time, "+00:00");
        event.action = Some(EventAction::Observe);
        event.epcs.push(Epc::new(EpcType::List, epc));
        capture.events.push(event);
        capture
    }

    async fn seed(store: &MemoryStore, captures: Vec<Capture>) {
        for mut capture in captures {
            store
                .insert_capture(&mut capture, &CancellationToken::new())
                .await
                .unwrap();
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn tenant_isolation_on_query() {
        let store = std::sync::Arc::new(MemoryStore::new());
        seed(
            &store,
            vec![
                capture_with_event("tenant-a", "urn:epc:id:sgtin:8901213.105919.000000", 30),
                capture_with_event("tenant-b", "urn:epc:id:sgtin:8901213.105919.000001", 31),
            ],
        )
        .await;

        let engine = QueryEngine::new(store, 1000, b"secret");
        let query = params(&[("MATCH_anyEPC", "urn:epc:id:sgtin:8901213.105919.*")]);

        let a = engine
            .execute(
                &QueryIdentity::tenant("tenant-a"),
                &query,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(a.events.len(), 1);
        assert_eq!(a.events[0].epcs[0].id, "urn:epc:id:sgtin:8901213.105919.000000");

        let b = engine
            .execute(
                &QueryIdentity::tenant("tenant-c"),
                &query,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(b.events.is_empty());
    }

    #[tokio::test]
    async fn super_user_sees_across_tenants() {
        let store = std::sync::Arc::new(MemoryStore::new());
        seed(
            &store,
            vec![
                capture_with_event("tenant-a", "urn:epc:id:sgtin:1.1.1", 30),
                capture_with_event("tenant-b", "urn:epc:id:sgtin:1.1.2", 31),
            ],
        )
        .await;

        let engine = QueryEngine::new(store, 1000, b"secret");
        let identity = QueryIdentity {
            tenant_id: "root".to_owned(),
            super_user: true,
        };
        let outcome = engine
            .execute(&identity, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.events.len(), 2);
    }

    #[tokio::test]
    async fn events_are_assigned_monotonic_ids_in_submission_order() {
        let store = MemoryStore::new();
        let mut capture = capture_with_event("tenant-a", "urn:epc:id:sgtin:1.1.1", 30);
        let mut second = Event::new(
            EventType::Object,
            Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap(),
            "+00:00",
        );
        second.action = Some(EventAction::Observe);
        capture.events.push(second);
        store
            .insert_capture(&mut capture, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(capture.id, 1);
        assert_eq!(capture.events[0].id, 1);
        assert_eq!(capture.events[1].id, 2);
        assert_eq!(capture.events[0].record_time, capture.record_time);
    }

    #[tokio::test]
    async fn with_descendants_walks_the_vocabulary() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut capture = capture_with_event("tenant-a", "urn:epc:id:sgtin:1.1.1", 30);
        capture.events[0].read_point = Some("urn:epc:id:sgln:0037000.00729.8201".to_owned());
        capture.masterdata.push(MasterData {
            vocabulary_type: "urn:epcglobal:epcis:vtype:ReadPoint".to_owned(),
            id: "urn:epc:id:sgln:0037000.00729.0".to_owned(),
            attributes: vec![],
            children: vec!["urn:epc:id:sgln:0037000.00729.8201".to_owned()],
        });
        seed(&store, vec![capture]).await;

        let engine = QueryEngine::new(store, 1000, b"secret");
        let outcome = engine
            .execute(
                &QueryIdentity::tenant("tenant-a"),
                &params(&[("WD_readPoint", "urn:epc:id:sgln:0037000.00729.0")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.events.len(), 1);
    }

    #[tokio::test]
    async fn discovery_values_are_tenant_scoped() {
        let store = MemoryStore::new();
        seed(
            &store,
            vec![
                capture_with_event("tenant-a", "urn:epc:id:sgtin:1.1.1", 30),
                capture_with_event("tenant-b", "urn:epc:id:sgtin:2.2.2", 31),
            ],
        )
        .await;

        let epcs = store
            .distinct_values("tenant-a", Discovery::Epcs, 100)
            .await
            .unwrap();
        assert_eq!(epcs, vec!["urn:epc:id:sgtin:1.1.1"]);

        let types = store
            .distinct_values("tenant-a", Discovery::EventTypes, 100)
            .await
            .unwrap();
        assert_eq!(types, vec!["ObjectEvent"]);
    }

    #[tokio::test]
    async fn duplicate_subscription_names_are_rejected() {
        let store = MemoryStore::new();
        let mut sub = Subscription {
            id: 0,
            name: "daily".to_owned(),
            query_name: "SimpleEventQuery".to_owned(),
            parameters: vec![],
            destination: "https://example.com/hook".to_owned(),
            tenant_id: "tenant-a".to_owned(),
            report_if_empty: false,
            initial_record_time: None,
            last_executed_time: None,
            trigger: SubscriptionTrigger::OnCapture,
            active: true,
            last_error: None,
        };
        store.insert_subscription(&mut sub).await.unwrap();
        assert_eq!(sub.id, 1);

        let mut duplicate = sub.clone();
        duplicate.id = 0;
        let err = store.insert_subscription(&mut duplicate).await.unwrap_err();
        assert!(matches!(err, EpcisError::DuplicateName(name) if name == "daily"));
    }

    #[tokio::test]
    async fn cursor_advance_is_monotonic() {
        let store = MemoryStore::new();
        let mut sub = Subscription {
            id: 0,
            name: "s".to_owned(),
            query_name: "q".to_owned(),
            parameters: vec![],
            destination: "https://example.com".to_owned(),
            tenant_id: "tenant-a".to_owned(),
            report_if_empty: false,
            initial_record_time: None,
            last_executed_time: None,
            trigger: SubscriptionTrigger::OnCapture,
            active: true,
            last_error: None,
        };
        store.insert_subscription(&mut sub).await.unwrap();

        let later = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        store.advance_subscription_cursor(sub.id, later).await.unwrap();
        store.advance_subscription_cursor(sub.id, earlier).await.unwrap();

        let subs = store.list_subscriptions("tenant-a").await.unwrap();
        assert_eq!(subs[0].last_executed_time, Some(later));
    }
}
