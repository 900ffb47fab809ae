//! Graph store interface and dual-write coordination.
//!
//! The graph backend is an external collaborator; only its write surface is
//! specified here. Knowledge-graph records are written to the relational
//! store first, then forwarded to the graph store. Graph failures degrade to
//! warnings and never fail the relational save.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::errors::DatacenterError;
use crate::models::{KgEntityData, KgEventData, KgRelationData};
use crate::persistence::ConfigurablePersistence;

/// Write surface of the graph backend.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_entity(&self, entity: &KgEntityData) -> Result<(), DatacenterError>;
    async fn upsert_relation(&self, relation: &KgRelationData) -> Result<(), DatacenterError>;
    async fn record_event(&self, event: &KgEventData) -> Result<(), DatacenterError>;
}

/// No-op graph backend used when none is configured.
pub struct NullGraphStore;

#[async_trait]
impl GraphStore for NullGraphStore {
    async fn upsert_entity(&self, entity: &KgEntityData) -> Result<(), DatacenterError> {
        debug!(entity_id = entity.entity_id, "graph backend disabled, entity not forwarded");
        Ok(())
    }

    async fn upsert_relation(&self, relation: &KgRelationData) -> Result<(), DatacenterError> {
        debug!(
            relation_id = relation.relation_id,
            "graph backend disabled, relation not forwarded"
        );
        Ok(())
    }

    async fn record_event(&self, event: &KgEventData) -> Result<(), DatacenterError> {
        debug!(event_id = event.event_id, "graph backend disabled, event not forwarded");
        Ok(())
    }
}

/// Writes knowledge-graph records to both stores.
pub struct DualWriter {
    persistence: Arc<ConfigurablePersistence>,
    graph: Arc<dyn GraphStore>,
}

impl DualWriter {
    pub fn new(persistence: Arc<ConfigurablePersistence>, graph: Arc<dyn GraphStore>) -> Self {
        Self { persistence, graph }
    }

    pub async fn save_entities(&self, entities: &[KgEntityData]) -> Result<usize, DatacenterError> {
        let saved = self.persistence.save("kg_entity", entities).await?;
        for entity in entities {
            if let Err(e) = self.graph.upsert_entity(entity).await {
                warn!(entity_id = entity.entity_id, "graph write failed: {e}");
            }
        }
        Ok(saved)
    }

    pub async fn save_relations(
        &self,
        relations: &[KgRelationData],
    ) -> Result<usize, DatacenterError> {
        let saved = self.persistence.save("kg_relation", relations).await?;
        for relation in relations {
            if let Err(e) = self.graph.upsert_relation(relation).await {
                warn!(relation_id = relation.relation_id, "graph write failed: {e}");
            }
        }
        Ok(saved)
    }

    pub async fn save_events(&self, events: &[KgEventData]) -> Result<usize, DatacenterError> {
        let saved = self.persistence.save("kg_event", events).await?;
        for event in events {
            if let Err(e) = self.graph.record_event(event).await {
                warn!(event_id = event.event_id, "graph write failed: {e}");
            }
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct RecordingGraph {
        entities: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl GraphStore for RecordingGraph {
        async fn upsert_entity(&self, entity: &KgEntityData) -> Result<(), DatacenterError> {
            if self.fail {
                return Err(DatacenterError::external("graph down", "graph"));
            }
            self.entities.lock().push(entity.entity_id.clone());
            Ok(())
        }

        async fn upsert_relation(&self, _: &KgRelationData) -> Result<(), DatacenterError> {
            Ok(())
        }

        async fn record_event(&self, _: &KgEventData) -> Result<(), DatacenterError> {
            Ok(())
        }
    }

    fn entity(id: &str) -> KgEntityData {
        KgEntityData {
            entity_id: id.to_string(),
            entity_type: "company".to_string(),
            name: "Bank A".to_string(),
            aliases: Vec::new(),
            description: None,
            code: Some("600000".to_string()),
            industry: None,
            properties: HashMap::new(),
            source: "eastmoney".to_string(),
            confidence: 1.0,
            collected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn entities_reach_both_stores() {
        let persistence = Arc::new(ConfigurablePersistence::in_memory().unwrap());
        let graph = Arc::new(RecordingGraph {
            entities: Mutex::new(Vec::new()),
            fail: false,
        });
        let writer = DualWriter::new(persistence.clone(), graph.clone());

        let saved = writer.save_entities(&[entity("e-1")]).await.unwrap();
        assert_eq!(saved, 1);
        assert_eq!(graph.entities.lock().as_slice(), ["e-1"]);

        let rows = persistence
            .query_rows("SELECT entity_id FROM main.kg_entity")
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn graph_failures_do_not_fail_the_relational_save() {
        let persistence = Arc::new(ConfigurablePersistence::in_memory().unwrap());
        let graph = Arc::new(RecordingGraph {
            entities: Mutex::new(Vec::new()),
            fail: true,
        });
        let writer = DualWriter::new(persistence.clone(), graph);

        let saved = writer.save_entities(&[entity("e-2")]).await.unwrap();
        assert_eq!(saved, 1);
    }
}
