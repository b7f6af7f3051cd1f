use std::collections::BTreeMap;

use async_trait::async_trait;
use dhc_core::{Event, Label, LabelId, NaturalKey};
use tokio::sync::Mutex;

use crate::store::{EventStore, StoreError};

/// In-process [`EventStore`] with the same uniqueness rules as the database.
/// Backs dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    labels: Vec<Label>,
    events: BTreeMap<NaturalKey, Event>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn labels(&self) -> Vec<Label> {
        self.state.lock().await.labels.clone()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.values().cloned().collect()
    }

    pub async fn events_for(&self, label_id: LabelId) -> Vec<Event> {
        self.state
            .lock()
            .await
            .events
            .values()
            .filter(|e| e.label_id == label_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn find_label(&self, name: &str) -> Result<Option<Label>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.labels.iter().find(|l| l.name == name).cloned())
    }

    async fn create_label(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.labels.iter().any(|l| l.name == name) {
            return Ok(());
        }
        let id = LabelId(state.labels.len() as i32 + 1);
        state.labels.push(Label {
            id,
            name: name.to_string(),
        });
        Ok(())
    }

    async fn find_event(&self, key: &NaturalKey) -> Result<Option<Event>, StoreError> {
        Ok(self.state.lock().await.events.get(key).cloned())
    }

    async fn insert_events(&self, events: &[Event]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for event in events {
            let key = event.natural_key();
            if state.events.contains_key(&key) {
                continue;
            }
            state.events.insert(key, event.clone());
            written += 1;
        }
        Ok(written)
    }

    async fn update_event(&self, event: &Event) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        match state.events.get_mut(&event.natural_key()) {
            Some(stored) => {
                stored.apply_mutable_fields(event);
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn event(title: &str, text: &str) -> Event {
        Event {
            timestamp: dhc_core::midnight(NaiveDate::from_ymd_opt(2018, 6, 15).unwrap()),
            title: title.into(),
            text: text.into(),
            link: String::new(),
            label_id: LabelId(1),
            image_link: String::new(),
            media_link: String::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_natural_keys_are_never_stored_twice() {
        let store = MemoryEventStore::new();
        let written = store
            .insert_events(&[event("A", "x"), event("A", "y"), event("B", "z")])
            .await
            .unwrap();
        assert_eq!(written, 2);
        let again = store.insert_events(&[event("A", "w")]).await.unwrap();
        assert_eq!(again, 0);
        let stored = store.events().await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].text, "x");
    }

    #[tokio::test]
    async fn labels_are_unique_by_name() {
        let store = MemoryEventStore::new();
        store.create_label("Movies").await.unwrap();
        store.create_label("Movies").await.unwrap();
        store.create_label("Wikipedia").await.unwrap();
        let labels = store.labels().await;
        assert_eq!(labels.len(), 2);
        assert_eq!(
            store.find_label("Wikipedia").await.unwrap().map(|l| l.id),
            Some(LabelId(2))
        );
    }

    #[tokio::test]
    async fn updates_only_touch_existing_rows() {
        let store = MemoryEventStore::new();
        store.insert_events(&[event("A", "x")]).await.unwrap();
        assert_eq!(store.update_event(&event("A", "y")).await.unwrap(), 1);
        assert_eq!(store.update_event(&event("Missing", "y")).await.unwrap(), 0);
        assert_eq!(store.events().await[0].text, "y");
    }
}
