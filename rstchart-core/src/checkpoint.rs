//! Session checkpoints and the store they are written to.

use crate::error::{SessionError, StoreError};
use chrono::{DateTime, Utc};
use rstchart_model::{DocumentId, Event, InterpreterModel};
use rstchart_value::DataValue;
use serde::{Deserialize, Serialize};

/// Opaque key-value sink for checkpoints, keyed by session id.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Recorded history of one history state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub state: DocumentId,
    pub states: Vec<DocumentId>,
}

/// An invoke that was running when the checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeRecord {
    pub invoke_id: String,
    pub state: DocumentId,
    /// Position of the declaration within the state's invokes.
    pub index: usize,
    pub autoforward: bool,
}

/// A delayed send that had not fired when the checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedRecord {
    pub send_id: String,
    pub target: Option<String>,
    pub event: Event,
    /// When the send fires. A restored session waits only for what is left.
    pub due: DateTime<Utc>,
}

/// Session state at a macrostep boundary.
///
/// Pending delayed sends are kept with their due time. One that fires after
/// the last checkpoint and before the process exits is sent again on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub document: Option<String>,
    pub configuration: Vec<DocumentId>,
    pub history: Vec<HistoryRecord>,
    pub data: DataValue,
    /// States whose late-bound data has been initialized.
    pub initialized: Vec<DocumentId>,
    pub invokes: Vec<InvokeRecord>,
    #[serde(default)]
    pub delayed: Vec<DelayedRecord>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Checks that every id refers to a state of `model`.
    pub fn validate(&self, model: &InterpreterModel) -> Result<(), SessionError> {
        let check = |id: &DocumentId, what: &str| match model.state(*id) {
            Ok(state) if what != "configuration" || !state.is_history() => Ok(()),
            _ => Err(SessionError::Checkpoint(format!(
                "{} refers to {} which is not a valid state",
                what, id
            ))),
        };

        for id in &self.configuration {
            check(id, "configuration")?;
        }
        for record in &self.history {
            check(&record.state, "history")?;
            for id in &record.states {
                check(id, "history")?;
            }
        }
        for id in &self.initialized {
            check(id, "initialized")?;
        }
        for invoke in &self.invokes {
            let state = model.state(invoke.state)?;
            if invoke.index >= state.invokes.len() {
                return Err(SessionError::Checkpoint(format!(
                    "invoke '{}' refers to a missing declaration",
                    invoke.invoke_id
                )));
            }
        }
        if !matches!(self.data, DataValue::Object(_)) {
            return Err(SessionError::Checkpoint(
                "data store is not an object".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstchart_value::DataObject;

    fn checkpoint() -> Checkpoint {
        let data = DataObject::new();
        data.set("n", DataValue::from(3)).unwrap();
        Checkpoint {
            session_id: "s1".to_string(),
            document: Some("doc".to_string()),
            configuration: vec![DocumentId(2), DocumentId(4)],
            history: vec![HistoryRecord {
                state: DocumentId(3),
                states: vec![DocumentId(4)],
            }],
            data: DataValue::Object(data),
            initialized: vec![DocumentId(0)],
            invokes: vec![InvokeRecord {
                invoke_id: "a.worker".to_string(),
                state: DocumentId(2),
                index: 0,
                autoforward: false,
            }],
            delayed: vec![DelayedRecord {
                send_id: "t1".to_string(),
                target: None,
                event: Event::new("timeout"),
                due: Utc::now(),
            }],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let original = checkpoint();
        let decoded = Checkpoint::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_without_delayed_sends() {
        let mut json: serde_json::Value =
            serde_json::from_slice(&checkpoint().encode().unwrap()).unwrap();
        json.as_object_mut().unwrap().remove("delayed");
        let decoded = Checkpoint::decode(&serde_json::to_vec(&json).unwrap()).unwrap();
        assert!(decoded.delayed.is_empty());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Checkpoint::decode(b"not json"),
            Err(StoreError::Serialization(_))
        ));
    }
}
