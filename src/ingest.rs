//! ==============================================================================
//! ingest.rs - accepting readings from the device and from observers
//! ==============================================================================
//!
//! purpose:
//!     turns raw pushes into register updates, stored readings and hub events.
//!
//! flow (device push):
//!
//!     raw json ──parse (never rejects)──► DevicePush
//!         │
//!         ├─ save=false ─► register.set_measurement ─► publish "update"
//!         │
//!         └─ save=true ──► store.append ─┬─ ok ──► register ─► publish "new-reading"
//!                                        └─ err ─► register ─► publish "update"
//!                                                  (error still returned)
//!
//!     the live state always moves forward, even when the disk does not.
//!     every publish that follows a register change happens inside the
//!     register's write guard, so no toggle can slip between the change
//!     and its event.
//!
//! ==============================================================================

use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::config::OperatorConfig;
use crate::domain::{now_iso, EventKind, ManualReading, NewReading, Reading, StateSnapshot};
use crate::error::{StorageError, ValidationError};
use crate::hub::BroadcastHub;
use crate::register::StateRegister;
use crate::store::ReadingStore;

/// a device push after lenient validation
#[derive(Debug, Default, PartialEq)]
pub struct DevicePush {
    pub alcohol: f64,
    pub save: bool,
    pub timestamp: Option<String>,
    pub alcohol_mg_l: Option<f64>,
    pub user: Option<String>,
    pub observaciones: Option<String>,
    pub sensor_value: Option<i64>,
}

impl DevicePush {
    /// every problem is reported and replaced by a default, nothing is rejected
    pub fn parse(raw: &Value) -> (Self, Vec<ValidationError>) {
        let mut issues = Vec::new();
        let empty = Map::new();
        let obj = match raw {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                issues.push(ValidationError::NotAnObject);
                &empty
            }
        };

        let alcohol = match obj.get("alcohol") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            None | Some(Value::Null) => {
                issues.push(ValidationError::MissingMeasurement);
                0.0
            }
            Some(other) => {
                issues.push(ValidationError::InvalidMeasurement(other.to_string()));
                0.0
            }
        };

        let save = match obj.get("save") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                issues.push(ValidationError::InvalidField {
                    field: "save",
                    value: other.to_string(),
                });
                false
            }
        };

        let push = DevicePush {
            alcohol,
            save,
            timestamp: opt_string(obj, "timestamp", &mut issues),
            alcohol_mg_l: opt_f64(obj, "alcohol_mg_l", &mut issues),
            user: opt_string(obj, "user", &mut issues),
            observaciones: opt_string(obj, "observaciones", &mut issues),
            sensor_value: opt_i64(obj, "sensor_value", &mut issues),
        };
        (push, issues)
    }
}

fn opt_f64(obj: &Map<String, Value>, field: &'static str, issues: &mut Vec<ValidationError>) -> Option<f64> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64(),
        Some(other) => {
            issues.push(ValidationError::InvalidField { field, value: other.to_string() });
            None
        }
    }
}

fn opt_i64(obj: &Map<String, Value>, field: &'static str, issues: &mut Vec<ValidationError>) -> Option<i64> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) if n.as_i64().is_some() => n.as_i64(),
        Some(other) => {
            issues.push(ValidationError::InvalidField { field, value: other.to_string() });
            None
        }
    }
}

/// empty strings count as absent
fn opt_string(obj: &Map<String, Value>, field: &'static str, issues: &mut Vec<ValidationError>) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => non_empty(Some(s.clone())),
        Some(other) => {
            issues.push(ValidationError::InvalidField { field, value: other.to_string() });
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// stored and broadcast as new-reading
    Persisted(Reading),
    /// live only, broadcast as update
    Live(StateSnapshot),
}

pub struct IngestionService {
    store: ReadingStore,
    register: Arc<StateRegister>,
    hub: BroadcastHub,
    operator: RwLock<String>,
    defaults: OperatorConfig,
    show_sensor_data: bool,
}

impl IngestionService {
    pub fn new(
        store: ReadingStore,
        register: Arc<StateRegister>,
        hub: BroadcastHub,
        defaults: OperatorConfig,
        show_sensor_data: bool,
    ) -> Self {
        Self {
            store,
            register,
            hub,
            operator: RwLock::new(defaults.default_user.clone()),
            defaults,
            show_sensor_data,
        }
    }

    pub async fn ingest_measurement(&self, raw: &Value) -> Result<IngestOutcome, StorageError> {
        let (push, issues) = DevicePush::parse(raw);
        for issue in &issues {
            warn!("[INGEST] {} (defaulted)", issue);
        }

        if self.show_sensor_data {
            info!("[INGEST] Alcohol: {:.2}% | save: {}", push.alcohol, push.save);
        } else {
            debug!("[INGEST] Alcohol: {:.2}% | save: {}", push.alcohol, push.save);
        }

        let timestamp = push.timestamp.clone().unwrap_or_else(now_iso);

        if !push.save {
            return Ok(IngestOutcome::Live(self.live_update(push.alcohol, timestamp)));
        }

        let reading = NewReading {
            timestamp: timestamp.clone(),
            alcohol: push.alcohol,
            alcohol_mg_l: push.alcohol_mg_l,
            user: push.user.unwrap_or_else(|| self.defaults.device_user.clone()),
            observaciones: push.observaciones.unwrap_or_default(),
            sensor_value: push.sensor_value,
        };

        match self.store.append(reading).await {
            Ok(entry) => {
                self.register
                    .set_measurement_with(entry.alcohol, entry.timestamp.clone(), |_| {
                        self.hub.publish(EventKind::NewReading, &entry);
                    });
                info!("[INGEST] Saved reading {} from device", entry.id);
                Ok(IngestOutcome::Persisted(entry))
            }
            Err(err) => {
                error!("[INGEST] Device reading not persisted, sending live update: {}", err);
                self.live_update(push.alcohol, timestamp);
                Err(err)
            }
        }
    }

    fn live_update(&self, alcohol: f64, timestamp: String) -> StateSnapshot {
        self.register.set_measurement_with(alcohol, timestamp, |snapshot| {
            self.hub.publish(EventKind::Update, snapshot);
        })
    }

    /// observer "save now". always persists, never touches the live state.
    pub async fn ingest_manual_reading(&self, manual: ManualReading) -> Result<Reading, StorageError> {
        let reading = NewReading {
            timestamp: non_empty(manual.timestamp).unwrap_or_else(now_iso),
            alcohol: manual.alcohol.or(manual.alcohol_mg_l).unwrap_or(0.0),
            alcohol_mg_l: manual.alcohol_mg_l,
            user: non_empty(manual.user)
                .or_else(|| non_empty(manual.identificacion))
                .unwrap_or_else(|| self.operator()),
            observaciones: manual.observaciones.unwrap_or_default(),
            sensor_value: manual.sensor_value,
        };

        let entry = self.store.append(reading).await?;
        self.hub.publish(EventKind::NewReading, &entry);
        info!("[INGEST] Saved manual reading {} for {}", entry.id, entry.user);
        Ok(entry)
    }

    pub fn operator(&self) -> String {
        match self.operator.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// blank resets to the configured default
    pub fn set_operator(&self, id: &str) -> String {
        let id = match id.trim() {
            "" => self.defaults.default_user.clone(),
            trimmed => trimmed.to_string(),
        };
        let mut guard = match self.operator.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = id.clone();
        info!("[INGEST] Operator set to {}", id);
        id
    }
}
