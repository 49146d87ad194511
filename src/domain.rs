use serde::{Deserialize, Serialize};

/// current time as an ISO-8601 string (utc, millisecond precision)
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// a persisted breath-alcohol reading
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Reading {
    /// assigned by the store, strictly increasing
    pub id: i64,
    /// ISO-8601 timestamp of the measurement
    pub timestamp: String,
    /// alcohol level reported by the sensor (%)
    pub alcohol: f64,
    /// alcohol concentration in mg/L, when the source knows it
    pub alcohol_mg_l: Option<f64>,
    /// operator identification
    pub user: String,
    /// free-text observation, may be empty
    pub observaciones: String,
    /// raw adc value from the sensor
    pub sensor_value: Option<i64>,
}

/// a reading that has not been assigned an identity yet
#[derive(Clone, Debug, PartialEq)]
pub struct NewReading {
    pub timestamp: String,
    pub alcohol: f64,
    pub alcohol_mg_l: Option<f64>,
    pub user: String,
    pub observaciones: String,
    pub sensor_value: Option<i64>,
}

impl NewReading {
    pub fn with_id(self, id: i64) -> Reading {
        Reading {
            id,
            timestamp: self.timestamp,
            alcohol: self.alcohol,
            alcohol_mg_l: self.alcohol_mg_l,
            user: self.user,
            observaciones: self.observaciones,
            sensor_value: self.sensor_value,
        }
    }
}

/// the single live state handed to observers
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StateSnapshot {
    /// latest alcohol level (%)
    pub alcohol: f64,
    /// recording armed flag
    pub activo: bool,
    /// timestamp of the measurement that produced `alcohol`
    pub timestamp: String,
}

impl StateSnapshot {
    pub fn initial() -> Self {
        Self {
            alcohol: 0.0,
            activo: false,
            timestamp: now_iso(),
        }
    }
}

/// observer-initiated "save now" request (POST /guardar)
#[derive(Clone, Deserialize, Debug, Default)]
pub struct ManualReading {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub alcohol: Option<f64>,
    #[serde(default)]
    pub alcohol_mg_l: Option<f64>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identificacion: Option<String>,
    #[serde(default)]
    pub observaciones: Option<String>,
    #[serde(default)]
    pub sensor_value: Option<i64>,
}

/// named events pushed through the hub
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// first message of every stream, carries the current snapshot
    Init,
    /// a reading that was just persisted
    NewReading,
    /// a live measurement that was not persisted
    Update,
    /// armed flag changed
    Toggle,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Init => "init",
            EventKind::NewReading => "new-reading",
            EventKind::Update => "update",
            EventKind::Toggle => "toggle",
        }
    }

    /// sse `event:` field; init goes out as a default message
    pub fn sse_name(&self) -> Option<&'static str> {
        match self {
            EventKind::Init => None,
            other => Some(other.as_str()),
        }
    }
}

/// body of the init message
#[derive(Serialize, Debug)]
pub struct InitPayload<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub latest: &'a StateSnapshot,
}

/// body of toggle events and /toggle responses
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ArmedPayload {
    pub activo: bool,
}
