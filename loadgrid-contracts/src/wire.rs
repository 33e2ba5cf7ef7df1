use crate::resources::IntensityVector;
use serde::{Deserialize, Serialize};

/// `{"error": "..."}` returned on every client or server error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// Node reply to a level update or reset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelsAck {
    pub status: String,
    pub app_name: String,
    pub levels: IntensityVector,
    pub running: bool,
}

/// Body of `POST /system/running`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningToggle {
    #[serde(default)]
    pub is_running: bool,
}
