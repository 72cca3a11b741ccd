use serde::{Deserialize, Serialize};

// Request models
#[derive(Debug, Deserialize)]
pub struct StateQuery {
    pub state: Option<String>,
}

// Response models
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IndicatorValues {
    pub indicator: String,
    pub state: Option<String>,
    pub count: usize,
    pub values: Vec<serde_json::Value>,
}
