use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelaySummary {
    pub online: bool,
    pub accounts: Vec<String>,
    pub mode: StreamingMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeResponse {
    pub mode: StreamingMode,
}
