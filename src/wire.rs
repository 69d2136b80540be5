//! Binary message envelope for the session channel.
//!
//! An outer tagged union wraps exactly one of request / response /
//! server push. Requests carry a per-session `msg_id`; the matching
//! response echoes it. Pushed updates carry no `msg_id`. Frames are
//! bincode on the wire, sent as binary WebSocket messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    NotFound,
    BadRequest,
    NoPermission,
    ServerError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WsMessage {
    Request(Request),
    Response(Response),
    Update(Update),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub msg_id: u32,
    pub body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    QuantCreate(QuantCreateParams),
    QuantGet { quant_id: String },
    QuantList { scan_id: String },
    MultiQuantCombine(MultiQuantCombineParams),
    MultiQuantCompare { scan_id: String, roi_id: String, quant_ids: Vec<String> },
    NotificationSubscribe,
    NotificationDismiss { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub msg_id: u32,
    pub status: ResponseStatus,
    pub error_text: String,
    pub body: Option<ResponseBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    QuantCreate { job: JobStatusMsg },
    QuantGet { summary: QuantSummaryMsg },
    QuantList { summaries: Vec<QuantSummaryMsg> },
    MultiQuantCombine { job: JobStatusMsg },
    MultiQuantCompare { tables: Vec<QuantComparisonTable> },
    NotificationSubscribe,
    NotificationDismiss,
}

/// Server-initiated pushes; no `msg_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Update {
    JobStatus(JobStatusMsg),
    Notification(UserNotification),
    SysNotify(SysEvent),
}

/// Lightweight cache-invalidation broadcast; never persisted or emailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysEvent {
    ScanChanged,
    ScanImagesChanged,
    QuantChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Starting,
    PreparingNodes,
    Running,
    GatheringResults,
    Complete,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "STARTING",
            JobState::PreparingNodes => "PREPARING_NODES",
            JobState::Running => "RUNNING",
            JobState::GatheringResults => "GATHERING_RESULTS",
            JobState::Complete => "COMPLETE",
            JobState::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "STARTING" => Some(JobState::Starting),
            "PREPARING_NODES" => Some(JobState::PreparingNodes),
            "RUNNING" => Some(JobState::Running),
            "GATHERING_RESULTS" => Some(JobState::GatheringResults),
            "COMPLETE" => Some(JobState::Complete),
            "ERROR" => Some(JobState::Error),
            _ => None,
        }
    }
}

/// Job snapshot as delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusMsg {
    pub job_id: String,
    pub job_type: String,
    pub job_item_id: String,
    pub requestor_user_id: String,
    pub name: String,
    pub elements: Vec<String>,
    pub status: JobState,
    pub message: String,
    pub start_unix_sec: i64,
    pub last_update_unix_sec: i64,
    pub end_unix_sec: i64,
    pub output_file_path: String,
    pub log_id: String,
    pub other_log_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantSummaryMsg {
    pub id: String,
    pub scan_id: String,
    pub name: String,
    pub elements: Vec<String>,
    pub status: JobStatusMsg,
    pub params: QuantParams,
}

/// Creation parameters recorded with a quantification. Kept as a closed
/// enum so summary frames stay bincode-serializable end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuantParams {
    Map(QuantCreateParams),
    MultiQuant {
        description: String,
        z_stack: Vec<ZStackLayer>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotification {
    pub id: String,
    pub subject: String,
    pub contents: String,
    pub from: String,
    pub link: String,
    pub timestamp_unix_sec: i64,
    pub notification_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantCreateParams {
    pub command: String,
    pub name: String,
    pub scan_id: String,
    pub elements: Vec<String>,
    pub detector_config: String,
    pub parameters: String,
    pub run_time_sec: u32,
    /// Run-length encoded PMC list; decoded on receipt.
    pub pmcs: Vec<i32>,
    pub roi_ids: Vec<String>,
    pub include_dwells: bool,
    pub quant_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiQuantCombineParams {
    pub scan_id: String,
    pub name: String,
    pub description: String,
    /// Top-down layers; the synthetic `RemainingPoints` layer must be last.
    pub z_stack: Vec<ZStackLayer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZStackLayer {
    pub roi_id: String,
    pub quant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantComparisonTable {
    pub quant_id: String,
    pub quant_name: String,
    /// Element label -> average weight percent over the ROI.
    pub element_weights: Vec<(String, f32)>,
}

pub fn encode(msg: &WsMessage) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode(bytes: &[u8]) -> anyhow::Result<WsMessage> {
    Ok(bincode::deserialize(bytes)?)
}
