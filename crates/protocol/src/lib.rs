use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod payload;

pub use payload::{
    AnnotationGroup, CommonAnnotations, DumpReport, ItemDataRequest, RecordDetail, RecordSummary,
    SetAnnotationRequest,
};

/// Event name carried by error replies.
pub const ERROR_EVENT: &str = "ERROR";

/// Request operations understood by the annotation server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetAnnotationList,
    GetCommonAnnotationList,
    GetList,
    GetItemData,
    SetAnnotation,
    DumpSignals,
    Shutdown,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::GetAnnotationList,
        Operation::GetCommonAnnotationList,
        Operation::GetList,
        Operation::GetItemData,
        Operation::SetAnnotation,
        Operation::DumpSignals,
        Operation::Shutdown,
    ];

    #[must_use]
    pub fn from_event(event: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.event_name() == event.trim())
    }

    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            Operation::GetAnnotationList => "GET_ANNOTATION_LIST",
            Operation::GetCommonAnnotationList => "GET_COMMON_ANNOTATION_LIST",
            Operation::GetList => "GET_LIST",
            Operation::GetItemData => "GET_ITEM_DATA",
            Operation::SetAnnotation => "SET_ANNOTATION",
            Operation::DumpSignals => "DUMP_SIGNALS",
            Operation::Shutdown => "SHUTDOWN",
        }
    }

    /// Event name of the reply. Also used for unsolicited pushes of the same payload.
    #[must_use]
    pub fn response_event(self) -> &'static str {
        match self {
            Operation::GetAnnotationList => "GOT_ANNOTATION_LIST",
            Operation::GetCommonAnnotationList => "GOT_COMMON_ANNOTATION_LIST",
            Operation::GetList => "GOT_LIST",
            Operation::GetItemData => "GOT_ITEM_DATA",
            Operation::SetAnnotation => "ANNOTATION_SET",
            Operation::DumpSignals => "SIGNALS_DUMPED",
            Operation::Shutdown => "SHUTTING_DOWN",
        }
    }
}

/// One inbound line: `{"event": "...", "data": {...}, "meta": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// One outbound line. `meta` echoes the request's meta (null for pushes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub event: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl ResponseEnvelope {
    pub fn reply<T: Serialize>(
        op: Operation,
        data: &T,
        meta: serde_json::Value,
    ) -> Result<ResponseEnvelope> {
        Ok(Self {
            event: op.response_event().to_string(),
            data: serde_json::to_value(data)?,
            meta,
        })
    }

    #[must_use]
    pub fn error(code: &str, message: impl Into<String>, meta: serde_json::Value) -> Self {
        let envelope = ErrorEnvelope {
            code: code.to_string(),
            message: message.into(),
        };
        Self {
            event: ERROR_EVENT.to_string(),
            data: serde_json::to_value(envelope).unwrap_or(serde_json::Value::Null),
            meta,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

pub fn serialize_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}
