// Data types shared across the bridge

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Named arguments of a call, as sent by the foreground.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// Logical channel a call arrives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Memory,
    Storage,
    Model,
}

impl Channel {
    /// Resolve a channel name. Accepts the bare name (`memory`) or the
    /// name qualified by `namespace` (`com.vertex.cortex/memory`).
    /// `llama` is an alias of `model`.
    pub fn parse(name: &str, namespace: &str) -> Option<Channel> {
        let bare = name
            .strip_prefix(namespace)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(name);

        match bare {
            "memory" => Some(Channel::Memory),
            "storage" => Some(Channel::Storage),
            "model" | "llama" => Some(Channel::Model),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Memory => "memory",
            Channel::Storage => "storage",
            Channel::Model => "model",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation resolved against its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetDeviceMemory,
    GetUsedMemory,
    GetFreeStorage,
    GetTotalStorage,
    GetSnapshot,
    LoadModel,
    SendMessage,
}

impl Operation {
    /// Resolve an operation name; `None` when the channel does not expose it.
    pub fn parse(channel: Channel, name: &str) -> Option<Operation> {
        match (channel, name) {
            (Channel::Memory, "getDeviceMemory") => Some(Operation::GetDeviceMemory),
            (Channel::Memory, "getUsedMemory") => Some(Operation::GetUsedMemory),
            (Channel::Storage, "getFreeStorage") => Some(Operation::GetFreeStorage),
            (Channel::Storage, "getTotalStorage") => Some(Operation::GetTotalStorage),
            (Channel::Memory | Channel::Storage, "getSnapshot") => Some(Operation::GetSnapshot),
            (Channel::Model, "loadModel") => Some(Operation::LoadModel),
            (Channel::Model, "sendMessage") => Some(Operation::SendMessage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::GetDeviceMemory => "getDeviceMemory",
            Operation::GetUsedMemory => "getUsedMemory",
            Operation::GetFreeStorage => "getFreeStorage",
            Operation::GetTotalStorage => "getTotalStorage",
            Operation::GetSnapshot => "getSnapshot",
            Operation::LoadModel => "loadModel",
            Operation::SendMessage => "sendMessage",
        }
    }
}

/// Opaque correlation token linking a call to its eventual worker result.
/// Doubles as the request ID on the worker wire, where 0 means unsolicited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallToken(pub u64);

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A validated model-channel call, before a token is issued.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub channel: Channel,
    pub operation: Operation,
    pub arguments: Arguments,
}

/// A call that has been accepted and holds its correlation token.
/// Immutable once created by the registry.
#[derive(Debug, Clone)]
pub struct Call {
    token: CallToken,
    request: CallRequest,
    created_at: Instant,
}

impl Call {
    pub(crate) fn new(token: CallToken, request: CallRequest) -> Self {
        Self {
            token,
            request,
            created_at: Instant::now(),
        }
    }

    pub fn token(&self) -> CallToken {
        self.token
    }

    pub fn channel(&self) -> Channel {
        self.request.channel
    }

    pub fn operation(&self) -> Operation {
        self.request.operation
    }

    pub fn arguments(&self) -> &Arguments {
        &self.request.arguments
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// Total and available physical memory, in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceMemory {
    #[serde(rename = "totalMB")]
    pub total_mb: u64,
    #[serde(rename = "availMB")]
    pub avail_mb: u64,
}

/// Point-in-time resource figures. Built fresh for every probe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    #[serde(rename = "totalMemoryMB")]
    pub total_memory_mb: u64,
    #[serde(rename = "usedMemoryMB")]
    pub used_memory_mb: u64,
    #[serde(rename = "freeStorageMB")]
    pub free_storage_mb: u64,
    #[serde(rename = "totalStorageMB")]
    pub total_storage_mb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "com.vertex.cortex";

    #[test]
    fn test_channel_parse_bare_and_qualified() {
        assert_eq!(Channel::parse("memory", NS), Some(Channel::Memory));
        assert_eq!(
            Channel::parse("com.vertex.cortex/storage", NS),
            Some(Channel::Storage)
        );
        assert_eq!(
            Channel::parse("com.vertex.cortex/llama", NS),
            Some(Channel::Model)
        );
        assert_eq!(Channel::parse("gpu", NS), None);
        assert_eq!(Channel::parse("other.ns/memory", NS), None);
    }

    #[test]
    fn test_operation_is_scoped_to_channel() {
        assert_eq!(
            Operation::parse(Channel::Memory, "getDeviceMemory"),
            Some(Operation::GetDeviceMemory)
        );
        assert_eq!(Operation::parse(Channel::Memory, "getFreeStorage"), None);
        assert_eq!(Operation::parse(Channel::Model, "getUsedMemory"), None);
        assert_eq!(
            Operation::parse(Channel::Storage, "getSnapshot"),
            Some(Operation::GetSnapshot)
        );
    }

    #[test]
    fn test_snapshot_serializes_with_mb_keys() {
        let snapshot = ResourceSnapshot {
            total_memory_mb: 8000,
            used_memory_mb: 3000,
            free_storage_mb: 1000,
            total_storage_mb: 64000,
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["totalMemoryMB"], 8000);
        assert_eq!(json["freeStorageMB"], 1000);
    }

    #[test]
    fn test_token_display() {
        assert_eq!(CallToken(42).to_string(), "#42");
    }
}
