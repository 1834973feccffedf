//! Wire codec: self-describing, tagged control/data frames.
//!
//! Grounded on the teacher's choice of a schema'd wire format (protobuf via
//! `tonic`/`prost` in `mem_etcd`) but re-expressed over `serde`/`serde_json`
//! since the transport here is raw UDP, not gRPC. `serde_json` gives us a
//! standard, safe, self-describing encoding without reaching for a
//! language-native object serializer (see DESIGN.md note on
//! `original_source`'s `pickle` usage, which this design explicitly drops).

use serde::{Deserialize, Serialize};

use crate::types::{Mode, SubscriberName, Transaction};

/// Maximum size of an inbound control frame, per spec.
pub const MAX_CONTROL_FRAME: usize = 512;
/// Maximum size of an outbound data frame, per spec.
pub const MAX_DATA_FRAME: usize = 65_536;

/// Inbound, peer-to-broker control commands. Tagged on `command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Register {
        name: SubscriberName,
        mode: Mode,
    },
    Unregister {
        name: SubscriberName,
    },
    Refresh {
        name: SubscriberName,
    },
    SetSubs {
        name: SubscriberName,
        subs: Vec<String>,
    },
    AddSubs {
        name: SubscriberName,
        subs: Vec<String>,
    },
    RemSubs {
        name: SubscriberName,
        subs: Vec<String>,
    },
    Info {
        name: SubscriberName,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<SubscriberName>,
    },
    IsRegistered {
        name: SubscriberName,
    },
    Stop {},
}

/// A snapshot of a subscriber's registry record, returned by `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberSnapshot {
    pub endpoint: String,
    pub filter: Vec<String>,
    pub lease: i64,
}

/// Outbound, broker-to-peer notices. Tagged on `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "info", rename_all = "snake_case")]
pub enum Notice {
    StreamData {
        name: SubscriberName,
        data: Transaction,
    },
    ClientInfo {
        name: SubscriberName,
        data: SubscriberSnapshot,
    },
    Error {
        data: String,
    },
    RefreshReq {
        name: SubscriberName,
    },
    ClientDelete {
        name: SubscriberName,
    },
    Stop {
        name: SubscriberName,
    },
    PingAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<SubscriberName>,
    },
    Registered {
        data: bool,
    },
}

/// Singleton-or-batch wrapper, shared by both frame directions. A batch is
/// processed left-to-right with identical semantics to sending its records
/// sequentially (spec §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Wire<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Wire<T> {
    /// Flatten into an ordered sequence of records, regardless of shape.
    pub fn into_records(self) -> Vec<T> {
        match self {
            Wire::One(record) => vec![record],
            Wire::Many(records) => records,
        }
    }
}

pub type CommandFrame = Wire<Command>;
pub type NoticeFrame = Wire<Notice>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds maximum size of {max} bytes (got {actual})")]
    TooLarge { max: usize, actual: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode a control frame (singleton or batch of [`Command`]) from bytes,
/// enforcing spec's 512-byte control frame cap.
pub fn decode_commands(bytes: &[u8]) -> Result<Vec<Command>, CodecError> {
    if bytes.len() > MAX_CONTROL_FRAME {
        return Err(CodecError::TooLarge {
            max: MAX_CONTROL_FRAME,
            actual: bytes.len(),
        });
    }
    let wire: CommandFrame = serde_json::from_slice(bytes)?;
    Ok(wire.into_records())
}

/// Encode a single [`Notice`] to bytes, enforcing spec's 65536-byte data
/// frame cap (the generous cap applies uniformly since `stream_data`
/// notices carry the largest payloads).
pub fn encode_notice(notice: &Notice) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(notice)?;
    if bytes.len() > MAX_DATA_FRAME {
        return Err(CodecError::TooLarge {
            max: MAX_DATA_FRAME,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Encode a batch of commands as a single wire frame (used by the client
/// when it needs to send `register` + `set_subs` atomically).
pub fn encode_commands(commands: &[Command]) -> Result<Vec<u8>, CodecError> {
    let wire = if commands.len() == 1 {
        Wire::One(commands[0].clone())
    } else {
        Wire::Many(commands.to_vec())
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Decode a data frame ([`Notice`], always singleton on this wire) from
/// bytes.
pub fn decode_notice(bytes: &[u8]) -> Result<Notice, CodecError> {
    let wire: NoticeFrame = serde_json::from_slice(bytes)?;
    match wire {
        Wire::One(notice) => Ok(notice),
        Wire::Many(mut notices) if notices.len() == 1 => Ok(notices.remove(0)),
        Wire::Many(_) => Err(CodecError::Malformed(serde::de::Error::custom(
            "expected a single notice",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_singleton_command() {
        let name = SubscriberName::new("alice").unwrap();
        let cmd = Command::Register {
            name: name.clone(),
            mode: Mode::Head,
        };
        let bytes = encode_commands(&[cmd.clone()]).unwrap();
        let decoded = decode_commands(&bytes).unwrap();
        assert_eq!(decoded, vec![cmd]);
    }

    #[test]
    fn round_trips_batch_command() {
        let name = SubscriberName::new("bob").unwrap();
        let cmds = vec![
            Command::Register {
                name: name.clone(),
                mode: Mode::Irreversible,
            },
            Command::SetSubs {
                name: name.clone(),
                subs: vec!["transfer".into()],
            },
        ];
        let bytes = encode_commands(&cmds).unwrap();
        let decoded = decode_commands(&bytes).unwrap();
        assert_eq!(decoded, cmds);
    }

    #[test]
    fn round_trips_notice() {
        let name = SubscriberName::new("carol").unwrap();
        let notice = Notice::StreamData {
            name,
            data: Transaction(serde_json::json!({"block_num": 1, "type": "vote"})),
        };
        let bytes = encode_notice(&notice).unwrap();
        let decoded = decode_notice(&bytes).unwrap();
        assert_eq!(decoded, notice);
    }

    #[test]
    fn rejects_oversized_control_frame() {
        let huge = vec![0u8; MAX_CONTROL_FRAME + 1];
        assert!(matches!(
            decode_commands(&huge),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn malformed_frame_is_rejected_not_panicking() {
        let garbage = b"not json at all {{{";
        assert!(decode_commands(garbage).is_err());
    }
}
