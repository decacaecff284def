use std::{borrow::Cow, io};

use runtime::{ExecError, Kwargs, PipeError, QueueStats, RefId, Value, WorkKey};

use crate::{
    Deserialize, Serialize,
    protocol::{self, CORRELATION_SIZE, HEADER_SIZE, Header},
    specs::{PeerSpec, StageSpec},
};

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// The peer is about to close the connection.
    Disconnect,
    /// Tear down the node's runtime and stop serving.
    Shutdown,
}

/// A call answered by exactly one `Response` with the same correlation id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Sets the node's rank and tells it where every other process lives.
    Join {
        rank: usize,
        world_size: usize,
        peers: Vec<PeerSpec>,
    },
    CreateStage {
        name: String,
        spec: StageSpec,
    },
    /// Queues a stage call, answered with `Submitted` before it runs.
    Invoke {
        stage: String,
        args: Vec<Value>,
        kwargs: Kwargs,
        key: WorkKey,
    },
    /// Answered once the referenced slot is set.
    Fetch {
        id: RefId,
    },
    Project {
        id: RefId,
        index: usize,
    },
    Release {
        ids: Vec<RefId>,
    },
    Stats {
        stage: String,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ack,
    Submitted(RefId),
    Value(Value),
    Failed(RemoteError),
    Stats(QueueStats),
}

/// A failure carried across the wire, keeping enough structure to be turned
/// back into the same runtime error on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteError {
    Execution(ExecError),
    DuplicateKey { stage: String, key: WorkKey },
    UnknownStage(String),
    UnknownRef(RefId),
    StageClosed(String),
    Config(String),
    Other(String),
}

impl From<PipeError> for RemoteError {
    fn from(value: PipeError) -> Self {
        match value {
            PipeError::Execution(e) => Self::Execution(e),
            PipeError::DuplicateKey { stage, key } => Self::DuplicateKey { stage, key },
            PipeError::UnknownStage(name) => Self::UnknownStage(name),
            PipeError::UnknownRef(id) => Self::UnknownRef(id),
            PipeError::StageClosed(name) => Self::StageClosed(name),
            PipeError::Config(msg) => Self::Config(msg),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for PipeError {
    fn from(value: RemoteError) -> Self {
        match value {
            RemoteError::Execution(e) => Self::Execution(e),
            RemoteError::DuplicateKey { stage, key } => Self::DuplicateKey { stage, key },
            RemoteError::UnknownStage(name) => Self::UnknownStage(name),
            RemoteError::UnknownRef(id) => Self::UnknownRef(id),
            RemoteError::StageClosed(name) => Self::StageClosed(name),
            RemoteError::Config(msg) => Self::Config(msg),
            RemoteError::Other(msg) => Self::Remote(msg),
        }
    }
}

/// The application layer message of the pipeline protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg<'a> {
    Err(Cow<'a, str>),
    Control(Command),
    Request { id: u64, body: Request },
    Response { id: u64, body: Response },
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("the given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: u32) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received an invalid message kind {kind}"),
        ))
    }

    fn write_json<T: serde::Serialize>(
        buf: &mut Vec<u8>,
        header: Header,
        id: Option<u64>,
        body: &T,
    ) -> io::Result<()> {
        buf.extend_from_slice(&header);
        if let Some(id) = id {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        serde_json::to_writer(buf, body).map_err(io::Error::from)
    }

    fn split_id(rest: &[u8]) -> io::Result<(u64, &[u8])> {
        let Some((id, body)) = rest.split_first_chunk::<CORRELATION_SIZE>() else {
            let size = rest.len() + HEADER_SIZE;
            return Self::buf_is_too_small(size, HEADER_SIZE + CORRELATION_SIZE);
        };
        Ok((u64::from_be_bytes(*id), body))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&protocol::ERR);
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                Self::write_json(buf, protocol::CONTROL, None, cmd)?;
                Ok(None)
            }
            Msg::Request { id, body } => {
                Self::write_json(buf, protocol::REQUEST, Some(*id), body)?;
                Ok(None)
            }
            Msg::Response { id, body } => {
                Self::write_json(buf, protocol::RESPONSE, Some(*id), body)?;
                Ok(None)
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        };

        match *kind {
            protocol::ERR => {
                let msg = std::str::from_utf8(rest)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Self::Err(Cow::Borrowed(msg)))
            }
            protocol::CONTROL => Ok(Self::Control(serde_json::from_slice(rest)?)),
            protocol::REQUEST => {
                let (id, body) = Self::split_id(rest)?;
                Ok(Self::Request {
                    id,
                    body: serde_json::from_slice(body)?,
                })
            }
            protocol::RESPONSE => {
                let (id, body) = Self::split_id(rest)?;
                Ok(Self::Response {
                    id,
                    body: serde_json::from_slice(body)?,
                })
            }
            other => Self::invalid_kind(u32::from_be_bytes(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(msg: &Msg<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf).unwrap();
        buf.extend_from_slice(tail.unwrap_or_default());
        buf
    }

    #[test]
    fn requests_carry_their_correlation_id() {
        let msg = Msg::Request {
            id: 42,
            body: Request::Fetch {
                id: RefId::new(1, 7),
            },
        };
        let buf = frame(&msg);

        assert_eq!(&buf[..HEADER_SIZE], &protocol::REQUEST);
        assert_eq!(&buf[HEADER_SIZE..HEADER_SIZE + 8], &42u64.to_be_bytes());
        assert_eq!(Msg::deserialize(&buf).unwrap(), msg);
    }

    #[test]
    fn error_text_is_sent_raw() {
        let msg = Msg::Err(Cow::Borrowed("boom"));
        let buf = frame(&msg);

        assert_eq!(&buf[HEADER_SIZE..], b"boom");
        assert_eq!(Msg::deserialize(&buf).unwrap(), msg);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(Msg::deserialize(&[0, 0]).is_err());
        assert!(Msg::deserialize(&[0, 0, 0, 9]).is_err());
        assert!(Msg::deserialize(&[0, 0, 0, 2, 1]).is_err());
    }

    #[test]
    fn remote_errors_map_back_to_the_same_variant() {
        let exec = ExecError::new("relu", 3, "bad input");
        let back: PipeError = RemoteError::from(PipeError::Execution(exec.clone())).into();
        assert!(matches!(back, PipeError::Execution(e) if e == exec));

        let unsupported = PipeError::UnsupportedOutput { microbatch: 1 };
        let back: PipeError = RemoteError::from(unsupported).into();
        assert!(matches!(back, PipeError::Remote(_)));
    }
}
