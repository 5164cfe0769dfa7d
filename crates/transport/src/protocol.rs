//! Client protocol codec.
//!
//! Operations are text control lines terminated by `\r\n`. `PUB` and `MSG`
//! carry a byte count and are followed by the payload and another `\r\n`.
//! The [`Decoder`] is streaming: feed it whatever chunks arrive from the link
//! and pull complete operations out.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CRLF: &[u8] = b"\r\n";

/// Longest control line accepted before a terminator is seen
pub const MAX_CONTROL_LINE: usize = 4096;

/// Payload limit of a [`Decoder`] until the peer announces its own
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Errors produced while encoding or decoding protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Control line exceeded [`MAX_CONTROL_LINE`]
    #[error("control line exceeds {MAX_CONTROL_LINE} bytes")]
    ControlLineTooLong,

    /// Control line is not UTF-8
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,

    /// Operation name not recognized
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// Wrong number or format of arguments
    #[error("malformed operation: {0}")]
    Malformed(String),

    /// Announced payload is larger than the decoder accepts
    #[error("payload of {len} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Byte count from the control line
        len: usize,
        /// Limit in force
        limit: usize,
    },

    /// JSON body of `CONNECT`/`INFO` could not be processed
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Options sent in `CONNECT`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    /// Ask the server to acknowledge every operation with `+OK`
    pub verbose: bool,
    /// Ask the server for strict checking
    pub pedantic: bool,
    /// Client implementation language
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    /// Client implementation version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Client name shown in server monitoring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Protocol level
    #[serde(default)]
    pub protocol: u8,
    /// Receive our own publishes
    #[serde(default)]
    pub echo: bool,
    /// Token authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Username authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

/// Server greeting carried in `INFO`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// Unique server identifier
    pub server_id: String,
    /// Server name
    pub server_name: String,
    /// Server version
    pub version: String,
    /// Largest payload the server accepts (0 = unknown)
    pub max_payload: usize,
    /// Whether the server requires authentication
    pub auth_required: bool,
    /// Whether the server requires TLS
    pub tls_required: bool,
    /// Whether the server supports headers
    pub headers: bool,
}

/// Operations sent by a client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientOp {
    /// Handshake options
    Connect(Box<ConnectInfo>),
    /// Publish a message
    Pub {
        /// Destination subject
        subject: String,
        /// Optional reply subject
        reply_to: Option<String>,
        /// Message body
        payload: Bytes,
    },
    /// Register interest in a subject pattern
    Sub {
        /// Subject pattern
        subject: String,
        /// Subscription identifier chosen by the client
        sid: u64,
    },
    /// Remove interest
    Unsub {
        /// Subscription identifier
        sid: u64,
        /// Unsubscribe after this many more messages
        max_msgs: Option<u64>,
    },
    /// Liveness probe
    Ping,
    /// Liveness answer
    Pong,
}

/// Operations sent by a server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerOp {
    /// Server greeting or update
    Info(Box<ServerInfo>),
    /// Delivered message
    Msg {
        /// Concrete subject the message was published to
        subject: String,
        /// Subscription the delivery is for
        sid: u64,
        /// Optional reply subject
        reply_to: Option<String>,
        /// Message body
        payload: Bytes,
    },
    /// Liveness probe
    Ping,
    /// Liveness answer
    Pong,
    /// Acknowledgement in verbose mode
    Ok,
    /// Error reported by the server
    Err(String),
}

impl ClientOp {
    /// Encode the operation into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] if `CONNECT` options fail to serialize.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Connect(info) => {
                buf.put_slice(b"CONNECT ");
                buf.put_slice(&serde_json::to_vec(info)?);
                buf.put_slice(CRLF);
            }
            Self::Pub {
                subject,
                reply_to,
                payload,
            } => {
                let line = reply_to.as_ref().map_or_else(
                    || format!("PUB {subject} {}\r\n", payload.len()),
                    |reply| format!("PUB {subject} {reply} {}\r\n", payload.len()),
                );
                buf.reserve(line.len() + payload.len() + 2);
                buf.put_slice(line.as_bytes());
                buf.put_slice(payload);
                buf.put_slice(CRLF);
            }
            Self::Sub { subject, sid } => {
                buf.put_slice(format!("SUB {subject} {sid}\r\n").as_bytes());
            }
            Self::Unsub { sid, max_msgs } => {
                let line = max_msgs.map_or_else(
                    || format!("UNSUB {sid}\r\n"),
                    |max| format!("UNSUB {sid} {max}\r\n"),
                );
                buf.put_slice(line.as_bytes());
            }
            Self::Ping => buf.put_slice(b"PING\r\n"),
            Self::Pong => buf.put_slice(b"PONG\r\n"),
        }
        Ok(buf.freeze())
    }
}

impl ServerOp {
    /// Encode the operation into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] if `INFO` fails to serialize.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Info(info) => {
                buf.put_slice(b"INFO ");
                buf.put_slice(&serde_json::to_vec(info)?);
                buf.put_slice(CRLF);
            }
            Self::Msg {
                subject,
                sid,
                reply_to,
                payload,
            } => {
                let line = reply_to.as_ref().map_or_else(
                    || format!("MSG {subject} {sid} {}\r\n", payload.len()),
                    |reply| format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()),
                );
                buf.reserve(line.len() + payload.len() + 2);
                buf.put_slice(line.as_bytes());
                buf.put_slice(payload);
                buf.put_slice(CRLF);
            }
            Self::Ping => buf.put_slice(b"PING\r\n"),
            Self::Pong => buf.put_slice(b"PONG\r\n"),
            Self::Ok => buf.put_slice(b"+OK\r\n"),
            Self::Err(message) => buf.put_slice(format!("-ERR '{message}'\r\n").as_bytes()),
        }
        Ok(buf.freeze())
    }
}

/// Streaming decoder for either side of the protocol
///
/// Byte counts above the payload limit are rejected before anything is
/// buffered for them.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_payload: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// A control line split into its parts
struct ControlLine {
    /// Bytes consumed by the line including the terminator
    consumed: usize,
    op: String,
    args: String,
}

impl Decoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty decoder that accepts payloads of at most
    /// `max_payload` bytes.
    #[must_use]
    pub fn with_max_payload(max_payload: usize) -> Self {
        let mut decoder = Self::new();
        decoder.set_max_payload(max_payload);
        decoder
    }

    /// Change the payload limit. `0` means unknown and restores
    /// [`DEFAULT_MAX_PAYLOAD`].
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = if max_payload == 0 {
            DEFAULT_MAX_PAYLOAD
        } else {
            max_payload
        };
    }

    /// Current payload limit.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not yet decoded bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete server operation, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the buffered bytes cannot be a valid
    /// server operation. The decoder should be discarded afterwards.
    pub fn next_server_op(&mut self) -> Result<Option<ServerOp>, ProtocolError> {
        let Some(line) = self.control_line()? else {
            return Ok(None);
        };

        let op = match line.op.as_str() {
            "MSG" => {
                let args: Vec<&str> = line.args.split_whitespace().collect();
                let (subject, sid, reply_to, len) = match args.as_slice() {
                    [subject, sid, len] => (*subject, *sid, None, *len),
                    [subject, sid, reply, len] => (*subject, *sid, Some(*reply), *len),
                    _ => return Err(ProtocolError::Malformed(format!("MSG {}", line.args))),
                };
                let sid = parse_number(sid, &line)?;
                let len = parse_number(len, &line)?;
                let subject = subject.to_string();
                let reply_to = reply_to.map(str::to_string);

                let Some(payload) = self.take_payload(line.consumed, len)? else {
                    return Ok(None);
                };

                return Ok(Some(ServerOp::Msg {
                    subject,
                    sid,
                    reply_to,
                    payload,
                }));
            }
            "INFO" => ServerOp::Info(Box::new(serde_json::from_str(&line.args)?)),
            "PING" => ServerOp::Ping,
            "PONG" => ServerOp::Pong,
            "+OK" => ServerOp::Ok,
            "-ERR" => ServerOp::Err(
                line.args
                    .trim()
                    .trim_start_matches('\'')
                    .trim_end_matches('\'')
                    .to_string(),
            ),
            other => return Err(ProtocolError::UnknownOperation(other.to_string())),
        };

        self.buf.advance(line.consumed);
        Ok(Some(op))
    }

    /// Decode the next complete client operation, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the buffered bytes cannot be a valid
    /// client operation. The decoder should be discarded afterwards.
    pub fn next_client_op(&mut self) -> Result<Option<ClientOp>, ProtocolError> {
        let Some(line) = self.control_line()? else {
            return Ok(None);
        };

        let op = match line.op.as_str() {
            "PUB" => {
                let args: Vec<&str> = line.args.split_whitespace().collect();
                let (subject, reply_to, len) = match args.as_slice() {
                    [subject, len] => (*subject, None, *len),
                    [subject, reply, len] => (*subject, Some(*reply), *len),
                    _ => return Err(ProtocolError::Malformed(format!("PUB {}", line.args))),
                };
                let len = parse_number(len, &line)?;
                let subject = subject.to_string();
                let reply_to = reply_to.map(str::to_string);

                let Some(payload) = self.take_payload(line.consumed, len)? else {
                    return Ok(None);
                };

                return Ok(Some(ClientOp::Pub {
                    subject,
                    reply_to,
                    payload,
                }));
            }
            "SUB" => {
                // A queue group may sit between subject and sid; it is ignored.
                let args: Vec<&str> = line.args.split_whitespace().collect();
                let (subject, sid) = match args.as_slice() {
                    [subject, sid] | [subject, _, sid] => (*subject, *sid),
                    _ => return Err(ProtocolError::Malformed(format!("SUB {}", line.args))),
                };
                ClientOp::Sub {
                    subject: subject.to_string(),
                    sid: parse_number(sid, &line)?,
                }
            }
            "UNSUB" => {
                let args: Vec<&str> = line.args.split_whitespace().collect();
                match args.as_slice() {
                    [sid] => ClientOp::Unsub {
                        sid: parse_number(sid, &line)?,
                        max_msgs: None,
                    },
                    [sid, max] => ClientOp::Unsub {
                        sid: parse_number(sid, &line)?,
                        max_msgs: Some(parse_number(max, &line)?),
                    },
                    _ => return Err(ProtocolError::Malformed(format!("UNSUB {}", line.args))),
                }
            }
            "CONNECT" => ClientOp::Connect(Box::new(serde_json::from_str(&line.args)?)),
            "PING" => ClientOp::Ping,
            "PONG" => ClientOp::Pong,
            other => return Err(ProtocolError::UnknownOperation(other.to_string())),
        };

        self.buf.advance(line.consumed);
        Ok(Some(op))
    }

    fn control_line(&self) -> Result<Option<ControlLine>, ProtocolError> {
        let Some(end) = self.buf.windows(2).position(|w| w == CRLF) else {
            if self.buf.len() > MAX_CONTROL_LINE {
                return Err(ProtocolError::ControlLineTooLong);
            }
            return Ok(None);
        };

        if end > MAX_CONTROL_LINE {
            return Err(ProtocolError::ControlLineTooLong);
        }

        let text = std::str::from_utf8(&self.buf[..end]).map_err(|_| ProtocolError::InvalidUtf8)?;
        let (op, args) = text
            .trim_start()
            .split_once(|c: char| c == ' ' || c == '\t')
            .unwrap_or((text.trim(), ""));

        Ok(Some(ControlLine {
            consumed: end + CRLF.len(),
            op: op.to_ascii_uppercase(),
            args: args.trim().to_string(),
        }))
    }

    /// Take `len` payload bytes that follow a control line of `header` bytes.
    ///
    /// Returns `None` without consuming anything if the payload has not fully
    /// arrived yet.
    fn take_payload(&mut self, header: usize, len: usize) -> Result<Option<Bytes>, ProtocolError> {
        if len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len,
                limit: self.max_payload,
            });
        }

        let end = header
            .checked_add(len)
            .ok_or_else(|| ProtocolError::Malformed(format!("byte count {len} overflows")))?;
        let total = end + CRLF.len();
        if self.buf.len() < total {
            return Ok(None);
        }

        if &self.buf[end..total] != CRLF {
            return Err(ProtocolError::Malformed(
                "payload not terminated by CRLF".to_string(),
            ));
        }

        let mut frame = self.buf.split_to(total);
        frame.advance(header);
        frame.truncate(len);
        Ok(Some(frame.freeze()))
    }
}

fn parse_number<N: std::str::FromStr>(value: &str, line: &ControlLine) -> Result<N, ProtocolError> {
    value
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("{} {}", line.op, line.args)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pub_with_and_without_reply() {
        let plain = ClientOp::Pub {
            subject: "orders.new".to_string(),
            reply_to: None,
            payload: Bytes::from_static(b"hello"),
        };
        assert_eq!(&plain.encode().unwrap()[..], b"PUB orders.new 5\r\nhello\r\n");

        let request = ClientOp::Pub {
            subject: "svc.echo".to_string(),
            reply_to: Some("_INBOX.abc.1".to_string()),
            payload: Bytes::new(),
        };
        assert_eq!(
            &request.encode().unwrap()[..],
            b"PUB svc.echo _INBOX.abc.1 0\r\n\r\n"
        );
    }

    #[test]
    fn test_decode_several_ops_in_one_chunk() {
        let mut decoder = Decoder::new();
        decoder.extend(b"PING\r\nMSG a.b 7 3\r\nabc\r\n+OK\r\n");

        assert_eq!(decoder.next_server_op().unwrap(), Some(ServerOp::Ping));
        assert_eq!(
            decoder.next_server_op().unwrap(),
            Some(ServerOp::Msg {
                subject: "a.b".to_string(),
                sid: 7,
                reply_to: None,
                payload: Bytes::from_static(b"abc"),
            })
        );
        assert_eq!(decoder.next_server_op().unwrap(), Some(ServerOp::Ok));
        assert_eq!(decoder.next_server_op().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_fragmented_msg() {
        let mut decoder = Decoder::new();
        decoder.extend(b"MSG a.b 1 reply.to 11\r\nhello ");
        assert_eq!(decoder.next_server_op().unwrap(), None);

        decoder.extend(b"world");
        assert_eq!(decoder.next_server_op().unwrap(), None);

        decoder.extend(b"\r\n");
        assert_eq!(
            decoder.next_server_op().unwrap(),
            Some(ServerOp::Msg {
                subject: "a.b".to_string(),
                sid: 1,
                reply_to: Some("reply.to".to_string()),
                payload: Bytes::from_static(b"hello world"),
            })
        );
    }

    #[test]
    fn test_payload_may_contain_crlf() {
        let mut decoder = Decoder::new();
        decoder.extend(b"PUB x 4\r\n\r\n\r\n\r\n");
        assert_eq!(
            decoder.next_client_op().unwrap(),
            Some(ClientOp::Pub {
                subject: "x".to_string(),
                reply_to: None,
                payload: Bytes::from_static(b"\r\n\r\n"),
            })
        );
    }

    #[test]
    fn test_decode_err_strips_quotes() {
        let mut decoder = Decoder::new();
        decoder.extend(b"-ERR 'Authorization Violation'\r\n");
        assert_eq!(
            decoder.next_server_op().unwrap(),
            Some(ServerOp::Err("Authorization Violation".to_string()))
        );
    }

    #[test]
    fn test_decode_info_ignores_unknown_fields() {
        let mut decoder = Decoder::new();
        decoder.extend(
            b"INFO {\"server_id\":\"S1\",\"max_payload\":1024,\"auth_required\":true,\"jetstream\":true}\r\n",
        );
        let Some(ServerOp::Info(info)) = decoder.next_server_op().unwrap() else {
            panic!("expected INFO");
        };
        assert_eq!(info.server_id, "S1");
        assert_eq!(info.max_payload, 1024);
        assert!(info.auth_required);
        assert!(!info.tls_required);
    }

    #[test]
    fn test_connect_carries_credentials() {
        let op = ClientOp::Connect(Box::new(ConnectInfo {
            auth_token: Some("tok".to_string()),
            protocol: 1,
            ..ConnectInfo::default()
        }));
        let mut decoder = Decoder::new();
        decoder.extend(&op.encode().unwrap());
        assert_eq!(decoder.next_client_op().unwrap(), Some(op));
    }

    #[test]
    fn test_sub_and_unsub() {
        let mut decoder = Decoder::new();
        decoder.extend(b"SUB orders.* 3\r\nSUB jobs workers 4\r\nUNSUB 3\r\nUNSUB 4 10\r\n");
        assert_eq!(
            decoder.next_client_op().unwrap(),
            Some(ClientOp::Sub {
                subject: "orders.*".to_string(),
                sid: 3
            })
        );
        assert_eq!(
            decoder.next_client_op().unwrap(),
            Some(ClientOp::Sub {
                subject: "jobs".to_string(),
                sid: 4
            })
        );
        assert_eq!(
            decoder.next_client_op().unwrap(),
            Some(ClientOp::Unsub {
                sid: 3,
                max_msgs: None
            })
        );
        assert_eq!(
            decoder.next_client_op().unwrap(),
            Some(ClientOp::Unsub {
                sid: 4,
                max_msgs: Some(10)
            })
        );
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        let mut decoder = Decoder::new();
        decoder.extend(b"HELLO\r\n");
        assert!(matches!(
            decoder.next_server_op(),
            Err(ProtocolError::UnknownOperation(op)) if op == "HELLO"
        ));

        let mut decoder = Decoder::new();
        decoder.extend(b"MSG a.b notanumber 3\r\nabc\r\n");
        assert!(matches!(
            decoder.next_server_op(),
            Err(ProtocolError::Malformed(_))
        ));

        let mut decoder = Decoder::new();
        decoder.extend(b"MSG a.b 1 3\r\nabcXY");
        assert!(matches!(
            decoder.next_server_op(),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_unterminated_long_line() {
        let mut decoder = Decoder::new();
        decoder.extend(&vec![b'A'; MAX_CONTROL_LINE + 1]);
        assert!(matches!(
            decoder.next_server_op(),
            Err(ProtocolError::ControlLineTooLong)
        ));
    }

    #[test]
    fn test_rejects_byte_count_beyond_usize() {
        let mut decoder = Decoder::new();
        decoder.extend(b"MSG a 1 18446744073709551615\r\n");
        assert!(matches!(
            decoder.next_server_op(),
            Err(ProtocolError::PayloadTooLarge { len: usize::MAX, limit: DEFAULT_MAX_PAYLOAD })
        ));

        let mut decoder = Decoder::new();
        decoder.extend(b"PUB a 18446744073709551615\r\n");
        assert!(matches!(
            decoder.next_client_op(),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_payload_before_buffering_it() {
        let mut decoder = Decoder::with_max_payload(1024);
        decoder.extend(b"MSG a 1 100000000000\r\n");
        decoder.extend(&[b'x'; 4096]);
        assert!(matches!(
            decoder.next_server_op(),
            Err(ProtocolError::PayloadTooLarge { len: 100_000_000_000, limit: 1024 })
        ));
    }

    #[test]
    fn test_payload_limit_is_inclusive() {
        let mut decoder = Decoder::with_max_payload(4);
        decoder.extend(b"MSG a 1 4\r\nabcd\r\nMSG a 1 5\r\nabcde\r\n");
        assert!(matches!(
            decoder.next_server_op(),
            Ok(Some(ServerOp::Msg { ref payload, .. })) if &payload[..] == b"abcd"
        ));
        assert!(matches!(
            decoder.next_server_op(),
            Err(ProtocolError::PayloadTooLarge { len: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_zero_limit_restores_default() {
        let mut decoder = Decoder::with_max_payload(16);
        assert_eq!(decoder.max_payload(), 16);
        decoder.set_max_payload(0);
        assert_eq!(decoder.max_payload(), DEFAULT_MAX_PAYLOAD);
    }
}
