//! shoal-protocol: RESP wire protocol tokenizer and command model.
//!
//! Provides incremental, zero-copy tokenizing of the RESP wire format and
//! a lightweight command view used by the proxy for routing decisions.
//! Every tokenized unit retains its exact raw byte span so the proxy can
//! forward commands and responses verbatim, without re-encoding.
//!
//! # quick start
//!
//! ```
//! use bytes::Bytes;
//! use shoal_protocol::{scan, UnitKind};
//!
//! let input = Bytes::from_static(b"+OK\r\n");
//! let (unit, consumed) = scan(&input, false).unwrap().unwrap();
//! assert_eq!(consumed, 5);
//! assert_eq!(unit.raw(), b"+OK\r\n".as_slice());
//! assert!(matches!(unit.kind(), UnitKind::Status(s) if s.as_ref() == b"OK"));
//! ```

pub mod command;
pub mod error;
pub mod reply;
pub mod scan;
pub mod types;

pub use command::Command;
pub use error::ProtocolError;
pub use scan::{scan, scan_slice};
pub use types::{ProtocolUnit, UnitKind};
