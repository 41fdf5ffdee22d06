//! Tokenized RESP unit types.
//!
//! A [`ProtocolUnit`] is one self-delimited wire value together with the
//! exact byte span it was decoded from. The raw span is immutable once
//! captured: the proxy forwards it verbatim, so fidelity of these bytes
//! is what makes the proxy transparent. Decoded payloads use `Bytes`
//! slices of the same receive buffer, avoiding per-unit copies.

use bytes::Bytes;

/// The decoded shape of a [`ProtocolUnit`].
///
/// A closed sum over the six recognized wire forms. The variant set is
/// fixed; every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// Status line, e.g. `+OK\r\n`. Payload excludes prefix and terminator.
    Status(Bytes),

    /// Error line, e.g. `-ERR unknown command\r\n`.
    Error(Bytes),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    /// `None` is the null bulk, `$-1\r\n`.
    Bulk(Option<Bytes>),

    /// Ordered array of units, e.g. `*2\r\n+a\r\n+b\r\n`.
    /// `None` is the null array, `*-1\r\n`. Element order is significant
    /// and every element carries its own raw span.
    Array(Option<Vec<ProtocolUnit>>),

    /// Legacy inline command line, space-separated with no type prefix.
    /// Payload is the line without its terminator.
    Inline(Bytes),
}

/// One tokenized wire protocol unit: decoded shape plus raw byte span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolUnit {
    raw: Bytes,
    kind: UnitKind,
}

impl ProtocolUnit {
    pub(crate) fn new(raw: Bytes, kind: UnitKind) -> Self {
        Self { raw, kind }
    }

    /// The exact wire bytes this unit was decoded from, including its
    /// prefix and terminators.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// The decoded shape.
    pub fn kind(&self) -> &UnitKind {
        &self.kind
    }

    /// Consumes the unit, returning its parts.
    pub fn into_parts(self) -> (Bytes, UnitKind) {
        (self.raw, self.kind)
    }

    /// The unit's payload as a string-like byte sequence, when it has one.
    ///
    /// Status, error, and inline lines yield their payload; bulk strings
    /// yield their data. Integers, arrays, and nulls yield `None`.
    pub fn string_value(&self) -> Option<&Bytes> {
        match &self.kind {
            UnitKind::Status(s) | UnitKind::Error(s) | UnitKind::Inline(s) => Some(s),
            UnitKind::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_value_per_shape() {
        let status = ProtocolUnit::new(
            Bytes::from_static(b"+OK\r\n"),
            UnitKind::Status(Bytes::from_static(b"OK")),
        );
        assert_eq!(status.string_value().unwrap().as_ref(), b"OK");

        let bulk = ProtocolUnit::new(
            Bytes::from_static(b"$3\r\nfoo\r\n"),
            UnitKind::Bulk(Some(Bytes::from_static(b"foo"))),
        );
        assert_eq!(bulk.string_value().unwrap().as_ref(), b"foo");

        let null_bulk = ProtocolUnit::new(
            Bytes::from_static(b"$-1\r\n"),
            UnitKind::Bulk(None),
        );
        assert!(null_bulk.string_value().is_none());

        let int = ProtocolUnit::new(Bytes::from_static(b":1\r\n"), UnitKind::Integer(1));
        assert!(int.string_value().is_none());
    }

    #[test]
    fn raw_span_is_preserved() {
        let raw = Bytes::from_static(b"*1\r\n$4\r\nping\r\n");
        let unit = ProtocolUnit::new(raw.clone(), UnitKind::Array(Some(vec![])));
        assert_eq!(unit.raw(), &raw);
    }
}
