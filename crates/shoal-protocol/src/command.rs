//! Command view over a tokenized unit.
//!
//! The proxy never interprets full command semantics; it only needs the
//! name, the first argument (the routing key), and the argument count to
//! classify and route. The original raw bytes ride along so accepted
//! commands are forwarded verbatim, byte for byte.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::{ProtocolUnit, UnitKind};

/// A command derived from one inbound unit. Created per unit, consumed
/// once by the session, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// ASCII-lowercased copy of the command name.
    name: Vec<u8>,
    /// The first argument, used as the routing key. `None` when absent
    /// or null.
    first_arg: Option<Bytes>,
    /// Number of arguments following the name.
    arg_count: usize,
    /// Exact wire bytes of the whole unit.
    raw: Bytes,
}

impl Command {
    /// Derives a command from a tokenized unit.
    ///
    /// Arrays take element 0 as the name and element 1 (null-safe) as the
    /// first argument. Inline lines split on runs of spaces with trimmed
    /// ends. Status, error, integer, and bulk units degrade to a
    /// zero-argument command non-fatally. Null and empty arrays have no
    /// command shape and are a parse error.
    pub fn from_unit(unit: ProtocolUnit) -> Result<Command, ProtocolError> {
        let (raw, kind) = unit.into_parts();

        let (name, first_arg, arg_count) = match kind {
            UnitKind::Array(Some(elements)) => {
                if elements.is_empty() {
                    return Err(ProtocolError::UnrecognizedShape);
                }
                let name = elements[0]
                    .string_value()
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                let first_arg = elements.get(1).and_then(|e| e.string_value()).cloned();
                (name, first_arg, elements.len() - 1)
            }
            UnitKind::Array(None) => return Err(ProtocolError::UnrecognizedShape),
            UnitKind::Inline(line) => {
                let mut tokens = split_spaces(&line);
                let name = tokens.next().map(|r| line.slice(r).to_vec()).unwrap_or_default();
                let first_arg = tokens.next().map(|r| line.slice(r));
                let rest = tokens.count();
                let arg_count = rest + usize::from(first_arg.is_some());
                (name, first_arg, arg_count)
            }
            // other top-level shapes degrade to a bare name, non-fatally
            UnitKind::Status(s) | UnitKind::Error(s) => (s.to_vec(), None, 0),
            UnitKind::Bulk(Some(data)) => (data.to_vec(), None, 0),
            UnitKind::Bulk(None) | UnitKind::Integer(_) => (Vec::new(), None, 0),
        };

        let mut name = name;
        name.make_ascii_lowercase();

        Ok(Command {
            name,
            first_arg,
            arg_count,
            raw,
        })
    }

    /// Lowercased command name bytes.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// The routing key: the command's first argument, when present.
    pub fn first_arg(&self) -> Option<&Bytes> {
        self.first_arg.as_ref()
    }

    /// Number of arguments following the command name.
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    /// Whether more than one argument was supplied.
    pub fn has_multiple_args(&self) -> bool {
        self.arg_count > 1
    }

    /// Exact wire bytes of the unit this command was derived from.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Case-insensitive-free name check (the stored name is already
    /// lowercase).
    pub fn is(&self, name: &[u8]) -> bool {
        self.name == name
    }
}

/// Iterator over non-empty token ranges of a line split on runs of spaces.
/// Leading and trailing runs are trimmed by construction.
fn split_spaces(line: &Bytes) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
    let bytes = line.as_ref();
    let mut pos = 0;
    std::iter::from_fn(move || {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        if pos >= bytes.len() {
            return None;
        }
        let start = pos;
        while pos < bytes.len() && bytes[pos] != b' ' {
            pos += 1;
        }
        Some(start..pos)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan;

    fn command_from(input: &'static [u8]) -> Command {
        let buf = Bytes::from_static(input);
        let (unit, _) = scan(&buf, false).unwrap().unwrap();
        Command::from_unit(unit).unwrap()
    }

    #[test]
    fn array_command() {
        let cmd = command_from(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
        assert_eq!(cmd.name(), b"set");
        assert_eq!(cmd.first_arg().unwrap().as_ref(), b"foo");
        assert_eq!(cmd.arg_count(), 2);
        assert!(cmd.has_multiple_args());
    }

    #[test]
    fn array_command_name_only() {
        let cmd = command_from(b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(cmd.name(), b"ping");
        assert!(cmd.first_arg().is_none());
        assert_eq!(cmd.arg_count(), 0);
    }

    #[test]
    fn array_with_null_first_arg() {
        let cmd = command_from(b"*2\r\n$3\r\nGET\r\n$-1\r\n");
        assert_eq!(cmd.name(), b"get");
        assert!(cmd.first_arg().is_none());
        assert_eq!(cmd.arg_count(), 1);
    }

    #[test]
    fn inline_command() {
        let cmd = command_from(b"get foo\r\n");
        assert_eq!(cmd.name(), b"get");
        assert_eq!(cmd.first_arg().unwrap().as_ref(), b"foo");
        assert_eq!(cmd.arg_count(), 1);
    }

    #[test]
    fn inline_runs_of_spaces_and_trim() {
        let cmd = command_from(b"  del   a  b   c  \r\n");
        assert_eq!(cmd.name(), b"del");
        assert_eq!(cmd.first_arg().unwrap().as_ref(), b"a");
        assert_eq!(cmd.arg_count(), 3);
    }

    #[test]
    fn inline_empty_line() {
        let cmd = command_from(b"\r\n");
        assert_eq!(cmd.name(), b"");
        assert!(cmd.first_arg().is_none());
        assert_eq!(cmd.arg_count(), 0);
    }

    #[test]
    fn name_is_case_folded() {
        let cmd = command_from(b"*1\r\n$4\r\nPiNg\r\n");
        assert_eq!(cmd.name(), b"ping");
    }

    #[test]
    fn degraded_shapes_are_non_fatal() {
        let cmd = command_from(b"+quit\r\n");
        assert_eq!(cmd.name(), b"quit");
        assert_eq!(cmd.arg_count(), 0);

        let cmd = command_from(b":42\r\n");
        assert_eq!(cmd.name(), b"");
        assert_eq!(cmd.arg_count(), 0);

        let cmd = command_from(b"$4\r\nPING\r\n");
        assert_eq!(cmd.name(), b"ping");
        assert_eq!(cmd.arg_count(), 0);
    }

    #[test]
    fn null_and_empty_arrays_are_parse_errors() {
        for input in [&b"*-1\r\n"[..], &b"*0\r\n"[..]] {
            let buf = Bytes::copy_from_slice(input);
            let (unit, _) = scan(&buf, false).unwrap().unwrap();
            assert_eq!(
                Command::from_unit(unit).unwrap_err(),
                ProtocolError::UnrecognizedShape
            );
        }
    }

    #[test]
    fn raw_bytes_reproduce_original() {
        let input: &[u8] = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let cmd = command_from(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        assert_eq!(cmd.raw().as_ref(), input);
    }
}
