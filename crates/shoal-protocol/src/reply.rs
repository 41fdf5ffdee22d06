//! Canned replies and small wire writers.
//!
//! The proxy synthesizes only a handful of replies itself (everything
//! else is copied verbatim from a backend). These helpers write them
//! directly into a `BytesMut` with no intermediate allocations; integer
//! formatting goes through `itoa`.

use bytes::{BufMut, BytesMut};

/// `+OK\r\n`
pub const OK: &[u8] = b"+OK\r\n";

/// `+PONG\r\n`
pub const PONG: &[u8] = b"+PONG\r\n";

/// Reply for commands rejected by the safety classifier.
pub const ERR_UNSUPPORTED: &[u8] = b"-ERR This command is not supported\r\n";

/// Reply when no live backend is available for a routed command.
pub const ERR_CONNECTION_DOWN: &[u8] = b"-ERR Connection down\r\n";

/// Writes a `-ERR <message>\r\n` error line.
pub fn write_error(message: &str, dst: &mut BytesMut) {
    dst.put_slice(b"-ERR ");
    dst.put_slice(message.as_bytes());
    dst.put_slice(b"\r\n");
}

/// Writes the synthesized subscribe/unsubscribe acknowledgment:
/// a 3-element array of `[kind, channel, new subscription count]`.
pub fn write_subscription_ack(kind: &[u8], channel: &[u8], count: i64, dst: &mut BytesMut) {
    dst.put_slice(b"*3\r\n");
    write_bulk(kind, dst);
    write_bulk(channel, dst);
    dst.put_u8(b':');
    write_i64(count, dst);
    dst.put_slice(b"\r\n");
}

/// Writes a command as a RESP array of bulk strings. Used for the few
/// commands the proxy originates itself (SELECT, PING, SUBSCRIBE, QUIT).
pub fn write_command(args: &[&[u8]], dst: &mut BytesMut) {
    dst.put_u8(b'*');
    write_i64(args.len() as i64, dst);
    dst.put_slice(b"\r\n");
    for arg in args {
        write_bulk(arg, dst);
    }
}

fn write_bulk(data: &[u8], dst: &mut BytesMut) {
    dst.put_u8(b'$');
    write_i64(data.len() as i64, dst);
    dst.put_slice(b"\r\n");
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

/// Writes an i64 as decimal ASCII directly into the buffer.
fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}
