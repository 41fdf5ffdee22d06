//! Command-safety classification for multiplexed routing.
//!
//! A pure predicate over lowercase command name bytes deciding whether a
//! command may be forwarded to a backend. Three tiers: commands that are
//! never safe through the proxy, commands that are only unsafe when more
//! than one shard is multiplexed (multi-key and whole-keyspace
//! operations), and everything else, which passes through.
//!
//! The tables below are a configuration asset tracking the redis 2.8
//! command set. When the backend command set moves, this module is the
//! one place to update.

/// Returns whether `name` (lowercase bytes) may be forwarded to a
/// backend, given whether the proxy is multiplexing more than one shard
/// and whether the command carried more than one argument.
///
/// Total over arbitrary byte strings: unknown names fall through to the
/// allowed tier, matching the proxy's transparency goal: single-key
/// commands it has never heard of still work.
pub fn is_supported(name: &[u8], multiplexing: bool, has_multiple_args: bool) -> bool {
    if is_always_blocked(name) {
        return false;
    }
    if multiplexing && is_single_shard_only(name) {
        return false;
    }
    // delete-like commands accept many keys; with one argument they are
    // ordinary single-key operations
    if multiplexing && has_multiple_args && is_delete_like(name) {
        return false;
    }
    true
}

/// Commands the proxy never forwards, in any mode.
///
/// Covers authentication, transactions, administrative / replication /
/// monitor commands, blocking cross-shard pops, and the legacy pub/sub
/// forms the session layer does not intercept.
fn is_always_blocked(name: &[u8]) -> bool {
    matches!(
        name,
        // authentication
        b"auth" |
        // transactions span commands that may route to different shards
        b"multi" | b"exec" | b"watch" | b"unwatch" | b"discard" |
        // administrative and persistence control
        b"bgrewriteaof" | b"bgsave" | b"client" | b"cluster" | b"command" |
        b"config" | b"debug" | b"info" | b"lastsave" | b"migrate" | b"move" |
        b"object" | b"save" | b"shutdown" | b"slowlog" | b"wait" |
        // replication and monitoring
        b"monitor" | b"psync" | b"replconf" | b"replicaof" | b"slaveof" | b"sync" |
        // scripting mixes reads and writes across arbitrary keys
        b"eval" | b"evalsha" | b"script" |
        // blocking pops would pin a pooled connection across shards
        b"blpop" | b"brpop" | b"brpoplpush" |
        // pattern pub/sub is not handled at the session level
        b"psubscribe" | b"punsubscribe"
    )
}

/// Commands blocked only when multiplexing more than one shard: multi-key
/// and whole-keyspace operations whose keys may live on different shards.
fn is_single_shard_only(name: &[u8]) -> bool {
    matches!(
        name,
        // set algebra across keys
        b"sdiff" | b"sdiffstore" | b"sinter" | b"sinterstore" | b"smove" |
        b"sunion" | b"sunionstore" |
        // sorted-set algebra across keys
        b"zinterstore" | b"zunionstore" |
        // whole-keyspace operations
        b"dbsize" | b"flushall" | b"flushdb" | b"keys" | b"randomkey" | b"scan" |
        // key-to-key operations
        b"bitop" | b"copy" | b"rename" | b"renamenx" | b"rpoplpush" |
        // multi-key get/set
        b"mget" | b"mset" | b"msetnx" |
        // hyperloglog merges
        b"pfcount" | b"pfmerge"
    )
}

/// Commands that take one or many keys and are only unsafe in the many
/// form.
fn is_delete_like(name: &[u8]) -> bool {
    matches!(name, b"del" | b"unlink" | b"exists" | b"touch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_blocked_regardless_of_mode() {
        for name in [&b"auth"[..], b"multi", b"exec", b"monitor", b"blpop", b"psubscribe"] {
            assert!(!is_supported(name, false, false), "{name:?}");
            assert!(!is_supported(name, true, false), "{name:?}");
            assert!(!is_supported(name, true, true), "{name:?}");
        }
    }

    #[test]
    fn multi_key_ops_blocked_only_when_multiplexing() {
        for name in [&b"mget"[..], b"mset", b"keys", b"flushall", b"rename", b"sunion"] {
            assert!(is_supported(name, false, true), "{name:?}");
            assert!(!is_supported(name, true, true), "{name:?}");
        }
    }

    #[test]
    fn delete_with_one_key_is_fine_multiplexed() {
        assert!(is_supported(b"del", true, false));
        assert!(!is_supported(b"del", true, true));
        assert!(is_supported(b"del", false, true));
        assert!(!is_supported(b"unlink", true, true));
        assert!(!is_supported(b"exists", true, true));
    }

    #[test]
    fn single_key_ops_always_allowed() {
        for name in [&b"get"[..], b"set", b"incr", b"hget", b"lpush", b"zadd", b"expire", b"ttl"] {
            assert!(is_supported(name, false, false), "{name:?}");
            assert!(is_supported(name, true, true), "{name:?}");
        }
    }

    #[test]
    fn unknown_names_fall_through_to_allowed() {
        assert!(is_supported(b"geoadd", true, true));
        assert!(is_supported(b"xadd", true, true));
        assert!(is_supported(b"notacommand", true, true));
    }

    /// Returns a boolean for every input without panicking, including
    /// empty and short names.
    #[test]
    fn total_over_arbitrary_input() {
        let _ = is_supported(b"", true, true);
        let _ = is_supported(b"a", false, false);
        let _ = is_supported(b"\x00\xff", true, false);
        let long = vec![b'z'; 4096];
        let _ = is_supported(&long, true, true);

        // every single lowercase ascii letter
        for b in b'a'..=b'z' {
            let _ = is_supported(&[b], true, true);
            let _ = is_supported(&[b], false, false);
        }
    }
}
