//! Lua scripts backing the stream bridge's connected-set mutations.
//! Both operations need to be atomic with respect to each other — no
//! attach for a signature may be enqueued while that signature is still in
//! the connected-set — so, like [`crate::queue::scripts`], they're single
//! round-trip Redis scripts rather than a read-then-write pair from the
//! application side.

use lazy_static::lazy_static;

use crate::error::Error;

// KEYS: 1. usb:connected hash
// ARGV: 1. signature, 2. device info json
// Returns 1 if this is a fresh connection (inserted), 0 if the signature
// was already present (duplicate attach — caller should drop, not enqueue).
const ATTACH_SCRIPT: &str = r##"
    if redis.call("HEXISTS", KEYS[1], ARGV[1]) == 1 then
        return 0
    end
    redis.call("HSET", KEYS[1], ARGV[1], ARGV[2])
    return 1
"##;

lazy_static! {
    static ref ATTACH: redis::Script = redis::Script::new(ATTACH_SCRIPT);
}

pub struct AttachScript(&'static redis::Script);

impl AttachScript {
    pub fn new() -> Self {
        AttachScript(&ATTACH)
    }

    pub async fn run(
        &self,
        conn: &mut deadpool_redis::Connection,
        connected_key: &str,
        signature: &str,
        device_json: &str,
    ) -> Result<bool, Error> {
        let inserted: i64 = self
            .0
            .key(connected_key)
            .arg(signature)
            .arg(device_json)
            .invoke_async(&mut **conn)
            .await?;
        Ok(inserted == 1)
    }
}

// KEYS: 1. usb:connected hash
// ARGV: 1. signature
// Returns 1 if the signature was present (and is now removed), 0 if it
// wasn't there to begin with. Either way the detach is still enqueued —
// duplicate-protection only applies to attach.
const DETACH_SCRIPT: &str = r##"
    local existed = redis.call("HEXISTS", KEYS[1], ARGV[1])
    redis.call("HDEL", KEYS[1], ARGV[1])
    return existed
"##;

lazy_static! {
    static ref DETACH: redis::Script = redis::Script::new(DETACH_SCRIPT);
}

pub struct DetachScript(&'static redis::Script);

impl DetachScript {
    pub fn new() -> Self {
        DetachScript(&DETACH)
    }

    pub async fn run(
        &self,
        conn: &mut deadpool_redis::Connection,
        connected_key: &str,
        signature: &str,
    ) -> Result<bool, Error> {
        let existed: i64 = self.0.key(connected_key).arg(signature).invoke_async(&mut **conn).await?;
        Ok(existed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_compile_and_hold_their_source() {
        // `redis::Script::new` doesn't parse eagerly (Lua is only compiled
        // Redis-side on first EVALSHA miss), so this just guards against
        // the lazy_static initializers panicking.
        let _ = AttachScript::new();
        let _ = DetachScript::new();
    }
}
