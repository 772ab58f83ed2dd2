//! The three atomic remote commands the lock protocol relies on.
//!
//! Each script is keyed by a variable number of resource keys (`KEYS`) and takes its
//! operands positionally via `ARGV`. All three begin with a protected `SELECT` so that
//! clusters which reject database selection don't fail the whole script.

/// `ARGV = [db, value, durationMs]`. Returns the count of keys created (0 on any conflict).
pub const ACQUIRE_SCRIPT: &str = r#"
pcall(function() redis.call("SELECT", ARGV[1]) end)
for i = 1, #KEYS do
  if redis.call("EXISTS", KEYS[i]) == 1 then
    return 0
  end
end
for i = 1, #KEYS do
  redis.call("SET", KEYS[i], ARGV[2], "PX", ARGV[3])
end
return #KEYS
"#;

/// `ARGV = [db, value, durationMs]`. Returns the count of keys refreshed (0 on any mismatch).
pub const EXTEND_SCRIPT: &str = r#"
pcall(function() redis.call("SELECT", ARGV[1]) end)
for i = 1, #KEYS do
  if redis.call("GET", KEYS[i]) ~= ARGV[2] then
    return 0
  end
end
for i = 1, #KEYS do
  redis.call("SET", KEYS[i], ARGV[2], "PX", ARGV[3])
end
return #KEYS
"#;

/// `ARGV = [db, value]`. Returns the count of keys deleted; never a failure indicator.
pub const RELEASE_SCRIPT: &str = r#"
pcall(function() redis.call("SELECT", ARGV[1]) end)
local deleted = 0
for i = 1, #KEYS do
  if redis.call("GET", KEYS[i]) == ARGV[2] then
    redis.call("DEL", KEYS[i])
    deleted = deleted + 1
  end
end
return deleted
"#;
