use std::time::{SystemTime, UNIX_EPOCH};

/// root directory i-number
pub const ROOT_INO: i32 = 0;

/// users.txt i-number, always the second inode handed out by mkfs
pub const USERS_INO: i32 = 1;

pub const USERS_FILE: &str = "users.txt";

/// unused pointer, free directory slot, free partition slot
pub const NONE: i32 = -1;

/// name written into a free directory slot
pub const FREE_NAME: &str = "-";

/// inode bitmap alphabet
pub const INODE_FREE: u8 = b'0';
pub const INODE_USED: u8 = b'1';

/// block bitmap alphabet
pub const BLOCK_FREE: u8 = b'O';
pub const BLOCK_USED: u8 = b'X';

/// inode kinds as stored in `Inode::kind`
pub const KIND_DIR: u8 = b'0';
pub const KIND_FILE: u8 = b'1';

/// first journal slot replayed by recovery; 0 and 1 describe `/` and users.txt
pub const JOURNAL_BASE_SLOT: usize = 2;

/// ratio of blocks to inodes fixed at format time
pub const BLOCKS_PER_INODE: i32 = 3;

/// first id byte handed out for partitions mounted from a disk
pub const MOUNT_LETTERS: &[u8; 26] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Unix time as stored on disk.
pub fn now() -> f32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as f32)
        .unwrap_or(0.0)
}

/// Copy `name` into a NUL padded fixed-width field, truncating if needed.
pub fn encode_name<const N: usize>(name: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = name.as_bytes();
    let len = bytes.len().min(N);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// Read a fixed-width field back, dropping NUL and space padding.
pub fn decode_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
        .trim_matches(|c| c == '\0' || c == ' ')
        .to_string()
}

/// `-1` on the wire, `None` in memory.
pub fn ptr(raw: i32) -> Option<i32> {
    if raw < 0 {
        None
    } else {
        Some(raw)
    }
}

pub fn raw(ptr: Option<i32>) -> i32 {
    ptr.unwrap_or(NONE)
}

/// Content written by `mkfile -size=N` when no explicit content is given.
pub fn digit_content(size: usize) -> String {
    (0..size).map(|i| char::from(b'0' + (i % 10) as u8)).collect()
}

/// Render an on-disk timestamp as RFC 3339.
pub fn format_time(ts: f32) -> String {
    use chrono::{TimeZone, Utc};
    Utc.timestamp_opt(ts as i64, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}
