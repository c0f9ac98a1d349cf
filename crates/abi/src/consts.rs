/// Maximum length of a single file or node name in bytes.
pub const MAX_NAME_LENGTH: usize = 128;
/// Maximum length of a volume label in bytes.
pub const MAX_LABEL_LENGTH: usize = 16;
/// Maximum length of a whole path in bytes.
pub const MAX_PATH_LENGTH: usize = 4096;
/// Size of a process's file descriptor table.
pub const MAX_FD: usize = 256;
/// Maximum number of argv entries accepted by spawn.
pub const MAX_ARGV: usize = 64;
/// Maximum total size of the copied-in argv block in bytes.
pub const MAX_ARGV_BYTES: usize = 0x8000;
/// Maximum number of wait queues a thread may block on at once.
pub const MAX_BLOCKERS_PER_THREAD: usize = 16;
